use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medlake_core::collector::{Collector, CollectorSettings};
use medlake_core::events::MemorySink;
use medlake_core::partition_store::PartitionStore;
use medlake_core::records::{PartitionDate, PartitionKey};
use medlake_core::retry::RetryPolicy;
use medlake_core::source::{ExportSource, MediaKind, MessageSource, SourceError, SourceMessage};
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio::time::Instant;

fn settings(channels: &[&str]) -> CollectorSettings {
    CollectorSettings {
        channels: channels.iter().map(|c| c.to_string()).collect(),
        message_limit: 100,
        lookback_days: 30,
        inter_channel_delay: Duration::ZERO,
        channel_timeout: Duration::from_secs(10),
        retry: RetryPolicy::once(Duration::from_secs(5)),
    }
}

fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(days)
}

fn write_export(root: &Path, channel: &str, messages: serde_json::Value) {
    let dir = root.join(channel);
    fs::create_dir_all(dir.join("media")).unwrap();
    fs::write(dir.join("messages.json"), serde_json::to_vec(&messages).unwrap()).unwrap();
}

struct Fixture {
    _dir: TempDir,
    exports: std::path::PathBuf,
    store: PartitionStore,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let exports = dir.path().join("exports");
    let store = PartitionStore::new(dir.path().join("data"));
    Fixture {
        exports,
        store,
        _dir: dir,
    }
}

#[tokio::test]
async fn export_channels_are_collected_and_persisted() {
    let fx = fixture();
    write_export(
        &fx.exports,
        "chemed",
        json!([
            {"id": 42, "date": days_ago(1), "text": "Vitamin C in stock",
             "views": 120, "forwards": 3,
             "media": {"kind": "photo", "file": "media/42.jpg"}},
            {"id": 43, "date": days_ago(2), "text": "Price list",
             "media": {"kind": "document", "mime_type": "application/pdf", "file": "media/43.pdf"}},
            {"id": 44, "date": days_ago(2)},
            {"id": 45, "date": days_ago(90), "text": "too old"}
        ]),
    );
    fs::write(fx.exports.join("chemed/media/42.jpg"), b"jpeg bytes").unwrap();

    let collector = Collector::new(
        Arc::new(ExportSource::new(&fx.exports)),
        fx.store.clone(),
        settings(&["chemed"]),
    );
    let sink = MemorySink::new();
    let report = collector.collect_all(&sink).await.unwrap();

    let chemed = &report.channels[0];
    assert_eq!(chemed.error, None);
    assert_eq!(chemed.fetched, 3);
    assert_eq!(chemed.skipped_empty, 1);
    assert_eq!(chemed.written, 2);
    assert_eq!(chemed.media_downloaded, 1);
    assert_eq!(report.records_collected(), 2);

    let image = fx.store.resolve_media_ref("raw/images/chemed/42.jpg");
    assert_eq!(fs::read(image).unwrap(), b"jpeg bytes");

    let records: Vec<_> = fx
        .store
        .scan()
        .unwrap()
        .flat_map(|p| p.unwrap().records)
        .collect();
    let photo = records.iter().find(|r| r.record_id == 42).unwrap();
    assert!(photo.has_media);
    assert_eq!(photo.media_ref.as_deref(), Some("raw/images/chemed/42.jpg"));
    assert_eq!(photo.view_count, 120);

    let document = records.iter().find(|r| r.record_id == 43).unwrap();
    assert!(document.has_media);
    assert_eq!(document.media_ref, None);
    assert_eq!(sink.count("partition_written"), 2);
}

#[tokio::test]
async fn missing_channel_does_not_stop_the_others() {
    let fx = fixture();
    write_export(
        &fx.exports,
        "tikvahpharma",
        json!([{"id": 1, "date": days_ago(1), "text": "open today"}]),
    );

    let collector = Collector::new(
        Arc::new(ExportSource::new(&fx.exports)),
        fx.store.clone(),
        settings(&["does_not_exist", "tikvahpharma"]),
    );
    let sink = MemorySink::new();
    let report = collector.collect_all(&sink).await.unwrap();

    assert_eq!(report.channels_failed(), 1);
    assert!(!report.all_channels_failed());
    assert!(report.channels[0].error.as_deref().unwrap().contains("not found"));
    assert_eq!(report.channels[1].written, 1);
    assert_eq!(sink.count("channel_failed"), 1);
}

#[tokio::test]
async fn rerunning_collection_adds_nothing() {
    let fx = fixture();
    write_export(
        &fx.exports,
        "chemed",
        json!([
            {"id": 1, "date": days_ago(1), "text": "a"},
            {"id": 2, "date": days_ago(1), "text": "b"}
        ]),
    );
    let collector = Collector::new(
        Arc::new(ExportSource::new(&fx.exports)),
        fx.store.clone(),
        settings(&["chemed"]),
    );

    collector.collect_all(&MemorySink::new()).await.unwrap();
    let second = collector.collect_all(&MemorySink::new()).await.unwrap();

    assert_eq!(second.records_written(), 0);
    assert_eq!(second.channels[0].duplicates, 2);
    assert_eq!(second.records_collected(), 2);
}

#[tokio::test]
async fn message_limit_keeps_the_newest() {
    let fx = fixture();
    write_export(
        &fx.exports,
        "chemed",
        json!([
            {"id": 1, "date": days_ago(3), "text": "old"},
            {"id": 2, "date": days_ago(2), "text": "mid"},
            {"id": 3, "date": days_ago(1), "text": "new"}
        ]),
    );
    let mut limited = settings(&["chemed"]);
    limited.message_limit = 2;
    let collector = Collector::new(
        Arc::new(ExportSource::new(&fx.exports)),
        fx.store.clone(),
        limited,
    );

    let report = collector.collect_all(&MemorySink::new()).await.unwrap();
    let mut ids: Vec<i64> = report.collected.iter().map(|k| k.record_id).collect();
    ids.sort();
    assert_eq!(ids, vec![2, 3]);
}

/// Serves fixed messages and fails every media download.
struct BrokenMediaSource {
    messages: Vec<SourceMessage>,
}

#[async_trait]
impl MessageSource for BrokenMediaSource {
    fn name(&self) -> &'static str {
        "broken_media"
    }

    async fn fetch_messages(
        &self,
        _channel: &str,
        _limit: usize,
        _since: DateTime<Utc>,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        Ok(self.messages.clone())
    }

    async fn download_media(
        &self,
        _channel: &str,
        _message: &SourceMessage,
        _dest: &Path,
    ) -> Result<(), SourceError> {
        Err(SourceError::Malformed("blob expired".into()))
    }
}

#[tokio::test]
async fn failed_download_keeps_the_record_without_media_ref() {
    let fx = fixture();
    let source = BrokenMediaSource {
        messages: vec![SourceMessage {
            id: 77,
            date: None,
            text: Some("photo post".into()),
            media: Some(MediaKind::Photo),
            views: Some(-4),
            forwards: None,
            media_handle: Some("x".into()),
        }],
    };
    let collector = Collector::new(Arc::new(source), fx.store.clone(), settings(&["chemed"]));
    let sink = MemorySink::new();

    let report = collector.collect_all(&sink).await.unwrap();
    assert_eq!(report.channels[0].media_failed, 1);
    assert_eq!(sink.count("media_download_failed"), 1);

    let stored = fx
        .store
        .read_partition(&PartitionKey {
            channel_name: "chemed".into(),
            date: PartitionDate::Undated,
        })
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].has_media);
    assert_eq!(stored[0].media_ref, None);
    assert_eq!(stored[0].view_count, 0);
}

/// Never answers; used to exercise the per-channel timeout.
struct HangingSource;

#[async_trait]
impl MessageSource for HangingSource {
    fn name(&self) -> &'static str {
        "hanging"
    }

    async fn fetch_messages(
        &self,
        _channel: &str,
        _limit: usize,
        _since: DateTime<Utc>,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        std::future::pending().await
    }

    async fn download_media(
        &self,
        _channel: &str,
        _message: &SourceMessage,
        _dest: &Path,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn hanging_channel_times_out() {
    let fx = fixture();
    let collector = Collector::new(
        Arc::new(HangingSource),
        fx.store.clone(),
        settings(&["chemed", "lobelia4cosmetics"]),
    );

    let report = collector.collect_all(&MemorySink::new()).await.unwrap();
    assert!(report.all_channels_failed());
    assert!(report.channels[0].error.as_deref().unwrap().contains("timed out"));
}

fn text_message(id: i64) -> SourceMessage {
    SourceMessage {
        id,
        date: None,
        text: Some(format!("post {id}")),
        media: None,
        views: None,
        forwards: None,
        media_handle: None,
    }
}

#[tokio::test]
async fn records_in_a_corrupt_partition_are_not_counted_as_collected() {
    let fx = fixture();
    let undated = PartitionKey {
        channel_name: "chemed".into(),
        date: PartitionDate::Undated,
    };
    let path = fx.store.partition_path(&undated);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"{ not json").unwrap();

    let source = BrokenMediaSource {
        messages: vec![text_message(1), text_message(2)],
    };
    let collector = Collector::new(Arc::new(source), fx.store.clone(), settings(&["chemed"]));
    let sink = MemorySink::new();

    let report = collector.collect_all(&sink).await.unwrap();
    let chemed = &report.channels[0];
    assert_eq!(chemed.error, None);
    assert_eq!(chemed.partitions_failed, 1);
    assert_eq!(chemed.records_dropped, 2);
    assert_eq!(chemed.written, 0);
    assert_eq!(report.records_collected(), 0);
    assert_eq!(report.partitions_failed(), 1);
    assert_eq!(sink.count("partition_failed"), 1);
    assert_eq!(fs::read(&path).unwrap(), b"{ not json");
}

/// Records when each channel was fetched.
struct ClockedSource {
    fetches: Mutex<Vec<(String, Instant)>>,
}

#[async_trait]
impl MessageSource for ClockedSource {
    fn name(&self) -> &'static str {
        "clocked"
    }

    async fn fetch_messages(
        &self,
        channel: &str,
        _limit: usize,
        _since: DateTime<Utc>,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        self.fetches
            .lock()
            .unwrap()
            .push((channel.to_string(), Instant::now()));
        Ok(vec![text_message(1)])
    }

    async fn download_media(
        &self,
        _channel: &str,
        _message: &SourceMessage,
        _dest: &Path,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn channels_are_spaced_by_the_inter_channel_delay() {
    let fx = fixture();
    let source = Arc::new(ClockedSource {
        fetches: Mutex::new(Vec::new()),
    });
    let mut spaced = settings(&["chemed", "tikvahpharma", "lobelia4cosmetics"]);
    spaced.inter_channel_delay = Duration::from_secs(3);
    let collector = Collector::new(source.clone(), fx.store.clone(), spaced);

    let started = Instant::now();
    let report = collector.collect_all(&MemorySink::new()).await.unwrap();
    assert_eq!(report.channels_failed(), 0);

    let fetches = source.fetches.lock().unwrap().clone();
    let order: Vec<&str> = fetches.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(order, vec!["chemed", "tikvahpharma", "lobelia4cosmetics"]);

    assert_eq!(fetches[0].1.duration_since(started), Duration::ZERO);
    assert!(fetches[1].1.duration_since(fetches[0].1) >= Duration::from_secs(3));
    assert!(fetches[2].1.duration_since(fetches[1].1) >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(7));
}
