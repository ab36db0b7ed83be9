use std::fs;

use chrono::{TimeZone, Utc};
use medlake_core::partition_store::PartitionStore;
use medlake_core::records::{PartitionDate, PartitionKey, SourceRecord};
use tempfile::tempdir;

fn record(id: i64, channel: &str, day: Option<u32>, text: &str) -> SourceRecord {
    SourceRecord {
        record_id: id,
        channel_name: channel.to_string(),
        collected_at: day.map(|d| Utc.with_ymd_and_hms(2026, 3, d, 9, 30, 0).unwrap()),
        text: text.to_string(),
        has_media: false,
        media_ref: None,
        view_count: 10,
        forward_count: 1,
    }
}

fn key(channel: &str, day: u32) -> PartitionKey {
    PartitionKey {
        channel_name: channel.to_string(),
        date: PartitionDate::Day(chrono::NaiveDate::from_ymd_opt(2026, 3, day).unwrap()),
    }
}

#[test]
fn appending_the_same_record_twice_stores_it_once() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());

    let first = store.append("chemed", vec![record(42, "chemed", Some(1), "hello")]).unwrap();
    assert_eq!(first.new_records(), 1);

    let second = store.append("chemed", vec![record(42, "chemed", Some(1), "hello")]).unwrap();
    assert_eq!(second.new_records(), 0);
    assert_eq!(second.duplicates(), 1);

    let stored = store.read_partition(&key("chemed", 1)).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].record_id, 42);
}

#[test]
fn stored_record_wins_over_incoming_copy() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());

    store.append("chemed", vec![record(7, "chemed", Some(2), "original")]).unwrap();
    store
        .append(
            "chemed",
            vec![
                record(7, "chemed", Some(2), "edited"),
                record(8, "chemed", Some(2), "new"),
            ],
        )
        .unwrap();

    let stored = store.read_partition(&key("chemed", 2)).unwrap();
    assert_eq!(stored.len(), 2);
    let seven = stored.iter().find(|r| r.record_id == 7).unwrap();
    assert_eq!(seven.text, "original");
}

#[test]
fn records_are_grouped_by_collection_date() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());

    let report = store
        .append(
            "tikvahpharma",
            vec![
                record(1, "tikvahpharma", Some(3), "a"),
                record(2, "tikvahpharma", Some(4), "b"),
                record(3, "tikvahpharma", Some(3), "c"),
                record(4, "tikvahpharma", None, "undated"),
            ],
        )
        .unwrap();

    assert_eq!(report.partitions.len(), 3);
    assert_eq!(store.read_partition(&key("tikvahpharma", 3)).unwrap().len(), 2);
    assert_eq!(store.read_partition(&key("tikvahpharma", 4)).unwrap().len(), 1);

    let undated = PartitionKey {
        channel_name: "tikvahpharma".into(),
        date: PartitionDate::Undated,
    };
    assert!(store.partition_path(&undated).ends_with("undated/tikvahpharma.json"));
    assert_eq!(store.read_partition(&undated).unwrap()[0].record_id, 4);
}

#[test]
fn invalid_records_are_rejected_at_the_write_boundary() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());

    let mut negative = record(5, "chemed", Some(1), "x");
    negative.view_count = -3;

    let report = store
        .append(
            "chemed",
            vec![
                record(0, "chemed", Some(1), "zero id"),
                record(6, "lobelia4cosmetics", Some(1), "wrong channel"),
                negative,
                record(9, "chemed", Some(1), "ok"),
            ],
        )
        .unwrap();

    assert_eq!(report.rejected.len(), 3);
    assert_eq!(report.new_records(), 1);
    assert!(store.append("../escape", Vec::new()).is_err());
}

#[test]
fn corrupt_partition_is_reported_and_left_untouched() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());
    let path = store.partition_path(&key("chemed", 5));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"[{\"record_id\": 1, ").unwrap();

    let report = store
        .append(
            "chemed",
            vec![
                record(1, "chemed", Some(5), "lost?"),
                record(2, "chemed", Some(6), "other day"),
            ],
        )
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, key("chemed", 5));
    assert_eq!(report.new_records(), 1);
    assert_eq!(fs::read(&path).unwrap(), b"[{\"record_id\": 1, ");
}

#[test]
fn scan_reflects_current_disk_state_each_call() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());

    assert_eq!(store.scan().unwrap().count(), 0);

    store.append("chemed", vec![record(1, "chemed", Some(1), "a")]).unwrap();
    store
        .append("lobelia4cosmetics", vec![record(1, "lobelia4cosmetics", Some(1), "b")])
        .unwrap();

    let scan = store.scan().unwrap();
    assert_eq!(scan.remaining(), 2);
    let partitions: Vec<_> = scan.map(Result::unwrap).collect();
    assert_eq!(partitions[0].key.channel_name, "chemed");
    assert_eq!(partitions[1].key.channel_name, "lobelia4cosmetics");

    store.append("chemed", vec![record(2, "chemed", Some(2), "c")]).unwrap();
    assert_eq!(store.scan().unwrap().count(), 3);
}

#[test]
fn scan_surfaces_unreadable_partitions_without_stopping() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());

    store.append("chemed", vec![record(1, "chemed", Some(1), "a")]).unwrap();
    store.append("chemed", vec![record(2, "chemed", Some(3), "b")]).unwrap();
    let corrupt = store.partition_path(&key("chemed", 2));
    fs::create_dir_all(corrupt.parent().unwrap()).unwrap();
    fs::write(&corrupt, b"not json").unwrap();

    let results: Vec<_> = store.scan().unwrap().collect();
    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    assert!(results[1].is_err());
}

#[test]
fn writes_leave_no_temporary_files() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());

    store
        .append(
            "chemed",
            (1..=20).map(|id| record(id, "chemed", Some(1), "bulk")).collect(),
        )
        .unwrap();

    let partition_dir = store.partition_path(&key("chemed", 1));
    let entries: Vec<_> = fs::read_dir(partition_dir.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec!["chemed.json".to_string()]);
}

#[test]
fn legacy_field_names_are_readable() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path());
    let path = store.partition_path(&key("chemed", 7));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        r#"[{"message_id": 11, "channel_name": "chemed",
             "message_date": "2026-03-07T08:00:00Z", "message_text": "legacy",
             "has_media": true, "image_path": "raw/images/chemed/11.jpg",
             "views": 5, "forwards": 2}]"#,
    )
    .unwrap();

    let stored = store.read_partition(&key("chemed", 7)).unwrap();
    assert_eq!(stored[0].record_id, 11);
    assert_eq!(stored[0].media_ref.as_deref(), Some("raw/images/chemed/11.jpg"));
    assert_eq!(stored[0].view_count, 5);
}
