//! Pulls messages and media for each configured channel and persists them to
//! the partition store one channel at a time.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MedlakeConfig;
use crate::error::Result;
use crate::events::{EventSink, PipelineEvent};
use crate::partition_store::PartitionStore;
use crate::records::{PartitionDate, RecordKey, SourceRecord};
use crate::retry::{with_retry, RetryPolicy};
use crate::source::{MessageSource, SourceError, SourceMessage};

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub channels: Vec<String>,
    pub message_limit: usize,
    pub lookback_days: u32,
    pub inter_channel_delay: Duration,
    pub channel_timeout: Duration,
    pub retry: RetryPolicy,
}

impl CollectorSettings {
    pub fn from_config(config: &MedlakeConfig) -> Self {
        Self {
            channels: config.source.channels.clone(),
            message_limit: config.source.message_limit,
            lookback_days: config.source.lookback_days,
            inter_channel_delay: config.source.inter_channel_delay(),
            channel_timeout: config.source.channel_timeout(),
            retry: config.retry_policy(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: String,
    pub fetched: usize,
    pub skipped_empty: usize,
    pub written: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub media_downloaded: usize,
    pub media_failed: usize,
    pub partitions_failed: usize,
    /// Valid records that landed in a partition that could not be written.
    pub records_dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectReport {
    pub channels: Vec<ChannelReport>,
    /// Every record scraped this run that is now in the store, whether new or
    /// already present.
    #[serde(skip)]
    pub collected: Vec<RecordKey>,
}

impl CollectReport {
    pub fn records_collected(&self) -> usize {
        self.collected.len()
    }

    pub fn records_written(&self) -> usize {
        self.channels.iter().map(|c| c.written).sum()
    }

    pub fn partitions_failed(&self) -> usize {
        self.channels.iter().map(|c| c.partitions_failed).sum()
    }

    pub fn records_dropped(&self) -> usize {
        self.channels.iter().map(|c| c.records_dropped).sum()
    }

    pub fn channels_failed(&self) -> usize {
        self.channels.iter().filter(|c| c.error.is_some()).count()
    }

    pub fn all_channels_failed(&self) -> bool {
        !self.channels.is_empty() && self.channels_failed() == self.channels.len()
    }
}

/// Records scraped from one channel plus media bookkeeping.
#[derive(Debug, Default)]
pub struct ScrapedChannel {
    pub records: Vec<SourceRecord>,
    pub fetched: usize,
    pub skipped_empty: usize,
    pub media_downloaded: usize,
    pub media_failed: usize,
}

pub struct Collector {
    source: Arc<dyn MessageSource>,
    store: PartitionStore,
    settings: CollectorSettings,
}

impl Collector {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: PartitionStore,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Scrapes every configured channel in order. A channel that fails is
    /// reported and skipped; a store write failure aborts the run.
    pub async fn collect_all(&self, events: &dyn EventSink) -> Result<CollectReport> {
        let since = Utc::now() - chrono::Duration::days(i64::from(self.settings.lookback_days));
        let mut report = CollectReport::default();

        for (idx, channel) in self.settings.channels.iter().enumerate() {
            if idx > 0 && !self.settings.inter_channel_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_channel_delay).await;
            }

            let scraped = tokio::time::timeout(
                self.settings.channel_timeout,
                self.scrape_channel(channel, since, events),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SourceError::Timeout {
                    operation: format!("scrape {channel}"),
                    attempts: 1,
                })
            });

            let scraped = match scraped {
                Ok(scraped) => scraped,
                Err(err) => {
                    events.emit(&PipelineEvent::ChannelFailed {
                        channel: channel.clone(),
                        error: err.to_string(),
                    });
                    report.channels.push(ChannelReport {
                        channel: channel.clone(),
                        error: Some(err.to_string()),
                        ..ChannelReport::default()
                    });
                    continue;
                }
            };

            let channel_report = self.persist_channel(channel, scraped, &mut report, events)?;
            report.channels.push(channel_report);
        }

        Ok(report)
    }

    fn persist_channel(
        &self,
        channel: &str,
        scraped: ScrapedChannel,
        report: &mut CollectReport,
        events: &dyn EventSink,
    ) -> Result<ChannelReport> {
        let keyed: Vec<(RecordKey, PartitionDate)> = scraped
            .records
            .iter()
            .map(|r| (r.key(), r.partition_date()))
            .collect();
        let append = self.store.append(channel, scraped.records)?;

        for rejected in &append.rejected {
            events.emit(&PipelineEvent::RecordRejected {
                channel: channel.to_string(),
                record_id: rejected.record_id,
                reason: rejected.reason.clone(),
            });
        }
        for written in &append.partitions {
            events.emit(&PipelineEvent::PartitionWritten {
                channel: channel.to_string(),
                date: written.key.date.dir_name(),
                new_records: written.new_records,
                duplicates: written.duplicates,
            });
        }
        for (key, error) in &append.failed {
            events.emit(&PipelineEvent::PartitionFailed {
                partition: key.to_string(),
                error: error.clone(),
            });
        }

        let rejected_ids: HashSet<i64> = append.rejected.iter().map(|r| r.record_id).collect();
        let failed_dates: HashSet<PartitionDate> =
            append.failed.iter().map(|(key, _)| key.date).collect();
        let mut records_dropped = 0;
        for (key, date) in keyed {
            if rejected_ids.contains(&key.record_id) {
                continue;
            }
            if failed_dates.contains(&date) {
                records_dropped += 1;
                continue;
            }
            report.collected.push(key);
        }

        Ok(ChannelReport {
            channel: channel.to_string(),
            fetched: scraped.fetched,
            skipped_empty: scraped.skipped_empty,
            written: append.new_records(),
            duplicates: append.duplicates(),
            rejected: append.rejected.len(),
            media_downloaded: scraped.media_downloaded,
            media_failed: scraped.media_failed,
            partitions_failed: append.failed.len(),
            records_dropped,
            error: None,
        })
    }

    /// Fetches one channel and downloads its images. Media failures are
    /// recorded on the affected record and never fail the channel.
    pub async fn scrape_channel(
        &self,
        channel: &str,
        since: DateTime<Utc>,
        events: &dyn EventSink,
    ) -> std::result::Result<ScrapedChannel, SourceError> {
        let limit = self.settings.message_limit;
        let mut messages = with_retry(&self.settings.retry, "fetch_messages", || {
            self.source.fetch_messages(channel, limit, since)
        })
        .await?;
        messages.truncate(limit);

        events.emit(&PipelineEvent::ChannelFetched {
            channel: channel.to_string(),
            messages: messages.len(),
        });

        let mut scraped = ScrapedChannel {
            fetched: messages.len(),
            ..ScrapedChannel::default()
        };

        for message in messages {
            if message.is_empty() {
                scraped.skipped_empty += 1;
                continue;
            }
            if let Some(date) = message.date {
                if date < since {
                    continue;
                }
            }

            let media_ref = match &message.media {
                Some(kind) if kind.is_image() => {
                    match self.download(channel, &message).await {
                        Ok(media_ref) => {
                            events.emit(&PipelineEvent::MediaDownloaded {
                                channel: channel.to_string(),
                                record_id: message.id,
                                media_ref: media_ref.clone(),
                            });
                            scraped.media_downloaded += 1;
                            Some(media_ref)
                        }
                        Err(err) => {
                            events.emit(&PipelineEvent::MediaDownloadFailed {
                                channel: channel.to_string(),
                                record_id: message.id,
                                error: err.to_string(),
                            });
                            scraped.media_failed += 1;
                            None
                        }
                    }
                }
                _ => None,
            };

            scraped.records.push(to_record(channel, message, media_ref));
        }

        Ok(scraped)
    }

    async fn download(
        &self,
        channel: &str,
        message: &SourceMessage,
    ) -> std::result::Result<String, SourceError> {
        let media_ref = PartitionStore::media_ref_for(channel, message.id);
        let dest = self.store.resolve_media_ref(&media_ref);

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Ok(media_ref);
        }

        let partial = dest.with_extension("jpg.part");
        let result = with_retry(&self.settings.retry, "download_media", || {
            self.source.download_media(channel, message, &partial)
        })
        .await;

        match result {
            Ok(()) => {
                finish_download(&partial, &dest).await?;
                Ok(media_ref)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }
}

async fn finish_download(partial: &Path, dest: &Path) -> std::result::Result<(), SourceError> {
    tokio::fs::rename(partial, dest).await.map_err(SourceError::from)
}

fn to_record(channel: &str, message: SourceMessage, media_ref: Option<String>) -> SourceRecord {
    SourceRecord {
        record_id: message.id,
        channel_name: channel.to_string(),
        collected_at: message.date,
        text: message.text.unwrap_or_default(),
        has_media: message.media.is_some(),
        media_ref,
        view_count: message.views.unwrap_or(0).max(0),
        forward_count: message.forwards.unwrap_or(0).max(0),
    }
}
