//! Observation vocabulary shared by the stages.
//!
//! Components describe what happened through [`PipelineEvent`] values and hand
//! them to an [`EventSink`]; how events are displayed or stored is the sink's
//! business.

use std::fmt;
use std::sync::Mutex;

use medlake_vision::ImageCategory;
use serde::Serialize;

use crate::orchestrator::{Stage, StageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        stage: Stage,
    },
    StageFinished {
        stage: Stage,
        status: StageStatus,
    },
    ChannelFetched {
        channel: String,
        messages: usize,
    },
    ChannelFailed {
        channel: String,
        error: String,
    },
    MediaDownloaded {
        channel: String,
        record_id: i64,
        media_ref: String,
    },
    MediaDownloadFailed {
        channel: String,
        record_id: i64,
        error: String,
    },
    RecordRejected {
        channel: String,
        record_id: i64,
        reason: String,
    },
    PartitionWritten {
        channel: String,
        date: String,
        new_records: usize,
        duplicates: usize,
    },
    PartitionLoaded {
        partition: String,
        records: usize,
        inserted: u64,
    },
    PartitionFailed {
        partition: String,
        error: String,
    },
    ImageClassified {
        media_ref: String,
        category: ImageCategory,
        confidence: f64,
    },
    ImageSkipped {
        path: String,
        reason: String,
    },
    ImageFailed {
        media_ref: String,
        error: String,
    },
    DetectionsLoaded {
        rows: usize,
        inserted: u64,
    },
    TransformOutput {
        stream: OutputStream,
        line: String,
    },
    Note {
        level: EventLevel,
        message: String,
    },
}

impl PipelineEvent {
    pub fn note(level: EventLevel, message: impl Into<String>) -> Self {
        PipelineEvent::Note {
            level,
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::StageStarted { .. } => "stage_started",
            PipelineEvent::StageFinished { .. } => "stage_finished",
            PipelineEvent::ChannelFetched { .. } => "channel_fetched",
            PipelineEvent::ChannelFailed { .. } => "channel_failed",
            PipelineEvent::MediaDownloaded { .. } => "media_downloaded",
            PipelineEvent::MediaDownloadFailed { .. } => "media_download_failed",
            PipelineEvent::RecordRejected { .. } => "record_rejected",
            PipelineEvent::PartitionWritten { .. } => "partition_written",
            PipelineEvent::PartitionLoaded { .. } => "partition_loaded",
            PipelineEvent::PartitionFailed { .. } => "partition_failed",
            PipelineEvent::ImageClassified { .. } => "image_classified",
            PipelineEvent::ImageSkipped { .. } => "image_skipped",
            PipelineEvent::ImageFailed { .. } => "image_failed",
            PipelineEvent::DetectionsLoaded { .. } => "detections_loaded",
            PipelineEvent::TransformOutput { .. } => "transform_output",
            PipelineEvent::Note { .. } => "note",
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            PipelineEvent::MediaDownloaded { .. } | PipelineEvent::ImageClassified { .. } => {
                EventLevel::Debug
            }
            PipelineEvent::ChannelFailed { .. }
            | PipelineEvent::PartitionFailed { .. }
            | PipelineEvent::ImageFailed { .. } => EventLevel::Error,
            PipelineEvent::MediaDownloadFailed { .. }
            | PipelineEvent::RecordRejected { .. }
            | PipelineEvent::ImageSkipped { .. } => EventLevel::Warn,
            PipelineEvent::StageFinished { status, .. } if *status == StageStatus::Failed => {
                EventLevel::Error
            }
            PipelineEvent::TransformOutput {
                stream: OutputStream::Stderr,
                ..
            } => EventLevel::Warn,
            PipelineEvent::Note { level, .. } => *level,
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::StageStarted { stage } => write!(f, "stage {stage} started"),
            PipelineEvent::StageFinished { stage, status } => {
                write!(f, "stage {stage} finished: {status}")
            }
            PipelineEvent::ChannelFetched { channel, messages } => {
                write!(f, "fetched {messages} messages from {channel}")
            }
            PipelineEvent::ChannelFailed { channel, error } => {
                write!(f, "channel {channel} failed: {error}")
            }
            PipelineEvent::MediaDownloaded {
                channel,
                record_id,
                media_ref,
            } => write!(f, "downloaded media for {channel}/{record_id} to {media_ref}"),
            PipelineEvent::MediaDownloadFailed {
                channel,
                record_id,
                error,
            } => write!(f, "media download failed for {channel}/{record_id}: {error}"),
            PipelineEvent::RecordRejected {
                channel,
                record_id,
                reason,
            } => write!(f, "rejected record {channel}/{record_id}: {reason}"),
            PipelineEvent::PartitionWritten {
                channel,
                date,
                new_records,
                duplicates,
            } => write!(
                f,
                "saved {new_records} new records to {date}/{channel} ({duplicates} already present)"
            ),
            PipelineEvent::PartitionLoaded {
                partition,
                records,
                inserted,
            } => write!(f, "loaded {partition}: {records} records, {inserted} new rows"),
            PipelineEvent::PartitionFailed { partition, error } => {
                write!(f, "failed to load {partition}: {error}")
            }
            PipelineEvent::ImageClassified {
                media_ref,
                category,
                confidence,
            } => write!(f, "classified {media_ref} as {category} ({confidence:.2})"),
            PipelineEvent::ImageSkipped { path, reason } => {
                write!(f, "skipped {path}: {reason}")
            }
            PipelineEvent::ImageFailed { media_ref, error } => {
                write!(f, "classification failed for {media_ref}: {error}")
            }
            PipelineEvent::DetectionsLoaded { rows, inserted } => {
                write!(f, "loaded {rows} detections, {inserted} new rows")
            }
            PipelineEvent::TransformOutput { line, .. } => f.write_str(line),
            PipelineEvent::Note { message, .. } => f.write_str(message),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        let name = event.name();
        match event.level() {
            EventLevel::Debug => tracing::debug!(event = name, "{event}"),
            EventLevel::Info => tracing::info!(event = name, "{event}"),
            EventLevel::Warn => tracing::warn!(event = name, "{event}"),
            EventLevel::Error => tracing::error!(event = name, "{event}"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &PipelineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
