//! Connector seam for the external messaging source.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out after {attempts} attempt(s)")]
    Timeout { operation: String, attempts: u32 },

    #[error("malformed source data: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Unavailable(_) | SourceError::Timeout { .. } => ErrorKind::Connectivity,
            SourceError::ChannelNotFound(_) | SourceError::Malformed(_) => ErrorKind::Validation,
            SourceError::Unauthorized(_) => ErrorKind::Connectivity,
            SourceError::Io(_) => ErrorKind::Resource,
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::Timeout { .. })
    }

    fn timed_out(operation: &str, attempts: u32) -> Self {
        SourceError::Timeout {
            operation: operation.to_string(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Document {
        #[serde(default)]
        mime_type: Option<String>,
    },
    Other,
}

impl MediaKind {
    /// Photos and image documents are downloaded; anything else only marks
    /// the record as having media.
    pub fn is_image(&self) -> bool {
        match self {
            MediaKind::Photo => true,
            MediaKind::Document { mime_type } => mime_type
                .as_deref()
                .is_some_and(|mime| mime.starts_with("image/")),
            MediaKind::Other => false,
        }
    }
}

/// A message as the connector reports it, before it becomes a record.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub media: Option<MediaKind>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    /// Connector-specific handle used to fetch the media blob.
    pub media_handle: Option<String>,
}

impl SourceMessage {
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty) && self.media.is_none()
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// At most `limit` messages from `channel`, newest first, none older
    /// than `since` (undated messages are included).
    async fn fetch_messages(
        &self,
        channel: &str,
        limit: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<SourceMessage>, SourceError>;

    /// Writes the message's media blob to `dest`.
    async fn download_media(
        &self,
        channel: &str,
        message: &SourceMessage,
        dest: &Path,
    ) -> Result<(), SourceError>;
}

#[derive(Debug, Deserialize)]
struct ExportedMessage {
    id: i64,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    media: Option<ExportedMedia>,
    #[serde(default)]
    views: Option<i64>,
    #[serde(default)]
    forwards: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExportedMedia {
    #[serde(flatten)]
    kind: MediaKind,
    #[serde(default)]
    file: Option<String>,
}

/// Reads channel exports laid out as `<root>/<channel>/messages.json`, with
/// media files referenced relative to the channel directory.
#[derive(Debug, Clone)]
pub struct ExportSource {
    root: PathBuf,
}

impl ExportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(channel)
    }
}

#[async_trait]
impl MessageSource for ExportSource {
    fn name(&self) -> &'static str {
        "export_dir"
    }

    async fn fetch_messages(
        &self,
        channel: &str,
        limit: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        let channel_dir = self.channel_dir(channel);
        if !tokio::fs::try_exists(&channel_dir).await? {
            return Err(SourceError::ChannelNotFound(channel.to_string()));
        }

        let raw = tokio::fs::read(channel_dir.join("messages.json")).await?;
        let exported: Vec<ExportedMessage> = serde_json::from_slice(&raw)
            .map_err(|err| SourceError::Malformed(format!("{channel}/messages.json: {err}")))?;

        let mut messages: Vec<SourceMessage> = exported
            .into_iter()
            .filter(|m| m.date.map_or(true, |date| date >= since))
            .map(|m| {
                let (media, media_handle) = match m.media {
                    Some(media) => (Some(media.kind), media.file),
                    None => (None, None),
                };
                SourceMessage {
                    id: m.id,
                    date: m.date,
                    text: m.text,
                    media,
                    views: m.views,
                    forwards: m.forwards,
                    media_handle,
                }
            })
            .collect();

        messages.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn download_media(
        &self,
        channel: &str,
        message: &SourceMessage,
        dest: &Path,
    ) -> Result<(), SourceError> {
        let handle = message.media_handle.as_deref().ok_or_else(|| {
            SourceError::Malformed(format!("message {} has no media file", message.id))
        })?;
        if Path::new(handle)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(SourceError::Malformed(format!(
                "media file '{handle}' escapes the channel directory"
            )));
        }
        let source_path = self.channel_dir(channel).join(handle);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source_path, dest).await?;
        Ok(())
    }
}
