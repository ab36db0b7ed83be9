use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One collected message, as stored in a partition file.
///
/// Original export field names are accepted as aliases so older partition
/// files remain readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(alias = "message_id")]
    pub record_id: i64,
    pub channel_name: String,
    #[serde(alias = "message_date", default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(alias = "message_text", default)]
    pub text: String,
    #[serde(default)]
    pub has_media: bool,
    #[serde(alias = "image_path", default)]
    pub media_ref: Option<String>,
    #[serde(alias = "views", default)]
    pub view_count: i64,
    #[serde(alias = "forwards", default)]
    pub forward_count: i64,
}

impl SourceRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            record_id: self.record_id,
            channel_name: self.channel_name.clone(),
        }
    }

    pub fn partition_date(&self) -> PartitionDate {
        match self.collected_at {
            Some(ts) => PartitionDate::Day(ts.date_naive()),
            None => PartitionDate::Undated,
        }
    }

    /// Checks the invariants a record must satisfy before it is stored or
    /// loaded under `channel`.
    pub fn validate(&self, channel: &str) -> Result<(), String> {
        if self.record_id <= 0 {
            return Err(format!("record_id must be positive, got {}", self.record_id));
        }
        if self.channel_name != channel {
            return Err(format!(
                "record belongs to channel '{}', not '{}'",
                self.channel_name, channel
            ));
        }
        if self.view_count < 0 || self.forward_count < 0 {
            return Err("view and forward counts cannot be negative".to_string());
        }
        if !self.has_media && self.media_ref.is_some() {
            return Err("media_ref set on a record without media".to_string());
        }
        Ok(())
    }
}

/// Natural key of a record across the store and the relational schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordKey {
    pub record_id: i64,
    pub channel_name: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_name, self.record_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionDate {
    Day(NaiveDate),
    Undated,
}

impl PartitionDate {
    pub const UNDATED_DIR: &'static str = "undated";

    pub fn dir_name(&self) -> String {
        match self {
            PartitionDate::Day(date) => date.format("%Y-%m-%d").to_string(),
            PartitionDate::Undated => Self::UNDATED_DIR.to_string(),
        }
    }

    pub fn parse_dir_name(name: &str) -> Option<Self> {
        if name == Self::UNDATED_DIR {
            return Some(PartitionDate::Undated);
        }
        NaiveDate::parse_from_str(name, "%Y-%m-%d")
            .ok()
            .map(PartitionDate::Day)
    }
}

impl fmt::Display for PartitionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// Identity of one `(channel, date)` partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub channel_name: String,
    pub date: PartitionDate,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.channel_name)
    }
}
