//! Date-partitioned JSON store for collected records.
//!
//! Layout under the data directory:
//! `raw/telegram_messages/<YYYY-MM-DD|undated>/<channel>.json`. Each file is a
//! JSON array of [`SourceRecord`]s, unique by `record_id`. Files are only
//! ever extended, and every write goes through a temporary file in the same
//! directory followed by a rename.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::records::{PartitionDate, PartitionKey, SourceRecord};

const MESSAGES_DIR: &str = "raw/telegram_messages";
const IMAGES_DIR: &str = "raw/images";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("partition file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is not a partition file")]
    UnrecognizedPath(PathBuf),

    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),

    #[error("invalid scan pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Io { .. } => ErrorKind::Resource,
            StoreError::Corrupt { .. }
            | StoreError::UnrecognizedPath(_)
            | StoreError::InvalidChannel(_) => ErrorKind::Validation,
            StoreError::Pattern(_) => ErrorKind::Internal,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWrite {
    pub key: PartitionKey,
    pub new_records: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub record_id: i64,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AppendReport {
    pub partitions: Vec<PartitionWrite>,
    pub rejected: Vec<RejectedRecord>,
    /// Partitions whose existing file could not be read; left untouched.
    pub failed: Vec<(PartitionKey, String)>,
}

impl AppendReport {
    pub fn new_records(&self) -> usize {
        self.partitions.iter().map(|p| p.new_records).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.partitions.iter().map(|p| p.duplicates).sum()
    }
}

#[derive(Debug, Clone)]
pub struct StoredPartition {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub records: Vec<SourceRecord>,
}

#[derive(Debug, Clone)]
pub struct PartitionStore {
    data_dir: PathBuf,
}

impl PartitionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join(MESSAGES_DIR)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join(IMAGES_DIR)
    }

    /// Relative reference recorded on a record whose media was downloaded.
    pub fn media_ref_for(channel: &str, record_id: i64) -> String {
        format!("{IMAGES_DIR}/{channel}/{record_id}.jpg")
    }

    /// The part of `media_ref` below the images directory, if it points there.
    pub fn image_relative_path(media_ref: &str) -> Option<&Path> {
        Path::new(media_ref).strip_prefix(IMAGES_DIR).ok()
    }

    pub fn resolve_media_ref(&self, media_ref: &str) -> PathBuf {
        self.data_dir.join(media_ref)
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.messages_dir()
            .join(key.date.dir_name())
            .join(format!("{}.json", key.channel_name))
    }

    /// Merges `records` into their `(channel, date)` partitions. Records
    /// already stored under the same `record_id` are kept as they are; the
    /// incoming copy is counted as a duplicate.
    pub fn append(
        &self,
        channel: &str,
        records: Vec<SourceRecord>,
    ) -> Result<AppendReport, StoreError> {
        validate_channel(channel)?;

        let mut report = AppendReport::default();
        let mut by_date: BTreeMap<PartitionDate, Vec<SourceRecord>> = BTreeMap::new();

        for record in records {
            match record.validate(channel) {
                Ok(()) => by_date
                    .entry(record.partition_date())
                    .or_default()
                    .push(record),
                Err(reason) => report.rejected.push(RejectedRecord {
                    record_id: record.record_id,
                    reason,
                }),
            }
        }

        for (date, incoming) in by_date {
            let key = PartitionKey {
                channel_name: channel.to_string(),
                date,
            };
            let path = self.partition_path(&key);

            let mut stored = match read_records(&path) {
                Ok(stored) => stored,
                Err(StoreError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    Vec::new()
                }
                Err(err @ StoreError::Corrupt { .. }) => {
                    report.failed.push((key, err.to_string()));
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut ids: HashSet<i64> = stored.iter().map(|r| r.record_id).collect();
            let mut new_records = 0;
            let mut duplicates = 0;

            for record in incoming {
                if ids.insert(record.record_id) {
                    stored.push(record);
                    new_records += 1;
                } else {
                    duplicates += 1;
                }
            }

            if new_records > 0 {
                write_atomically(&path, &stored)?;
            }

            report.partitions.push(PartitionWrite {
                key,
                new_records,
                duplicates,
            });
        }

        Ok(report)
    }

    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<SourceRecord>, StoreError> {
        read_records(&self.partition_path(key))
    }

    /// Lists the partition files present right now and returns an iterator
    /// that reads them one at a time. Each call reflects current disk state.
    pub fn scan(&self) -> Result<PartitionScan, StoreError> {
        let messages_dir = self.messages_dir();
        if !messages_dir.exists() {
            return Ok(PartitionScan {
                paths: Vec::new().into_iter(),
            });
        }

        let pattern = messages_dir.join("*").join("*.json");
        let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(err) => {
                    tracing::warn!(error = %err, "unreadable entry while scanning partitions");
                    None
                }
            })
            .collect();
        paths.sort();

        Ok(PartitionScan {
            paths: paths.into_iter(),
        })
    }
}

/// Lazy sequence of stored partitions produced by [`PartitionStore::scan`].
#[derive(Debug)]
pub struct PartitionScan {
    paths: std::vec::IntoIter<PathBuf>,
}

impl PartitionScan {
    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl Iterator for PartitionScan {
    type Item = Result<StoredPartition, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        Some(load_partition(path))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.paths.size_hint()
    }
}

fn load_partition(path: PathBuf) -> Result<StoredPartition, StoreError> {
    let key = key_from_path(&path).ok_or_else(|| StoreError::UnrecognizedPath(path.clone()))?;
    let records = read_records(&path)?;
    Ok(StoredPartition { key, path, records })
}

fn key_from_path(path: &Path) -> Option<PartitionKey> {
    let channel_name = path.file_stem()?.to_str()?.to_string();
    let date_dir = path.parent()?.file_name()?.to_str()?;
    let date = PartitionDate::parse_dir_name(date_dir)?;
    Some(PartitionKey { channel_name, date })
}

fn validate_channel(channel: &str) -> Result<(), StoreError> {
    if channel.is_empty()
        || channel.starts_with('.')
        || channel.contains(['/', '\\'])
        || channel.contains('\0')
    {
        return Err(StoreError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<SourceRecord>, StoreError> {
    let file = File::open(path).map_err(|err| StoreError::io(path, err))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomically(path: &Path, records: &[SourceRecord]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::UnrecognizedPath(path.to_path_buf()))?;
    fs::create_dir_all(dir).map_err(|err| StoreError::io(dir, err))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StoreError::UnrecognizedPath(path.to_path_buf()))?;
    let temp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let result = write_records(&temp_path, records)
        .and_then(|()| fs::rename(&temp_path, path).map_err(|err| StoreError::io(path, err)));

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn write_records(path: &Path, records: &[SourceRecord]) -> Result<(), StoreError> {
    let file = File::create(path).map_err(|err| StoreError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|err| StoreError::io(path, err))?;
    let file = writer
        .into_inner()
        .map_err(|err| StoreError::io(path, err.into_error()))?;
    file.sync_all().map_err(|err| StoreError::io(path, err))?;
    Ok(())
}
