//! Promotes stored partitions into `raw.messages`.
//!
//! Each partition is written in its own transaction with
//! `ON CONFLICT (record_id, channel_name) DO NOTHING`, so reloading an
//! unchanged store inserts nothing and existing rows are never altered.

use serde::Serialize;
use sqlx::{Postgres, QueryBuilder, Transaction};

use crate::db::{self, DbPool};
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::partition_store::{PartitionStore, StoredPartition};
use crate::records::SourceRecord;
use crate::retry::{with_retry, RetryPolicy};

/// Rows per INSERT statement; eight binds each keeps well below the
/// protocol's bind-parameter limit.
const INSERT_CHUNK: usize = 1_000;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PartitionFailure {
    pub partition: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub partitions_scanned: usize,
    pub partitions_loaded: usize,
    pub partitions_failed: usize,
    pub records_seen: usize,
    pub rows_inserted: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PartitionFailure>,
}

pub struct MessageLoader {
    pool: DbPool,
    store: PartitionStore,
    retry: RetryPolicy,
}

impl MessageLoader {
    pub fn new(pool: DbPool, store: PartitionStore, retry: RetryPolicy) -> Self {
        Self { pool, store, retry }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        db::run_migrations(&self.pool).await
    }

    pub async fn load(&self, events: &dyn EventSink) -> Result<LoadReport> {
        self.ensure_schema().await?;

        let mut report = LoadReport::default();

        for entry in self.store.scan()? {
            report.partitions_scanned += 1;

            let partition = match entry {
                Ok(partition) => partition,
                Err(err) => {
                    let failure = PartitionFailure {
                        partition: failure_label(&err),
                        error: err.to_string(),
                    };
                    events.emit(&PipelineEvent::PartitionFailed {
                        partition: failure.partition.clone(),
                        error: failure.error.clone(),
                    });
                    report.partitions_failed += 1;
                    report.failures.push(failure);
                    continue;
                }
            };

            let label = partition.key.to_string();
            match self.load_partition(&partition).await {
                Ok(inserted) => {
                    events.emit(&PipelineEvent::PartitionLoaded {
                        partition: label,
                        records: partition.records.len(),
                        inserted,
                    });
                    report.partitions_loaded += 1;
                    report.records_seen += partition.records.len();
                    report.rows_inserted += inserted;
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    events.emit(&PipelineEvent::PartitionFailed {
                        partition: label.clone(),
                        error: err.to_string(),
                    });
                    report.partitions_failed += 1;
                    report.failures.push(PartitionFailure {
                        partition: label,
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            partitions = report.partitions_scanned,
            failed = report.partitions_failed,
            inserted = report.rows_inserted,
            "message load complete"
        );
        Ok(report)
    }

    /// Loads one partition atomically and returns the number of new rows.
    pub async fn load_partition(&self, partition: &StoredPartition) -> Result<u64> {
        for record in &partition.records {
            record
                .validate(&partition.key.channel_name)
                .map_err(|reason| {
                    PipelineError::Validation(format!(
                        "record {} in {}: {reason}",
                        record.record_id, partition.key
                    ))
                })?;
        }

        with_retry(&self.retry, "load_partition", || async {
            let mut tx = self.pool.begin().await?;
            let mut inserted = 0;
            for chunk in partition.records.chunks(INSERT_CHUNK) {
                inserted += insert_messages(&mut tx, chunk).await?;
            }
            tx.commit().await?;
            Ok::<u64, PipelineError>(inserted)
        })
        .await
    }
}

async fn insert_messages(
    tx: &mut Transaction<'_, Postgres>,
    records: &[SourceRecord],
) -> Result<u64> {
    if records.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO raw.messages \
         (record_id, channel_name, collected_at, text, has_media, media_ref, views, forwards) ",
    );
    builder.push_values(records, |mut row, record| {
        row.push_bind(record.record_id)
            .push_bind(&record.channel_name)
            .push_bind(record.collected_at)
            .push_bind(&record.text)
            .push_bind(record.has_media)
            .push_bind(&record.media_ref)
            .push_bind(record.view_count)
            .push_bind(record.forward_count);
    });
    builder.push(" ON CONFLICT (record_id, channel_name) DO NOTHING");

    let result = builder.build().execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

fn failure_label(err: &crate::partition_store::StoreError) -> String {
    use crate::partition_store::StoreError;
    match err {
        StoreError::Io { path, .. } | StoreError::Corrupt { path, .. } => {
            path.display().to_string()
        }
        StoreError::UnrecognizedPath(path) => path.display().to_string(),
        other => other.to_string(),
    }
}
