//! Promotes classifier output into `raw.detections`.
//!
//! Rows are keyed by `(record_id, media_ref)` and inserted with
//! `ON CONFLICT DO NOTHING`; there is no foreign key to `raw.messages`, so
//! detections may land before their owning message.

use std::path::Path;

use serde::Serialize;
use sqlx::{Postgres, QueryBuilder};

use crate::classifier::{read_detections_csv, DetectionRow};
use crate::db::{self, DbPool};
use crate::error::{PipelineError, Result};
use crate::events::{EventLevel, EventSink, PipelineEvent};
use crate::retry::{with_retry, RetryPolicy};

const INSERT_CHUNK: usize = 1_000;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DetectionLoadReport {
    pub rows: usize,
    pub rejected: usize,
    pub inserted: u64,
}

pub struct DetectionLoader {
    pool: DbPool,
    retry: RetryPolicy,
}

impl DetectionLoader {
    pub fn new(pool: DbPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        db::run_migrations(&self.pool).await
    }

    pub async fn load(
        &self,
        rows: &[DetectionRow],
        events: &dyn EventSink,
    ) -> Result<DetectionLoadReport> {
        self.ensure_schema().await?;

        let mut valid = Vec::with_capacity(rows.len());
        for row in rows {
            match validate_row(row) {
                Ok(()) => valid.push(row),
                Err(err) => events.emit(&PipelineEvent::note(EventLevel::Warn, err.to_string())),
            }
        }

        let inserted = with_retry(&self.retry, "load_detections", || async {
            let mut tx = self.pool.begin().await?;
            let mut inserted = 0;
            for chunk in valid.chunks(INSERT_CHUNK) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO raw.detections (record_id, channel_name, media_ref, \
                     detected_class, confidence_score, category) ",
                );
                builder.push_values(chunk, |mut b, row| {
                    b.push_bind(row.record_id)
                        .push_bind(&row.channel_name)
                        .push_bind(&row.media_ref)
                        .push_bind(&row.detected_class)
                        .push_bind(row.confidence_score)
                        .push_bind(row.category.as_str());
                });
                builder.push(" ON CONFLICT (record_id, media_ref) DO NOTHING");
                inserted += builder.build().execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            Ok::<u64, PipelineError>(inserted)
        })
        .await?;

        let report = DetectionLoadReport {
            rows: rows.len(),
            rejected: rows.len() - valid.len(),
            inserted,
        };
        events.emit(&PipelineEvent::DetectionsLoaded {
            rows: report.rows,
            inserted: report.inserted,
        });
        Ok(report)
    }

    /// Loads a detections CSV written by the classifier.
    pub async fn load_csv(
        &self,
        path: &Path,
        events: &dyn EventSink,
    ) -> Result<DetectionLoadReport> {
        let rows = read_detections_csv(path)?;
        self.load(&rows, events).await
    }
}

fn validate_row(row: &DetectionRow) -> Result<()> {
    if row.media_ref.trim().is_empty() {
        return Err(PipelineError::Validation(format!(
            "detection for record {} has no media reference",
            row.record_id
        )));
    }
    if !(0.0..=1.0).contains(&row.confidence_score) {
        return Err(PipelineError::Validation(format!(
            "confidence {} for {} is outside [0, 1]",
            row.confidence_score, row.media_ref
        )));
    }
    Ok(())
}
