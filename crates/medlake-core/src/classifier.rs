//! Runs the detector over downloaded media and labels each image.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use medlake_vision::{classify, ImageCategory, MediaFileName, VisionError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detector::ObjectDetector;
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::partition_store::PartitionStore;
use crate::retry::{with_retry, RetryPolicy};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const DETECTIONS_CSV: &str = "processed/detections.csv";

/// One classified image, ready for `raw.detections`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    pub record_id: i64,
    pub channel_name: Option<String>,
    pub media_ref: String,
    pub detected_class: Option<String>,
    pub confidence_score: f64,
    pub category: ImageCategory,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ClassifyReport {
    pub discovered: usize,
    pub classified: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct ClassifyBatch {
    pub rows: Vec<DetectionRow>,
    pub report: ClassifyReport,
}

pub struct ImageClassifier {
    detector: Arc<dyn ObjectDetector>,
    store: PartitionStore,
    retry: RetryPolicy,
}

impl ImageClassifier {
    pub fn new(
        detector: Arc<dyn ObjectDetector>,
        store: PartitionStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            detector,
            store,
            retry,
        }
    }

    pub fn detections_csv_path(&self) -> PathBuf {
        self.store.data_dir().join(DETECTIONS_CSV)
    }

    /// Classifies the image at `media_ref` (relative to the data directory)
    /// owned by `record_id`.
    pub async fn process(&self, media_ref: &str, record_id: i64) -> Result<DetectionRow> {
        let path = self.store.resolve_media_ref(media_ref);
        let channel_name = media_identity(media_ref)
            .ok()
            .and_then(|identity| identity.channel_name);

        let detections = with_retry(&self.retry, "detect", || self.detector.detect(&path))
            .await
            .map_err(PipelineError::from)?;
        let classification = classify(&detections);

        Ok(DetectionRow {
            record_id,
            channel_name,
            media_ref: media_ref.to_string(),
            detected_class: classification.detected_class,
            confidence_score: classification.confidence_score,
            category: classification.category,
        })
    }

    /// Classifies every discoverable image. Files whose names do not encode
    /// a record id are skipped; per-image detector failures are reported and
    /// processing moves on.
    pub async fn process_all(&self, events: &dyn EventSink) -> Result<ClassifyBatch> {
        let mut batch = ClassifyBatch::default();
        let files = discover_images(&self.store.images_dir())?;
        batch.report.discovered = files.len();

        for path in files {
            let Some(media_ref) = relative_ref(self.store.data_dir(), &path) else {
                events.emit(&PipelineEvent::ImageSkipped {
                    path: path.display().to_string(),
                    reason: "path is not valid UTF-8".into(),
                });
                batch.report.skipped += 1;
                continue;
            };

            let name = match media_identity(&media_ref) {
                Ok(name) => name,
                Err(err) => {
                    events.emit(&PipelineEvent::ImageSkipped {
                        path: path.display().to_string(),
                        reason: err.to_string(),
                    });
                    batch.report.skipped += 1;
                    continue;
                }
            };

            match self.process(&media_ref, name.record_id).await {
                Ok(row) => {
                    events.emit(&PipelineEvent::ImageClassified {
                        media_ref: row.media_ref.clone(),
                        category: row.category,
                        confidence: row.confidence_score,
                    });
                    batch.report.classified += 1;
                    batch.rows.push(row);
                }
                Err(err) => {
                    events.emit(&PipelineEvent::ImageFailed {
                        media_ref,
                        error: err.to_string(),
                    });
                    batch.report.failed += 1;
                }
            }
        }

        tracing::info!(
            detector = self.detector.name(),
            discovered = batch.report.discovered,
            classified = batch.report.classified,
            skipped = batch.report.skipped,
            failed = batch.report.failed,
            "image classification complete"
        );
        Ok(batch)
    }

    pub fn export_csv(&self, rows: &[DetectionRow]) -> Result<PathBuf> {
        let path = self.detections_csv_path();
        write_detections_csv(&path, rows)?;
        Ok(path)
    }
}

/// Images directly under `images_dir` or one channel directory below it,
/// sorted by path.
pub fn discover_images(images_dir: &Path) -> Result<Vec<PathBuf>> {
    if !images_dir.exists() {
        return Ok(Vec::new());
    }

    let options = glob::MatchOptions {
        case_sensitive: false,
        ..glob::MatchOptions::new()
    };

    let mut files = Vec::new();
    for depth in ["*", "*/*"] {
        for ext in IMAGE_EXTENSIONS {
            let pattern = images_dir.join(format!("{depth}.{ext}"));
            let paths = glob::glob_with(&pattern.to_string_lossy(), options)
                .map_err(|err| PipelineError::Validation(err.to_string()))?;
            for entry in paths {
                match entry {
                    Ok(path) if path.is_file() => files.push(path),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "unreadable entry while scanning images")
                    }
                }
            }
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Channel and record id of an image, read from its place under the
/// images directory.
pub fn media_identity(media_ref: &str) -> std::result::Result<MediaFileName, VisionError> {
    let relative = PartitionStore::image_relative_path(media_ref).ok_or_else(|| {
        VisionError::UnparseableFileName {
            name: media_ref.to_string(),
            reason: "not under the images directory".into(),
        }
    })?;
    MediaFileName::parse(relative)
}

fn relative_ref(data_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(data_dir).ok()?;
    let parts: Option<Vec<&str>> = relative.iter().map(|part| part.to_str()).collect();
    Some(parts?.join("/"))
}

pub fn write_detections_csv(path: &Path, rows: &[DetectionRow]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PipelineError::Validation(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;

    let temp_path = dir.join(format!(".detections.{}.csv.tmp", Uuid::new_v4().simple()));
    let result = write_rows(&temp_path, rows).and_then(|()| Ok(fs::rename(&temp_path, path)?));

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn write_rows(path: &Path, rows: &[DetectionRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_detections_csv(path: &Path) -> Result<Vec<DetectionRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

