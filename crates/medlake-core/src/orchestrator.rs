//! Sequences the four pipeline stages as a fixed dependency graph.
//!
//! `Collect -> Load -> Transform` and `Collect -> Classify`. Stages run one at
//! a time in [`Stage::ORDER`]; a stage starts only when every dependency
//! succeeded, otherwise it is marked skipped. A failed stage fails the job
//! but nothing already committed is undone.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classifier::ImageClassifier;
use crate::collector::{Collector, CollectorSettings};
use crate::config::{DatabaseConfig, MedlakeConfig};
use crate::db::{self, DbPool};
use crate::detection_loader::DetectionLoader;
use crate::detector::ObjectDetector;
use crate::error::{PipelineError, Result};
use crate::events::{EventLevel, EventSink, PipelineEvent};
use crate::loader::MessageLoader;
use crate::partition_store::PartitionStore;
use crate::retry::RetryPolicy;
use crate::source::MessageSource;
use crate::transform::{TransformOutcome, TransformRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Load,
    Transform,
    Classify,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Collect, Stage::Load, Stage::Transform, Stage::Classify];

    pub fn dependencies(&self) -> &'static [Stage] {
        match self {
            Stage::Collect => &[],
            Stage::Load => &[Stage::Collect],
            Stage::Transform => &[Stage::Load],
            Stage::Classify => &[Stage::Collect],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Load => "load",
            Stage::Transform => "transform",
            Stage::Classify => "classify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Running)
                | (StageStatus::Pending, StageStatus::Skipped)
                | (StageStatus::Running, StageStatus::Succeeded)
                | (StageStatus::Running, StageStatus::Failed)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("stage {stage} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub stage: Stage,
    pub from: StageStatus,
    pub to: StageStatus,
}

/// Counts reported by a finished stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageSummary {
    Collect {
        records_collected: usize,
        records_written: usize,
        duplicates: usize,
        rejected: usize,
        media_downloaded: usize,
        media_failed: usize,
        partitions_failed: usize,
        records_dropped: usize,
        channels_failed: usize,
    },
    Load {
        partitions_loaded: usize,
        partitions_failed: usize,
        records_seen: usize,
        rows_inserted: u64,
    },
    Transform {
        exit_code: Option<i32>,
    },
    Classify {
        images_classified: usize,
        images_skipped: usize,
        images_failed: usize,
        detections_inserted: u64,
    },
}

impl StageSummary {
    /// Short human-readable form used in tables.
    pub fn describe(&self) -> String {
        match self {
            StageSummary::Collect {
                records_collected,
                records_written,
                duplicates,
                rejected,
                media_downloaded,
                media_failed,
                partitions_failed,
                records_dropped,
                channels_failed,
            } => format!(
                "{records_collected} collected, {records_written} new, {duplicates} dup, \
                 {rejected} rejected, media {media_downloaded}/{media_failed} ok/failed, \
                 {partitions_failed} partition(s) failed ({records_dropped} records dropped), \
                 {channels_failed} channel(s) failed"
            ),
            StageSummary::Load {
                partitions_loaded,
                partitions_failed,
                records_seen,
                rows_inserted,
            } => format!(
                "{partitions_loaded} partition(s) loaded, {partitions_failed} failed, \
                 {records_seen} records, {rows_inserted} new rows"
            ),
            StageSummary::Transform { exit_code } => match exit_code {
                Some(code) => format!("exit code {code}"),
                None => "no exit code".to_string(),
            },
            StageSummary::Classify {
                images_classified,
                images_skipped,
                images_failed,
                detections_inserted,
            } => format!(
                "{images_classified} classified, {images_skipped} skipped, \
                 {images_failed} failed, {detections_inserted} new detections"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageLogLine {
    pub at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<StageLogLine>,
}

impl StageReport {
    pub fn pending(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            summary: None,
            error: None,
            logs: Vec::new(),
        }
    }

    pub fn transition(&mut self, to: StageStatus) -> std::result::Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                stage: self.stage,
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        match to {
            StageStatus::Running => self.started_at = Some(now),
            _ if to.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }
}

/// Forwards events to an inner sink and keeps a copy tagged with the stage.
pub struct StageCapture<'a> {
    stage: Stage,
    inner: &'a dyn EventSink,
    lines: Mutex<Vec<StageLogLine>>,
}

impl<'a> StageCapture<'a> {
    pub fn new(stage: Stage, inner: &'a dyn EventSink) -> Self {
        Self {
            stage,
            inner,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn into_lines(self) -> Vec<StageLogLine> {
        match self.lines.into_inner() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for StageCapture<'_> {
    fn emit(&self, event: &PipelineEvent) {
        let line = StageLogLine {
            at: Utc::now(),
            level: event.level(),
            message: format!("[{}] {event}", self.stage),
        };
        match self.lines.lock() {
            Ok(mut lines) => lines.push(line),
            Err(poisoned) => poisoned.into_inner().push(line),
        }
        self.inner.emit(event);
    }
}

/// What a stage body produced. Errors returned by the executor are
/// recorded as failures without a summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Succeeded(StageSummary),
    Failed { summary: StageSummary, error: String },
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Whether `stage` has anything to do. Disabled stages are skipped
    /// without running.
    fn is_enabled(&self, _stage: Stage) -> bool {
        true
    }

    async fn collect(&self, events: &dyn EventSink) -> Result<StageResult>;

    async fn load(&self, events: &dyn EventSink) -> Result<StageResult>;

    async fn transform(&self, events: &dyn EventSink) -> Result<StageResult>;

    async fn classify(&self, events: &dyn EventSink) -> Result<StageResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobOutcome::Running => "RUNNING",
            JobOutcome::Succeeded => "SUCCEEDED",
            JobOutcome::Failed => "FAILED",
        }
    }
}

/// Receipt for one execution of the stage graph.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: JobOutcome,
    pub stages: Vec<StageReport>,
}

impl JobRun {
    pub fn succeeded(&self) -> bool {
        self.outcome == JobOutcome::Succeeded
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }

    pub fn status_of(&self, stage: Stage) -> Option<StageStatus> {
        self.stage(stage).map(|report| report.status)
    }

    pub fn failed_stages(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|report| report.status == StageStatus::Failed)
    }
}

pub struct Orchestrator {
    executor: Arc<dyn StageExecutor>,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        trigger: Trigger,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> JobRun {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(%run_id, trigger = trigger.as_str(), "job started");

        let mut reports: Vec<StageReport> =
            Stage::ORDER.iter().copied().map(StageReport::pending).collect();

        for idx in 0..reports.len() {
            let stage = reports[idx].stage;

            let blocked_by = stage.dependencies().iter().copied().find(|dep| {
                reports
                    .iter()
                    .find(|r| r.stage == *dep)
                    .map_or(true, |r| r.status != StageStatus::Succeeded)
            });

            let skip_reason = if cancel.is_cancelled() {
                Some("job cancelled before stage started".to_string())
            } else if let Some(dep) = blocked_by {
                Some(format!("upstream stage {dep} did not succeed"))
            } else if !self.executor.is_enabled(stage) {
                Some(format!("{stage} is not configured"))
            } else {
                None
            };

            let report = &mut reports[idx];
            if let Some(reason) = skip_reason {
                skip(report, reason, sink);
                continue;
            }

            self.run_stage(report, cancel, sink).await;
        }

        let outcome = if reports.iter().any(|r| r.status == StageStatus::Failed) {
            JobOutcome::Failed
        } else {
            JobOutcome::Succeeded
        };

        let run = JobRun {
            run_id,
            trigger,
            started_at,
            finished_at: Some(Utc::now()),
            outcome,
            stages: reports,
        };

        match run.outcome {
            JobOutcome::Failed => {
                let failed: Vec<&str> = run.failed_stages().map(|r| r.stage.as_str()).collect();
                tracing::error!(%run_id, failed = ?failed, "job failed");
            }
            _ => tracing::info!(%run_id, "job succeeded"),
        }
        run
    }

    async fn run_stage(
        &self,
        report: &mut StageReport,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) {
        let stage = report.stage;
        mark(report, StageStatus::Running);
        sink.emit(&PipelineEvent::StageStarted { stage });

        let capture = StageCapture::new(stage, sink);
        let result = {
            let body = async {
                match stage {
                    Stage::Collect => self.executor.collect(&capture).await,
                    Stage::Load => self.executor.load(&capture).await,
                    Stage::Transform => self.executor.transform(&capture).await,
                    Stage::Classify => self.executor.classify(&capture).await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                result = body => result,
            }
        };

        match result {
            Ok(StageResult::Succeeded(summary)) => {
                report.summary = Some(summary);
                mark(report, StageStatus::Succeeded);
            }
            Ok(StageResult::Failed { summary, error }) => {
                report.summary = Some(summary);
                report.error = Some(error);
                mark(report, StageStatus::Failed);
            }
            Err(err) => {
                report.error = Some(match err {
                    PipelineError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                });
                mark(report, StageStatus::Failed);
            }
        }

        if let Some(error) = &report.error {
            capture.emit(&PipelineEvent::note(
                EventLevel::Error,
                format!("stage {stage} failed: {error}"),
            ));
        }
        report.logs = capture.into_lines();
        sink.emit(&PipelineEvent::StageFinished {
            stage,
            status: report.status,
        });
    }
}

fn skip(report: &mut StageReport, reason: String, sink: &dyn EventSink) {
    mark(report, StageStatus::Skipped);
    report.error = None;
    report.logs.push(StageLogLine {
        at: Utc::now(),
        level: EventLevel::Info,
        message: format!("[{}] skipped: {reason}", report.stage),
    });
    sink.emit(&PipelineEvent::StageFinished {
        stage: report.stage,
        status: StageStatus::Skipped,
    });
}

fn mark(report: &mut StageReport, to: StageStatus) {
    if let Err(err) = report.transition(to) {
        tracing::error!(error = %err, "stage state machine violated");
    }
}

/// Production stage bodies wired from configuration.
pub struct PipelineStages {
    store: PartitionStore,
    collector: Collector,
    classifier: ImageClassifier,
    transform: TransformRunner,
    database: DatabaseConfig,
    retry: RetryPolicy,
    pool: OnceCell<DbPool>,
}

impl PipelineStages {
    pub fn new(
        config: &MedlakeConfig,
        source: Arc<dyn MessageSource>,
        detector: Arc<dyn ObjectDetector>,
    ) -> Self {
        let store = PartitionStore::new(&config.data_dir);
        let retry = config.retry_policy();
        Self {
            collector: Collector::new(
                source,
                store.clone(),
                CollectorSettings::from_config(config),
            ),
            classifier: ImageClassifier::new(detector, store.clone(), retry),
            transform: TransformRunner::new(&config.transform),
            database: config.database.clone(),
            store,
            retry,
            pool: OnceCell::new(),
        }
    }

    /// Reuses an existing pool instead of connecting on first use.
    pub fn with_pool(self, pool: DbPool) -> Self {
        Self {
            pool: OnceCell::new_with(Some(pool)),
            ..self
        }
    }

    /// Connects on first call; stages that never touch the database never
    /// connect.
    pub async fn pool(&self) -> Result<&DbPool> {
        self.pool
            .get_or_try_init(|| db::connect(&self.database, &self.retry))
            .await
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }
}

#[async_trait]
impl StageExecutor for PipelineStages {
    fn is_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Transform => self.transform.is_configured(),
            _ => true,
        }
    }

    async fn collect(&self, events: &dyn EventSink) -> Result<StageResult> {
        let report = self.collector.collect_all(events).await?;
        let summary = StageSummary::Collect {
            records_collected: report.records_collected(),
            records_written: report.records_written(),
            duplicates: report.channels.iter().map(|c| c.duplicates).sum(),
            rejected: report.channels.iter().map(|c| c.rejected).sum(),
            media_downloaded: report.channels.iter().map(|c| c.media_downloaded).sum(),
            media_failed: report.channels.iter().map(|c| c.media_failed).sum(),
            partitions_failed: report.partitions_failed(),
            records_dropped: report.records_dropped(),
            channels_failed: report.channels_failed(),
        };

        if report.all_channels_failed() {
            return Ok(StageResult::Failed {
                summary,
                error: format!("all {} configured channel(s) failed", report.channels.len()),
            });
        }
        Ok(StageResult::Succeeded(summary))
    }

    async fn load(&self, events: &dyn EventSink) -> Result<StageResult> {
        let pool = self.pool().await?.clone();
        let loader = MessageLoader::new(pool, self.store.clone(), self.retry);
        let report = loader.load(events).await?;
        Ok(StageResult::Succeeded(StageSummary::Load {
            partitions_loaded: report.partitions_loaded,
            partitions_failed: report.partitions_failed,
            records_seen: report.records_seen,
            rows_inserted: report.rows_inserted,
        }))
    }

    async fn transform(&self, events: &dyn EventSink) -> Result<StageResult> {
        let outcome = self.transform.run(events).await?;
        let summary = StageSummary::Transform {
            exit_code: outcome.exit_code(),
        };
        Ok(match outcome {
            TransformOutcome::Completed { .. } | TransformOutcome::NotConfigured => {
                StageResult::Succeeded(summary)
            }
            TransformOutcome::Failed { exit_code } => StageResult::Failed {
                summary,
                error: match exit_code {
                    Some(code) => format!("transform exited with code {code}"),
                    None => "transform terminated by signal".to_string(),
                },
            },
            TransformOutcome::TimedOut => StageResult::Failed {
                summary,
                error: "transform timed out".to_string(),
            },
        })
    }

    async fn classify(&self, events: &dyn EventSink) -> Result<StageResult> {
        let batch = self.classifier.process_all(events).await?;
        let csv_path = self.classifier.export_csv(&batch.rows)?;
        tracing::debug!(path = %csv_path.display(), rows = batch.rows.len(), "detections exported");

        let pool = self.pool().await?.clone();
        let loaded = DetectionLoader::new(pool, self.retry)
            .load(&batch.rows, events)
            .await?;

        Ok(StageResult::Succeeded(StageSummary::Classify {
            images_classified: batch.report.classified,
            images_skipped: batch.report.skipped,
            images_failed: batch.report.failed,
            detections_inserted: loaded.inserted,
        }))
    }
}
