use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use medlake_core::events::{EventSink, MemorySink, PipelineEvent};
use medlake_core::orchestrator::{
    JobOutcome, Orchestrator, Stage, StageExecutor, StageResult, StageStatus, StageSummary, Trigger,
};
use medlake_core::{PipelineError, Result};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Script {
    Succeed,
    Fail,
    Error,
    CancelAndHang,
}

/// Plays back a scripted result per stage and records call order.
struct ScriptedExecutor {
    scripts: HashMap<Stage, Script>,
    disabled: Vec<Stage>,
    calls: Mutex<Vec<Stage>>,
    cancel: CancellationToken,
}

impl ScriptedExecutor {
    fn new(scripts: &[(Stage, Script)]) -> Self {
        Self {
            scripts: scripts.iter().copied().collect(),
            disabled: Vec::new(),
            calls: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn calls(&self) -> Vec<Stage> {
        self.calls.lock().unwrap().clone()
    }

    async fn play(&self, stage: Stage, events: &dyn EventSink) -> Result<StageResult> {
        self.calls.lock().unwrap().push(stage);
        events.emit(&PipelineEvent::note(
            medlake_core::events::EventLevel::Info,
            format!("{stage} body ran"),
        ));
        let summary = StageSummary::Transform { exit_code: Some(0) };
        match self.scripts.get(&stage).copied().unwrap_or(Script::Succeed) {
            Script::Succeed => Ok(StageResult::Succeeded(summary)),
            Script::Fail => Ok(StageResult::Failed {
                summary,
                error: format!("{stage} broke"),
            }),
            Script::Error => Err(PipelineError::Connectivity("database unreachable".into())),
            Script::CancelAndHang => {
                self.cancel.cancel();
                std::future::pending().await
            }
        }
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    fn is_enabled(&self, stage: Stage) -> bool {
        !self.disabled.contains(&stage)
    }

    async fn collect(&self, events: &dyn EventSink) -> Result<StageResult> {
        self.play(Stage::Collect, events).await
    }

    async fn load(&self, events: &dyn EventSink) -> Result<StageResult> {
        self.play(Stage::Load, events).await
    }

    async fn transform(&self, events: &dyn EventSink) -> Result<StageResult> {
        self.play(Stage::Transform, events).await
    }

    async fn classify(&self, events: &dyn EventSink) -> Result<StageResult> {
        self.play(Stage::Classify, events).await
    }
}

async fn run(executor: Arc<ScriptedExecutor>) -> medlake_core::JobRun {
    let cancel = executor.cancel.clone();
    Orchestrator::new(executor)
        .run(Trigger::Manual, &cancel, &MemorySink::new())
        .await
}

#[tokio::test]
async fn all_stages_run_in_order_when_everything_succeeds() {
    let executor = Arc::new(ScriptedExecutor::new(&[]));
    let job = run(executor.clone()).await;

    assert!(job.succeeded());
    assert_eq!(executor.calls(), Stage::ORDER.to_vec());
    for report in &job.stages {
        assert_eq!(report.status, StageStatus::Succeeded);
        assert!(report.started_at.is_some() && report.finished_at.is_some());
    }
}

#[tokio::test]
async fn collect_failure_skips_every_downstream_stage() {
    let executor = Arc::new(ScriptedExecutor::new(&[(Stage::Collect, Script::Fail)]));
    let job = run(executor.clone()).await;

    assert_eq!(job.outcome, JobOutcome::Failed);
    assert_eq!(executor.calls(), vec![Stage::Collect]);
    assert_eq!(job.status_of(Stage::Collect), Some(StageStatus::Failed));
    assert_eq!(job.status_of(Stage::Load), Some(StageStatus::Skipped));
    assert_eq!(job.status_of(Stage::Transform), Some(StageStatus::Skipped));
    assert_eq!(job.status_of(Stage::Classify), Some(StageStatus::Skipped));
    assert_eq!(
        job.stage(Stage::Collect).unwrap().error.as_deref(),
        Some("collect broke")
    );
}

#[tokio::test]
async fn load_failure_still_lets_classify_run() {
    let executor = Arc::new(ScriptedExecutor::new(&[(Stage::Load, Script::Error)]));
    let job = run(executor.clone()).await;

    assert!(!job.succeeded());
    assert_eq!(
        executor.calls(),
        vec![Stage::Collect, Stage::Load, Stage::Classify]
    );
    assert_eq!(job.status_of(Stage::Transform), Some(StageStatus::Skipped));
    assert_eq!(job.status_of(Stage::Classify), Some(StageStatus::Succeeded));

    let load = job.stage(Stage::Load).unwrap();
    assert!(load.summary.is_none());
    assert!(load.error.as_deref().unwrap().contains("database unreachable"));
}

#[tokio::test]
async fn unconfigured_transform_is_skipped_without_failing_the_job() {
    let mut executor = ScriptedExecutor::new(&[]);
    executor.disabled.push(Stage::Transform);
    let executor = Arc::new(executor);
    let job = run(executor.clone()).await;

    assert!(job.succeeded());
    assert_eq!(job.status_of(Stage::Transform), Some(StageStatus::Skipped));
    assert!(!executor.calls().contains(&Stage::Transform));
}

#[tokio::test]
async fn cancellation_fails_the_running_stage_and_skips_the_rest() {
    let executor = Arc::new(ScriptedExecutor::new(&[(Stage::Load, Script::CancelAndHang)]));
    let job = run(executor.clone()).await;

    assert_eq!(job.status_of(Stage::Collect), Some(StageStatus::Succeeded));
    assert_eq!(job.status_of(Stage::Load), Some(StageStatus::Failed));
    assert_eq!(job.stage(Stage::Load).unwrap().error.as_deref(), Some("cancelled"));
    assert_eq!(job.status_of(Stage::Transform), Some(StageStatus::Skipped));
    assert_eq!(job.status_of(Stage::Classify), Some(StageStatus::Skipped));
    assert_eq!(job.outcome, JobOutcome::Failed);
}

#[tokio::test]
async fn stage_logs_are_captured_with_stage_identity() {
    let executor = Arc::new(ScriptedExecutor::new(&[(Stage::Classify, Script::Fail)]));
    let sink = MemorySink::new();
    let cancel = CancellationToken::new();
    let job = Orchestrator::new(executor)
        .run(Trigger::Scheduled, &cancel, &sink)
        .await;

    let classify = job.stage(Stage::Classify).unwrap();
    assert!(classify
        .logs
        .iter()
        .any(|line| line.message == "[classify] classify body ran"));
    assert!(classify
        .logs
        .iter()
        .any(|line| line.message.contains("stage classify failed")));

    assert_eq!(sink.count("stage_started"), 4);
    assert_eq!(sink.count("stage_finished"), 4);

    let receipt = serde_json::to_value(&job).unwrap();
    assert_eq!(receipt["trigger"], "scheduled");
    assert_eq!(receipt["outcome"], "failed");
    assert_eq!(receipt["stages"][3]["status"], "failed");
}
