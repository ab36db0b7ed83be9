use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use medlake_core::detector::HttpDetector;
use medlake_core::events::{EventLevel, EventSink, PipelineEvent, TracingSink};
use medlake_core::orchestrator::{StageCapture, StageExecutor, StageResult};
use medlake_core::runs;
use medlake_core::schedule::{self, JobSchedule};
use medlake_core::source::ExportSource;
use medlake_core::{db, JobRun, MedlakeConfig, PipelineStages, Stage, Trigger};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Channel ingestion and image enrichment pipeline",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to ./medlake.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full job once
    Run(RunArgs),
    /// Collect channel messages and media into the partition store
    Collect,
    /// Load stored partitions into the warehouse
    Load,
    /// Classify downloaded images and load the detections
    Classify,
    /// Run the job on its cron schedule until interrupted
    Schedule(ScheduleArgs),
    /// Run database migrations
    Migrate,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Print the job receipt as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug, Default)]
struct ScheduleArgs {
    /// Start the scheduler even if `schedule.enabled` is false
    #[arg(long)]
    enable: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = MedlakeConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Command::Run(args) => {
            let stages = build_stages(&config)?;
            let run = run_job(stages, Trigger::Manual, &cancel).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run);
            }
            Ok(exit_code(run.succeeded()))
        }
        Command::Collect => run_single(&config, Stage::Collect).await,
        Command::Load => run_single(&config, Stage::Load).await,
        Command::Classify => run_single(&config, Stage::Classify).await,
        Command::Schedule(args) => {
            if !(config.schedule.enabled || args.enable) {
                bail!("scheduled runs are disabled; set schedule.enabled = true or pass --enable");
            }
            let job_schedule = JobSchedule::parse(&config.schedule.cron)?;
            let stages = build_stages(&config)?;

            info!(schedule = job_schedule.expression(), "scheduler started");
            let runs = schedule::run_scheduled(&job_schedule, cancel.clone(), |fire_time| {
                let stages = stages.clone();
                let cancel = cancel.clone();
                async move {
                    info!(%fire_time, "scheduled run starting");
                    match run_job(stages, Trigger::Scheduled, &cancel).await {
                        Ok(run) if run.succeeded() => {
                            info!(run_id = %run.run_id, "scheduled run succeeded")
                        }
                        Ok(run) => warn!(run_id = %run.run_id, "scheduled run failed"),
                        Err(err) => warn!(error = %err, "scheduled run could not start"),
                    }
                }
            })
            .await;
            info!(runs, "scheduler stopped");
            Ok(ExitCode::SUCCESS)
        }
        Command::Migrate => {
            let pool = db::connect(&config.database, &config.retry_policy()).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_stages(config: &MedlakeConfig) -> Result<Arc<PipelineStages>> {
    let source = Arc::new(ExportSource::new(&config.source.export_dir));
    let detector =
        Arc::new(HttpDetector::new(&config.detector).context("building detector client")?);
    Ok(Arc::new(PipelineStages::new(config, source, detector)))
}

/// Runs the full graph under the job lock and records the receipt.
async fn run_job(
    stages: Arc<PipelineStages>,
    trigger: Trigger,
    cancel: &CancellationToken,
) -> Result<JobRun> {
    let execution = runs::execute_job(stages, trigger, cancel, &TracingSink)
        .await
        .context("preparing the job run")?;
    if !execution.recorded {
        warn!(run_id = %execution.run.run_id, "job receipt was not stored");
    }
    Ok(execution.run)
}

async fn run_single(config: &MedlakeConfig, stage: Stage) -> Result<ExitCode> {
    let stages = build_stages(config)?;
    let sink = TracingSink;
    let capture = StageCapture::new(stage, &sink);

    let result = match stage {
        Stage::Collect => stages.collect(&capture).await,
        Stage::Load => stages.load(&capture).await,
        Stage::Transform => stages.transform(&capture).await,
        Stage::Classify => stages.classify(&capture).await,
    };

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Stage", "Status", "Summary"]);

    let succeeded = match result {
        Ok(StageResult::Succeeded(summary)) => {
            table.add_row(vec![stage.to_string(), "succeeded".into(), summary.describe()]);
            true
        }
        Ok(StageResult::Failed { summary, error }) => {
            table.add_row(vec![
                stage.to_string(),
                "failed".into(),
                format!("{} ({error})", summary.describe()),
            ]);
            false
        }
        Err(err) => {
            capture.emit(&PipelineEvent::note(EventLevel::Error, err.to_string()));
            table.add_row(vec![stage.to_string(), "failed".into(), err.to_string()]);
            false
        }
    };

    println!("{table}");
    Ok(exit_code(succeeded))
}

fn print_run(run: &JobRun) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Stage", "Status", "Summary", "Error"]);

    for report in &run.stages {
        table.add_row(vec![
            report.stage.to_string(),
            report.status.to_string(),
            report
                .summary
                .as_ref()
                .map(|s| s.describe())
                .unwrap_or_default(),
            report.error.clone().unwrap_or_default(),
        ]);
    }

    println!("Run {} ({}): {:?}", run.run_id, run.trigger.as_str(), run.outcome);
    println!("{table}");
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

fn exit_code(succeeded: bool) -> ExitCode {
    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
