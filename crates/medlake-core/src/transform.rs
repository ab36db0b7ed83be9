//! Runs the external warehouse transform as a child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::config::TransformConfig;
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, OutputStream, PipelineEvent};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransformOutcome {
    /// No command configured.
    NotConfigured,
    Completed { exit_code: i32 },
    Failed { exit_code: Option<i32> },
    TimedOut,
}

impl TransformOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, TransformOutcome::Completed { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TransformOutcome::Completed { exit_code } => Some(*exit_code),
            TransformOutcome::Failed { exit_code } => *exit_code,
            TransformOutcome::NotConfigured | TransformOutcome::TimedOut => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformRunner {
    command: Option<Vec<String>>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl TransformRunner {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            command: config.command.clone().filter(|argv| !argv.is_empty()),
            working_dir: config.working_dir.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.command.is_some()
    }

    pub async fn run(&self, events: &dyn EventSink) -> Result<TransformOutcome> {
        let Some(argv) = &self.command else {
            return Ok(TransformOutcome::NotConfigured);
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PipelineError::Validation("transform command is empty".into()))?;

        tracing::info!(
            program = %program,
            working_dir = %self.working_dir.display(),
            "starting transform"
        );

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            tokio::join!(
                forward_lines(stdout, OutputStream::Stdout, events),
                forward_lines(stderr, OutputStream::Stderr, events),
            );
            child.wait().await
        };

        let waited = tokio::time::timeout(self.timeout, run).await;
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(error = %err, "failed to kill timed-out transform");
                }
                return Ok(TransformOutcome::TimedOut);
            }
        };

        Ok(match status.code() {
            Some(0) => TransformOutcome::Completed { exit_code: 0 },
            code => TransformOutcome::Failed { exit_code: code },
        })
    }
}

async fn forward_lines<R>(reader: Option<R>, stream: OutputStream, events: &dyn EventSink)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => events.emit(&PipelineEvent::TransformOutput { stream, line }),
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "transform output unreadable");
                break;
            }
        }
    }
}
