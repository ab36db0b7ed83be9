//! Cron-style recurring invocation of the pipeline job.

use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("invalid schedule '{expression}': {message}")]
pub struct ScheduleError {
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct JobSchedule {
    expression: String,
    schedule: Schedule,
}

impl JobSchedule {
    /// Accepts six/seven-field cron expressions (with seconds) and classic
    /// five-field ones, which fire at second zero.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };

        let schedule = Schedule::from_str(&normalized).map_err(|err| ScheduleError {
            expression: expression.to_string(),
            message: err.to_string(),
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Waits for each fire time and invokes `run_job`, until `cancel` fires or
/// the schedule has no further occurrences. Returns the number of runs.
pub async fn run_scheduled<F, Fut>(
    schedule: &JobSchedule,
    cancel: CancellationToken,
    mut run_job: F,
) -> usize
where
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut runs = 0;
    let mut last_fire: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        let reference = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = schedule.next_after(reference) else {
            tracing::info!(schedule = schedule.expression(), "schedule has no further runs");
            break;
        };

        let wait = (next - now).to_std().unwrap_or_default();
        tracing::info!(
            schedule = schedule.expression(),
            next_run = %next,
            "waiting for next scheduled run"
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if cancel.is_cancelled() {
            break;
        }

        last_fire = Some(next);
        run_job(next).await;
        runs += 1;
    }

    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn five_field_expressions_fire_on_the_minute() {
        let schedule = JobSchedule::parse("0 2 * * *").expect("parse");
        let from = Utc.with_ymd_and_hms(2026, 1, 15, 13, 45, 10).unwrap();
        let next = schedule.next_after(from).expect("next run");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 16, 2, 0, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_are_used_verbatim() {
        let schedule = JobSchedule::parse("30 15 * * * *").expect("parse");
        let from = Utc.with_ymd_and_hms(2026, 1, 15, 13, 0, 0).unwrap();
        let next = schedule.next_after(from).expect("next run");
        assert_eq!((next.minute(), next.second()), (15, 30));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(JobSchedule::parse("daily").is_err());
        assert!(JobSchedule::parse("").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_loop_stops_when_cancelled() {
        let schedule = JobSchedule::parse("* * * * * *").expect("every second");
        let cancel = CancellationToken::new();
        let mut fired = Vec::new();

        let runs = run_scheduled(&schedule, cancel.clone(), |at| {
            fired.push(at);
            if fired.len() == 3 {
                cancel.cancel();
            }
            async {}
        })
        .await;

        assert_eq!(runs, 3);
        assert!(fired.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn cancelled_before_first_fire_runs_nothing() {
        let schedule = JobSchedule::parse("0 2 * * *").expect("parse");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runs = run_scheduled(&schedule, cancel, |_| async {}).await;
        assert_eq!(runs, 0);
    }
}
