//! 作业分发器

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use super::handlers::JobHandlers;
use super::runner::StepContext;
use super::JobError;
use crate::models::jobs::{JobEnvelope, JobOutcome, JobRunStatus};
use crate::repository::JobRunStore;
use crate::services::{Notification, Notifier};

/// 按幂等键记录每次尝试，再交给处理函数
pub struct JobDispatcher {
    runs: Arc<dyn JobRunStore>,
    handlers: Arc<JobHandlers>,
    notifier: Arc<dyn Notifier>,
    max_attempts: i32,
}

impl JobDispatcher {
    pub fn new(
        runs: Arc<dyn JobRunStore>,
        handlers: Arc<JobHandlers>,
        notifier: Arc<dyn Notifier>,
        max_attempts: i32,
    ) -> Self {
        Self {
            runs,
            handlers,
            notifier,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// 处理一次投递
    ///
    /// 已完成的键直接返回保存的结果；失败的尝试记录错误后原样返回，由投递方决定是否重投
    #[instrument(skip(self, envelope), fields(event = envelope.event.name()))]
    pub async fn dispatch(&self, envelope: &JobEnvelope) -> Result<JobOutcome, JobError> {
        let key = envelope.idempotency_key();
        let event_name = envelope.event.name();
        let run = self
            .runs
            .begin_run(&key, event_name, envelope.event.tenant_id())
            .await?;

        if run.status == JobRunStatus::Completed {
            info!(job_key = %key, "Job already completed, returning stored outcome");
            return Ok(run.outcome.map(|o| o.0).unwrap_or_default());
        }

        if run.attempts > self.max_attempts {
            let err = JobError::AttemptsExhausted {
                key: key.clone(),
                attempts: run.attempts - 1,
            };
            self.runs
                .finish_run(run.id, JobRunStatus::Failed, None, Some(&err.to_string()))
                .await?;
            metrics::counter!("job_runs_total", "event" => event_name, "outcome" => "exhausted")
                .increment(1);
            return Err(err);
        }

        let started = Instant::now();
        let attempts = run.attempts;
        let mut ctx = StepContext::new(run, self.runs.clone());
        let result = self.handlers.handle(&envelope.event, &mut ctx).await;
        let run_id = ctx.run().id;

        metrics::histogram!("job_duration_seconds", "event" => event_name)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                self.runs
                    .finish_run(run_id, JobRunStatus::Completed, Some(&outcome), None)
                    .await?;
                metrics::counter!("job_runs_total", "event" => event_name, "outcome" => "completed")
                    .increment(1);
                info!(
                    job_key = %key,
                    attempts,
                    processed = outcome.processed,
                    failed = outcome.failed,
                    steps = ?ctx.executed_steps(),
                    "Job completed"
                );
                Ok(outcome)
            }
            Err(err) => {
                let message = err.to_string();
                self.runs
                    .finish_run(run_id, JobRunStatus::Failed, None, Some(&message))
                    .await?;
                metrics::counter!("job_runs_total", "event" => event_name, "outcome" => "failed")
                    .increment(1);

                let final_attempt = !err.is_retryable() || attempts >= self.max_attempts;
                if final_attempt {
                    error!(job_key = %key, attempts, error = %message, "Job failed permanently");
                    let notified = self
                        .notifier
                        .notify(&Notification::JobFailed {
                            job_key: key.clone(),
                            event_name: event_name.to_string(),
                            attempts,
                            error: message,
                        })
                        .await;
                    if let Err(e) = notified {
                        warn!(job_key = %key, error = %e, "Failed to send job failure notification");
                    }
                } else {
                    warn!(job_key = %key, attempts, error = %message, "Job attempt failed, will retry");
                }
                Err(err)
            }
        }
    }
}
