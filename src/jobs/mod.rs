//! 后台作业
//!
//! 外部调度器投递的事件按名称分发到处理函数。每个处理函数是一串具名步骤，
//! 完成的步骤连同输出持久化在 job_runs 上，重试时跳过已完成的步骤。

pub mod dispatcher;
pub mod handlers;
pub mod queue;
pub mod runner;
pub mod scheduler;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::AppError;
use crate::models::jobs::JobEnvelope;

pub use dispatcher::JobDispatcher;
pub use handlers::JobHandlers;
pub use queue::{JobQueue, JobReceiver, JobWorker, RetryPolicy};
pub use runner::StepContext;
pub use scheduler::Scheduler;

/// 作业错误
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: AppError,
    },

    #[error("Step '{step}' produced unreadable output: {message}")]
    StepOutput { step: String, message: String },

    #[error("Job {key} gave up after {attempts} attempts")]
    AttemptsExhausted { key: String, attempts: i32 },

    /// 重试也不会成功的错误（缺少配置、事件不合法等）
    #[error("Job cannot run: {0}")]
    Permanent(String),

    #[error("Job queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Persistence(#[from] AppError),
}

impl JobError {
    /// 是否值得在作业级别重试
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Step { source, .. } => !matches!(
                source,
                AppError::Unsupported(_)
                    | AppError::Conflict(_)
                    | AppError::NotFound(_)
                    | AppError::BadRequest(_)
                    | AppError::Validation(_)
                    | AppError::Expired(_)
            ),
            JobError::Persistence(_) => true,
            JobError::StepOutput { .. }
            | JobError::AttemptsExhausted { .. }
            | JobError::Permanent(_)
            | JobError::QueueClosed => false,
        }
    }
}

/// 事件投递出口（进程内队列或外部调度器）
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: JobEnvelope) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        let step = |source| JobError::Step {
            step: "execute".to_string(),
            source,
        };
        assert!(step(AppError::Connector("502".to_string())).is_retryable());
        assert!(step(AppError::Timeout("slow".to_string())).is_retryable());
        assert!(!step(AppError::Unsupported("figma".to_string())).is_retryable());
        assert!(!step(AppError::Conflict("dismissed".to_string())).is_retryable());
        assert!(!JobError::Permanent("no legacy store".to_string()).is_retryable());
    }
}
