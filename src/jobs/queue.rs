//! 进程内作业队列
//!
//! 没有外部调度器时使用：mpsc 通道 + 信号量限流的 worker，失败的尝试按指数退避重投。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatcher::JobDispatcher;
use super::{EventPublisher, JobError};
use crate::connectors::http::backoff;
use crate::models::jobs::JobEnvelope;

/// 作业级重试
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// 投递端
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<JobEnvelope>,
}

/// 消费端
pub struct JobReceiver {
    receiver: mpsc::Receiver<JobEnvelope>,
}

impl JobQueue {
    pub fn channel(capacity: usize) -> (JobQueue, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (JobQueue { sender }, JobReceiver { receiver })
    }
}

#[async_trait]
impl EventPublisher for JobQueue {
    async fn publish(&self, mut envelope: JobEnvelope) -> Result<(), JobError> {
        // 重投必须复用同一个幂等键
        if envelope.id.is_none() && envelope.event.natural_key().is_none() {
            envelope.id = Some(Uuid::new_v4().to_string());
        }
        debug!(event = envelope.event.name(), id = ?envelope.id, "Enqueueing job");
        self.sender
            .send(envelope)
            .await
            .map_err(|_| JobError::QueueClosed)
    }
}

/// 运行中的消费循环
pub struct JobWorker {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    concurrency: u32,
}

impl JobWorker {
    /// 停止接收新作业，等待在途作业结束；超时返回 false
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.stop.notify_one();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Job worker loop ended abnormally");
        }
        tokio::time::timeout(grace, self.semaphore.acquire_many(self.concurrency))
            .await
            .is_ok()
    }
}

impl JobReceiver {
    /// 启动消费循环；收到停止信号或所有投递端关闭后退出
    pub fn spawn(
        mut self,
        dispatcher: Arc<JobDispatcher>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> JobWorker {
        let concurrency = concurrency.clamp(1, Semaphore::MAX_PERMITS) as u32;
        let semaphore = Arc::new(Semaphore::new(concurrency as usize));
        let stop = Arc::new(Notify::new());

        let loop_semaphore = semaphore.clone();
        let loop_stop = stop.clone();
        let handle = tokio::spawn(async move {
            info!(concurrency, "Job worker started");
            loop {
                let envelope = tokio::select! {
                    _ = loop_stop.notified() => break,
                    next = self.receiver.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let permit = match loop_semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    run_with_retry(&dispatcher, &envelope, retry).await;
                    drop(permit);
                });
            }
            info!("Job worker stopped");
        });

        JobWorker {
            stop,
            handle,
            semaphore,
            concurrency,
        }
    }
}

async fn run_with_retry(dispatcher: &JobDispatcher, envelope: &JobEnvelope, retry: RetryPolicy) {
    let max_attempts = retry.max_attempts.max(1);
    for attempt in 0..max_attempts {
        match dispatcher.dispatch(envelope).await {
            Ok(outcome) => {
                debug!(event = envelope.event.name(), processed = outcome.processed, "Job delivered");
                return;
            }
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = backoff(retry.base_delay, attempt);
                warn!(
                    event = envelope.event.name(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying job"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(event = envelope.event.name(), error = %e, "Job abandoned");
                return;
            }
        }
    }
}
