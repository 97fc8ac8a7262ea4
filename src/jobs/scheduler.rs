//! 内置定时触发器
//!
//! 按配置的间隔投递定时事件；同一时间片内的重复投递落到同一个幂等键上。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::EventPublisher;
use crate::config::JobsConfig;
use crate::models::jobs::{JobEnvelope, JobEvent};

#[derive(Debug, Clone)]
pub struct Trigger {
    pub events: Vec<JobEvent>,
    pub every: Duration,
}

pub struct Scheduler {
    publisher: Arc<dyn EventPublisher>,
    triggers: Vec<Trigger>,
}

impl Scheduler {
    pub fn new(publisher: Arc<dyn EventPublisher>, triggers: Vec<Trigger>) -> Self {
        Self {
            publisher,
            triggers,
        }
    }

    /// 清理后紧跟健康检查；提醒、自动化、失败监控各自独立
    pub fn from_config(publisher: Arc<dyn EventPublisher>, config: &JobsConfig) -> Self {
        let secs = |s: u64| Duration::from_secs(s.max(1));
        let triggers = vec![
            Trigger {
                events: vec![JobEvent::ArchiveExpirySweep, JobEvent::ArchiveHealthCheck],
                every: secs(config.expiry_sweep_interval_secs),
            },
            Trigger {
                events: vec![JobEvent::ArchiveExpiryWarn],
                every: secs(config.expiry_warning_interval_secs),
            },
            Trigger {
                events: vec![JobEvent::AutomationRun],
                every: secs(config.automation_interval_secs),
            },
            Trigger {
                events: vec![JobEvent::FailureMonitor],
                every: secs(config.failure_monitor_interval_secs),
            },
        ];
        Self::new(publisher, triggers)
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.triggers
            .into_iter()
            .map(|trigger| {
                let publisher = self.publisher.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(trigger.every);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        for event in &trigger.events {
                            let envelope = scheduled_envelope(event.clone(), trigger.every);
                            if let Err(e) = publisher.publish(envelope).await {
                                warn!(event = event.name(), error = %e, "Failed to publish scheduled event");
                                if matches!(e, super::JobError::QueueClosed) {
                                    info!("Job queue closed, stopping scheduler trigger");
                                    return;
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

/// 事件 ID 取当前时间片编号
pub fn scheduled_envelope(event: JobEvent, every: Duration) -> JobEnvelope {
    let slot = Utc::now().timestamp() / every.as_secs().max(1) as i64;
    JobEnvelope {
        id: Some(format!("scheduled-{}", slot)),
        event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelopes_in_same_slot_share_key() {
        let every = Duration::from_secs(86_400);
        let a = scheduled_envelope(JobEvent::ArchiveExpirySweep, every);
        let b = scheduled_envelope(JobEvent::ArchiveExpirySweep, every);
        assert_eq!(a.idempotency_key(), b.idempotency_key());

        let other = scheduled_envelope(JobEvent::ArchiveExpiryWarn, every);
        assert_ne!(a.idempotency_key(), other.idempotency_key());
    }
}
