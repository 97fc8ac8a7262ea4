//! 步骤执行器
//!
//! 一个作业运行的上下文：已完成的步骤直接返回保存的输出，未完成的执行后落库。

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::JobError;
use crate::error::AppError;
use crate::models::jobs::JobRun;
use crate::repository::JobRunStore;

pub struct StepContext {
    run: JobRun,
    store: Arc<dyn JobRunStore>,
    executed: Vec<String>,
}

impl StepContext {
    pub fn new(run: JobRun, store: Arc<dyn JobRunStore>) -> Self {
        Self {
            run,
            store,
            executed: Vec::new(),
        }
    }

    pub fn run(&self) -> &JobRun {
        &self.run
    }

    /// 本次尝试中真正执行过的步骤
    pub fn executed_steps(&self) -> &[String] {
        &self.executed
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.run.completed_steps.contains_key(name)
    }

    /// 执行一个具名步骤
    ///
    /// 之前的尝试已完成的步骤不会再执行，直接反序列化保存的输出
    pub async fn step<T, F, Fut>(&mut self, name: &str, f: F) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if let Some(saved) = self.run.completed_steps.get(name) {
            debug!(job_key = %self.run.job_key, step = name, "Step already completed, skipping");
            return serde_json::from_value(saved.clone()).map_err(|e| JobError::StepOutput {
                step: name.to_string(),
                message: e.to_string(),
            });
        }

        let output = f().await.map_err(|source| JobError::Step {
            step: name.to_string(),
            source,
        })?;

        let value = serde_json::to_value(&output).map_err(|e| JobError::StepOutput {
            step: name.to_string(),
            message: e.to_string(),
        })?;
        self.store.complete_step(self.run.id, name, &value).await?;
        self.run.completed_steps.insert(name.to_string(), value);
        self.executed.push(name.to_string());
        debug!(job_key = %self.run.job_key, step = name, "Step completed");

        Ok(output)
    }
}
