//! Job run repository (作业步骤游标数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use super::JobRunStore;
use crate::{
    error::AppError,
    models::jobs::{JobOutcome, JobRun, JobRunStatus},
};

const RUN_COLUMNS: &str = "id, job_key, event_name, tenant_id, status, attempts, completed_steps, \
     outcome, last_error, created_at, updated_at";

pub struct PgJobRunStore {
    db: PgPool,
}

impl PgJobRunStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobRunStore for PgJobRunStore {
    async fn begin_run(
        &self,
        key: &str,
        event_name: &str,
        tenant_id: Option<Uuid>,
    ) -> Result<JobRun, AppError> {
        // 已完成的运行保持原样；其余情况尝试次数 +1 并回到 RUNNING
        let sql = format!(
            r#"
            INSERT INTO job_runs (id, job_key, event_name, tenant_id, status, attempts)
            VALUES ($1, $2, $3, $4, 'running', 1)
            ON CONFLICT (job_key) DO UPDATE
            SET attempts = CASE WHEN job_runs.status = 'completed' THEN job_runs.attempts
                                ELSE job_runs.attempts + 1 END,
                status = CASE WHEN job_runs.status = 'completed' THEN job_runs.status
                              ELSE 'running'::job_run_status END,
                updated_at = NOW()
            RETURNING {}
            "#,
            RUN_COLUMNS
        );
        let run = sqlx::query_as::<_, JobRun>(&sql)
            .bind(Uuid::new_v4())
            .bind(key)
            .bind(event_name)
            .bind(tenant_id)
            .fetch_one(&self.db)
            .await?;

        Ok(run)
    }

    async fn complete_step(
        &self,
        run_id: Uuid,
        step: &str,
        output: &serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE job_runs
            SET completed_steps = completed_steps || jsonb_build_object($2::text, $3::jsonb),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(step)
        .bind(Json(output))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: JobRunStatus,
        outcome: Option<&JobOutcome>,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, outcome = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status)
        .bind(outcome.map(Json))
        .bind(error)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list_failed_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRun>, AppError> {
        let sql = format!(
            "SELECT {} FROM job_runs WHERE status = 'failed' AND updated_at >= $1 ORDER BY updated_at DESC",
            RUN_COLUMNS
        );
        let runs = sqlx::query_as::<_, JobRun>(&sql)
            .bind(since)
            .fetch_all(&self.db)
            .await?;

        Ok(runs)
    }
}
