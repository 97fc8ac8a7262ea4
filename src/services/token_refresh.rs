//! 令牌刷新
//!
//! 调用连接器前检查访问令牌是否临近过期；同一集成的刷新串行执行，
//! 并发调用方在锁内重新读取凭证，不会重复刷新。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::concurrency::{ConcurrencyStrategy, KeyedLocks};
use crate::connectors::{Connector, ConnectorRegistry};
use crate::error::{AppError, Result};
use crate::models::integration::{ConnectorConfig, Integration, Platform, SyncStatus};
use crate::repository::IntegrationStore;

/// 等待其他刷新完成的上限
const REFRESH_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TokenService {
    integrations: Arc<dyn IntegrationStore>,
    registry: ConnectorRegistry,
    locks: KeyedLocks,
    skew_secs: i64,
}

impl TokenService {
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        registry: ConnectorRegistry,
        skew_secs: i64,
    ) -> Self {
        Self {
            integrations,
            registry,
            locks: KeyedLocks::new("integration", ConcurrencyStrategy::Wait, REFRESH_LOCK_TIMEOUT),
            skew_secs,
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// 返回可用的凭证，必要时先刷新并持久化
    ///
    /// 刷新失败时集成被标记为 ERROR，错误原样返回给调用方
    #[instrument(skip(self, integration), fields(integration_id = %integration.id, platform = %integration.platform))]
    pub async fn fresh_credentials(
        &self,
        integration: &Integration,
        now: DateTime<Utc>,
    ) -> Result<ConnectorConfig> {
        if !integration.credentials.expires_within(now, self.skew_secs) {
            return Ok(integration.credentials.0.clone());
        }

        let _permit = self.locks.acquire(&integration.id.to_string()).await?;

        // 锁内重新读取，别的调用方可能已经刷新过
        let current = self
            .integrations
            .get_integration(integration.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Integration {}", integration.id)))?;
        let mut credentials = current.credentials.0.clone();
        if !credentials.expires_within(now, self.skew_secs) {
            return Ok(credentials);
        }

        let connector = self.build(integration, credentials.clone())?;
        match connector.refresh_token().await {
            Ok(grant) => {
                grant.apply_to(&mut credentials);
                self.integrations
                    .update_credentials(integration.id, &credentials)
                    .await?;
                info!("Integration credentials refreshed");
                Ok(credentials)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, marking integration as errored");
                self.integrations
                    .set_sync_status(integration.id, SyncStatus::Error, Some(&e.to_string()), now)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// 用最新凭证构造连接器
    pub async fn connector_for(
        &self,
        integration: &Integration,
        now: DateTime<Utc>,
    ) -> Result<Arc<dyn Connector>> {
        let credentials = self.fresh_credentials(integration, now).await?;
        self.build(integration, credentials)
    }

    /// 租户在某平台上的有效集成对应的连接器
    pub async fn connector_for_platform(
        &self,
        tenant_id: Uuid,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<Arc<dyn Connector>> {
        let integration = self
            .integrations
            .find_active_integration(tenant_id, platform)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No active {} integration for tenant", platform))
            })?;
        self.connector_for(&integration, now).await
    }

    fn build(
        &self,
        integration: &Integration,
        credentials: ConnectorConfig,
    ) -> Result<Arc<dyn Connector>> {
        Ok(self.registry.create(integration.platform, credentials)?)
    }
}
