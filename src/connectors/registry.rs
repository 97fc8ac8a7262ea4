//! 连接器注册表
//!
//! 平台 → 构造函数的显式映射，在启动时组装后注入各服务

use std::collections::HashMap;
use std::sync::Arc;

use super::figma::FigmaConnector;
use super::google_workspace::GoogleWorkspaceConnector;
use super::http::HttpSettings;
use super::jira::JiraConnector;
use super::notion::NotionConnector;
use super::slack::SlackConnector;
use super::{Connector, ConnectorError};
use crate::models::integration::{ConnectorConfig, Platform};

/// 连接器构造函数
pub type ConnectorFactory =
    Arc<dyn Fn(ConnectorConfig) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<Platform, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// 空注册表（测试里按需登记假连接器）
    pub fn new() -> Self {
        Self::default()
    }

    /// 五个内置平台
    pub fn with_defaults(settings: HttpSettings) -> Self {
        let mut registry = Self::new();

        let s = settings.clone();
        registry.register(Platform::Slack, move |config| {
            Ok(Arc::new(SlackConnector::new(config, s.clone())?) as Arc<dyn Connector>)
        });
        let s = settings.clone();
        registry.register(Platform::GoogleWorkspace, move |config| {
            Ok(Arc::new(GoogleWorkspaceConnector::new(config, s.clone())?) as Arc<dyn Connector>)
        });
        let s = settings.clone();
        registry.register(Platform::Notion, move |config| {
            Ok(Arc::new(NotionConnector::new(config, s.clone())?) as Arc<dyn Connector>)
        });
        let s = settings.clone();
        registry.register(Platform::Figma, move |config| {
            Ok(Arc::new(FigmaConnector::new(config, s.clone())?) as Arc<dyn Connector>)
        });
        let s = settings;
        registry.register(Platform::Jira, move |config| {
            Ok(Arc::new(JiraConnector::new(config, s.clone())?) as Arc<dyn Connector>)
        });

        registry
    }

    pub fn register<F>(&mut self, platform: Platform, factory: F) -> &mut Self
    where
        F: Fn(ConnectorConfig) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync + 'static,
    {
        self.factories.insert(platform, Arc::new(factory));
        self
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.factories.contains_key(&platform)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.factories.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }

    /// 用凭证构造连接器实例
    pub fn create(
        &self,
        platform: Platform,
        config: ConnectorConfig,
    ) -> Result<Arc<dyn Connector>, ConnectorError> {
        let factory = self.factories.get(&platform).ok_or_else(|| {
            ConnectorError::new(
                "unregistered_platform",
                format!("No connector registered for {}", platform),
            )
        })?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_platform() {
        let registry = ConnectorRegistry::with_defaults(HttpSettings::default());
        for platform in Platform::ALL {
            assert!(registry.supports(platform), "{} missing", platform);
        }
        assert_eq!(registry.platforms().len(), 5);
    }

    #[test]
    fn test_create_builds_matching_platform() {
        let registry = ConnectorRegistry::with_defaults(HttpSettings::default());
        let connector = registry
            .create(Platform::Notion, ConnectorConfig::new(uuid::Uuid::new_v4(), "secret"))
            .unwrap();
        assert_eq!(connector.platform(), Platform::Notion);
    }

    #[test]
    fn test_unregistered_platform_is_an_error() {
        let registry = ConnectorRegistry::new();
        let err = registry
            .create(Platform::Slack, ConnectorConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.code, "unregistered_platform");
    }
}
