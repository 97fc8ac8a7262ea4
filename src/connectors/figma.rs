//! Figma 连接器（只读）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::dedupe::mark_duplicates;
use super::http::{ApiClient, HttpSettings};
use super::{oauth, Connector, ConnectorError, TokenError, TokenGrant};
use crate::models::audit::{AuditData, FileRecord};
use crate::models::integration::{ConnectorConfig, Platform};

pub const API_BASE: &str = "https://api.figma.com/v1";

pub struct FigmaConnector {
    config: ConnectorConfig,
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: serde_json::Value,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    #[serde(default)]
    projects: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct FigmaFile {
    key: String,
    name: String,
    last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FigmaFile>,
}

impl FigmaConnector {
    pub fn new(config: ConnectorConfig, settings: HttpSettings) -> Result<Self, ConnectorError> {
        Self::with_base_url(config, settings, API_BASE)
    }

    pub fn with_base_url(
        config: ConnectorConfig,
        settings: HttpSettings,
        base_url: &str,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            api: ApiClient::new(Platform::Figma, base_url, settings)?,
            config,
        })
    }

    /// 个人令牌走 X-Figma-Token，OAuth 令牌走 Bearer
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.config.meta_str("token_type") == Some("personal") {
            request.header("X-Figma-Token", &self.config.access_token)
        } else {
            request.bearer_auth(&self.config.access_token)
        }
    }

    fn team_ids(&self) -> Vec<String> {
        match self.config.metadata.get("team_ids") {
            Some(serde_json::Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => self
                .config
                .meta_str("team_id")
                .map(|id| vec![id.to_string()])
                .unwrap_or_default(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ConnectorError> {
        let url = self.api.url(path);
        self.api
            .json(|client: &Client| self.authorize(client.get(&url)))
            .await
    }
}

#[async_trait]
impl Connector for FigmaConnector {
    fn platform(&self) -> Platform {
        Platform::Figma
    }

    async fn test_connection(&self) -> bool {
        match self.get::<serde_json::Value>("me").await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Figma connection test failed");
                false
            }
        }
    }

    async fn refresh_token(&self) -> Result<TokenGrant, TokenError> {
        oauth::refresh_grant(&self.api, Platform::Figma, "oauth/refresh", &self.config).await
    }

    #[instrument(skip(self), fields(platform = "figma", tenant_id = %self.config.tenant_id))]
    async fn fetch_audit_data(&self) -> Result<AuditData, ConnectorError> {
        let teams = self.team_ids();
        if teams.is_empty() {
            warn!("Figma integration has no team_id metadata, nothing to audit");
        }

        let mut files = Vec::new();
        for team in teams {
            let projects: ProjectList = self.get(&format!("teams/{}/projects", team)).await?;
            for project in projects.projects {
                let project_id = match &project.id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let list: FileList = self.get(&format!("projects/{}/files", project_id)).await?;
                for file in list.files {
                    files.push(FileRecord {
                        path: format!("/{}/{}", project.name, file.name),
                        parent_id: Some(project_id.clone()),
                        last_accessed: file.last_modified,
                        // 设计文件没有大小与哈希信息
                        size_bytes: 0,
                        content_hash: Some(format!("figma:{}", file.key)),
                        file_type: "figma_file".to_string(),
                        source: Platform::Figma,
                        owner: None,
                        is_public: false,
                        shared_with: vec![],
                        external_id: file.key,
                        name: file.name,
                        is_duplicate: false,
                        duplicate_group: None,
                    });
                }
            }
        }

        mark_duplicates(&mut files);

        let seats = self
            .config
            .metadata
            .get("seats")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(AuditData {
            files,
            users: vec![],
            channels: None,
            storage_used_gb: 0.0,
            total_licenses: seats,
            active_users: seats,
        })
    }
}
