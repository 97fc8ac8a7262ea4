//! Jira Cloud 连接器
//!
//! 文件来自议题附件；用户的访问权由产品访问组授予，撤销即移出该组

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, instrument};

use super::dedupe::mark_duplicates;
use super::http::{paginate, ApiClient, HttpSettings, Page};
use super::{
    oauth, Connector, ConnectorError, DownloadedFile, OpResult, OperationError, RevokeOutcome,
    TokenError, TokenGrant,
};
use crate::models::audit::{AuditData, FileRecord, UserRecord};
use crate::models::integration::{ConnectorConfig, Platform};
use crate::models::playbook::{ItemMetadata, PlaybookItem};
use crate::models::undo::RestoreAccess;

const API_ROOT: &str = "https://api.atlassian.com/ex/jira";
const TOKEN_URL: &str = "https://auth.atlassian.com/oauth/token";
const DEFAULT_ACCESS_GROUP: &str = "jira-software-users";

pub struct JiraConnector {
    config: ConnectorConfig,
    api: ApiClient,
    token_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraUser {
    account_id: String,
    account_type: Option<String>,
    display_name: Option<String>,
    email_address: Option<String>,
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Author {
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attachment {
    id: String,
    filename: String,
    #[serde(default)]
    size: i64,
    mime_type: Option<String>,
    created: Option<String>,
    author: Option<Author>,
}

#[derive(Debug, Default, Deserialize)]
struct IssueFields {
    #[serde(default)]
    attachment: Vec<Attachment>,
    assignee: Option<Author>,
    reporter: Option<Author>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    key: String,
    #[serde(default)]
    fields: IssueFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    #[serde(default)]
    issues: Vec<Issue>,
    #[serde(default)]
    start_at: u32,
    #[serde(default)]
    total: u32,
}

/// Jira 时间戳形如 "2024-03-01T10:15:30.000+0000"
fn parse_jira_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl JiraConnector {
    pub fn new(config: ConnectorConfig, settings: HttpSettings) -> Result<Self, ConnectorError> {
        let cloud_id = config.meta_str("cloud_id").unwrap_or_default().to_string();
        let base = format!("{}/{}/rest/api/3", API_ROOT, cloud_id);
        Ok(Self {
            api: ApiClient::new(Platform::Jira, base, settings)?,
            config,
            token_url: TOKEN_URL.to_string(),
        })
    }

    pub fn with_base_url(
        config: ConnectorConfig,
        settings: HttpSettings,
        base_url: &str,
    ) -> Result<Self, ConnectorError> {
        let base = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            api: ApiClient::new(Platform::Jira, base.clone(), settings)?,
            config,
            token_url: format!("{}/oauth/token", base),
        })
    }

    fn access_group(&self) -> String {
        self.config
            .meta_str("access_group")
            .unwrap_or(DEFAULT_ACCESS_GROUP)
            .to_string()
    }

    fn is_external(&self, email: Option<&str>) -> bool {
        match (self.config.meta_str("domain"), email.and_then(|e| e.rsplit_once('@'))) {
            (Some(domain), Some((_, other))) => !other.eq_ignore_ascii_case(domain),
            _ => false,
        }
    }

    async fn list_users(&self) -> Result<Vec<JiraUser>, ConnectorError> {
        let url = self.api.url("users/search");
        let token = &self.config.access_token;
        let page_size = self.api.settings().page_size;
        paginate(Platform::Jira, self.api.settings().max_pages, |cursor| {
            let url = url.clone();
            async move {
                let start_at: u32 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
                let users: Vec<JiraUser> = self
                    .api
                    .json(|client| {
                        client.get(&url).bearer_auth(token).query(&[
                            ("startAt", start_at.to_string()),
                            ("maxResults", page_size.to_string()),
                        ])
                    })
                    .await?;
                // 该端点没有总数，拿满一页才继续
                let next = if users.len() as u32 >= page_size {
                    Some((start_at + page_size).to_string())
                } else {
                    None
                };
                Ok(Page::new(users, next))
            }
        })
        .await
    }

    async fn search(&self, jql: &str, fields: &str) -> Result<Vec<Issue>, ConnectorError> {
        let url = self.api.url("search");
        let token = &self.config.access_token;
        let page_size = self.api.settings().page_size.min(100);
        paginate(Platform::Jira, self.api.settings().max_pages, |cursor| {
            let url = url.clone();
            async move {
                let start_at: u32 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
                let result: SearchResult = self
                    .api
                    .json(|client| {
                        client.get(&url).bearer_auth(token).query(&[
                            ("jql", jql.to_string()),
                            ("fields", fields.to_string()),
                            ("startAt", start_at.to_string()),
                            ("maxResults", page_size.to_string()),
                        ])
                    })
                    .await?;
                let fetched = result.start_at + result.issues.len() as u32;
                let next = if !result.issues.is_empty() && fetched < result.total {
                    Some(fetched.to_string())
                } else {
                    None
                };
                Ok(Page::new(result.issues, next))
            }
        })
        .await
    }

    async fn group_membership(&self, account_id: &str, group: &str, add: bool) -> Result<(), ConnectorError> {
        let url = self.api.url("group/user");
        let token = &self.config.access_token;
        if add {
            let body = json!({ "accountId": account_id });
            let result = self
                .api
                .send(|client| {
                    client
                        .post(&url)
                        .bearer_auth(token)
                        .query(&[("groupname", group)])
                        .json(&body)
                })
                .await;
            match result {
                // 已经在组里
                Err(e) if e.status == Some(400) && e.message.contains("already a member") => Ok(()),
                other => other,
            }
        } else {
            let result = self
                .api
                .send(|client| {
                    client
                        .delete(&url)
                        .bearer_auth(token)
                        .query(&[("groupname", group), ("accountId", account_id)])
                })
                .await;
            match result {
                Err(e) if e.status == Some(404) => Ok(()),
                other => other,
            }
        }
    }
}

#[async_trait]
impl Connector for JiraConnector {
    fn platform(&self) -> Platform {
        Platform::Jira
    }

    async fn test_connection(&self) -> bool {
        let url = self.api.url("myself");
        let token = &self.config.access_token;
        match self.api.send(|client| client.get(&url).bearer_auth(token)).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Jira connection test failed");
                false
            }
        }
    }

    async fn refresh_token(&self) -> Result<TokenGrant, TokenError> {
        oauth::refresh_grant(&self.api, Platform::Jira, &self.token_url, &self.config).await
    }

    #[instrument(skip(self), fields(platform = "jira", tenant_id = %self.config.tenant_id))]
    async fn fetch_audit_data(&self) -> Result<AuditData, ConnectorError> {
        let users = self.list_users().await?;
        let with_attachments = self
            .search("attachments IS NOT EMPTY ORDER BY updated DESC", "attachment,updated")
            .await?;
        let recent = self
            .search("updated >= -90d ORDER BY updated DESC", "assignee,reporter,updated")
            .await?;

        // 近期议题的经办人 / 报告人视为活跃
        let mut last_active: HashMap<String, DateTime<Utc>> = HashMap::new();
        for issue in &recent {
            let Some(updated) = issue.fields.updated.as_deref().and_then(parse_jira_time) else {
                continue;
            };
            for person in [&issue.fields.assignee, &issue.fields.reporter].into_iter().flatten() {
                if let Some(id) = &person.account_id {
                    let entry = last_active.entry(id.clone()).or_insert(updated);
                    if updated > *entry {
                        *entry = updated;
                    }
                }
            }
        }

        let mut files = Vec::new();
        for issue in with_attachments {
            for attachment in issue.fields.attachment {
                files.push(FileRecord {
                    path: format!("/{}/{}", issue.key, attachment.filename),
                    parent_id: Some(issue.key.clone()),
                    last_accessed: attachment.created.as_deref().and_then(parse_jira_time),
                    owner: attachment.author.and_then(|a| a.account_id),
                    size_bytes: attachment.size,
                    file_type: attachment
                        .mime_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    source: Platform::Jira,
                    content_hash: None,
                    is_public: false,
                    shared_with: vec![],
                    external_id: attachment.id,
                    name: attachment.filename,
                    is_duplicate: false,
                    duplicate_group: None,
                });
            }
        }
        mark_duplicates(&mut files);

        let group = self.access_group();
        let now = Utc::now();
        let users: Vec<UserRecord> = users
            .into_iter()
            .filter(|u| u.active && u.account_type.as_deref() != Some("app"))
            .map(|u| {
                let is_guest = u.account_type.as_deref() == Some("customer")
                    || self.is_external(u.email_address.as_deref());
                UserRecord {
                    email: u.email_address.clone(),
                    name: u.display_name.clone().unwrap_or_else(|| u.account_id.clone()),
                    role: if is_guest { "guest" } else { "user" }.to_string(),
                    source: Platform::Jira,
                    last_active: last_active.get(&u.account_id).copied(),
                    is_guest,
                    is_admin: false,
                    license_type: Some("jira-software".to_string()),
                    group_id: Some(group.clone()),
                    external_id: u.account_id,
                }
            })
            .collect();

        let storage_bytes: i64 = files.iter().map(|f| f.size_bytes).sum();
        let active_users = users.iter().filter(|u| !u.is_inactive(now, 90)).count() as i64;

        Ok(AuditData {
            storage_used_gb: storage_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            total_licenses: users.len() as i64,
            active_users,
            files,
            users,
            channels: None,
        })
    }

    async fn revoke_access(&self, item: &PlaybookItem) -> OpResult<RevokeOutcome> {
        let (group, role) = match &item.metadata.0 {
            ItemMetadata::User { group_id, role, .. } => (
                group_id.clone().unwrap_or_else(|| self.access_group()),
                role.clone(),
            ),
            _ => {
                return Err(OperationError::InvalidTarget(format!(
                    "jira can only revoke user access, {} is not a user",
                    item.external_id
                )))
            }
        };

        self.group_membership(&item.external_id, &group, false).await?;
        Ok(RevokeOutcome::AccessRemoved {
            group_id: Some(group),
            role: Some(role),
            permissions: None,
        })
    }

    async fn restore_access(&self, action: &RestoreAccess) -> OpResult<()> {
        let group = action.group_id.clone().unwrap_or_else(|| self.access_group());
        self.group_membership(&action.user_id, &group, true).await?;
        Ok(())
    }

    async fn remove_guest(&self, item: &PlaybookItem) -> OpResult<()> {
        self.revoke_access(item).await.map(|_| ())
    }

    async fn download_file(&self, file_id: &str) -> OpResult<DownloadedFile> {
        let url = self.api.url(&format!("attachment/content/{}", file_id));
        let token = &self.config.access_token;
        let (bytes, mime_type) = self
            .api
            .bytes(|client| client.get(&url).bearer_auth(token))
            .await?;
        Ok(DownloadedFile { bytes, mime_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jira_time() {
        let at = parse_jira_time("2024-03-01T10:15:30.000+0000").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-03-01T10:15:30+00:00");
        assert!(parse_jira_time("yesterday").is_none());
    }

    #[test]
    fn test_cloud_id_in_base_url() {
        let mut config = ConnectorConfig::new(uuid::Uuid::new_v4(), "t");
        config
            .metadata
            .insert("cloud_id".to_string(), serde_json::json!("c-123"));
        let connector = JiraConnector::new(config, HttpSettings::default()).unwrap();
        assert_eq!(
            connector.api.url("myself"),
            "https://api.atlassian.com/ex/jira/c-123/rest/api/3/myself"
        );
    }
}
