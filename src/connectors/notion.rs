//! Notion 连接器
//!
//! 集成令牌不过期，没有刷新流程；唯一的变更能力是归档 / 取消归档页面

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, instrument};

use super::dedupe::mark_duplicates;
use super::http::{paginate, ApiClient, HttpSettings, Page};
use super::{ArchivedLocation, Connector, ConnectorError, OpResult, OperationError};
use crate::models::audit::{AuditData, FileRecord, SharePermission, UserRecord};
use crate::models::integration::{ConnectorConfig, Platform};
use crate::models::playbook::{ItemMetadata, PlaybookItem};
use crate::models::undo::RestoreFile;

pub const API_BASE: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";

pub struct NotionConnector {
    config: ConnectorConfig,
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct PartialUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct NotionObject {
    object: String,
    id: String,
    last_edited_time: Option<DateTime<Utc>>,
    created_by: Option<PartialUser>,
    last_edited_by: Option<PartialUser>,
    #[serde(default)]
    archived: bool,
    public_url: Option<String>,
    parent: Option<Value>,
    #[serde(default)]
    properties: Value,
    #[serde(default)]
    title: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    has_more: bool,
    next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Person {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotionUser {
    id: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    person: Option<Person>,
}

fn plain_text(rich: &[Value]) -> String {
    rich.iter()
        .filter_map(|t| t.get("plain_text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

impl NotionObject {
    /// 页面标题藏在 type = title 的属性里；数据库标题在顶层
    fn display_title(&self) -> String {
        let title = if self.object == "database" {
            plain_text(&self.title)
        } else {
            self.properties
                .as_object()
                .and_then(|props| {
                    props
                        .values()
                        .find(|p| p.get("type").and_then(Value::as_str) == Some("title"))
                })
                .and_then(|p| p.get("title").and_then(Value::as_array))
                .map(|rich| plain_text(rich))
                .unwrap_or_default()
        };
        if title.is_empty() {
            "Untitled".to_string()
        } else {
            title
        }
    }

    fn parent_id(&self) -> Option<String> {
        let parent = self.parent.as_ref()?;
        let kind = parent.get("type").and_then(Value::as_str)?;
        parent.get(kind).and_then(Value::as_str).map(|s| s.to_string())
    }
}

impl NotionConnector {
    pub fn new(config: ConnectorConfig, settings: HttpSettings) -> Result<Self, ConnectorError> {
        Self::with_base_url(config, settings, API_BASE)
    }

    pub fn with_base_url(
        config: ConnectorConfig,
        settings: HttpSettings,
        base_url: &str,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            api: ApiClient::new(Platform::Notion, base_url, settings)?,
            config,
        })
    }

    async fn search(&self) -> Result<Vec<NotionObject>, ConnectorError> {
        let url = self.api.url("search");
        let token = &self.config.access_token;
        let page_size = self.api.settings().page_size.min(100);
        paginate(Platform::Notion, self.api.settings().max_pages, |cursor| {
            let url = url.clone();
            async move {
                let mut body = json!({ "page_size": page_size });
                if let Some(cursor) = cursor {
                    body["start_cursor"] = json!(cursor);
                }
                let list: ListResponse<NotionObject> = self
                    .api
                    .json(|client| {
                        client
                            .post(&url)
                            .bearer_auth(token)
                            .header("Notion-Version", NOTION_VERSION)
                            .json(&body)
                    })
                    .await?;
                let next = if list.has_more { list.next_cursor } else { None };
                Ok(Page::new(list.results, next))
            }
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<NotionUser>, ConnectorError> {
        let url = self.api.url("users");
        let token = &self.config.access_token;
        let page_size = self.api.settings().page_size.min(100).to_string();
        paginate(Platform::Notion, self.api.settings().max_pages, |cursor| {
            let url = url.clone();
            let page_size = page_size.clone();
            async move {
                let mut query = vec![("page_size", page_size)];
                if let Some(cursor) = cursor {
                    query.push(("start_cursor", cursor));
                }
                let list: ListResponse<NotionUser> = self
                    .api
                    .json(|client| {
                        client
                            .get(&url)
                            .bearer_auth(token)
                            .header("Notion-Version", NOTION_VERSION)
                            .query(&query)
                    })
                    .await?;
                let next = if list.has_more { list.next_cursor } else { None };
                Ok(Page::new(list.results, next))
            }
        })
        .await
    }

    async fn set_archived(&self, page_id: &str, archived: bool) -> Result<(), ConnectorError> {
        let url = self.api.url(&format!("pages/{}", page_id));
        let token = &self.config.access_token;
        let body = json!({ "archived": archived });
        self.api
            .send(|client| {
                client
                    .patch(&url)
                    .bearer_auth(token)
                    .header("Notion-Version", NOTION_VERSION)
                    .json(&body)
            })
            .await
    }

    fn to_file_record(object: &NotionObject) -> FileRecord {
        let is_public = object.public_url.is_some();
        let name = object.display_title();
        FileRecord {
            external_id: object.id.clone(),
            path: format!("/{}", name),
            name,
            // API 不暴露大小
            size_bytes: 0,
            file_type: object.object.clone(),
            source: Platform::Notion,
            // 没有内容哈希；用对象 ID 占位，同名页面不应被当作重复
            content_hash: Some(format!("notion:{}", object.id)),
            parent_id: object.parent_id(),
            last_accessed: object.last_edited_time,
            owner: object.created_by.as_ref().map(|u| u.id.clone()),
            is_public,
            shared_with: if is_public {
                vec![SharePermission {
                    permission_id: None,
                    principal_type: "anyone".to_string(),
                    principal: object.public_url.clone(),
                    role: "reader".to_string(),
                }]
            } else {
                vec![]
            },
            is_duplicate: false,
            duplicate_group: None,
        }
    }
}

#[async_trait]
impl Connector for NotionConnector {
    fn platform(&self) -> Platform {
        Platform::Notion
    }

    async fn test_connection(&self) -> bool {
        let url = self.api.url("users/me");
        let token = &self.config.access_token;
        let result = self
            .api
            .send(|client| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .header("Notion-Version", NOTION_VERSION)
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Notion connection test failed");
                false
            }
        }
    }

    #[instrument(skip(self), fields(platform = "notion", tenant_id = %self.config.tenant_id))]
    async fn fetch_audit_data(&self) -> Result<AuditData, ConnectorError> {
        let objects = self.search().await?;
        let users = self.list_users().await?;

        // 用户最近一次编辑时间作为活跃时间
        let mut last_edit: HashMap<String, DateTime<Utc>> = HashMap::new();
        for object in &objects {
            if let (Some(editor), Some(at)) = (&object.last_edited_by, object.last_edited_time) {
                let entry = last_edit.entry(editor.id.clone()).or_insert(at);
                if at > *entry {
                    *entry = at;
                }
            }
        }

        let mut files: Vec<FileRecord> = objects
            .iter()
            .filter(|o| !o.archived)
            .map(Self::to_file_record)
            .collect();
        mark_duplicates(&mut files);

        let now = Utc::now();
        let users: Vec<UserRecord> = users
            .into_iter()
            .filter(|u| u.kind.as_deref() != Some("bot"))
            .map(|u| UserRecord {
                email: u.person.as_ref().and_then(|p| p.email.clone()),
                name: u.name.clone().unwrap_or_else(|| u.id.clone()),
                role: "member".to_string(),
                source: Platform::Notion,
                last_active: last_edit.get(&u.id).copied(),
                is_guest: false,
                is_admin: false,
                license_type: Some("member".to_string()),
                group_id: None,
                external_id: u.id,
            })
            .collect();

        let active_users = users.iter().filter(|u| !u.is_inactive(now, 90)).count() as i64;

        Ok(AuditData {
            total_licenses: users.len() as i64,
            active_users,
            files,
            users,
            channels: None,
            storage_used_gb: 0.0,
        })
    }

    async fn archive_file(&self, item: &PlaybookItem) -> OpResult<ArchivedLocation> {
        match &item.metadata.0 {
            ItemMetadata::File { file_type, .. } if file_type == "page" => {
                self.set_archived(&item.external_id, true).await?;
                Ok(ArchivedLocation::default())
            }
            _ => Err(OperationError::InvalidTarget(format!(
                "only notion pages can be archived, {} is not a page",
                item.external_id
            ))),
        }
    }

    async fn restore_file(&self, action: &RestoreFile) -> OpResult<()> {
        self.set_archived(&action.file_id, false).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_title_extraction() {
        let object: NotionObject = serde_json::from_value(json!({
            "object": "page",
            "id": "p1",
            "properties": {
                "Name": { "type": "title", "title": [{ "plain_text": "Roadmap " }, { "plain_text": "2024" }] }
            },
            "parent": { "type": "page_id", "page_id": "root" }
        }))
        .unwrap();
        assert_eq!(object.display_title(), "Roadmap 2024");
        assert_eq!(object.parent_id().as_deref(), Some("root"));
    }

    #[test]
    fn test_databases_are_database_like() {
        let object: NotionObject = serde_json::from_value(json!({
            "object": "database",
            "id": "d1",
            "title": [{ "plain_text": "Customers" }],
            "public_url": "https://acme.notion.site/d1"
        }))
        .unwrap();
        let record = NotionConnector::to_file_record(&object);
        assert!(record.is_public);
        assert!(record.is_database_like());
        assert_eq!(record.name, "Customers");
    }

    #[tokio::test]
    async fn test_refresh_is_unsupported() {
        let connector = NotionConnector::new(
            ConnectorConfig::new(uuid::Uuid::new_v4(), "secret_abc"),
            HttpSettings::default(),
        )
        .unwrap();
        let err = connector.refresh_token().await.unwrap_err();
        assert!(matches!(err, super::super::TokenError::RefreshUnsupported(Platform::Notion)));
    }
}
