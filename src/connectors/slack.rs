//! Slack 连接器
//!
//! Web API 全部是 `method` 形式的 POST，业务错误以 `ok: false` 返回在 200 响应里

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use super::dedupe::mark_duplicates;
use super::http::{paginate, ApiClient, HttpSettings, Page};
use super::{
    oauth, Connector, ConnectorError, DownloadedFile, OpResult, OperationError,
    RevokeOutcome, TokenError, TokenGrant,
};
use crate::models::archive::RestoreUpload;
use crate::models::audit::{AuditData, ChannelRecord, FileRecord, SharePermission, UserRecord};
use crate::models::integration::{ConnectorConfig, Platform};
use crate::models::playbook::{ItemMetadata, PlaybookItem};
use crate::models::undo::{RestoreChannel, RestoreUser};

pub const API_BASE: &str = "https://slack.com/api";

/// 成员数低于该值的频道才探测最后一条消息
const ACTIVITY_PROBE_MAX_MEMBERS: i64 = 5;

pub struct SlackConnector {
    config: ConnectorConfig,
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct SlackPaging {
    page: u32,
    pages: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    id: String,
    name: Option<String>,
    title: Option<String>,
    #[serde(default)]
    size: i64,
    mimetype: Option<String>,
    filetype: Option<String>,
    created: Option<i64>,
    timestamp: Option<i64>,
    user: Option<String>,
    #[serde(default)]
    public_url_shared: bool,
    #[serde(default)]
    channels: Vec<String>,
    url_private_download: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilesList {
    #[serde(default)]
    files: Vec<SlackFile>,
    paging: Option<SlackPaging>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackProfile {
    email: Option<String>,
    real_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
    name: String,
    #[serde(default)]
    profile: SlackProfile,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    is_admin: bool,
    #[serde(default)]
    is_owner: bool,
    #[serde(default)]
    is_restricted: bool,
    #[serde(default)]
    is_ultra_restricted: bool,
    updated: Option<i64>,
}

impl SlackUser {
    fn role(&self) -> &'static str {
        if self.is_owner {
            "owner"
        } else if self.is_admin {
            "admin"
        } else if self.is_ultra_restricted {
            "single_channel_guest"
        } else if self.is_restricted {
            "multi_channel_guest"
        } else {
            "member"
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsersList {
    #[serde(default)]
    members: Vec<SlackUser>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Debug, Deserialize)]
struct SlackChannel {
    id: String,
    name: String,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    is_archived: bool,
    #[serde(default)]
    num_members: i64,
    /// 毫秒
    updated: Option<i64>,
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ConversationsList {
    #[serde(default)]
    channels: Vec<SlackChannel>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    messages: Vec<SlackMessage>,
}

#[derive(Debug, Deserialize)]
struct AccessLog {
    user_id: String,
    date_last: i64,
}

#[derive(Debug, Deserialize)]
struct AccessLogs {
    #[serde(default)]
    logins: Vec<AccessLog>,
    paging: Option<SlackPaging>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file: SlackFile,
}

#[derive(Debug, Deserialize)]
struct UploadUrl {
    upload_url: String,
    file_id: String,
}

fn from_epoch(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Slack 消息时间戳形如 "1700000000.000100"
fn from_ts(ts: &str) -> Option<DateTime<Utc>> {
    ts.split('.').next()?.parse::<i64>().ok().and_then(from_epoch)
}

impl SlackConnector {
    pub fn new(config: ConnectorConfig, settings: HttpSettings) -> Result<Self, ConnectorError> {
        Self::with_base_url(config, settings, API_BASE)
    }

    pub fn with_base_url(
        config: ConnectorConfig,
        settings: HttpSettings,
        base_url: &str,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            api: ApiClient::new(Platform::Slack, base_url, settings)?,
            config,
        })
    }

    fn team_id(&self) -> Option<String> {
        self.config.meta_str("team_id").map(|s| s.to_string())
    }

    /// 调用 Web API 方法并解开 `ok` 包络
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, ConnectorError> {
        let url = self.api.url(method);
        let token = &self.config.access_token;
        let body: Value = self
            .api
            .json(|client| client.post(&url).bearer_auth(token).form(params))
            .await?;

        if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let code = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            return Err(ConnectorError::api(code.clone(), format!("slack {} failed: {}", method, code)));
        }

        serde_json::from_value(body)
            .map_err(|e| ConnectorError::decode(format!("slack {}: {}", method, e)))
    }

    async fn list_files(&self) -> Result<Vec<SlackFile>, ConnectorError> {
        let count = self.api.settings().page_size.to_string();
        paginate(Platform::Slack, self.api.settings().max_pages, |cursor| {
            let count = count.clone();
            async move {
                let page = cursor.unwrap_or_else(|| "1".to_string());
                let list: FilesList = self
                    .call("files.list", &[("count", count), ("page", page)])
                    .await?;
                let next = list
                    .paging
                    .as_ref()
                    .filter(|p| p.page < p.pages)
                    .map(|p| (p.page + 1).to_string());
                Ok(Page::new(list.files, next))
            }
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<SlackUser>, ConnectorError> {
        let limit = self.api.settings().page_size.to_string();
        paginate(Platform::Slack, self.api.settings().max_pages, |cursor| {
            let limit = limit.clone();
            async move {
                let mut params = vec![("limit", limit)];
                if let Some(cursor) = cursor {
                    params.push(("cursor", cursor));
                }
                let list: UsersList = self.call("users.list", &params).await?;
                Ok(Page::new(list.members, Some(list.response_metadata.next_cursor)))
            }
        })
        .await
    }

    async fn list_channels(&self) -> Result<Vec<SlackChannel>, ConnectorError> {
        let limit = self.api.settings().page_size.to_string();
        paginate(Platform::Slack, self.api.settings().max_pages, |cursor| {
            let limit = limit.clone();
            async move {
                let mut params = vec![
                    ("limit", limit),
                    ("types", "public_channel,private_channel".to_string()),
                    ("exclude_archived", "false".to_string()),
                ];
                if let Some(cursor) = cursor {
                    params.push(("cursor", cursor));
                }
                let list: ConversationsList = self.call("conversations.list", &params).await?;
                Ok(Page::new(list.channels, Some(list.response_metadata.next_cursor)))
            }
        })
        .await
    }

    /// 最近登录时间（付费版才有 access logs，失败时退化为空）
    async fn last_logins(&self) -> HashMap<String, DateTime<Utc>> {
        let result = paginate(Platform::Slack, self.api.settings().max_pages, |cursor| async move {
            let page = cursor.unwrap_or_else(|| "1".to_string());
            let logs: AccessLogs = self
                .call("team.accessLogs", &[("count", "1000".to_string()), ("page", page)])
                .await?;
            let next = logs
                .paging
                .as_ref()
                .filter(|p| p.page < p.pages)
                .map(|p| (p.page + 1).to_string());
            Ok(Page::new(logs.logins, next))
        })
        .await;

        match result {
            Ok(logins) => {
                let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
                for login in logins {
                    if let Some(at) = from_epoch(login.date_last) {
                        let entry = latest.entry(login.user_id).or_insert(at);
                        if at > *entry {
                            *entry = at;
                        }
                    }
                }
                latest
            }
            Err(e) => {
                debug!(error = %e, "Slack access logs unavailable, falling back to profile updates");
                HashMap::new()
            }
        }
    }

    /// 频道最后一条消息的时间
    async fn last_message_at(&self, channel_id: &str) -> Option<DateTime<Utc>> {
        let history: Result<History, _> = self
            .call(
                "conversations.history",
                &[("channel", channel_id.to_string()), ("limit", "1".to_string())],
            )
            .await;
        match history {
            Ok(history) => history.messages.first().and_then(|m| from_ts(&m.ts)),
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "Failed to probe channel activity");
                None
            }
        }
    }

    fn to_file_record(&self, file: SlackFile) -> FileRecord {
        let name = file
            .name
            .clone()
            .or(file.title.clone())
            .unwrap_or_else(|| file.id.clone());
        let sharing = if file.public_url_shared {
            vec![SharePermission {
                permission_id: None,
                principal_type: "anyone".to_string(),
                principal: None,
                role: "reader".to_string(),
            }]
        } else {
            vec![]
        };
        FileRecord {
            path: format!("/{}", name),
            parent_id: file.channels.first().cloned(),
            last_accessed: file.timestamp.or(file.created).and_then(from_epoch),
            owner: file.user.clone(),
            is_public: file.public_url_shared,
            shared_with: sharing,
            file_type: file
                .mimetype
                .clone()
                .or(file.filetype.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size_bytes: file.size,
            content_hash: None,
            source: Platform::Slack,
            external_id: file.id,
            name,
            is_duplicate: false,
            duplicate_group: None,
        }
    }

    fn user_target(item: &PlaybookItem) -> OpResult<(&str, Option<&str>)> {
        match &item.metadata.0 {
            ItemMetadata::User {
                role, license_type, ..
            } => Ok((role.as_str(), license_type.as_deref())),
            _ => Err(OperationError::InvalidTarget(format!(
                "{} is not a user item",
                item.external_id
            ))),
        }
    }

    fn require_team(&self) -> OpResult<String> {
        self.team_id().ok_or_else(|| {
            OperationError::InvalidTarget("slack team_id missing from integration metadata".to_string())
        })
    }
}

#[async_trait]
impl Connector for SlackConnector {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn test_connection(&self) -> bool {
        match self.call::<Value>("auth.test", &[]).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Slack connection test failed");
                false
            }
        }
    }

    async fn refresh_token(&self) -> Result<TokenGrant, TokenError> {
        oauth::refresh_grant(&self.api, Platform::Slack, "oauth.v2.access", &self.config).await
    }

    #[instrument(skip(self), fields(platform = "slack", tenant_id = %self.config.tenant_id))]
    async fn fetch_audit_data(&self) -> Result<AuditData, ConnectorError> {
        let files = self.list_files().await?;
        let users = self.list_users().await?;
        let channels = self.list_channels().await?;
        let logins = self.last_logins().await;

        let mut file_records: Vec<FileRecord> =
            files.into_iter().map(|f| self.to_file_record(f)).collect();
        mark_duplicates(&mut file_records);

        let now = Utc::now();
        let user_records: Vec<UserRecord> = users
            .into_iter()
            .filter(|u| !u.deleted && !u.is_bot && u.id != "USLACKBOT")
            .map(|u| {
                let is_guest = u.is_restricted || u.is_ultra_restricted;
                UserRecord {
                    email: u.profile.email.clone(),
                    name: u.profile.real_name.clone().unwrap_or_else(|| u.name.clone()),
                    role: u.role().to_string(),
                    source: Platform::Slack,
                    last_active: logins
                        .get(&u.id)
                        .copied()
                        .or_else(|| u.updated.and_then(from_epoch)),
                    is_guest,
                    is_admin: u.is_admin || u.is_owner,
                    license_type: Some(if is_guest { "guest" } else { "full" }.to_string()),
                    group_id: None,
                    external_id: u.id,
                }
            })
            .collect();

        let mut channel_records = Vec::with_capacity(channels.len());
        for channel in channels {
            let listed_activity = channel
                .updated
                .map(|ms| ms / 1000)
                .or(channel.created)
                .and_then(from_epoch);
            let last_activity = if !channel.is_archived && channel.num_members < ACTIVITY_PROBE_MAX_MEMBERS {
                self.last_message_at(&channel.id).await.or(listed_activity)
            } else {
                listed_activity
            };
            channel_records.push(ChannelRecord {
                external_id: channel.id,
                name: channel.name,
                source: Platform::Slack,
                is_private: channel.is_private,
                is_archived: channel.is_archived,
                member_count: channel.num_members,
                last_activity,
            });
        }

        let storage_bytes: i64 = file_records.iter().map(|f| f.size_bytes).sum();
        let active_users = user_records
            .iter()
            .filter(|u| !u.is_inactive(now, 90))
            .count() as i64;

        debug!(
            files = file_records.len(),
            users = user_records.len(),
            channels = channel_records.len(),
            "Slack audit data fetched"
        );

        Ok(AuditData {
            storage_used_gb: storage_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            total_licenses: user_records.iter().filter(|u| !u.is_guest).count() as i64,
            active_users,
            files: file_records,
            users: user_records,
            channels: Some(channel_records),
        })
    }

    async fn update_permissions(&self, file_id: &str, sharing: &[SharePermission]) -> OpResult<()> {
        let method = if sharing.iter().any(|s| s.is_public()) {
            "files.sharedPublicURL"
        } else {
            "files.revokePublicURL"
        };
        self.call::<Value>(method, &[("file", file_id.to_string())])
            .await?;
        Ok(())
    }

    async fn revoke_access(&self, item: &PlaybookItem) -> OpResult<RevokeOutcome> {
        match &item.metadata.0 {
            ItemMetadata::File { sharing, .. } => {
                self.call::<Value>("files.revokePublicURL", &[("file", item.external_id.clone())])
                    .await?;
                Ok(RevokeOutcome::PermissionsRemoved {
                    original_sharing: sharing.clone(),
                })
            }
            ItemMetadata::User { .. } => {
                let (role, license_type) = Self::user_target(item)?;
                let (role, license_type) = (role.to_string(), license_type.map(|s| s.to_string()));
                self.remove_guest(item).await?;
                Ok(RevokeOutcome::UserDeactivated { role, license_type })
            }
            ItemMetadata::Channel { .. } => Err(OperationError::InvalidTarget(format!(
                "cannot revoke access on channel {}",
                item.external_id
            ))),
        }
    }

    async fn restore_user(&self, action: &RestoreUser) -> OpResult<()> {
        let team_id = self.require_team()?;
        let is_guest = action.role.contains("guest");
        let mut params = vec![
            ("team_id", team_id),
            ("user_id", action.user_id.clone()),
        ];
        if is_guest {
            params.push(("is_restricted", "true".to_string()));
            if action.role == "single_channel_guest" {
                params.push(("is_ultra_restricted", "true".to_string()));
            }
        }
        self.call::<Value>("admin.users.assign", &params).await?;
        Ok(())
    }

    async fn archive_channel(&self, item: &PlaybookItem) -> OpResult<()> {
        let result = self
            .call::<Value>("conversations.archive", &[("channel", item.external_id.clone())])
            .await;
        match result {
            Ok(_) => Ok(()),
            // 重试时频道可能已经被归档
            Err(e) if e.code == "already_archived" => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn restore_channel(&self, action: &RestoreChannel) -> OpResult<()> {
        let result = self
            .call::<Value>("conversations.unarchive", &[("channel", action.channel_id.clone())])
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code == "not_archived" => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_guest(&self, item: &PlaybookItem) -> OpResult<()> {
        let team_id = self.require_team()?;
        self.call::<Value>(
            "admin.users.remove",
            &[("team_id", team_id), ("user_id", item.external_id.clone())],
        )
        .await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> OpResult<DownloadedFile> {
        let info: FileInfo = self.call("files.info", &[("file", file_id.to_string())]).await?;
        let url = info.file.url_private_download.ok_or_else(|| {
            OperationError::InvalidTarget(format!("slack file {} has no download url", file_id))
        })?;
        let token = &self.config.access_token;
        let (bytes, mime) = self
            .api
            .bytes(|client| client.get(&url).bearer_auth(token))
            .await?;
        Ok(DownloadedFile {
            bytes,
            mime_type: mime.or(info.file.mimetype),
        })
    }

    async fn upload_file(&self, upload: &RestoreUpload) -> OpResult<String> {
        let channel = upload.target_location.clone().ok_or_else(|| {
            OperationError::InvalidTarget("slack uploads need a target channel".to_string())
        })?;

        let target: UploadUrl = self
            .call(
                "files.getUploadURLExternal",
                &[
                    ("filename", upload.file_name.clone()),
                    ("length", upload.bytes.len().to_string()),
                ],
            )
            .await?;

        let bytes = upload.bytes.clone();
        self.api
            .send(|client| client.post(&target.upload_url).body(bytes.clone()))
            .await?;

        let files = serde_json::json!([{ "id": target.file_id, "title": upload.file_name }]);
        self.call::<Value>(
            "files.completeUploadExternal",
            &[("files", files.to_string()), ("channel_id", channel)],
        )
        .await?;

        Ok(target.file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ts_parsing() {
        let at = from_ts("1700000000.000100").unwrap();
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert!(from_ts("garbage").is_none());
    }

    #[test]
    fn test_guest_roles() {
        let user: SlackUser = serde_json::from_value(serde_json::json!({
            "id": "U1",
            "name": "contractor",
            "is_restricted": true,
            "is_ultra_restricted": true
        }))
        .unwrap();
        assert_eq!(user.role(), "single_channel_guest");
    }
}
