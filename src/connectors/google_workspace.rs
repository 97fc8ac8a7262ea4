//! Google Workspace 连接器（Drive + Admin Directory）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use super::dedupe::mark_duplicates;
use super::http::{paginate, ApiClient, HttpSettings, Page};
use super::{
    oauth, ArchivedLocation, Connector, ConnectorError, DownloadedFile, OpResult, OperationError,
    RevokeOutcome, TokenError, TokenGrant,
};
use crate::models::archive::RestoreUpload;
use crate::models::audit::{AuditData, FileRecord, SharePermission, UserRecord};
use crate::models::integration::{ConnectorConfig, Platform};
use crate::models::playbook::{ItemMetadata, PlaybookItem};
use crate::models::undo::{RestoreAccess, RestoreFile, RestoreUser};

const DRIVE_BASE: &str = "https://www.googleapis.com";
const ADMIN_BASE: &str = "https://admin.googleapis.com";
const OAUTH_BASE: &str = "https://oauth2.googleapis.com";

const ARCHIVE_FOLDER_NAME: &str = "Workspace Audit Archive";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size,md5Checksum,parents,viewedByMeTime,modifiedTime,owners(emailAddress),permissions(id,type,role,emailAddress,domain))";

pub struct GoogleWorkspaceConnector {
    config: ConnectorConfig,
    api: ApiClient,
    drive_base: String,
    admin_base: String,
    oauth_base: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrivePermission {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    role: String,
    email_address: Option<String>,
    domain: Option<String>,
}

impl DrivePermission {
    fn to_share(&self) -> SharePermission {
        SharePermission {
            permission_id: self.id.clone(),
            principal_type: self.kind.clone(),
            principal: self.email_address.clone().or(self.domain.clone()),
            role: self.role.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveOwner {
    email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    /// Drive 以字符串返回字节数
    size: Option<String>,
    md5_checksum: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    viewed_by_me_time: Option<DateTime<Utc>>,
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    owners: Vec<DriveOwner>,
    #[serde(default)]
    permissions: Vec<DrivePermission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionList {
    #[serde(default)]
    permissions: Vec<DrivePermission>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserName {
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryUser {
    id: String,
    primary_email: String,
    #[serde(default)]
    name: UserName,
    #[serde(default)]
    is_admin: bool,
    #[serde(default)]
    suspended: bool,
    last_login_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserList {
    #[serde(default)]
    users: Vec<DirectoryUser>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageQuota {
    usage: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    #[serde(default)]
    storage_quota: StorageQuota,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// 外部协作者：域外邮箱在文件共享里出现的汇总
struct ExternalCollaborator {
    role: String,
}

fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain)
}

impl GoogleWorkspaceConnector {
    pub fn new(config: ConnectorConfig, settings: HttpSettings) -> Result<Self, ConnectorError> {
        Ok(Self {
            api: ApiClient::new(Platform::GoogleWorkspace, DRIVE_BASE, settings)?,
            config,
            drive_base: DRIVE_BASE.to_string(),
            admin_base: ADMIN_BASE.to_string(),
            oauth_base: OAUTH_BASE.to_string(),
        })
    }

    /// 所有端点指向同一个地址（测试桩）
    pub fn with_base_url(
        config: ConnectorConfig,
        settings: HttpSettings,
        base_url: &str,
    ) -> Result<Self, ConnectorError> {
        let base = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            api: ApiClient::new(Platform::GoogleWorkspace, base.clone(), settings)?,
            config,
            drive_base: base.clone(),
            admin_base: base.clone(),
            oauth_base: base,
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.drive_base)
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/drive/v3/files/{}", self.drive_base, file_id)
    }

    fn users_url(&self) -> String {
        format!("{}/admin/directory/v1/users", self.admin_base)
    }

    fn domain(&self) -> Option<&str> {
        self.config.meta_str("domain")
    }

    fn is_external(&self, email: &str) -> bool {
        match (self.domain(), email_domain(email)) {
            (Some(domain), Some(other)) => !other.eq_ignore_ascii_case(domain),
            _ => false,
        }
    }

    async fn list_files(&self) -> Result<Vec<DriveFile>, ConnectorError> {
        let url = self.files_url();
        let page_size = self.api.settings().page_size.min(1000).to_string();
        let token = &self.config.access_token;
        paginate(Platform::GoogleWorkspace, self.api.settings().max_pages, |cursor| {
            let url = url.clone();
            let page_size = page_size.clone();
            async move {
                let mut query = vec![
                    ("pageSize", page_size),
                    ("fields", FILE_FIELDS.to_string()),
                    ("q", "trashed = false".to_string()),
                ];
                if let Some(cursor) = cursor {
                    query.push(("pageToken", cursor));
                }
                let list: FileList = self
                    .api
                    .json(|client| client.get(&url).bearer_auth(token).query(&query))
                    .await?;
                Ok(Page::new(list.files, list.next_page_token))
            }
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, ConnectorError> {
        let url = self.users_url();
        let page_size = self.api.settings().page_size.min(500).to_string();
        let token = &self.config.access_token;
        let customer = self
            .config
            .meta_str("customer_id")
            .unwrap_or("my_customer")
            .to_string();
        paginate(Platform::GoogleWorkspace, self.api.settings().max_pages, |cursor| {
            let url = url.clone();
            let page_size = page_size.clone();
            let customer = customer.clone();
            async move {
                let mut query = vec![("customer", customer), ("maxResults", page_size)];
                if let Some(cursor) = cursor {
                    query.push(("pageToken", cursor));
                }
                let list: UserList = self
                    .api
                    .json(|client| client.get(&url).bearer_auth(token).query(&query))
                    .await?;
                Ok(Page::new(list.users, list.next_page_token))
            }
        })
        .await
    }

    async fn storage_usage_bytes(&self) -> Result<i64, ConnectorError> {
        let url = format!("{}/drive/v3/about", self.drive_base);
        let token = &self.config.access_token;
        let about: About = self
            .api
            .json(|client| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("fields", "storageQuota")])
            })
            .await?;
        Ok(about
            .storage_quota
            .usage
            .and_then(|u| u.parse::<i64>().ok())
            .unwrap_or(0))
    }

    fn to_file_record(&self, file: DriveFile) -> FileRecord {
        let shares: Vec<SharePermission> = file.permissions.iter().map(|p| p.to_share()).collect();
        let is_public = shares.iter().any(|s| s.is_public());
        FileRecord {
            size_bytes: file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
            path: format!("/{}", file.name),
            parent_id: file.parents.first().cloned(),
            last_accessed: file.viewed_by_me_time.or(file.modified_time),
            owner: file.owners.first().and_then(|o| o.email_address.clone()),
            content_hash: file.md5_checksum,
            file_type: file.mime_type,
            source: Platform::GoogleWorkspace,
            is_public,
            shared_with: shares,
            external_id: file.id,
            name: file.name,
            is_duplicate: false,
            duplicate_group: None,
        }
    }

    /// 找到或创建归档目录
    async fn ensure_archive_folder(&self) -> Result<String, ConnectorError> {
        if let Some(id) = self.config.meta_str("archive_folder_id") {
            return Ok(id.to_string());
        }

        let url = self.files_url();
        let token = &self.config.access_token;
        let query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            ARCHIVE_FOLDER_NAME, FOLDER_MIME
        );
        let existing: FileList = self
            .api
            .json(|client| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("q", query.as_str()), ("fields", "files(id,name,mimeType)")])
            })
            .await?;
        if let Some(folder) = existing.files.into_iter().next() {
            return Ok(folder.id);
        }

        let body = json!({ "name": ARCHIVE_FOLDER_NAME, "mimeType": FOLDER_MIME });
        let created: CreatedFile = self
            .api
            .json(|client| client.post(&url).bearer_auth(token).json(&body))
            .await?;
        info!(folder_id = %created.id, "Created Drive archive folder");
        Ok(created.id)
    }

    async fn move_file(&self, file_id: &str, add: &str, remove: Option<&str>) -> Result<(), ConnectorError> {
        let url = self.file_url(file_id);
        let token = &self.config.access_token;
        let mut query = vec![("addParents", add.to_string()), ("fields", "id,parents".to_string())];
        if let Some(remove) = remove {
            query.push(("removeParents", remove.to_string()));
        }
        self.api
            .send(|client| {
                client
                    .patch(&url)
                    .bearer_auth(token)
                    .query(&query)
                    .json(&json!({}))
            })
            .await
    }

    async fn file_permissions(&self, file_id: &str) -> Result<Vec<DrivePermission>, ConnectorError> {
        let url = format!("{}/permissions", self.file_url(file_id));
        let token = &self.config.access_token;
        let list: PermissionList = self
            .api
            .json(|client| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("fields", "permissions(id,type,role,emailAddress,domain)")])
            })
            .await?;
        Ok(list.permissions)
    }

    async fn delete_permission(&self, file_id: &str, permission_id: &str) -> Result<(), ConnectorError> {
        let url = format!("{}/permissions/{}", self.file_url(file_id), permission_id);
        let token = &self.config.access_token;
        match self.api.send(|client| client.delete(&url).bearer_auth(token)).await {
            // 重试时权限可能已被删除
            Err(e) if e.status == Some(404) => Ok(()),
            other => other,
        }
    }

    async fn create_permission(&self, file_id: &str, body: serde_json::Value) -> Result<(), ConnectorError> {
        let url = format!("{}/permissions", self.file_url(file_id));
        let token = &self.config.access_token;
        self.api
            .send(|client| {
                client
                    .post(&url)
                    .bearer_auth(token)
                    .query(&[("sendNotificationEmail", "false")])
                    .json(&body)
            })
            .await
    }

    /// 某个外部协作者可访问的所有文件
    async fn files_shared_with(&self, email: &str) -> Result<Vec<DriveFile>, ConnectorError> {
        let url = self.files_url();
        let token = &self.config.access_token;
        let query = format!(
            "('{0}' in readers or '{0}' in writers) and trashed = false",
            email.replace('\'', "\\'")
        );
        paginate(Platform::GoogleWorkspace, self.api.settings().max_pages, |cursor| {
            let url = url.clone();
            let query = query.clone();
            async move {
                let mut params = vec![("q", query), ("fields", FILE_FIELDS.to_string())];
                if let Some(cursor) = cursor {
                    params.push(("pageToken", cursor));
                }
                let list: FileList = self
                    .api
                    .json(|client| client.get(&url).bearer_auth(token).query(&params))
                    .await?;
                Ok(Page::new(list.files, list.next_page_token))
            }
        })
        .await
    }

    async fn set_suspended(&self, user_id: &str, suspended: bool) -> Result<(), ConnectorError> {
        let url = format!("{}/{}", self.users_url(), user_id);
        let token = &self.config.access_token;
        let body = json!({ "suspended": suspended });
        self.api
            .send(|client| client.put(&url).bearer_auth(token).json(&body))
            .await
    }

    /// 移除外部协作者在所有文件上的权限，返回 "文件ID:角色" 列表
    async fn remove_collaborator(&self, email: &str) -> OpResult<Vec<String>> {
        let files = self.files_shared_with(email).await?;
        let mut removed = Vec::new();
        for file in files {
            for permission in file.permissions.iter().filter(|p| {
                p.email_address
                    .as_deref()
                    .map(|e| e.eq_ignore_ascii_case(email))
                    .unwrap_or(false)
            }) {
                if let Some(permission_id) = &permission.id {
                    self.delete_permission(&file.id, permission_id).await?;
                    removed.push(format!("{}:{}", file.id, permission.role));
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Connector for GoogleWorkspaceConnector {
    fn platform(&self) -> Platform {
        Platform::GoogleWorkspace
    }

    async fn test_connection(&self) -> bool {
        match self.storage_usage_bytes().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Google Workspace connection test failed");
                false
            }
        }
    }

    async fn refresh_token(&self) -> Result<TokenGrant, TokenError> {
        let url = format!("{}/token", self.oauth_base);
        oauth::refresh_grant(&self.api, Platform::GoogleWorkspace, &url, &self.config).await
    }

    #[instrument(skip(self), fields(platform = "google_workspace", tenant_id = %self.config.tenant_id))]
    async fn fetch_audit_data(&self) -> Result<AuditData, ConnectorError> {
        let files = self.list_files().await?;
        let directory = self.list_users().await?;
        let usage_bytes = match self.storage_usage_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Drive storage quota unavailable, summing file sizes");
                -1
            }
        };

        // 外部协作者按邮箱聚合，取最高的角色
        let mut external: BTreeMap<String, ExternalCollaborator> = BTreeMap::new();
        for file in &files {
            for permission in &file.permissions {
                if permission.kind != "user" {
                    continue;
                }
                if let Some(email) = permission.email_address.as_deref() {
                    if self.is_external(email) {
                        let entry = external
                            .entry(email.to_lowercase())
                            .or_insert_with(|| ExternalCollaborator {
                                role: permission.role.clone(),
                            });
                        if permission.role == "writer" {
                            entry.role = "writer".to_string();
                        }
                    }
                }
            }
        }

        let mut file_records: Vec<FileRecord> =
            files.into_iter().map(|f| self.to_file_record(f)).collect();
        mark_duplicates(&mut file_records);

        let now = Utc::now();
        let mut users: Vec<UserRecord> = directory
            .into_iter()
            .filter(|u| !u.suspended)
            .map(|u| UserRecord {
                email: Some(u.primary_email.clone()),
                name: u.name.full_name.clone().unwrap_or_else(|| u.primary_email.clone()),
                role: if u.is_admin { "admin" } else { "member" }.to_string(),
                source: Platform::GoogleWorkspace,
                last_active: u.last_login_time,
                is_guest: false,
                is_admin: u.is_admin,
                license_type: Some("workspace".to_string()),
                group_id: None,
                external_id: u.id,
            })
            .collect();
        let licensed = users.len() as i64;

        users.extend(external.into_iter().map(|(email, collaborator)| UserRecord {
            external_id: email.clone(),
            email: Some(email.clone()),
            name: email,
            role: collaborator.role,
            source: Platform::GoogleWorkspace,
            last_active: None,
            is_guest: true,
            is_admin: false,
            license_type: None,
            group_id: None,
        }));

        let storage_bytes = if usage_bytes >= 0 {
            usage_bytes
        } else {
            file_records.iter().map(|f| f.size_bytes).sum()
        };
        let active_users = users
            .iter()
            .filter(|u| !u.is_guest && !u.is_inactive(now, 90))
            .count() as i64;

        Ok(AuditData {
            files: file_records,
            users,
            channels: None,
            storage_used_gb: storage_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            total_licenses: licensed,
            active_users,
        })
    }

    async fn archive_file(&self, item: &PlaybookItem) -> OpResult<ArchivedLocation> {
        let parent = match &item.metadata.0 {
            ItemMetadata::File { parent_id, .. } => parent_id.clone(),
            _ => {
                return Err(OperationError::InvalidTarget(format!(
                    "{} is not a file item",
                    item.external_id
                )))
            }
        };

        let folder = self.ensure_archive_folder().await?;
        if parent.as_deref() == Some(folder.as_str()) {
            // 已经在归档目录里
            return Ok(ArchivedLocation {
                archive_folder_id: Some(folder),
            });
        }
        self.move_file(&item.external_id, &folder, parent.as_deref())
            .await?;
        Ok(ArchivedLocation {
            archive_folder_id: Some(folder),
        })
    }

    async fn restore_file(&self, action: &RestoreFile) -> OpResult<()> {
        let target = action.original_parent_id.clone().ok_or_else(|| {
            OperationError::InvalidTarget(format!("{} has no recorded parent", action.file_id))
        })?;
        self.move_file(&action.file_id, &target, action.archive_folder_id.as_deref())
            .await?;
        Ok(())
    }

    /// 只补回缺失的公开 / 域共享
    async fn update_permissions(&self, file_id: &str, sharing: &[SharePermission]) -> OpResult<()> {
        let current = self.file_permissions(file_id).await?;
        for share in sharing {
            let exists = current.iter().any(|p| {
                p.kind == share.principal_type
                    && p.role == share.role
                    && p.email_address.clone().or(p.domain.clone()) == share.principal
            });
            if exists {
                continue;
            }
            let mut body = json!({ "type": share.principal_type, "role": share.role });
            match share.principal_type.as_str() {
                "domain" => body["domain"] = json!(share.principal),
                "user" | "group" => body["emailAddress"] = json!(share.principal),
                _ => {}
            }
            self.create_permission(file_id, body).await?;
        }
        Ok(())
    }

    async fn revoke_access(&self, item: &PlaybookItem) -> OpResult<RevokeOutcome> {
        match &item.metadata.0 {
            ItemMetadata::File { .. } => {
                let current = self.file_permissions(&item.external_id).await?;
                let public: Vec<DrivePermission> = current
                    .into_iter()
                    .filter(|p| p.kind == "anyone")
                    .collect();
                for permission in &public {
                    if let Some(permission_id) = &permission.id {
                        self.delete_permission(&item.external_id, permission_id).await?;
                    }
                }
                Ok(RevokeOutcome::PermissionsRemoved {
                    original_sharing: public.iter().map(|p| p.to_share()).collect(),
                })
            }
            ItemMetadata::User {
                is_guest: true,
                email,
                role,
                ..
            } => {
                let email = email.clone().unwrap_or_else(|| item.external_id.clone());
                let removed = self.remove_collaborator(&email).await?;
                Ok(RevokeOutcome::AccessRemoved {
                    group_id: None,
                    role: Some(role.clone()),
                    permissions: Some(removed),
                })
            }
            ItemMetadata::User {
                role, license_type, ..
            } => {
                self.set_suspended(&item.external_id, true).await?;
                Ok(RevokeOutcome::UserDeactivated {
                    role: role.clone(),
                    license_type: license_type.clone(),
                })
            }
            ItemMetadata::Channel { .. } => Err(OperationError::InvalidTarget(format!(
                "{} is not a drive object",
                item.external_id
            ))),
        }
    }

    async fn restore_access(&self, action: &RestoreAccess) -> OpResult<()> {
        let email = action.user_email.clone().unwrap_or_else(|| action.user_id.clone());
        for entry in action.permissions.iter().flatten() {
            let Some((file_id, role)) = entry.split_once(':') else {
                warn!(entry = %entry, "Skipping malformed permission entry");
                continue;
            };
            self.create_permission(
                file_id,
                json!({ "type": "user", "role": role, "emailAddress": email }),
            )
            .await?;
        }
        Ok(())
    }

    async fn restore_user(&self, action: &RestoreUser) -> OpResult<()> {
        self.set_suspended(&action.user_id, false).await?;
        Ok(())
    }

    async fn remove_guest(&self, item: &PlaybookItem) -> OpResult<()> {
        let email = match &item.metadata.0 {
            ItemMetadata::User { email, .. } => email.clone().unwrap_or_else(|| item.external_id.clone()),
            _ => item.external_id.clone(),
        };
        self.remove_collaborator(&email).await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> OpResult<DownloadedFile> {
        let token = &self.config.access_token;
        let url = self.file_url(file_id);
        let meta: DriveFile = self
            .api
            .json(|client| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("fields", "id,name,mimeType")])
            })
            .await?;

        // 原生文档只能导出
        let (bytes, mime) = if meta.mime_type.starts_with("application/vnd.google-apps") {
            let export_url = format!("{}/export", url);
            self.api
                .bytes(|client| {
                    client
                        .get(&export_url)
                        .bearer_auth(token)
                        .query(&[("mimeType", "application/pdf")])
                })
                .await?
        } else {
            self.api
                .bytes(|client| client.get(&url).bearer_auth(token).query(&[("alt", "media")]))
                .await?
        };

        Ok(DownloadedFile {
            bytes,
            mime_type: mime.or(Some(meta.mime_type)),
        })
    }

    async fn upload_file(&self, upload: &RestoreUpload) -> OpResult<String> {
        let token = &self.config.access_token;
        let upload_url = format!("{}/upload/drive/v3/files", self.drive_base);
        let mime = upload
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = upload.bytes.clone();
        let created: CreatedFile = self
            .api
            .json(|client| {
                client
                    .post(&upload_url)
                    .bearer_auth(token)
                    .query(&[("uploadType", "media")])
                    .header(reqwest::header::CONTENT_TYPE, mime.as_str())
                    .body(bytes.clone())
            })
            .await?;

        let url = self.file_url(&created.id);
        let body = json!({ "name": upload.file_name });
        let mut query = vec![("fields", "id".to_string())];
        if let Some(parent) = &upload.target_location {
            query.push(("addParents", parent.clone()));
        }
        self.api
            .send(|client| client.patch(&url).bearer_auth(token).query(&query).json(&body))
            .await?;

        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_domain() {
        assert_eq!(email_domain("a@corp.example"), Some("corp.example"));
        assert_eq!(email_domain("nobody"), None);
    }

    #[test]
    fn test_external_detection_uses_domain_metadata() {
        let mut config = ConnectorConfig::new(uuid::Uuid::new_v4(), "token");
        config
            .metadata
            .insert("domain".to_string(), serde_json::json!("corp.example"));
        let connector =
            GoogleWorkspaceConnector::new(config, HttpSettings::default()).unwrap();
        assert!(connector.is_external("guest@gmail.com"));
        assert!(!connector.is_external("me@CORP.example"));
    }
}
