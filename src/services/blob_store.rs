//! 归档存储后端
//!
//! 统一的 BlobStore 抽象：
//! - 本地文件系统
//! - S3 兼容存储 (AWS S3, MinIO)
//! - 内存（测试与本地演练）

use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::ExposeSecret;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::archive_service::ArchiveError;
use crate::config::ArchiveConfig;
use crate::models::integration::Platform;

/// 写入后的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 后端名称（local / s3 / memory）
    fn backend(&self) -> &'static str;

    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<StoredBlob, ArchiveError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError>;

    /// 对象不存在不算错误
    async fn delete(&self, key: &str) -> Result<(), ArchiveError>;

    async fn exists(&self, key: &str) -> Result<bool, ArchiveError>;
}

/// 文件名转成存储键片段：小写字母数字，其余折叠为 '-'
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }

    let slug: String = slug.trim_matches(|c| c == '-' || c == '.').chars().take(120).collect();
    if slug.is_empty() {
        "file".to_string()
    } else {
        slug
    }
}

/// 归档对象键：{tenant}/{platform}/{external_id}/{slug(name)}
pub fn archive_key(tenant_id: Uuid, platform: Platform, external_id: &str, file_name: &str) -> String {
    let external: String = external_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}/{}/{}/{}", tenant_id, platform, external, slugify(file_name))
}

/// 本地文件系统存储
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// 解析存储键；拒绝跳出基础目录的键
    fn resolve(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ArchiveError::Storage(format!("Invalid storage key: {}", key)));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: Option<&str>) -> Result<StoredBlob, ArchiveError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchiveError::Storage(format!("create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ArchiveError::Storage(format!("write {}: {}", path.display(), e)))?;

        debug!(key = %key, size = bytes.len(), "Stored archive blob on local disk");
        Ok(StoredBlob {
            key: key.to_string(),
            url: None,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiveError::BlobMissing(key.to_string()))
            }
            Err(e) => Err(ArchiveError::Storage(format!("read {}: {}", path.display(), e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ArchiveError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArchiveError::Storage(format!("delete {}: {}", path.display(), e))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ArchiveError> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ArchiveError::Storage(format!("stat {}: {}", path.display(), e)))
    }
}

/// S3 兼容存储
pub struct S3BlobStore {
    bucket: s3::Bucket,
    bucket_name: String,
    endpoint: Option<String>,
}

impl S3BlobStore {
    pub fn from_config(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        use s3::creds::Credentials;
        use s3::Region;

        let access_key = config.s3_access_key.as_ref().map(|s| s.expose_secret().clone());
        let secret_key = config.s3_secret_key.as_ref().map(|s| s.expose_secret().clone());

        let credentials = match (access_key, secret_key) {
            (Some(access), Some(secret)) => {
                Credentials::new(Some(&access), Some(&secret), None, None, None)
            }
            // 退回 AWS 标准环境变量 / 实例角色
            _ => Credentials::default(),
        }
        .map_err(|e| ArchiveError::Storage(format!("S3 credentials: {}", e)))?;

        let region_name = config
            .s3_region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let region = match &config.s3_endpoint {
            // 自定义端点（如 MinIO）
            Some(endpoint) => Region::Custom {
                region: region_name,
                endpoint: endpoint.clone(),
            },
            None => region_name.parse().unwrap_or(Region::UsEast1),
        };

        let mut bucket = s3::Bucket::new(&config.s3_bucket, region, credentials)
            .map_err(|e| ArchiveError::Storage(format!("S3 bucket: {}", e)))?;
        if config.s3_endpoint.is_some() {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            bucket_name: config.s3_bucket.clone(),
            endpoint: config.s3_endpoint.clone(),
        })
    }

    fn object_path(key: &str) -> String {
        if key.starts_with('/') {
            key.to_string()
        } else {
            format!("/{}", key)
        }
    }

    fn object_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket_name, key),
            None => format!("s3://{}/{}", self.bucket_name, key),
        }
    }
}

fn is_not_found(err: &s3::error::S3Error) -> bool {
    matches!(err, s3::error::S3Error::HttpFailWithBody(404, _))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn backend(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<StoredBlob, ArchiveError> {
        let path = Self::object_path(key);
        self.bucket
            .put_object_with_content_type(
                &path,
                bytes,
                content_type.unwrap_or("application/octet-stream"),
            )
            .await
            .map_err(|e| ArchiveError::Storage(format!("S3 put {}: {}", key, e)))?;

        debug!(bucket = %self.bucket_name, key = %key, size = bytes.len(), "Stored archive blob in S3");
        Ok(StoredBlob {
            key: key.to_string(),
            url: Some(self.object_url(key)),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        match self.bucket.get_object(Self::object_path(key)).await {
            Ok(response) => Ok(response.bytes().to_vec()),
            Err(e) if is_not_found(&e) => Err(ArchiveError::BlobMissing(key.to_string())),
            Err(e) => Err(ArchiveError::Storage(format!("S3 get {}: {}", key, e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ArchiveError> {
        match self.bucket.delete_object(Self::object_path(key)).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ArchiveError::Storage(format!("S3 delete {}: {}", key, e))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ArchiveError> {
        match self.bucket.head_object(Self::object_path(key)).await {
            Ok((_, status)) => Ok((200..300).contains(&status)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => {
                warn!(key = %key, error = %e, "S3 head request failed");
                Err(ArchiveError::Storage(format!("S3 head {}: {}", key, e)))
            }
        }
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: Option<&str>) -> Result<StoredBlob, ArchiveError> {
        self.objects.insert(key.to_string(), bytes.to_vec());
        Ok(StoredBlob {
            key: key.to_string(),
            url: Some(format!("memory://{}", key)),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        self.objects
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| ArchiveError::BlobMissing(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), ArchiveError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ArchiveError> {
        Ok(self.objects.contains_key(key))
    }
}

/// 按配置构造当前后端
pub fn blob_store_from_config(config: &ArchiveConfig) -> Result<Arc<dyn BlobStore>, ArchiveError> {
    match config.storage_type.to_lowercase().as_str() {
        "s3" => Ok(Arc::new(S3BlobStore::from_config(config)?)),
        _ => Ok(Arc::new(LocalBlobStore::new(&config.local_base_path))),
    }
}

/// 迁移任务读取的旧后端（只支持本地目录）
pub fn legacy_blob_store(config: &ArchiveConfig) -> Option<Arc<dyn BlobStore>> {
    config
        .legacy_local_path
        .as_ref()
        .map(|path| Arc::new(LocalBlobStore::new(path)) as Arc<dyn BlobStore>)
}
