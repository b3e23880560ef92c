pub mod memory;
pub mod operator;

use crate::config::{RemoteConfig, RemoteType};
use crate::core::metadata::{FileKind, FileMetadata, ModifiedTime, NativeAttributes};
use crate::core::transfer::UploadStatus;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::{MemoryStore, StoreCall};
pub use operator::OperatorStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 存储根目录的 id
pub const ROOT_ID: &str = "root";

/// 远程存储中的一个条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: FileKind,
    pub modified_time: ModifiedTime,
    pub size: u64,
    /// 小写十六进制 MD5，存储不提供时为空
    pub checksum: Option<String>,
    /// 描述字段，存放编码后的平台属性
    pub description: Option<String>,
}

impl RemoteEntry {
    /// 虚拟根记录，不需要访问存储
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            parent_id: None,
            name: String::new(),
            kind: FileKind::Folder,
            modified_time: ModifiedTime::from_secs(0),
            size: 0,
            checksum: None,
            description: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == FileKind::Folder
    }

    /// 转换为统一元数据，`path` 为解析时使用的完整路径
    pub fn to_metadata(&self, path: &str) -> FileMetadata {
        let folder = self.is_folder();
        FileMetadata {
            id: Some(self.id.clone()),
            title: self.name.clone(),
            path: path.to_string(),
            modified_time: self.modified_time,
            kind: self.kind,
            size: if folder { 0 } else { self.size },
            checksum: if folder { None } else { self.checksum.clone() },
            native: self.description.as_deref().and_then(NativeAttributes::decode),
        }
    }
}

/// 一页子条目
#[derive(Debug, Clone, Default)]
pub struct ChildPage {
    pub entries: Vec<RemoteEntry>,
    /// 还有下一页时返回续页令牌
    pub next_page_token: Option<String>,
}

/// 新建条目的参数
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub parent_id: String,
    pub name: String,
    pub kind: FileKind,
    pub modified_time: ModifiedTime,
    pub description: Option<String>,
}

/// 条目更新，`None` 字段保持不变
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub modified_time: Option<ModifiedTime>,
    pub description: Option<String>,
}

/// 层级式远程存储接口
///
/// 条目不存在时查询返回 `Ok(None)`。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 分页列出子条目
    async fn list_children(&self, parent_id: &str, page_token: Option<&str>) -> Result<ChildPage>;

    /// 按 id 获取条目
    async fn get(&self, id: &str) -> Result<Option<RemoteEntry>>;

    /// 创建文件或目录，文件可带初始内容
    async fn create(&self, entry: NewEntry, data: Option<Bytes>) -> Result<RemoteEntry>;

    /// 更新修改时间和描述
    async fn update(&self, id: &str, patch: EntryPatch) -> Result<RemoteEntry>;

    /// 删除条目（目录连同子树）
    async fn delete(&self, id: &str, skip_trash: bool) -> Result<()>;

    /// 读取文件的一部分
    async fn read_range(&self, id: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// 开始一个可续传的上传会话，完成后替换文件内容
    async fn begin_upload(&self, id: &str, total_size: u64) -> Result<String>;

    /// 上传一个分块，`offset` 必须等于已确认的字节数
    async fn upload_chunk(&self, session: &str, offset: u64, data: Bytes) -> Result<UploadStatus>;

    /// 查询会话已确认的字节数
    async fn upload_status(&self, session: &str) -> Result<UploadStatus>;

    /// 放弃会话
    async fn cancel_upload(&self, session: &str) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建远程存储实例
pub async fn create_store(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.remote_type {
        RemoteType::Memory => {
            tracing::info!("初始化内存存储");
            Ok(Arc::new(MemoryStore::new()) as Arc<dyn RemoteStore>)
        }
        RemoteType::Fs => {
            if config.root.is_empty() {
                anyhow::bail!("fs 存储需要 root");
            }
            tracing::info!("初始化本地目录存储: {}", config.root);
            Ok(Arc::new(OperatorStore::fs(&config.root).await?) as Arc<dyn RemoteStore>)
        }
        RemoteType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 存储需要 bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 存储需要 region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 存储需要 accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 存储需要 secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(
                OperatorStore::s3(
                    bucket,
                    region,
                    access_key,
                    secret_key,
                    config.endpoint.clone(),
                    &config.root,
                )
                .await?,
            ) as Arc<dyn RemoteStore>)
        }
        RemoteType::Webdav => {
            let endpoint = config
                .endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV 存储需要 endpoint"))?;
            let username = config
                .username
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV 存储需要 username"))?;
            let password = config
                .password
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV 存储需要 password"))?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={}", endpoint, config.root);
            Ok(Arc::new(OperatorStore::webdav(endpoint, username, password, &config.root).await?)
                as Arc<dyn RemoteStore>)
        }
    }
}
