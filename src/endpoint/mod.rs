//! 端点适配：本地与远程树的统一接口

pub mod local;
pub mod remote;

use crate::config::{SyncOptions, TransferConfig};
use crate::core::metadata::{AttributeSet, FileMetadata};
use crate::core::resolver::Resolver;
use crate::core::transfer::{
    CancelFlag, ProgressCallback, TransferCounters, TransferHandle, DEFAULT_CHUNK_SIZE,
};
use crate::error::{Result, SyncError};
use crate::path::{Location, SyncPath};
use async_trait::async_trait;
use std::sync::Arc;

pub use local::LocalEndpoint;
pub use remote::RemoteEndpoint;

/// 端点行为选项
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// 获取信息时计算校验和
    pub checksum: bool,
    pub dry_run: bool,
    /// 本地目标追加写入
    pub append: bool,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub cancel: CancelFlag,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            checksum: false,
            dry_run: false,
            append: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            cancel: CancelFlag::new(),
        }
    }
}

impl EndpointOptions {
    pub fn new(options: &SyncOptions, transfer: &TransferConfig, cancel: CancelFlag) -> Self {
        Self {
            checksum: options.checksum,
            dry_run: options.dry_run,
            append: options.append,
            chunk_size: transfer.chunk_size(),
            max_retries: transfer.max_retries,
            retry_base_delay_ms: transfer.retry_base_delay_ms,
            cancel,
        }
    }
}

/// 要复制到目标的源条目
pub struct SourceRef<'a> {
    pub endpoint: &'a dyn Endpoint,
    /// 源端点下的相对路径，`None` 表示源根本身
    pub rel: Option<&'a str>,
    pub meta: &'a FileMetadata,
    /// 要写到目标的属性
    pub attrs: AttributeSet,
}

/// 一棵树（本地目录或远程存储中的路径）
///
/// `rel` 为相对于端点根的路径；`None` 或空串表示根本身。
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn kind(&self) -> Location;


    /// `rel` 对应的完整路径
    fn path_of(&self, rel: Option<&str>) -> String;

    fn is_local(&self) -> bool {
        self.kind() == Location::Local
    }

    /// 获取元数据，不存在时返回 `None`
    async fn get_info(&self, rel: Option<&str>) -> Result<Option<FileMetadata>>;

    /// 创建条目：目录直接创建，文件先建占位再写数据；最后设置属性
    async fn create(
        &self,
        rel: Option<&str>,
        source: &SourceRef<'_>,
        progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()>;

    /// 分块写入数据，返回写入的字节数
    async fn update_data(
        &self,
        rel: Option<&str>,
        source: &SourceRef<'_>,
        progress: Option<&ProgressCallback<'_>>,
    ) -> Result<u64>;

    /// 设置属性，`None` 字段保持不变
    async fn update_attrs(&self, rel: Option<&str>, attrs: &AttributeSet) -> Result<()>;

    /// 打开用于读取的分块句柄
    async fn uploader(&self, rel: Option<&str>) -> Result<Box<dyn TransferHandle>>;

    /// MD5 校验和，目录返回 `None`
    async fn checksum(&self, rel: Option<&str>) -> Result<Option<String>>;

    fn counters(&self) -> &TransferCounters;
}

/// 根据路径前缀选择端点
pub fn create_endpoint(
    path: &SyncPath,
    resolver: Option<Arc<Resolver>>,
    options: EndpointOptions,
) -> Result<Box<dyn Endpoint>> {
    match path.location() {
        Location::Local => Ok(Box::new(LocalEndpoint::new(path.clone(), options))),
        Location::Remote => {
            let resolver = resolver.ok_or_else(|| {
                SyncError::InvalidPath(format!("{}: 未配置远程存储", path))
            })?;
            Ok(Box::new(RemoteEndpoint::new(path.clone(), resolver, options)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_factory_picks_by_scheme() {
        let resolver = Arc::new(Resolver::new(Arc::new(MemoryStore::new())));

        let local = SyncPath::parse("/tmp/x").unwrap();
        let ep = create_endpoint(&local, None, EndpointOptions::default()).unwrap();
        assert_eq!(ep.kind(), Location::Local);
        assert!(ep.is_local());

        let remote = SyncPath::parse("remote://backup").unwrap();
        let ep = create_endpoint(&remote, Some(resolver), EndpointOptions::default()).unwrap();
        assert_eq!(ep.kind(), Location::Remote);
        assert_eq!(ep.path_of(Some("a/b")), "remote://backup/a/b");

        assert!(create_endpoint(&remote, None, EndpointOptions::default()).is_err());
    }
}
