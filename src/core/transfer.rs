//! 分块传输：读取句柄、字节计数、进度回调与上传会话状态

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 默认分块大小 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
/// 计算校验和时每次读取的块大小
pub const CHECKSUM_BLOCK_SIZE: usize = 64 * 1024;

/// 上传会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::InProgress => write!(f, "in_progress"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 存储端报告的上传会话进度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub session: String,
    pub total_size: u64,
    /// 存储端已确认的字节数，续传从这里开始
    pub received: u64,
    pub status: TransferStatus,
}

/// 单次进度通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub path: String,
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            100
        } else {
            ((self.transferred.min(self.total) * 100) / self.total) as u32
        }
    }
}

/// 每写完一个分块调用一次
pub type ProgressCallback<'a> = dyn Fn(&TransferProgress) + Send + Sync + 'a;

/// 端点读写字节计数
#[derive(Debug, Default)]
pub struct TransferCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl TransferCounters {
    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// 取消标志，在所有端点间共享
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 已取消时返回 `Interrupted`
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// 可按偏移读取的源数据句柄
#[async_trait]
pub trait TransferHandle: Send + Sync {
    /// 总字节数
    fn size(&self) -> u64;

    /// 从 `offset` 读取至多 `len` 字节；到达末尾时返回空
    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes>;
}

/// 第 `attempt` 次重试前的等待时间（指数退避）
pub fn backoff_delay(base_delay_ms: u64, attempt: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempt);
    Duration::from_millis(base_delay_ms.saturating_mul(factor))
}

/// 小写十六进制 MD5
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 按 64 KiB 块读取整个句柄并计算 MD5
pub async fn md5_of(handle: &dyn TransferHandle, cancel: &CancelFlag) -> Result<String> {
    let mut hasher = Md5::new();
    let mut offset = 0u64;
    let size = handle.size();

    while offset < size {
        cancel.check()?;
        let block = handle.read_chunk(offset, CHECKSUM_BLOCK_SIZE).await?;
        if block.is_empty() {
            break;
        }
        hasher.update(&block);
        offset += block.len() as u64;
    }

    Ok(hex::encode(hasher.finalize()))
}

/// 内存中的句柄
#[cfg(test)]
pub struct BytesHandle {
    data: Bytes,
}

#[cfg(test)]
impl BytesHandle {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[cfg(test)]
#[async_trait]
impl TransferHandle for BytesHandle {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}
