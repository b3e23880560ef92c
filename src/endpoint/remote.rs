use super::{Endpoint, EndpointOptions, SourceRef};
use crate::core::metadata::{AttributeSet, FileKind, FileMetadata, NativeAttributes};
use crate::core::resolver::Resolver;
use crate::core::transfer::{
    backoff_delay, md5_of, ProgressCallback, TransferCounters, TransferHandle, TransferProgress,
    TransferStatus,
};
use crate::error::{Result, SyncError};
use crate::path::{self, Location, SyncPath};
use crate::storage::{EntryPatch, RemoteEntry, RemoteStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// 远程存储端点，所有路径查询经过共享的 [`Resolver`]
pub struct RemoteEndpoint {
    root: SyncPath,
    resolver: Arc<Resolver>,
    options: EndpointOptions,
    counters: Arc<TransferCounters>,
}

impl RemoteEndpoint {
    pub fn new(root: SyncPath, resolver: Arc<Resolver>, options: EndpointOptions) -> Self {
        Self {
            root,
            resolver,
            options,
            counters: Arc::new(TransferCounters::default()),
        }
    }

    fn store(&self) -> &Arc<dyn RemoteStore> {
        self.resolver.store()
    }

    async fn require(&self, path: &str) -> Result<RemoteEntry> {
        self.resolver
            .resolve(path)
            .await?
            .ok_or_else(|| SyncError::transfer(path, "远程条目不存在"))
    }

    /// 已存在但类型不同的条目先删除
    async fn clear_conflicting(&self, path: &str, kind: FileKind) -> Result<()> {
        if let Some(existing) = self.resolver.resolve(path).await? {
            if existing.kind != kind && existing.parent_id.is_some() {
                debug!("删除类型不同的远程条目: {}", path);
                self.resolver.delete(path, false).await?;
            }
        }
        Ok(())
    }

    /// 放弃上传会话，失败只记录
    async fn abandon(&self, path: &str, session: &str) {
        if let Err(e) = self.store().cancel_upload(session).await {
            warn!("取消上传会话失败: {}: {}", path, e);
        }
    }

    /// 上传整个句柄；分块失败后查询会话进度并从确认的偏移续传，
    /// 会话已失效时重新开始一个会话
    async fn upload(
        &self,
        path: &str,
        entry: &RemoteEntry,
        handle: &dyn TransferHandle,
        progress: Option<&ProgressCallback<'_>>,
    ) -> Result<u64> {
        let total = handle.size();
        let chunk_size = self.options.chunk_size.max(1);
        let mut session = self.store().begin_upload(&entry.id, total).await?;

        let mut offset = 0u64;
        let mut written = 0u64;
        let mut retries = 0u32;

        while offset < total {
            if self.options.cancel.is_cancelled() {
                debug!("取消上传会话: {}", path);
                self.abandon(path, &session).await;
                return Err(SyncError::Interrupted);
            }

            let chunk = match handle.read_chunk(offset, chunk_size).await {
                Ok(chunk) if !chunk.is_empty() => chunk,
                Ok(_) => {
                    self.abandon(path, &session).await;
                    return Err(SyncError::transfer(
                        path,
                        format!("源文件在传输中变短 ({}/{})", offset, total),
                    ));
                }
                Err(e) => {
                    self.abandon(path, &session).await;
                    return Err(e);
                }
            };

            let acknowledged = match self.store().upload_chunk(&session, offset, chunk).await {
                Ok(status) => status.received,
                Err(e) => {
                    retries += 1;
                    if retries > self.options.max_retries {
                        self.abandon(path, &session).await;
                        return Err(SyncError::transfer(
                            path,
                            format!("分块上传失败 (已重试{}次): {}", self.options.max_retries, e),
                        ));
                    }

                    let delay = backoff_delay(self.options.retry_base_delay_ms, retries - 1);
                    warn!(
                        "分块上传失败，{}ms 后续传 ({}/{}): {}: {}",
                        delay.as_millis(),
                        retries,
                        self.options.max_retries,
                        path,
                        e
                    );
                    tokio::time::sleep(delay).await;

                    let status = match self.store().upload_status(&session).await {
                        Ok(status) => status,
                        Err(e) => {
                            self.abandon(path, &session).await;
                            return Err(SyncError::transfer(path, e));
                        }
                    };
                    match status.status {
                        TransferStatus::Cancelled => {
                            return Err(SyncError::transfer(path, "上传会话已被取消"));
                        }
                        TransferStatus::Failed => {
                            warn!("上传会话已失效，从头重新上传: {}", path);
                            self.abandon(path, &session).await;
                            session = self.store().begin_upload(&entry.id, total).await?;
                            0
                        }
                        TransferStatus::InProgress | TransferStatus::Completed => {
                            debug!("从偏移 {} 续传: {}", status.received, path);
                            status.received
                        }
                    }
                }
            };

            if acknowledged > offset {
                let delta = acknowledged - offset;
                written += delta;
                self.counters.add_written(delta);
            }
            offset = acknowledged;

            if let Some(callback) = progress {
                callback(&TransferProgress {
                    path: path.to_string(),
                    transferred: offset,
                    total,
                });
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl Endpoint for RemoteEndpoint {
    fn kind(&self) -> Location {
        Location::Remote
    }

    fn path_of(&self, rel: Option<&str>) -> String {
        let joined = match rel {
            Some(rel) => self.root.join(rel),
            None => self.root.as_str().to_string(),
        };
        path::normalize_remote(&joined)
    }

    async fn get_info(&self, rel: Option<&str>) -> Result<Option<FileMetadata>> {
        let path = self.path_of(rel);
        let Some(entry) = self.resolver.resolve(&path).await? else {
            return Ok(None);
        };

        let mut info = entry.to_metadata(&path);
        if !self.options.checksum {
            info.checksum = None;
        } else if info.is_file() && info.checksum.is_none() {
            info.checksum = self.checksum(rel).await?;
        }
        Ok(Some(info))
    }

    async fn create(
        &self,
        rel: Option<&str>,
        source: &SourceRef<'_>,
        progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()> {
        let path = self.path_of(rel);

        if self.options.dry_run {
            debug!("[dry-run] 创建: {}", path);
            return Ok(());
        }

        self.clear_conflicting(&path, source.meta.kind).await?;

        match source.meta.kind {
            FileKind::Folder => {
                self.resolver.mkdir(&path).await?;
            }
            FileKind::File => {
                let mtime = source.attrs.mtime.unwrap_or(source.meta.modified_time);
                let description = source.attrs.native().encode();
                self.resolver
                    .create_file(&path, mtime, Some(description))
                    .await?;
                self.update_data(rel, source, progress).await?;
            }
        }

        self.update_attrs(rel, &source.attrs).await
    }

    async fn update_data(
        &self,
        rel: Option<&str>,
        source: &SourceRef<'_>,
        progress: Option<&ProgressCallback<'_>>,
    ) -> Result<u64> {
        let path = self.path_of(rel);

        if self.options.dry_run {
            debug!("[dry-run] 上传: {}", path);
            return Ok(0);
        }

        let entry = self.require(&path).await?;
        if entry.is_folder() {
            return Err(SyncError::transfer(&path, "目标是目录"));
        }
        if self.options.append {
            debug!("远程存储不支持追加，整体重传: {}", path);
        }

        let handle = source.endpoint.uploader(source.rel).await?;
        let written = self.upload(&path, &entry, handle.as_ref(), progress).await?;

        // 上传改变了大小和校验和
        if let Some(updated) = self.store().get(&entry.id).await? {
            self.resolver.refresh(&path, updated);
        }

        debug!("上传完成: {} ({} 字节)", path, written);
        Ok(written)
    }

    async fn update_attrs(&self, rel: Option<&str>, attrs: &AttributeSet) -> Result<()> {
        let path = self.path_of(rel);

        if self.options.dry_run {
            debug!("[dry-run] 设置属性: {}", path);
            return Ok(());
        }

        let entry = self.require(&path).await?;
        if entry.parent_id.is_none() {
            debug!("跳过存储根的属性: {}", path);
            return Ok(());
        }

        let stored = entry
            .description
            .as_deref()
            .and_then(NativeAttributes::decode)
            .unwrap_or_default();
        let merged = stored.merge(&attrs.native());

        let updated = self
            .store()
            .update(
                &entry.id,
                EntryPatch {
                    modified_time: attrs.mtime,
                    description: Some(merged.encode()),
                },
            )
            .await?;
        self.resolver.refresh(&path, updated);
        Ok(())
    }

    async fn uploader(&self, rel: Option<&str>) -> Result<Box<dyn TransferHandle>> {
        let path = self.path_of(rel);
        let entry = self.require(&path).await?;
        if entry.is_folder() {
            return Err(SyncError::transfer(&path, "不能读取目录"));
        }
        Ok(Box::new(RemoteHandle {
            store: self.store().clone(),
            id: entry.id,
            size: entry.size,
            counters: self.counters.clone(),
        }))
    }

    async fn checksum(&self, rel: Option<&str>) -> Result<Option<String>> {
        let path = self.path_of(rel);
        let entry = self.require(&path).await?;
        if entry.is_folder() {
            return Ok(None);
        }
        if let Some(sum) = entry.checksum {
            return Ok(Some(sum));
        }

        // 存储不提供校验和时读取内容计算
        let handle = self.uploader(rel).await?;
        Ok(Some(md5_of(handle.as_ref(), &self.options.cancel).await?))
    }

    fn counters(&self) -> &TransferCounters {
        &self.counters
    }
}

/// 远程文件的分块读取句柄，读取的字节计入端点的接收计数
struct RemoteHandle {
    store: Arc<dyn RemoteStore>,
    id: String,
    size: u64,
    counters: Arc<TransferCounters>,
}

#[async_trait]
impl TransferHandle for RemoteHandle {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        let length = (len as u64).min(self.size - offset);
        let data = self.store.read_range(&self.id, offset, length).await?;
        self.counters.add_read(data.len() as u64);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::ModifiedTime;
    use crate::core::transfer::{md5_hex, BytesHandle};
    use crate::endpoint::LocalEndpoint;
    use crate::storage::{MemoryStore, StoreCall};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn remote(store: &Arc<MemoryStore>, root: &str, options: EndpointOptions) -> RemoteEndpoint {
        let resolver = Arc::new(Resolver::new(store.clone()));
        RemoteEndpoint::new(SyncPath::parse(root).unwrap(), resolver, options)
    }

    fn fast(chunk_size: usize) -> EndpointOptions {
        EndpointOptions {
            chunk_size,
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    /// 源数据放在本地临时目录
    fn local_source(data: &[u8]) -> (tempfile::TempDir, LocalEndpoint) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.bin"), data).unwrap();
        let ep = LocalEndpoint::new(
            SyncPath::parse(dir.path().to_str().unwrap()).unwrap(),
            EndpointOptions::default(),
        );
        (dir, ep)
    }

    #[tokio::test]
    async fn test_create_file_then_read_back() {
        let store = Arc::new(MemoryStore::new());
        let dst = remote(&store, "remote://backup", fast(5));
        let data = b"remote upload payload".to_vec();
        let (_dir, src) = local_source(&data);

        let meta = src.get_info(Some("src.bin")).await.unwrap().unwrap();
        let attrs = AttributeSet {
            mode: Some(0o100640),
            mtime: Some(ModifiedTime::from_secs(1_234_567_890)),
            ..Default::default()
        };
        let source = SourceRef {
            endpoint: &src,
            rel: Some("src.bin"),
            meta: &meta,
            attrs,
        };

        let ticks = AtomicU64::new(0);
        let progress = |_: &TransferProgress| {
            ticks.fetch_add(1, Ordering::Relaxed);
        };
        dst.create(Some("dir/f.bin"), &source, Some(&progress))
            .await
            .unwrap();

        assert_eq!(dst.counters().bytes_written(), data.len() as u64);
        assert_eq!(ticks.load(Ordering::Relaxed), 5);

        let info = dst.get_info(Some("dir/f.bin")).await.unwrap().unwrap();
        assert_eq!(info.size, data.len() as u64);
        assert_eq!(info.modified_time.as_secs(), 1_234_567_890);
        assert_eq!(info.native.unwrap().mode, Some(0o100640));
        assert_eq!(info.path, "remote://backup/dir/f.bin");

        let handle = dst.uploader(Some("dir/f.bin")).await.unwrap();
        let first = handle.read_chunk(0, 6).await.unwrap();
        assert_eq!(&first[..], b"remote");
        assert_eq!(dst.counters().bytes_read(), 6);
    }

    #[tokio::test]
    async fn test_byte_counter_independent_of_chunk_size() {
        let data: Vec<u8> = (0..777u32).map(|i| i as u8).collect();
        let (_dir, src) = local_source(&data);
        let meta = src.get_info(Some("src.bin")).await.unwrap().unwrap();

        for chunk_size in [1usize, 10, 256, 777, 10_000] {
            let store = Arc::new(MemoryStore::new());
            let dst = remote(&store, "remote://", fast(chunk_size));
            let source = SourceRef {
                endpoint: &src,
                rel: Some("src.bin"),
                meta: &meta,
                attrs: AttributeSet::times_only(meta.modified_time, None),
            };
            dst.create(Some("f"), &source, None).await.unwrap();
            assert_eq!(dst.counters().bytes_written(), 777, "分块大小 {}", chunk_size);
        }
    }

    #[tokio::test]
    async fn test_resume_from_acknowledged_offset() {
        let store = Arc::new(MemoryStore::new());
        let dst = remote(&store, "remote://", fast(4));
        let data = b"0123456789abcdef".to_vec();
        let (_dir, src) = local_source(&data);
        let meta = src.get_info(Some("src.bin")).await.unwrap().unwrap();
        let source = SourceRef {
            endpoint: &src,
            rel: Some("src.bin"),
            meta: &meta,
            attrs: AttributeSet::times_only(meta.modified_time, None),
        };

        // 前两次分块各只接收 1 字节
        store.fail_next_chunks(2, 1);
        dst.create(Some("f"), &source, None).await.unwrap();

        let entry = dst.resolver.resolve("remote://f").await.unwrap().unwrap();
        assert_eq!(store.content(&entry.id).unwrap(), Bytes::from(data.clone()));
        assert_eq!(dst.counters().bytes_written(), data.len() as u64);
        assert_eq!(
            store.count_calls(|c| matches!(c, StoreCall::UploadStatus(_))),
            2
        );
        assert_eq!(entry.checksum.as_deref(), Some(md5_hex(&data).as_str()));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let store = Arc::new(MemoryStore::new());
        let dst = remote(
            &store,
            "remote://",
            EndpointOptions {
                max_retries: 2,
                ..fast(4)
            },
        );
        let (_dir, src) = local_source(b"some bytes");
        let meta = src.get_info(Some("src.bin")).await.unwrap().unwrap();
        let source = SourceRef {
            endpoint: &src,
            rel: Some("src.bin"),
            meta: &meta,
            attrs: AttributeSet::default(),
        };

        store.fail_next_chunks(10, 0);
        let err = dst.create(Some("f"), &source, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Transfer { .. }));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failed_session_restarts_upload() {
        let store = Arc::new(MemoryStore::new());
        let dst = remote(&store, "remote://", fast(4));
        let data = b"0123456789abcdef".to_vec();
        let (_dir, src) = local_source(&data);
        let meta = src.get_info(Some("src.bin")).await.unwrap().unwrap();
        let source = SourceRef {
            endpoint: &src,
            rel: Some("src.bin"),
            meta: &meta,
            attrs: AttributeSet::default(),
        };

        store.fail_next_session();
        dst.create(Some("f"), &source, None).await.unwrap();

        let entry = dst.resolver.resolve("remote://f").await.unwrap().unwrap();
        assert_eq!(store.content(&entry.id).unwrap(), Bytes::from(data));
        assert_eq!(
            store.count_calls(|c| matches!(c, StoreCall::BeginUpload(_))),
            2
        );
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_status_query_failure_abandons_session() {
        let store = Arc::new(MemoryStore::new());
        let dst = remote(&store, "remote://", fast(4));
        let (_dir, src) = local_source(b"some bytes");
        let meta = src.get_info(Some("src.bin")).await.unwrap().unwrap();
        let source = SourceRef {
            endpoint: &src,
            rel: Some("src.bin"),
            meta: &meta,
            attrs: AttributeSet::default(),
        };

        store.fail_next_chunks(1, 0);
        store.fail_next_status(1);
        let err = dst.create(Some("f"), &source, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Transfer { .. }));
        assert_eq!(
            store.count_calls(|c| matches!(c, StoreCall::CancelUpload(_))),
            1
        );
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cancel_abandons_session() {
        let store = Arc::new(MemoryStore::new());
        let options = fast(4);
        let cancel = options.cancel.clone();
        let dst = remote(&store, "remote://", options);
        let entry = dst
            .resolver
            .create_file("remote://f", ModifiedTime::now(), None)
            .await
            .unwrap();

        cancel.cancel();
        let handle = BytesHandle::new(vec![1u8; 32]);
        let err = dst
            .upload("remote://f", &entry, &handle, None)
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(
            store.count_calls(|c| matches!(c, StoreCall::CancelUpload(_))),
            1
        );
        assert_eq!(store.count_calls(|c| matches!(c, StoreCall::UploadChunk { .. })), 0);
    }

    #[tokio::test]
    async fn test_update_attrs_merges_blob() {
        let store = Arc::new(MemoryStore::new());
        let dst = remote(&store, "remote://", fast(4));
        let stored = NativeAttributes {
            mode: Some(0o644),
            uid: Some(7),
            gid: Some(8),
            atime: Some(1),
        };
        dst.resolver
            .create_file("remote://f", ModifiedTime::from_secs(1), Some(stored.encode()))
            .await
            .unwrap();

        let attrs = AttributeSet {
            mode: Some(0o600),
            mtime: Some(ModifiedTime::from_secs(99)),
            ..Default::default()
        };
        dst.update_attrs(Some("f"), &attrs).await.unwrap();

        let info = dst.get_info(Some("f")).await.unwrap().unwrap();
        let native = info.native.unwrap();
        assert_eq!(native.mode, Some(0o600));
        assert_eq!(native.uid, Some(7));
        assert_eq!(native.gid, Some(8));
        assert_eq!(info.modified_time.as_secs(), 99);
    }

    #[tokio::test]
    async fn test_checksum_only_when_requested() {
        let store = Arc::new(MemoryStore::new());
        let plain = remote(&store, "remote://", fast(4));
        plain
            .resolver
            .create_file("remote://empty", ModifiedTime::now(), None)
            .await
            .unwrap();
        let info = plain.get_info(Some("empty")).await.unwrap().unwrap();
        assert_eq!(info.checksum, None);

        let checking = remote(
            &store,
            "remote://",
            EndpointOptions {
                checksum: true,
                ..fast(4)
            },
        );
        let info = checking.get_info(Some("empty")).await.unwrap().unwrap();
        assert_eq!(info.checksum.as_deref(), Some(md5_hex(b"").as_str()));
        assert_eq!(checking.checksum(None).await.unwrap(), None);
    }
}
