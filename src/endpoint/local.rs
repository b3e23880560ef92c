use super::{Endpoint, EndpointOptions, SourceRef};
use crate::core::metadata::{
    AttributeSet, FileKind, FileMetadata, ModifiedTime, NativeAttributes,
};
use crate::core::transfer::{
    md5_of, ProgressCallback, TransferCounters, TransferHandle, TransferProgress,
};
use crate::error::{Result, SyncError};
use crate::path::{self, Location, SyncPath};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 本地文件系统端点
pub struct LocalEndpoint {
    root: SyncPath,
    options: EndpointOptions,
    counters: Arc<TransferCounters>,
}

impl LocalEndpoint {
    pub fn new(root: SyncPath, options: EndpointOptions) -> Self {
        Self {
            root,
            options,
            counters: Arc::new(TransferCounters::default()),
        }
    }

    fn resolve_path(&self, rel: Option<&str>) -> PathBuf {
        PathBuf::from(self.path_of(rel))
    }

    fn native_of(metadata: &std::fs::Metadata) -> Option<NativeAttributes> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Some(NativeAttributes {
                mode: Some(metadata.mode()),
                uid: Some(metadata.uid()),
                gid: Some(metadata.gid()),
                atime: Some(metadata.atime()),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = metadata;
            None
        }
    }

    /// 目标已存在但类型不同时先移除（目录只在为空时移除）
    async fn clear_conflicting(&self, full: &Path, kind: FileKind) -> Result<()> {
        match fs::metadata(full).await {
            Ok(existing) if existing.is_dir() && kind == FileKind::File => {
                debug!("移除同名空目录: {}", full.display());
                fs::remove_dir(full).await?;
            }
            Ok(existing) if !existing.is_dir() && kind == FileKind::Folder => {
                debug!("移除同名文件: {}", full.display());
                fs::remove_file(full).await?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn kind(&self) -> Location {
        Location::Local
    }

    fn path_of(&self, rel: Option<&str>) -> String {
        match rel {
            Some(rel) => self.root.join(rel),
            None => self.root.as_str().to_string(),
        }
    }

    async fn get_info(&self, rel: Option<&str>) -> Result<Option<FileMetadata>> {
        let full = self.resolve_path(rel);

        let metadata = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let kind = if metadata.is_dir() {
            FileKind::Folder
        } else {
            FileKind::File
        };
        let full_str = full.to_string_lossy().to_string();

        let mut info = FileMetadata {
            id: None,
            title: path::base_name(&full_str),
            path: full_str,
            modified_time: ModifiedTime::from_system_time(metadata.modified()?),
            kind,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            checksum: None,
            native: Self::native_of(&metadata),
        };

        if self.options.checksum && kind == FileKind::File {
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
        let full = self.resolve_path(rel);

        if self.options.dry_run {
            debug!("[dry-run] 创建: {}", full.display());
            return Ok(());
        }

        self.clear_conflicting(&full, source.meta.kind).await?;

        match source.meta.kind {
            FileKind::Folder => {
                fs::create_dir_all(&full).await?;
            }
            FileKind::File => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).await?;
                }
                // 占位文件
                fs::File::create(&full).await?;
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
        let full = self.resolve_path(rel);
        let shown = full.to_string_lossy().to_string();

        if self.options.dry_run {
            debug!("[dry-run] 写入: {}", shown);
            return Ok(0);
        }

        let handle = source.endpoint.uploader(source.rel).await?;
        let total = handle.size();
        let chunk_size = self.options.chunk_size.max(1);

        let (mut file, mut offset) = if self.options.append {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&full)
                .await?;
            let existing = file.metadata().await?.len();
            debug!("追加写入: {} (从 {} 字节开始)", shown, existing);
            (file, existing.min(total))
        } else {
            (fs::File::create(&full).await?, 0)
        };

        let mut written = 0u64;
        while offset < total {
            self.options.cancel.check()?;

            let chunk = handle.read_chunk(offset, chunk_size).await?;
            if chunk.is_empty() {
                warn!("源文件在传输中变短: {} ({}/{})", shown, offset, total);
                break;
            }

            file.write_all(&chunk).await?;
            let len = chunk.len() as u64;
            offset += len;
            written += len;
            self.counters.add_written(len);

            if let Some(callback) = progress {
                callback(&TransferProgress {
                    path: shown.clone(),
                    transferred: offset,
                    total,
                });
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        debug!("写入完成: {} ({} 字节)", shown, written);
        Ok(written)
    }

    async fn update_attrs(&self, rel: Option<&str>, attrs: &AttributeSet) -> Result<()> {
        let full = self.resolve_path(rel);

        if self.options.dry_run {
            debug!("[dry-run] 设置属性: {}", full.display());
            return Ok(());
        }

        let attrs = *attrs;
        tokio::task::spawn_blocking(move || apply_attrs(&full, &attrs))
            .await
            .map_err(|e| SyncError::transfer(self.path_of(rel), e))?
    }

    async fn uploader(&self, rel: Option<&str>) -> Result<Box<dyn TransferHandle>> {
        let full = self.resolve_path(rel);
        let file = fs::File::open(&full).await?;
        let size = file.metadata().await?.len();
        Ok(Box::new(LocalHandle {
            file: Mutex::new(file),
            size,
        }))
    }

    async fn checksum(&self, rel: Option<&str>) -> Result<Option<String>> {
        let full = self.resolve_path(rel);
        if fs::metadata(&full).await?.is_dir() {
            return Ok(None);
        }
        let file = fs::File::open(&full).await?;
        let size = file.metadata().await?.len();
        let handle = LocalHandle {
            file: Mutex::new(file),
            size,
        };
        Ok(Some(md5_of(&handle, &self.options.cancel).await?))
    }

    fn counters(&self) -> &TransferCounters {
        &self.counters
    }
}

/// 属主/属组/权限/时间，依次设置
fn apply_attrs(full: &Path, attrs: &AttributeSet) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if attrs.uid.is_some() || attrs.gid.is_some() {
            // 非特权用户无法修改属主，与 rsync 一致地忽略
            if let Err(e) = std::os::unix::fs::chown(full, attrs.uid, attrs.gid) {
                debug!("修改属主失败（忽略）: {}: {}", full.display(), e);
            }
        }

        if let Some(mode) = attrs.mode {
            std::fs::set_permissions(full, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    if let Some(mtime) = attrs.mtime {
        let atime = attrs.atime.unwrap_or(mtime);
        filetime::set_file_times(
            full,
            filetime::FileTime::from_system_time(atime.to_system_time()),
            filetime::FileTime::from_system_time(mtime.to_system_time()),
        )?;
    }

    Ok(())
}

/// 本地文件的分块读取句柄
struct LocalHandle {
    file: Mutex<fs::File>,
    size: u64,
}

#[async_trait]
impl TransferHandle for LocalHandle {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        // 读满 len 或到达文件末尾
        let mut buffer = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::md5_hex;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn endpoint(root: &Path, options: EndpointOptions) -> LocalEndpoint {
        LocalEndpoint::new(SyncPath::parse(root.to_str().unwrap()).unwrap(), options)
    }

    fn options(chunk_size: usize) -> EndpointOptions {
        EndpointOptions {
            chunk_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_info_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path(), options(16));
        assert!(ep.get_info(Some("nope")).await.unwrap().is_none());

        let root = ep.get_info(None).await.unwrap().unwrap();
        assert!(root.is_folder());
        assert_eq!(root.size, 0);
    }

    #[tokio::test]
    async fn test_create_copies_in_chunks_and_counts_bytes() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(src_dir.path().join("f.bin"), &data).unwrap();

        for chunk_size in [1usize, 7, 64, 1000, 4096] {
            let src = endpoint(src_dir.path(), options(chunk_size));
            let dst = endpoint(dst_dir.path(), options(chunk_size));
            let meta = src.get_info(Some("f.bin")).await.unwrap().unwrap();
            let source = SourceRef {
                endpoint: &src,
                rel: Some("f.bin"),
                meta: &meta,
                attrs: AttributeSet::times_only(meta.modified_time, None),
            };

            let calls = AtomicU64::new(0);
            let progress = |p: &TransferProgress| {
                calls.fetch_add(1, Ordering::Relaxed);
                assert!(p.transferred <= p.total);
            };

            let name = format!("out-{}.bin", chunk_size);
            dst.create(Some(&name), &source, Some(&progress)).await.unwrap();

            assert_eq!(dst.counters().bytes_written(), 1000);
            assert_eq!(
                calls.load(Ordering::Relaxed),
                1000u64.div_ceil(chunk_size as u64)
            );
            let copied = std::fs::read(dst_dir.path().join(&name)).unwrap();
            assert_eq!(copied, data);

            let info = dst.get_info(Some(&name)).await.unwrap().unwrap();
            assert_eq!(info.modified_time.as_secs(), meta.modified_time.as_secs());
        }
    }

    #[tokio::test]
    async fn test_append_writes_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.txt"), b"hello world").unwrap();
        std::fs::write(dir.path().join("dst.txt"), b"hello").unwrap();

        let ep = endpoint(
            dir.path(),
            EndpointOptions {
                append: true,
                chunk_size: 4,
                ..Default::default()
            },
        );
        let meta = ep.get_info(Some("src.txt")).await.unwrap().unwrap();
        let source = SourceRef {
            endpoint: &ep,
            rel: Some("src.txt"),
            meta: &meta,
            attrs: AttributeSet::default(),
        };

        let written = ep.update_data(Some("dst.txt"), &source, None).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(
            std::fs::read(dir.path().join("dst.txt")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.txt"), b"data").unwrap();

        let ep = endpoint(
            dir.path(),
            EndpointOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        let meta = ep.get_info(Some("src.txt")).await.unwrap().unwrap();
        let source = SourceRef {
            endpoint: &ep,
            rel: Some("src.txt"),
            meta: &meta,
            attrs: AttributeSet::default(),
        };
        ep.create(Some("out/copy.txt"), &source, None).await.unwrap();

        assert!(!dir.path().join("out").exists());
        assert_eq!(ep.counters().bytes_written(), 0);
    }

    #[tokio::test]
    async fn test_checksum_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"checksum me").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let ep = endpoint(
            dir.path(),
            EndpointOptions {
                checksum: true,
                ..Default::default()
            },
        );
        let info = ep.get_info(Some("a.txt")).await.unwrap().unwrap();
        assert_eq!(info.checksum.as_deref(), Some(md5_hex(b"checksum me").as_str()));
        assert_eq!(ep.checksum(Some("sub")).await.unwrap(), None);

        ep.options.cancel.cancel();
        let source = SourceRef {
            endpoint: &ep,
            rel: Some("a.txt"),
            meta: &info,
            attrs: AttributeSet::default(),
        };
        let err = ep
            .update_data(Some("b.txt"), &source, None)
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_update_attrs_sets_mode_and_times() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let ep = endpoint(dir.path(), EndpointOptions::default());

        let attrs = AttributeSet {
            mode: Some(0o100600),
            mtime: Some(ModifiedTime::from_secs(1_500_000_000)),
            ..Default::default()
        };
        ep.update_attrs(Some("a.txt"), &attrs).await.unwrap();

        let meta = std::fs::metadata(dir.path().join("a.txt")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
        let info = ep.get_info(Some("a.txt")).await.unwrap().unwrap();
        assert_eq!(info.modified_time.as_secs(), 1_500_000_000);
    }
}
