//! 基于 opendal 的远程存储（fs / s3 / webdav）
//!
//! 条目 id 即对象路径，目录以 `/` 结尾。对象存储无法直接设置修改时间和描述，
//! 这两项保存在 `.treesync-meta/` 下的旁路 JSON 中。

use super::{
    ChildPage, EntryPatch, NewEntry, RemoteEntry, RemoteStore, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
    ROOT_ID,
};
use crate::core::metadata::{FileKind, ModifiedTime};
use crate::core::transfer::{TransferStatus, UploadStatus};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator, Writer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 旁路元数据目录
const SIDECAR_DIR: &str = ".treesync-meta/";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    #[serde(default)]
    modified_time: Option<ModifiedTime>,
    #[serde(default)]
    description: Option<String>,
}

struct UploadSession {
    path: String,
    total_size: u64,
    received: u64,
    status: TransferStatus,
    writer: Option<Writer>,
}

pub struct OperatorStore {
    operator: Operator,
    name: String,
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl OperatorStore {
    fn with_timeout<B: opendal::Builder>(builder: B) -> Result<Operator> {
        Ok(Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish())
    }

    fn from_operator(operator: Operator, name: String) -> Self {
        Self {
            operator,
            name,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 以本地目录作为远程存储
    pub async fn fs(root: &str) -> Result<Self> {
        use opendal::services::Fs;

        let operator = Self::with_timeout(Fs::default().root(root))?;
        Ok(Self::from_operator(operator, format!("fs://{}", root)))
    }

    pub async fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        root: &str,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if !root.is_empty() {
            builder = builder.root(root);
        }

        let operator = Self::with_timeout(builder)?;
        let name = format!("s3://{}/{}", bucket, root.trim_start_matches('/'));
        Ok(Self::from_operator(operator, name))
    }

    pub async fn webdav(endpoint: &str, username: &str, password: &str, root: &str) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if !root.is_empty() {
            builder = builder.root(root);
        }

        let operator = Self::with_timeout(builder)?;

        // 某些 WebDAV 服务器需要先创建根目录，已存在时忽略错误
        let _ = operator.create_dir("/").await;

        let name = format!(
            "webdav://{}/{}",
            endpoint.trim_end_matches('/'),
            root.trim_start_matches('/')
        );
        Ok(Self::from_operator(operator, name))
    }

    /// id 对应的对象路径，根目录为空串
    fn object_path(id: &str) -> &str {
        if id == ROOT_ID {
            ""
        } else {
            id
        }
    }

    fn sidecar_path(path: &str) -> String {
        format!("{}{}.json", SIDECAR_DIR, path.trim_end_matches('/'))
    }

    fn parent_id_of(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => trimmed[..=idx].to_string(),
            None => ROOT_ID.to_string(),
        }
    }

    async fn read_sidecar(&self, path: &str) -> Sidecar {
        match self.operator.read(&Self::sidecar_path(path)).await {
            Ok(buf) => serde_json::from_slice(&buf.to_bytes()).unwrap_or_else(|e| {
                warn!("旁路元数据损坏: {}: {}", path, e);
                Sidecar::default()
            }),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Sidecar::default(),
            Err(e) => {
                warn!("读取旁路元数据失败: {}: {}", path, e);
                Sidecar::default()
            }
        }
    }

    async fn write_sidecar(&self, path: &str, sidecar: &Sidecar) -> Result<()> {
        let content = serde_json::to_vec(sidecar)?;
        self.operator
            .write(&Self::sidecar_path(path), content)
            .await?;
        Ok(())
    }

    async fn entry_from_meta(&self, path: &str, meta: &opendal::Metadata) -> RemoteEntry {
        let sidecar = self.read_sidecar(path).await;
        let kind = if meta.is_dir() {
            FileKind::Folder
        } else {
            FileKind::File
        };
        let modified_time = sidecar
            .modified_time
            .or_else(|| meta.last_modified().map(ModifiedTime::new))
            .unwrap_or_else(|| ModifiedTime::from_secs(0));

        RemoteEntry {
            id: path.to_string(),
            parent_id: Some(Self::parent_id_of(path)),
            name: path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            kind,
            modified_time,
            size: if kind == FileKind::Folder {
                0
            } else {
                meta.content_length()
            },
            checksum: meta
                .content_md5()
                .map(str::to_lowercase)
                .filter(|_| kind == FileKind::File),
            description: sidecar.description,
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>> {
        match self.operator.stat(path).await {
            Ok(meta) => Ok(Some(self.entry_from_meta(path, &meta).await)),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RemoteStore for OperatorStore {
    async fn list_children(&self, parent_id: &str, _page_token: Option<&str>) -> Result<ChildPage> {
        let dir = Self::object_path(parent_id);
        let list_path = if dir.is_empty() { "/" } else { dir };

        let mut lister = self
            .operator
            .lister_with(list_path)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?;

        let mut entries = Vec::new();
        while let Some(entry) = lister.try_next().await? {
            let path = entry.path().trim_start_matches('/').to_string();

            // 跳过目录自身和旁路元数据
            if path.is_empty() || path == dir || path.starts_with(SIDECAR_DIR) {
                continue;
            }

            entries.push(self.entry_from_meta(&path, entry.metadata()).await);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        // opendal 的 lister 已在内部翻页
        Ok(ChildPage {
            entries,
            next_page_token: None,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<RemoteEntry>> {
        if id == ROOT_ID {
            return Ok(Some(RemoteEntry::root()));
        }
        self.stat(id).await
    }

    async fn create(&self, new: NewEntry, data: Option<Bytes>) -> Result<RemoteEntry> {
        let parent = Self::object_path(&new.parent_id);
        if !parent.is_empty() && !parent.ends_with('/') {
            bail!("父条目不是目录: {}", parent);
        }

        let path = match new.kind {
            FileKind::Folder => format!("{}{}/", parent, new.name),
            FileKind::File => format!("{}{}", parent, new.name),
        };

        match new.kind {
            FileKind::Folder => self.operator.create_dir(&path).await?,
            FileKind::File => {
                self.operator
                    .write(&path, data.unwrap_or_default())
                    .await?;
            }
        }

        self.write_sidecar(
            &path,
            &Sidecar {
                modified_time: Some(new.modified_time),
                description: new.description,
            },
        )
        .await?;

        self.stat(&path)
            .await?
            .ok_or_else(|| anyhow!("创建后找不到条目: {}", path))
    }

    async fn update(&self, id: &str, patch: EntryPatch) -> Result<RemoteEntry> {
        let path = Self::object_path(id);
        let mut sidecar = self.read_sidecar(path).await;
        if let Some(mtime) = patch.modified_time {
            sidecar.modified_time = Some(mtime);
        }
        if let Some(description) = patch.description {
            sidecar.description = Some(description);
        }
        self.write_sidecar(path, &sidecar).await?;

        self.stat(path)
            .await?
            .ok_or_else(|| anyhow!("条目不存在: {}", path))
    }

    async fn delete(&self, id: &str, skip_trash: bool) -> Result<()> {
        if !skip_trash {
            debug!("存储没有回收站，直接删除: {}", id);
        }
        let path = Self::object_path(id);
        if path.ends_with('/') {
            self.operator.remove_all(path).await?;
            self.operator
                .remove_all(&format!("{}{}", SIDECAR_DIR, path))
                .await?;
        } else {
            match self.operator.delete(path).await {
                Ok(_) => {}
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let _ = self.operator.delete(&Self::sidecar_path(path)).await;
        Ok(())
    }

    async fn read_range(&self, id: &str, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let data = self
            .operator
            .read_with(Self::object_path(id))
            .range(offset..offset + length)
            .await?;
        Ok(data.to_bytes())
    }

    async fn begin_upload(&self, id: &str, total_size: u64) -> Result<String> {
        let path = Self::object_path(id).to_string();
        if path.is_empty() || path.ends_with('/') {
            bail!("不能向目录上传: {}", id);
        }

        let session = uuid::Uuid::new_v4().to_string();
        if total_size == 0 {
            // 空文件直接写入，不需要会话
            self.operator.write(&path, Vec::<u8>::new()).await?;
            return Ok(session);
        }

        let writer = self.operator.writer(&path).await?;
        self.sessions.lock().await.insert(
            session.clone(),
            UploadSession {
                path,
                total_size,
                received: 0,
                status: TransferStatus::InProgress,
                writer: Some(writer),
            },
        );
        Ok(session)
    }

    async fn upload_chunk(&self, session: &str, offset: u64, data: Bytes) -> Result<UploadStatus> {
        let mut sessions = self.sessions.lock().await;
        let sess = sessions
            .get_mut(session)
            .ok_or_else(|| anyhow!("上传会话不存在: {}", session))?;

        if sess.status != TransferStatus::InProgress {
            bail!("上传会话已结束: {} ({})", session, sess.status);
        }
        if offset != sess.received {
            bail!("分块偏移不匹配: 期望 {}, 实际 {}", sess.received, offset);
        }

        let writer = sess
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("上传会话没有写入器: {}", session))?;
        let len = data.len() as u64;
        if let Err(e) = writer.write(data).await {
            // opendal 的写入器失败后不能继续使用
            sess.status = TransferStatus::Failed;
            sess.writer = None;
            return Err(e.into());
        }
        sess.received += len;

        if sess.received >= sess.total_size {
            if let Some(mut writer) = sess.writer.take() {
                if let Err(e) = writer.close().await {
                    sess.status = TransferStatus::Failed;
                    return Err(e.into());
                }
            }
            let status = UploadStatus {
                session: session.to_string(),
                total_size: sess.total_size,
                received: sess.received,
                status: TransferStatus::Completed,
            };
            // 完成的会话不再需要
            sessions.remove(session);
            return Ok(status);
        }

        Ok(UploadStatus {
            session: session.to_string(),
            total_size: sess.total_size,
            received: sess.received,
            status: sess.status,
        })
    }

    async fn upload_status(&self, session: &str) -> Result<UploadStatus> {
        let sessions = self.sessions.lock().await;
        let sess = sessions
            .get(session)
            .ok_or_else(|| anyhow!("上传会话不存在: {}", session))?;
        Ok(UploadStatus {
            session: session.to_string(),
            total_size: sess.total_size,
            received: sess.received,
            status: sess.status,
        })
    }

    async fn cancel_upload(&self, session: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(mut sess) = sessions.remove(session) {
            if let Some(mut writer) = sess.writer.take() {
                if let Err(e) = writer.abort().await {
                    warn!("放弃上传失败: {}: {}", sess.path, e);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(parent_id: &str, name: &str, kind: FileKind) -> NewEntry {
        NewEntry {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            kind,
            modified_time: ModifiedTime::from_secs(1_600_000_000),
            description: Some("attrs".to_string()),
        }
    }

    #[tokio::test]
    async fn test_fs_store_keeps_times_in_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperatorStore::fs(dir.path().to_str().unwrap()).await.unwrap();

        let folder = store
            .create(new_entry(ROOT_ID, "docs", FileKind::Folder), None)
            .await
            .unwrap();
        assert_eq!(folder.id, "docs/");
        assert!(folder.is_folder());

        let file = store
            .create(
                new_entry(&folder.id, "a.txt", FileKind::File),
                Some(Bytes::from_static(b"hello")),
            )
            .await
            .unwrap();
        assert_eq!(file.id, "docs/a.txt");
        assert_eq!(file.parent_id.as_deref(), Some("docs/"));
        assert_eq!(file.size, 5);
        assert_eq!(file.modified_time, ModifiedTime::from_secs(1_600_000_000));
        assert_eq!(file.description.as_deref(), Some("attrs"));

        let root = store.list_children(ROOT_ID, None).await.unwrap();
        let names: Vec<_> = root.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["docs"]);

        let children = store.list_children(&folder.id, None).await.unwrap();
        assert_eq!(children.entries.len(), 1);
        assert_eq!(children.entries[0].name, "a.txt");
    }

    #[tokio::test]
    async fn test_fs_store_upload_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperatorStore::fs(dir.path().to_str().unwrap()).await.unwrap();
        let file = store
            .create(new_entry(ROOT_ID, "f.bin", FileKind::File), None)
            .await
            .unwrap();

        let session = store.begin_upload(&file.id, 6).await.unwrap();
        store
            .upload_chunk(&session, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert!(store
            .upload_chunk(&session, 0, Bytes::from_static(b"abc"))
            .await
            .is_err());
        let status = store
            .upload_chunk(&session, 3, Bytes::from_static(b"def"))
            .await
            .unwrap();
        assert_eq!(status.status, TransferStatus::Completed);
        // 完成后会话被移除
        assert!(store.upload_status(&session).await.is_err());

        let data = store.read_range(&file.id, 2, 3).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"cde"));

        store.delete(&file.id, true).await.unwrap();
        assert!(store.get(&file.id).await.unwrap().is_none());
    }
}
