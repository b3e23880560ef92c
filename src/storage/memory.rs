//! 进程内远程存储
//!
//! 记录每一次调用，便于断言缓存效果；可以注入分块上传失败。

use super::{ChildPage, EntryPatch, NewEntry, RemoteEntry, RemoteStore, ROOT_ID};
use crate::core::metadata::{FileKind, ModifiedTime};
use crate::core::transfer::{md5_hex, TransferStatus, UploadStatus};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

/// 默认每页条目数
const DEFAULT_PAGE_SIZE: usize = 100;

/// 一次存储调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    List {
        parent_id: String,
        page_token: Option<String>,
    },
    Get(String),
    Create {
        parent_id: String,
        name: String,
        kind: FileKind,
    },
    Update(String),
    Delete(String),
    ReadRange {
        id: String,
        offset: u64,
        length: u64,
    },
    BeginUpload(String),
    UploadChunk {
        session: String,
        offset: u64,
        length: u64,
    },
    UploadStatus(String),
    CancelUpload(String),
}

impl StoreCall {
    pub fn is_list(&self) -> bool {
        matches!(self, StoreCall::List { .. })
    }

    pub fn is_create(&self) -> bool {
        matches!(self, StoreCall::Create { .. })
    }
}

struct StoredEntry {
    entry: RemoteEntry,
    data: Bytes,
}

struct Session {
    id: String,
    total_size: u64,
    buffer: Vec<u8>,
    status: TransferStatus,
}

impl Session {
    fn status(&self, session: &str) -> UploadStatus {
        UploadStatus {
            session: session.to_string(),
            total_size: self.total_size,
            received: self.buffer.len() as u64,
            status: self.status,
        }
    }
}

/// 注入的分块失败
#[derive(Debug, Clone, Copy, Default)]
struct ChunkFailure {
    remaining: u32,
    /// 失败前仍然接收的字节数
    accept_bytes: usize,
    /// 失败后会话不能继续
    end_session: bool,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, StoredEntry>,
    sessions: HashMap<String, Session>,
    calls: Vec<StoreCall>,
    chunk_failure: ChunkFailure,
    status_failures: u32,
}

pub struct MemoryStore {
    state: Mutex<State>,
    page_size: usize,
    name: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: page_size.max(1),
            name: "memory://".to_string(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| anyhow!("内存存储锁已损坏"))
    }

    /// 已记录的调用
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    /// 统计满足条件的调用次数
    pub fn count_calls(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// 让接下来 `count` 次分块上传失败，每次失败前只接收 `accept_bytes` 字节
    pub fn fail_next_chunks(&self, count: u32, accept_bytes: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.chunk_failure = ChunkFailure {
                remaining: count,
                accept_bytes,
                end_session: false,
            };
        }
    }

    /// 让下一次分块上传失败并使会话失效，之后只能重新开始上传
    pub fn fail_next_session(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.chunk_failure = ChunkFailure {
                remaining: 1,
                accept_bytes: 0,
                end_session: true,
            };
        }
    }

    /// 让接下来 `count` 次会话状态查询失败
    pub fn fail_next_status(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.status_failures = count;
        }
    }

    /// 文件内容
    pub fn content(&self, id: &str) -> Option<Bytes> {
        let state = self.state.lock().ok()?;
        state.entries.get(id).map(|e| e.data.clone())
    }

    /// 进行中的会话数
    pub fn open_sessions(&self) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.sessions
                    .values()
                    .filter(|s| s.status == TransferStatus::InProgress)
                    .count()
            })
            .unwrap_or(0)
    }

    fn children_of(state: &State, parent_id: &str) -> Vec<RemoteEntry> {
        let mut children: Vec<RemoteEntry> = state
            .entries
            .values()
            .filter(|e| e.entry.parent_id.as_deref() == Some(parent_id))
            .map(|e| e.entry.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    fn parent_exists(state: &State, parent_id: &str) -> bool {
        parent_id == ROOT_ID
            || state
                .entries
                .get(parent_id)
                .is_some_and(|e| e.entry.is_folder())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_children(&self, parent_id: &str, page_token: Option<&str>) -> Result<ChildPage> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::List {
            parent_id: parent_id.to_string(),
            page_token: page_token.map(str::to_string),
        });

        if !Self::parent_exists(&state, parent_id) {
            bail!("目录不存在: {}", parent_id);
        }

        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| anyhow!("无效的分页令牌: {}", token))?,
            None => 0,
        };

        let children = Self::children_of(&state, parent_id);
        let end = (start + self.page_size).min(children.len());
        let entries = children.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < children.len()).then(|| end.to_string());

        Ok(ChildPage {
            entries,
            next_page_token,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<RemoteEntry>> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::Get(id.to_string()));
        if id == ROOT_ID {
            return Ok(Some(RemoteEntry::root()));
        }
        Ok(state.entries.get(id).map(|e| e.entry.clone()))
    }

    async fn create(&self, new: NewEntry, data: Option<Bytes>) -> Result<RemoteEntry> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::Create {
            parent_id: new.parent_id.clone(),
            name: new.name.clone(),
            kind: new.kind,
        });

        if !Self::parent_exists(&state, &new.parent_id) {
            bail!("父目录不存在: {}", new.parent_id);
        }

        let data = match new.kind {
            FileKind::Folder => Bytes::new(),
            FileKind::File => data.unwrap_or_default(),
        };

        let entry = RemoteEntry {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: Some(new.parent_id),
            name: new.name,
            kind: new.kind,
            modified_time: new.modified_time,
            size: data.len() as u64,
            checksum: (new.kind == FileKind::File).then(|| md5_hex(&data)),
            description: new.description,
        };

        state.entries.insert(
            entry.id.clone(),
            StoredEntry {
                entry: entry.clone(),
                data,
            },
        );
        Ok(entry)
    }

    async fn update(&self, id: &str, patch: EntryPatch) -> Result<RemoteEntry> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::Update(id.to_string()));

        let stored = state
            .entries
            .get_mut(id)
            .ok_or_else(|| anyhow!("条目不存在: {}", id))?;
        if let Some(mtime) = patch.modified_time {
            stored.entry.modified_time = mtime;
        }
        if let Some(description) = patch.description {
            stored.entry.description = Some(description);
        }
        Ok(stored.entry.clone())
    }

    async fn delete(&self, id: &str, _skip_trash: bool) -> Result<()> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::Delete(id.to_string()));

        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            if state.entries.remove(&current).is_some() {
                pending.extend(
                    state
                        .entries
                        .values()
                        .filter(|e| e.entry.parent_id.as_deref() == Some(current.as_str()))
                        .map(|e| e.entry.id.clone()),
                );
            }
        }
        Ok(())
    }

    async fn read_range(&self, id: &str, offset: u64, length: u64) -> Result<Bytes> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::ReadRange {
            id: id.to_string(),
            offset,
            length,
        });

        let stored = state
            .entries
            .get(id)
            .ok_or_else(|| anyhow!("条目不存在: {}", id))?;
        let len = stored.data.len();
        let start = (offset as usize).min(len);
        let end = start.saturating_add(length as usize).min(len);
        Ok(stored.data.slice(start..end))
    }

    async fn begin_upload(&self, id: &str, total_size: u64) -> Result<String> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.calls.push(StoreCall::BeginUpload(id.to_string()));

        match state.entries.get_mut(id) {
            Some(stored) if !stored.entry.is_folder() => {
                let session = uuid::Uuid::new_v4().to_string();
                let mut status = TransferStatus::InProgress;
                if total_size == 0 {
                    stored.data = Bytes::new();
                    stored.entry.size = 0;
                    stored.entry.checksum = Some(md5_hex(b""));
                    stored.entry.modified_time = ModifiedTime::now();
                    status = TransferStatus::Completed;
                }
                state.sessions.insert(
                    session.clone(),
                    Session {
                        id: id.to_string(),
                        total_size,
                        buffer: Vec::new(),
                        status,
                    },
                );
                Ok(session)
            }
            Some(_) => bail!("不能向目录上传: {}", id),
            None => bail!("条目不存在: {}", id),
        }
    }

    async fn upload_chunk(&self, session: &str, offset: u64, data: Bytes) -> Result<UploadStatus> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.calls.push(StoreCall::UploadChunk {
            session: session.to_string(),
            offset,
            length: data.len() as u64,
        });

        let sess = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| anyhow!("上传会话不存在: {}", session))?;
        if sess.status != TransferStatus::InProgress {
            bail!("上传会话已结束: {} ({})", session, sess.status);
        }
        if offset != sess.buffer.len() as u64 {
            bail!(
                "分块偏移不匹配: 期望 {}, 实际 {}",
                sess.buffer.len(),
                offset
            );
        }

        if state.chunk_failure.remaining > 0 {
            state.chunk_failure.remaining -= 1;
            if state.chunk_failure.end_session {
                sess.status = TransferStatus::Failed;
                sess.buffer.clear();
                bail!("注入的分块失败，会话已失效");
            }
            let accepted = state.chunk_failure.accept_bytes.min(data.len());
            sess.buffer.extend_from_slice(&data[..accepted]);
            bail!("注入的分块失败 (已接收 {} 字节)", accepted);
        }

        let room = (sess.total_size as usize).saturating_sub(sess.buffer.len());
        if data.len() > room {
            bail!("分块超出声明的总大小: {}", session);
        }
        sess.buffer.extend_from_slice(&data);

        if sess.buffer.len() as u64 == sess.total_size {
            sess.status = TransferStatus::Completed;
            let content = Bytes::from(std::mem::take(&mut sess.buffer));
            let received = content.len() as u64;
            let target = sess.id.clone();
            let status = UploadStatus {
                session: session.to_string(),
                total_size: sess.total_size,
                received,
                status: TransferStatus::Completed,
            };

            let stored = state
                .entries
                .get_mut(&target)
                .ok_or_else(|| anyhow!("上传目标已被删除: {}", target))?;
            stored.entry.size = received;
            stored.entry.checksum = Some(md5_hex(&content));
            stored.entry.modified_time = ModifiedTime::now();
            stored.data = content;
            return Ok(status);
        }

        Ok(sess.status(session))
    }

    async fn upload_status(&self, session: &str) -> Result<UploadStatus> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::UploadStatus(session.to_string()));
        if state.status_failures > 0 {
            state.status_failures -= 1;
            bail!("注入的状态查询失败: {}", session);
        }
        state
            .sessions
            .get(session)
            .map(|s| s.status(session))
            .ok_or_else(|| anyhow!("上传会话不存在: {}", session))
    }

    async fn cancel_upload(&self, session: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.calls.push(StoreCall::CancelUpload(session.to_string()));
        if let Some(sess) = state.sessions.get_mut(session) {
            sess.status = TransferStatus::Cancelled;
            sess.buffer.clear();
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
            modified_time: ModifiedTime::from_secs(1000),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_paginated_listing() {
        let store = MemoryStore::with_page_size(2);
        for name in ["c", "a", "b"] {
            store
                .create(new_entry(ROOT_ID, name, FileKind::File), None)
                .await
                .unwrap();
        }

        let first = store.list_children(ROOT_ID, None).await.unwrap();
        let names: Vec<_> = first.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        let token = first.next_page_token.unwrap();
        let second = store.list_children(ROOT_ID, Some(&token)).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].name, "c");
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_upload_with_partial_failure() {
        let store = MemoryStore::new();
        let file = store
            .create(new_entry(ROOT_ID, "f", FileKind::File), None)
            .await
            .unwrap();

        let session = store.begin_upload(&file.id, 6).await.unwrap();
        store.fail_next_chunks(1, 2);
        assert!(store
            .upload_chunk(&session, 0, Bytes::from_static(b"abcd"))
            .await
            .is_err());

        let status = store.upload_status(&session).await.unwrap();
        assert_eq!(status.received, 2);

        // 旧偏移被拒绝
        assert!(store
            .upload_chunk(&session, 0, Bytes::from_static(b"abcd"))
            .await
            .is_err());

        let status = store
            .upload_chunk(&session, 2, Bytes::from_static(b"cdef"))
            .await
            .unwrap();
        assert_eq!(status.status, TransferStatus::Completed);
        assert_eq!(store.content(&file.id).unwrap(), Bytes::from_static(b"abcdef"));

        let stored = store.get(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.size, 6);
        assert_eq!(stored.checksum.as_deref(), Some(md5_hex(b"abcdef").as_str()));
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let store = MemoryStore::new();
        let dir = store
            .create(new_entry(ROOT_ID, "d", FileKind::Folder), None)
            .await
            .unwrap();
        let child = store
            .create(
                new_entry(&dir.id, "x", FileKind::File),
                Some(Bytes::from_static(b"x")),
            )
            .await
            .unwrap();

        store.delete(&dir.id, true).await.unwrap();
        assert!(store.get(&child.id).await.unwrap().is_none());
        assert!(store
            .create(new_entry(&dir.id, "y", FileKind::File), None)
            .await
            .is_err());
    }
}
