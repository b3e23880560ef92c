//! 远程路径解析
//!
//! 把层级路径逐段翻译成远程条目：每个父目录最多列举一次，结果写入 [`PathCache`]，
//! 兄弟条目的后续查询不再访问存储。

use crate::core::cache::PathCache;
use crate::core::metadata::{FileKind, ModifiedTime};
use crate::error::{Result, SyncError};
use crate::path;
use crate::storage::{NewEntry, RemoteEntry, RemoteStore};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

/// 名称比较前统一为 NFC
fn nfc(name: &str) -> String {
    name.nfc().collect()
}

/// 缓存键：存储内绝对路径，各段为 NFC
fn cache_key(raw: &str) -> String {
    let components = path::path_components(raw);
    if components.len() == 1 {
        return "/".to_string();
    }
    // 第一项是根标记
    components
        .iter()
        .skip(1)
        .fold(String::new(), |mut acc, part| {
            acc.push('/');
            acc.push_str(&nfc(part));
            acc
        })
}

pub struct Resolver {
    store: Arc<dyn RemoteStore>,
    cache: PathCache,
}

impl Resolver {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            cache: PathCache::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn cache(&self) -> &PathCache {
        &self.cache
    }

    /// 解析路径，不存在时返回 `None`
    pub async fn resolve(&self, raw: &str) -> Result<Option<RemoteEntry>> {
        let key = cache_key(raw);
        if key == "/" {
            return Ok(Some(RemoteEntry::root()));
        }
        if let Some(entry) = self.cache.get(&key) {
            return Ok(Some(entry));
        }

        let mut current = RemoteEntry::root();
        let mut sub = String::new();

        for name in key.split('/').filter(|s| !s.is_empty()) {
            let parent_key = if sub.is_empty() { "/".to_string() } else { sub.clone() };
            sub.push('/');
            sub.push_str(name);

            if let Some(entry) = self.cache.get(&sub) {
                current = entry;
                continue;
            }

            if !current.is_folder() {
                debug!("路径经过文件: {} ({})", parent_key, raw);
                return Ok(None);
            }

            let children = self.children_of(&current, &parent_key).await?;
            match children.into_iter().find(|c| nfc(&c.name) == name) {
                Some(entry) => current = entry,
                None => {
                    debug!("远程条目不存在: {}", raw);
                    return Ok(None);
                }
            }
        }

        Ok(Some(current))
    }

    /// 列出父目录的全部子条目（翻页直到结束），并把每个子路径写入缓存
    async fn children_of(&self, parent: &RemoteEntry, parent_key: &str) -> Result<Vec<RemoteEntry>> {
        if let Some(children) = self.cache.children(&parent.id) {
            return Ok(children);
        }

        let lock = self.cache.listing_lock(&parent.id);
        let _guard = lock.lock().await;

        // 等锁期间可能已被其他任务列举
        if let Some(children) = self.cache.children(&parent.id) {
            return Ok(children);
        }

        let mut children = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .store
                .list_children(&parent.id, token.as_deref())
                .await?;
            children.extend(page.entries);
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!("列举远程目录: {} ({} 项)", parent_key, children.len());

        // 同名条目以先出现的为准
        let mut seen = HashSet::new();
        for child in &children {
            let key = path::join(parent_key, &nfc(&child.name));
            if seen.insert(key.clone()) {
                self.cache.insert(&key, child.clone());
            }
        }
        self.cache.set_children(&parent.id, children.clone());

        Ok(children)
    }

    /// 目录的子条目；路径不存在或不是目录时返回 `None`
    pub async fn list(&self, raw: &str) -> Result<Option<Vec<RemoteEntry>>> {
        let Some(entry) = self.resolve(raw).await? else {
            return Ok(None);
        };
        if !entry.is_folder() {
            return Ok(None);
        }
        let key = cache_key(raw);
        let mut children = self.children_of(&entry, &key).await?;
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(children))
    }

    /// 创建目录及缺失的祖先，已存在时直接返回
    pub fn mkdir<'a>(&'a self, raw: &'a str) -> BoxFuture<'a, Result<RemoteEntry>> {
        Box::pin(async move {
            let key = cache_key(raw);

            if let Some(existing) = self.resolve(&key).await? {
                if existing.is_folder() {
                    return Ok(existing);
                }
                return Err(SyncError::InvalidPath(format!("{}: 已存在同名文件", raw)));
            }

            let parent_key = path::parent(&key).unwrap_or_else(|| "/".to_string());
            let parent = self.mkdir(&parent_key).await?;

            info!("创建远程目录: {}", key);
            let created = self
                .store
                .create(
                    NewEntry {
                        parent_id: parent.id.clone(),
                        name: path::base_name(&key),
                        kind: FileKind::Folder,
                        modified_time: ModifiedTime::now(),
                        description: None,
                    },
                    None,
                )
                .await?;

            self.cache.insert(&key, created.clone());
            self.cache.insert_child(&parent.id, created.clone());
            // 新目录没有子条目
            self.cache.set_children(&created.id, Vec::new());
            Ok(created)
        })
    }

    /// 在（必要时创建的）父目录下创建空文件
    pub async fn create_file(
        &self,
        raw: &str,
        modified_time: ModifiedTime,
        description: Option<String>,
    ) -> Result<RemoteEntry> {
        let key = cache_key(raw);
        let parent_key = path::parent(&key)
            .ok_or_else(|| SyncError::InvalidPath(format!("{}: 不能在根上创建文件", raw)))?;
        let parent = self.mkdir(&parent_key).await?;

        debug!("创建远程文件: {}", key);
        let created = self
            .store
            .create(
                NewEntry {
                    parent_id: parent.id.clone(),
                    name: path::base_name(&key),
                    kind: FileKind::File,
                    modified_time,
                    description,
                },
                None,
            )
            .await?;

        self.cache.insert(&key, created.clone());
        self.cache.insert_child(&parent.id, created.clone());
        Ok(created)
    }

    /// 更新后替换缓存中的记录
    pub fn refresh(&self, raw: &str, entry: RemoteEntry) {
        if let Some(parent_id) = entry.parent_id.clone() {
            self.cache.insert_child(&parent_id, entry.clone());
        }
        self.cache.insert(&cache_key(raw), entry);
    }

    /// 删除条目并使其子树缓存失效；不存在时返回 false
    pub async fn delete(&self, raw: &str, skip_trash: bool) -> Result<bool> {
        let Some(entry) = self.resolve(raw).await? else {
            return Ok(false);
        };
        if entry.parent_id.is_none() {
            return Err(SyncError::InvalidPath(format!("{}: 不能删除根目录", raw)));
        }

        info!("删除远程条目: {}", raw);
        self.store.delete(&entry.id, skip_trash).await?;
        self.invalidate(raw);
        if let Some(parent_id) = &entry.parent_id {
            self.cache.remove_child(parent_id, &entry.id);
        }
        Ok(true)
    }

    pub fn invalidate(&self, raw: &str) {
        self.cache.remove(&cache_key(raw));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreCall, ROOT_ID};

    fn setup(page_size: usize) -> (Arc<MemoryStore>, Resolver) {
        let store = Arc::new(MemoryStore::with_page_size(page_size));
        let resolver = Resolver::new(store.clone());
        (store, resolver)
    }

    fn lists_of(store: &MemoryStore, parent: &str) -> usize {
        store.count_calls(|c| matches!(c, StoreCall::List { parent_id, .. } if parent_id == parent))
    }

    #[tokio::test]
    async fn test_root_needs_no_store_call() {
        let (store, resolver) = setup(10);
        for raw in ["remote://", "remote:", "remote:/"] {
            let root = resolver.resolve(raw).await.unwrap().unwrap();
            assert_eq!(root.id, ROOT_ID);
        }
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_siblings_list_parent_once() {
        let (store, writer) = setup(2);
        for name in ["x", "y", "z", "w", "v"] {
            writer
                .create_file(&format!("remote://a/{}", name), ModifiedTime::now(), None)
                .await
                .unwrap();
        }
        let a = writer.resolve("remote://a").await.unwrap().unwrap();

        // 新的解析器，缓存为空
        let resolver = Resolver::new(store.clone());
        store.clear_calls();

        for name in ["x", "y", "z", "w", "v", "missing"] {
            resolver.resolve(&format!("remote://a/{}", name)).await.unwrap();
        }

        assert_eq!(lists_of(&store, ROOT_ID), 1);
        // 5 个子条目，每页 2 个：一次列举需要 3 页
        assert_eq!(lists_of(&store, &a.id), 3);
        assert_eq!(
            store.count_calls(|c| matches!(c, StoreCall::List { page_token: None, .. })),
            2
        );
    }

    #[tokio::test]
    async fn test_concurrent_misses_are_single_flighted() {
        let (store, writer) = setup(10);
        writer
            .create_file("remote://p", ModifiedTime::now(), None)
            .await
            .unwrap();
        writer
            .create_file("remote://q", ModifiedTime::now(), None)
            .await
            .unwrap();

        let resolver = Resolver::new(store.clone());
        store.clear_calls();

        let (p, q) = tokio::join!(resolver.resolve("remote://p"), resolver.resolve("remote://q"));
        assert!(p.unwrap().is_some());
        assert!(q.unwrap().is_some());
        assert_eq!(lists_of(&store, ROOT_ID), 1);
    }

    #[tokio::test]
    async fn test_mkdir_creates_ancestors_in_order() {
        let (store, resolver) = setup(10);
        let c = resolver.mkdir("remote://a/b/c").await.unwrap();
        assert!(c.is_folder());

        let created: Vec<String> = store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::Create { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(created, ["a", "b", "c"]);

        store.clear_calls();
        let b = resolver.resolve("remote://a/b").await.unwrap().unwrap();
        assert_eq!(b.name, "b");
        assert_eq!(c.parent_id.as_deref(), Some(b.id.as_str()));
        assert!(store.calls().is_empty());

        // 已存在时不再创建
        resolver.mkdir("remote://a/b").await.unwrap();
        assert_eq!(store.count_calls(StoreCall::is_create), 0);
    }

    #[tokio::test]
    async fn test_mkdir_over_file_fails() {
        let (_store, resolver) = setup(10);
        resolver
            .create_file("remote://a/f", ModifiedTime::now(), None)
            .await
            .unwrap();
        let err = resolver.mkdir("remote://a/f").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath(_)));
        assert!(resolver.resolve("remote://a/f/g").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_names_compare_after_nfc() {
        let (store, resolver) = setup(10);
        // 存储中是分解形式
        store
            .create(
                NewEntry {
                    parent_id: ROOT_ID.to_string(),
                    name: "Cafe\u{301}".to_string(),
                    kind: FileKind::File,
                    modified_time: ModifiedTime::now(),
                    description: None,
                },
                None,
            )
            .await
            .unwrap();

        let found = resolver.resolve("remote://Caf\u{e9}").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_delete_invalidates_subtree() {
        let (store, resolver) = setup(10);
        resolver.mkdir("remote://a/b").await.unwrap();
        resolver
            .create_file("remote://a/b/f", ModifiedTime::now(), None)
            .await
            .unwrap();

        assert!(resolver.delete("remote://a", true).await.unwrap());
        assert!(!resolver.cache().contains("/a/b/f"));
        assert!(resolver.resolve("remote://a/b/f").await.unwrap().is_none());
        assert!(resolver.list("remote://").await.unwrap().unwrap().is_empty());
        assert!(!resolver.delete("remote://a", true).await.unwrap());
        assert_eq!(store.count_calls(|c| matches!(c, StoreCall::Delete(_))), 1);
    }

    #[tokio::test]
    async fn test_list_sorted_children() {
        let (_store, resolver) = setup(1);
        for name in ["b", "a", "c"] {
            resolver
                .create_file(&format!("remote://d/{}", name), ModifiedTime::now(), None)
                .await
                .unwrap();
        }
        let names: Vec<String> = resolver
            .list("remote://d")
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(resolver.list("remote://d/a").await.unwrap().is_none());
        assert!(resolver.list("remote://nope").await.unwrap().is_none());
    }
}
