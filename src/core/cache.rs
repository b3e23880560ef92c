//! 远程路径缓存
//!
//! 记录 路径 -> 条目 以及 父 id -> 子条目列表，生命周期为一次同步。

use crate::storage::RemoteEntry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// 缓存命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub paths: usize,
    pub listings: usize,
}

#[derive(Default)]
pub struct PathCache {
    /// 规范化后的存储内绝对路径（`/a/b`）-> 条目
    paths: RwLock<HashMap<String, RemoteEntry>>,
    /// 父 id -> 完整的子条目列表
    children: RwLock<HashMap<String, Vec<RemoteEntry>>>,
    /// 每个父 id 一把锁，同一目录的并发列举只发一次请求
    listing_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<RemoteEntry> {
        let found = read(&self.paths).get(path).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn contains(&self, path: &str) -> bool {
        read(&self.paths).contains_key(path)
    }

    pub fn insert(&self, path: &str, entry: RemoteEntry) {
        write(&self.paths).insert(path.to_string(), entry);
    }

    /// 删除路径及其下所有缓存记录
    pub fn remove(&self, path: &str) {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };

        let removed: Vec<RemoteEntry> = {
            let mut paths = write(&self.paths);
            let keys: Vec<String> = paths
                .keys()
                .filter(|k| k.as_str() == path || k.starts_with(&prefix))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| paths.remove(k)).collect()
        };

        if removed.is_empty() {
            return;
        }
        debug!("缓存失效: {} ({} 条)", path, removed.len());

        let mut children = write(&self.children);
        for entry in &removed {
            children.remove(&entry.id);
            if let Some(listing) = entry.parent_id.as_ref().and_then(|p| children.get_mut(p)) {
                listing.retain(|c| c.id != entry.id);
            }
        }
    }

    /// 已缓存的子条目列表
    pub fn children(&self, parent_id: &str) -> Option<Vec<RemoteEntry>> {
        read(&self.children).get(parent_id).cloned()
    }

    pub fn set_children(&self, parent_id: &str, entries: Vec<RemoteEntry>) {
        write(&self.children).insert(parent_id.to_string(), entries);
    }

    /// 在已缓存的列表中加入或替换一个子条目；列表未缓存时不做任何事
    pub fn insert_child(&self, parent_id: &str, entry: RemoteEntry) {
        if let Some(listing) = write(&self.children).get_mut(parent_id) {
            match listing.iter_mut().find(|c| c.id == entry.id) {
                Some(existing) => *existing = entry,
                None => listing.push(entry),
            }
        }
    }

    pub fn remove_child(&self, parent_id: &str, id: &str) {
        if let Some(listing) = write(&self.children).get_mut(parent_id) {
            listing.retain(|c| c.id != id);
        }
    }

    /// 获取某个父 id 的列举锁
    pub fn listing_lock(&self, parent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.listing_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(parent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            paths: read(&self.paths).len(),
            listings: read(&self.children).len(),
        }
    }
}
