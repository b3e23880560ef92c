//! 树遍历：深度优先、按名称排序，把每个条目的完整路径交给访问者

use crate::config::SyncOptions;
use crate::core::resolver::Resolver;
use crate::core::transfer::CancelFlag;
use crate::error::{Result, SyncError};
use crate::path::{self, SyncPath};
use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 包含/排除判断，`rel` 为相对于遍历根的路径
pub trait PathFilter: Send + Sync {
    fn is_included(&self, rel: &str, is_dir: bool) -> bool;
}

/// 不过滤
pub struct AllowAll;

impl PathFilter for AllowAll {
    fn is_included(&self, _rel: &str, _is_dir: bool) -> bool {
        true
    }
}

struct FilterRule {
    include: bool,
    regex: Regex,
    dir_only: bool,
    /// 模式不含 `/` 时只匹配最后一段
    base_name_only: bool,
}

/// 基于 glob 的过滤规则，第一条匹配的规则生效，没有匹配时包含
///
/// 规则写法：`- *.tmp`、`+ keep.tmp`、`exclude build/`、`include /src/**`。
/// `*` 不跨越 `/`，`**` 跨越；以 `/` 结尾只匹配目录；以 `/` 开头锚定到根。
#[derive(Default)]
pub struct PatternFilter {
    rules: Vec<FilterRule>,
}

impl PatternFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude(mut self, pattern: &str) -> Result<Self> {
        self.rules.push(Self::compile(false, pattern)?);
        Ok(self)
    }

    pub fn include(mut self, pattern: &str) -> Result<Self> {
        self.rules.push(Self::compile(true, pattern)?);
        Ok(self)
    }

    /// 解析规则行，空行和 `#` 注释被忽略
    pub fn from_rules<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let mut filter = Self::new();
        for line in rules {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (kind, pattern) = line
                .split_once(char::is_whitespace)
                .map(|(k, p)| (k, p.trim()))
                .ok_or_else(|| SyncError::InvalidPath(format!("无效的过滤规则: {}", line)))?;
            filter = match kind {
                "-" | "exclude" => filter.exclude(pattern)?,
                "+" | "include" => filter.include(pattern)?,
                _ => {
                    return Err(SyncError::InvalidPath(format!("无效的过滤规则: {}", line)));
                }
            };
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn compile(include: bool, pattern: &str) -> Result<FilterRule> {
        let dir_only = pattern.len() > 1 && pattern.ends_with('/');
        let pattern = pattern.trim_end_matches('/');
        let anchored = pattern.starts_with('/');
        let pattern = pattern.trim_start_matches('/');
        let base_name_only = !anchored && !pattern.contains('/');

        let body = glob_to_regex(pattern);
        let full = if anchored || base_name_only {
            format!("^{}$", body)
        } else {
            format!("^(?:.*/)?{}$", body)
        };

        let regex = Regex::new(&full)
            .map_err(|e| SyncError::InvalidPath(format!("无效的过滤模式 {}: {}", pattern, e)))?;
        Ok(FilterRule {
            include,
            regex,
            dir_only,
            base_name_only,
        })
    }
}

/// glob 转正则
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out
}

impl PathFilter for PatternFilter {
    fn is_included(&self, rel: &str, is_dir: bool) -> bool {
        let rel = rel.trim_matches('/');
        let base = rel.rsplit('/').next().unwrap_or(rel);

        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            let subject = if rule.base_name_only { base } else { rel };
            if rule.regex.is_match(subject) {
                return rule.include;
            }
        }
        true
    }
}

/// 访问者，返回错误会中止遍历
#[async_trait]
pub trait Visitor: Send {
    async fn visit(&mut self, path: &str) -> Result<()>;
}

/// 遍历选项
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlOptions {
    pub recursive: bool,
    pub dirs: bool,
    pub one_file_system: bool,
}

impl From<&SyncOptions> for CrawlOptions {
    fn from(options: &SyncOptions) -> Self {
        Self {
            recursive: options.recursive,
            dirs: options.dirs,
            one_file_system: options.one_file_system,
        }
    }
}

impl CrawlOptions {
    /// 目录本身是否交给访问者
    fn visits_dirs(&self) -> bool {
        self.recursive || self.dirs
    }
}

/// 遍历统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub visited: u64,
    pub excluded: u64,
    pub errors: u64,
}

/// 本地遍历线程发回的事件
enum LocalItem {
    Entry(String),
    Excluded,
    Error(String),
}

pub struct Crawler {
    options: CrawlOptions,
    filter: Arc<dyn PathFilter>,
    resolver: Option<Arc<Resolver>>,
    cancel: CancelFlag,
}

impl Crawler {
    pub fn new(options: CrawlOptions) -> Self {
        Self {
            options,
            filter: Arc::new(AllowAll),
            resolver: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn PathFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// 遍历根；根是文件时只访问它自己
    pub async fn crawl(&self, root: &SyncPath, visitor: &mut dyn Visitor) -> Result<CrawlStats> {
        info!("开始遍历: {}", root);
        let stats = if root.is_remote() {
            self.crawl_remote(root, visitor).await?
        } else {
            self.crawl_local(root, visitor).await?
        };
        info!(
            "遍历完成: {} 个条目, {} 个被排除, {} 个错误",
            stats.visited, stats.excluded, stats.errors
        );
        Ok(stats)
    }

    async fn crawl_local(&self, root: &SyncPath, visitor: &mut dyn Visitor) -> Result<CrawlStats> {
        let root_str = root.as_str().to_string();
        let metadata = tokio::fs::metadata(&root_str)
            .await
            .map_err(|e| SyncError::traversal(&root_str, e))?;

        let mut stats = CrawlStats::default();
        if !metadata.is_dir() {
            self.cancel.check()?;
            visitor.visit(&root_str).await?;
            stats.visited += 1;
            return Ok(stats);
        }

        let root_dev = if self.options.one_file_system {
            device_of(&metadata)
        } else {
            None
        };

        let (tx, mut rx) = mpsc::channel::<LocalItem>(256);
        let options = self.options;
        let filter = self.filter.clone();
        let walk_root = root_str.clone();

        // walkdir 是同步的，放到阻塞线程里按需发送
        let walker = tokio::task::spawn_blocking(move || {
            walk_local(&walk_root, options, filter.as_ref(), root_dev, &tx)
        });

        let mut outcome = Ok(());
        while let Some(item) = rx.recv().await {
            match item {
                LocalItem::Entry(path) => {
                    if let Err(e) = self.cancel.check() {
                        outcome = Err(e);
                        break;
                    }
                    if let Err(e) = visitor.visit(&path).await {
                        outcome = Err(e);
                        break;
                    }
                    stats.visited += 1;
                }
                LocalItem::Excluded => stats.excluded += 1,
                LocalItem::Error(message) => {
                    warn!("遍历失败: {}", message);
                    stats.errors += 1;
                }
            }
        }
        // 提前结束时关闭接收端，遍历线程在下一次发送时退出
        drop(rx);

        walker
            .await
            .map_err(|e| SyncError::traversal(&root_str, e))?;
        outcome.map(|_| stats)
    }

    async fn crawl_remote(&self, root: &SyncPath, visitor: &mut dyn Visitor) -> Result<CrawlStats> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| SyncError::InvalidPath(format!("{}: 未配置远程存储", root)))?;

        let root_path = remote_display(root.as_str());
        let entry = resolver
            .resolve(&root_path)
            .await?
            .ok_or_else(|| SyncError::traversal(&root_path, "源不存在"))?;

        let mut stats = CrawlStats::default();
        if !entry.is_folder() {
            self.cancel.check()?;
            visitor.visit(&root_path).await?;
            stats.visited += 1;
            return Ok(stats);
        }

        self.walk_remote(resolver, &root_path, "", visitor, &mut stats)
            .await?;
        Ok(stats)
    }

    fn walk_remote<'a>(
        &'a self,
        resolver: &'a Resolver,
        dir: &'a str,
        rel: &'a str,
        visitor: &'a mut dyn Visitor,
        stats: &'a mut CrawlStats,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!("列举: {}", dir);
            let children = match resolver.list(dir).await {
                Ok(Some(children)) => children,
                Ok(None) => {
                    warn!("遍历失败: {}: 目录不存在", dir);
                    stats.errors += 1;
                    return Ok(());
                }
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!("遍历失败: {}: {}", dir, e);
                    stats.errors += 1;
                    return Ok(());
                }
            };

            for child in children {
                let child_rel = path::join(rel, &child.name);
                let child_rel = child_rel.trim_start_matches('/');
                let child_path = path::join(dir, &child.name);
                let is_dir = child.is_folder();

                if !self.filter.is_included(child_rel, is_dir) {
                    debug!("排除: {}", child_rel);
                    stats.excluded += 1;
                    continue;
                }

                if is_dir {
                    if !self.options.visits_dirs() {
                        continue;
                    }
                    self.cancel.check()?;
                    visitor.visit(&child_path).await?;
                    stats.visited += 1;
                    if self.options.recursive {
                        self.walk_remote(resolver, &child_path, child_rel, &mut *visitor, &mut *stats)
                            .await?;
                    }
                } else {
                    self.cancel.check()?;
                    visitor.visit(&child_path).await?;
                    stats.visited += 1;
                }
            }
            Ok(())
        })
    }
}

/// 远程路径的显示形式 `remote://a/b`
fn remote_display(store_path: &str) -> String {
    path::normalize_remote(store_path)
}

#[cfg(unix)]
fn device_of(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.dev())
}

#[cfg(not(unix))]
fn device_of(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

/// 在阻塞线程中遍历本地目录；接收端关闭后停止
fn walk_local(
    root: &str,
    options: CrawlOptions,
    filter: &dyn PathFilter,
    root_dev: Option<u64>,
    tx: &mpsc::Sender<LocalItem>,
) {
    let root_path = Path::new(root);
    let max_depth = if options.recursive { usize::MAX } else { 1 };

    let mut excluded = 0u64;
    let mut invalid = Vec::new();
    let walker = WalkDir::new(root_path)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // 路径在各端点间以 UTF-8 字符串传递，无法表示的名字连同子树一起跳过
            if entry.path().to_str().is_none() {
                invalid.push(entry.path().display().to_string());
                return false;
            }
            let rel = entry
                .path()
                .strip_prefix(root_path)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let is_dir = entry.file_type().is_dir();

            if !filter.is_included(&rel, is_dir) {
                debug!("排除: {}", rel);
                excluded += 1;
                return false;
            }

            if let Some(dev) = root_dev {
                if let Ok(meta) = entry.metadata() {
                    if device_of(&meta) != Some(dev) {
                        info!("不在同一文件系统，跳过: {}", entry.path().display());
                        excluded += 1;
                        return false;
                    }
                }
            }
            true
        });

    for item in walker {
        let message = match item {
            Ok(entry) => {
                let file_type = entry.file_type();
                if file_type.is_symlink() {
                    info!("跳过符号链接: {}", entry.path().display());
                    LocalItem::Excluded
                } else if file_type.is_dir() && !options.visits_dirs() {
                    continue;
                } else {
                    match entry.path().to_str() {
                        Some(p) => LocalItem::Entry(p.to_string()),
                        None => LocalItem::Error(format!(
                            "文件名不是有效的 UTF-8: {}",
                            entry.path().display()
                        )),
                    }
                }
            }
            Err(e) => LocalItem::Error(e.to_string()),
        };

        if tx.blocking_send(message).is_err() {
            return;
        }
    }

    for _ in 0..excluded {
        if tx.blocking_send(LocalItem::Excluded).is_err() {
            return;
        }
    }

    for name in invalid {
        let message = LocalItem::Error(format!("文件名不是有效的 UTF-8: {}", name));
        if tx.blocking_send(message).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::ModifiedTime;
    use crate::storage::MemoryStore;
    use std::fs;

    #[derive(Default)]
    struct Collect {
        root: String,
        seen: Vec<String>,
        stop_after: Option<usize>,
    }

    #[async_trait]
    impl Visitor for Collect {
        async fn visit(&mut self, path: &str) -> Result<()> {
            if self.stop_after == Some(self.seen.len()) {
                return Err(SyncError::Interrupted);
            }
            self.seen.push(path::relative_to(&self.root, path));
            Ok(())
        }
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("b/nested")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("z.txt"), b"z").unwrap();
        fs::write(root.join("a/1.txt"), b"1").unwrap();
        fs::write(root.join("b/2.tmp"), b"2").unwrap();
        fs::write(root.join("b/nested/3.txt"), b"3").unwrap();
        dir
    }

    async fn crawl_local(
        dir: &tempfile::TempDir,
        options: CrawlOptions,
        filter: Arc<dyn PathFilter>,
    ) -> (Vec<String>, CrawlStats) {
        let root = SyncPath::parse(dir.path().to_str().unwrap()).unwrap();
        let mut visitor = Collect {
            root: root.as_str().to_string(),
            ..Default::default()
        };
        let stats = Crawler::new(options)
            .with_filter(filter)
            .crawl(&root, &mut visitor)
            .await
            .unwrap();
        (visitor.seen, stats)
    }

    #[tokio::test]
    async fn test_recursive_is_depth_first_and_sorted() {
        let dir = tree();
        let options = CrawlOptions {
            recursive: true,
            ..Default::default()
        };
        let (seen, stats) = crawl_local(&dir, options, Arc::new(AllowAll)).await;
        assert_eq!(
            seen,
            ["a", "a/1.txt", "b", "b/2.tmp", "b/nested", "b/nested/3.txt", "z.txt"]
        );
        assert_eq!(stats.visited, 7);
    }

    #[tokio::test]
    async fn test_single_level_modes() {
        let dir = tree();
        let (seen, _) = crawl_local(&dir, CrawlOptions::default(), Arc::new(AllowAll)).await;
        assert_eq!(seen, ["z.txt"]);

        let options = CrawlOptions {
            dirs: true,
            ..Default::default()
        };
        let (seen, _) = crawl_local(&dir, options, Arc::new(AllowAll)).await;
        assert_eq!(seen, ["a", "b", "z.txt"]);
    }

    #[tokio::test]
    async fn test_excluded_directory_prunes_subtree() {
        let dir = tree();
        let filter = PatternFilter::from_rules(&["- b/", "- *.txt", "+ never"]).unwrap();
        let options = CrawlOptions {
            recursive: true,
            ..Default::default()
        };
        let (seen, stats) = crawl_local(&dir, options, Arc::new(filter)).await;
        assert_eq!(seen, ["a"]);
        assert_eq!(stats.excluded, 3);
    }

    #[tokio::test]
    async fn test_single_file_root() {
        let dir = tree();
        let root = SyncPath::parse(dir.path().join("z.txt").to_str().unwrap()).unwrap();
        let mut visitor = Collect {
            root: root.as_str().to_string(),
            ..Default::default()
        };
        let options = CrawlOptions {
            recursive: true,
            ..Default::default()
        };
        let stats = Crawler::new(options).crawl(&root, &mut visitor).await.unwrap();
        assert_eq!(visitor.seen, [""]);
        assert_eq!(stats.visited, 1);
    }

    #[tokio::test]
    async fn test_visitor_error_stops_crawl() {
        let dir = tree();
        let root = SyncPath::parse(dir.path().to_str().unwrap()).unwrap();
        let mut visitor = Collect {
            root: root.as_str().to_string(),
            stop_after: Some(2),
            ..Default::default()
        };
        let options = CrawlOptions {
            recursive: true,
            ..Default::default()
        };
        let err = Crawler::new(options)
            .crawl(&root, &mut visitor)
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(visitor.seen.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_directory_is_counted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tree();
        let locked = dir.path().join("b/nested");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // root 用户不受权限限制
        let readable = fs::read_dir(&locked).is_ok();

        let options = CrawlOptions {
            recursive: true,
            ..Default::default()
        };
        let (seen, stats) = crawl_local(&dir, options, Arc::new(AllowAll)).await;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if !readable {
            assert_eq!(stats.errors, 1);
            assert!(!seen.contains(&"b/nested/3.txt".to_string()));
        }
        assert!(seen.contains(&"z.txt".to_string()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_non_utf8_name_is_a_traversal_error() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tree();
        fs::write(dir.path().join(OsStr::from_bytes(b"caf\xe9.txt")), b"x").unwrap();

        let options = CrawlOptions {
            recursive: true,
            ..Default::default()
        };
        let (seen, stats) = crawl_local(&dir, options, Arc::new(AllowAll)).await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.visited, 7);
        assert!(seen.iter().all(|p| !p.contains('\u{fffd}')));
    }

    #[tokio::test]
    async fn test_remote_crawl() {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(Resolver::new(store));
        for path in ["remote://src/b/x", "remote://src/a", "remote://src/b/y/z"] {
            resolver
                .create_file(path, ModifiedTime::now(), None)
                .await
                .unwrap();
        }

        let root = SyncPath::parse("remote://src").unwrap();
        let mut visitor = Collect {
            root: "remote://src".to_string(),
            ..Default::default()
        };
        let options = CrawlOptions {
            recursive: true,
            ..Default::default()
        };
        Crawler::new(options)
            .with_resolver(resolver.clone())
            .crawl(&root, &mut visitor)
            .await
            .unwrap();
        assert_eq!(visitor.seen, ["a", "b", "b/x", "b/y", "b/y/z"]);

        let filter = PatternFilter::new().exclude("y").unwrap();
        let mut visitor = Collect {
            root: "remote://src".to_string(),
            ..Default::default()
        };
        Crawler::new(options)
            .with_resolver(resolver)
            .with_filter(Arc::new(filter))
            .crawl(&root, &mut visitor)
            .await
            .unwrap();
        assert_eq!(visitor.seen, ["a", "b", "b/x"]);
    }

    #[test]
    fn test_pattern_filter_rules() {
        let filter = PatternFilter::from_rules(&[
            "# 注释",
            "+ keep.tmp",
            "- *.tmp",
            "- /build/",
            "exclude docs/**/*.md",
        ])
        .unwrap();

        assert!(filter.is_included("keep.tmp", false));
        assert!(!filter.is_included("x/y.tmp", false));
        assert!(!filter.is_included("build", true));
        // 只匹配目录，且锚定到根
        assert!(filter.is_included("build", false));
        assert!(filter.is_included("src/build", true));
        assert!(!filter.is_included("docs/a/b.md", false));
        assert!(filter.is_included("docs.md", false));
        assert!(filter.is_included("a/b.txt", false));

        assert!(PatternFilter::from_rules(&["? x"]).is_err());
    }
}
