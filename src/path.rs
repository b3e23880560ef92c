//! 路径语法：`remote://` 前缀表示远程存储，其余为本地路径。

use crate::error::{Result, SyncError};

/// 远程路径前缀
pub const REMOTE_PREFIX: &str = "remote://";
const REMOTE_SCHEME: &str = "remote:";

/// 路径所在位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote,
}

/// 解析后的同步路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPath {
    location: Location,
    /// 本地：规范化后的文件系统路径；远程：以 `/` 开头的存储内绝对路径
    path: String,
    /// 原始输入是否以分隔符结尾（影响"作为文件"还是"作为目录"同步）
    trailing_separator: bool,
}

impl SyncPath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(SyncError::InvalidPath("空路径".to_string()));
        }

        let trailing_separator = raw.len() > 1 && raw.ends_with('/');

        if is_remote(raw) {
            Ok(Self {
                location: Location::Remote,
                path: strip_remote(raw),
                trailing_separator: trailing_separator && raw != REMOTE_PREFIX,
            })
        } else {
            Ok(Self {
                location: Location::Local,
                path: normalize_local(raw),
                trailing_separator,
            })
        }
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn is_remote(&self) -> bool {
        self.location == Location::Remote
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn has_trailing_separator(&self) -> bool {
        self.trailing_separator
    }

    /// 拼接相对路径，`rel` 为空时返回自身
    pub fn join(&self, rel: &str) -> String {
        join(&self.path, rel)
    }

    /// 路径的最后一段
    pub fn base_name(&self) -> String {
        base_name(&self.path)
    }
}

impl std::fmt::Display for SyncPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location {
            Location::Local => write!(f, "{}", self.path),
            Location::Remote => write!(f, "{}", normalize_remote(&self.path)),
        }
    }
}

pub fn is_remote(path: &str) -> bool {
    path.starts_with(REMOTE_SCHEME)
}

/// 折叠 `.`、`..` 与重复分隔符
fn collapse(path: &str, absolute: bool) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                // 绝对路径的根之上没有东西
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    parts
}

/// 规范化远程路径
///
/// `remote:`、`remote:/`、`remote://` 都表示根；以 `/` 开头的路径视为远程绝对路径；
/// 相对路径保持相对。
pub fn normalize_remote(path: &str) -> String {
    let (rest, absolute) = match path.strip_prefix(REMOTE_SCHEME) {
        Some(rest) => (rest, true),
        None => (path, path.starts_with('/')),
    };

    let parts = collapse(rest, absolute);
    if absolute {
        format!("{}{}", REMOTE_PREFIX, parts.join("/"))
    } else if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// 去掉前缀，返回存储内绝对路径（根为 `/`）
pub fn strip_remote(path: &str) -> String {
    let rest = path.strip_prefix(REMOTE_SCHEME).unwrap_or(path);
    format!("/{}", collapse(rest, true).join("/"))
}

/// 远程路径的组成部分，第一项总是根标记
pub fn path_components(path: &str) -> Vec<String> {
    let stripped = strip_remote(path);
    let mut components = vec![REMOTE_PREFIX.to_string()];
    components.extend(
        stripped
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    );
    components
}

/// 本地路径规范化：折叠多余分隔符和 `.`/`..`，去掉结尾分隔符
pub fn normalize_local(path: &str) -> String {
    let absolute = path.starts_with('/');
    let parts = collapse(path, absolute);
    match (absolute, parts.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", parts.join("/")),
        (false, true) => ".".to_string(),
        (false, false) => parts.join("/"),
    }
}

pub fn join(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() || rel == "." {
        base.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, rel)
    } else {
        format!("{}/{}", base, rel)
    }
}

pub fn base_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// 父路径；根的父路径是 `None`
pub fn parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => Some(String::new()),
    }
}

/// 计算 `path` 相对于 `root` 的路径；`path` 不在 `root` 下时原样规范化返回。
/// `root` 自身返回空串。
pub fn relative_to(root: &str, path: &str) -> String {
    let (root, path) = if is_remote(root) || is_remote(path) {
        (strip_remote(root), strip_remote(path))
    } else {
        (normalize_local(root), normalize_local(path))
    };

    if path == root {
        return String::new();
    }

    let prefix = if root.ends_with('/') {
        root.clone()
    } else {
        format!("{}/", root)
    };

    match path.strip_prefix(&prefix) {
        Some(rest) => rest.to_string(),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_remote() {
        let cases = [
            ("remote:", "remote://"),
            ("remote:/", "remote://"),
            ("remote://", "remote://"),
            ("remote://backup", "remote://backup"),
            ("remote://backup/", "remote://backup"),
            ("//backup/a/b/c", "remote://backup/a/b/c"),
            ("backup/a/b/c/.", "backup/a/b/c"),
            ("/backup/a/b/c/..", "remote://backup/a/b"),
        ];

        for (input, expected) in cases {
            assert_eq!(normalize_remote(input), expected, "输入: {}", input);
        }
    }

    #[test]
    fn test_strip_remote() {
        let cases = [
            ("remote:", "/"),
            ("remote://", "/"),
            ("remote://backup/", "/backup"),
            ("remote://backup/a/b/c/.", "/backup/a/b/c"),
            ("remote://backup/a/b/c/..", "/backup/a/b"),
        ];

        for (input, expected) in cases {
            assert_eq!(strip_remote(input), expected, "输入: {}", input);
        }
    }

    #[test]
    fn test_path_components() {
        assert_eq!(path_components("remote://"), vec!["remote://"]);
        assert_eq!(
            path_components("remote://backup/a/b/c/.."),
            vec!["remote://", "backup", "a", "b"]
        );
    }

    #[test]
    fn test_parse_keeps_trailing_separator() {
        let p = SyncPath::parse("/tmp/dest/").unwrap();
        assert!(p.has_trailing_separator());
        assert_eq!(p.as_str(), "/tmp/dest");

        let p = SyncPath::parse("remote://dest").unwrap();
        assert!(p.is_remote());
        assert!(!p.has_trailing_separator());
        assert_eq!(p.as_str(), "/dest");
        assert_eq!(p.to_string(), "remote://dest");
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("tests/data", "tests/data/a.txt"), "a.txt");
        assert_eq!(relative_to("tests/data/", "tests/data//x/./y"), "x/y");
        assert_eq!(relative_to("tests/data", "tests/data"), "");
        assert_eq!(relative_to("tests/data", "a.txt"), "a.txt");
        assert_eq!(relative_to("remote://a", "remote://a/b/c"), "b/c");
    }

    #[test]
    fn test_parent_and_join() {
        assert_eq!(parent("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent("/a").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", ""), "/a");
        assert_eq!(join("/a", "b/c"), "/a/b/c");
    }
}
