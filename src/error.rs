//! 同步错误类型
//!
//! "不存在" 不是错误：所有查询接口都用 `Ok(None)` 表示条目缺失。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 枚举目录失败，该子树被跳过
    #[error("遍历失败: {path}: {message}")]
    Traversal { path: String, message: String },

    /// 单个条目的创建/更新失败，该条目被放弃
    #[error("传输失败: {path}: {message}")]
    Transfer { path: String, message: String },

    /// 用户或系统取消
    #[error("操作已取消")]
    Interrupted,

    #[error("无效路径: {0}")]
    InvalidPath(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("存储错误: {0}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    pub fn transfer(path: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Transfer {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn traversal(path: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Traversal {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// 取消是唯一需要中止整个同步的错误
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SyncError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
