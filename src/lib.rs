pub mod config;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod path;
pub mod storage;

pub use config::{ConfigSection, RemoteConfig, RemoteType, SyncOptions, TransferConfig};
pub use core::{SyncEngine, SyncEvent, SyncReport};
pub use error::{Result, SyncError};
pub use path::SyncPath;

// 配置与缓存目录，避免额外依赖
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux：优先 XDG_CONFIG_HOME
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
