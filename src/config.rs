//! 同步选项与配置文件

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

const CONFIG_FILE: &str = "config.json";

/// `config.json` 中的一个配置段
///
/// 读取失败或字段缺失时回落到默认值；保存时保留文件中的其他段。
pub trait ConfigSection: Serialize + DeserializeOwned + Default {
    const SECTION: &'static str;

    /// 从配置文件加载
    fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join(CONFIG_FILE);
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(section) = config.get(Self::SECTION) {
                        if let Ok(value) = serde_json::from_value::<Self>(section.clone()) {
                            return value;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 保存到配置文件
    fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join(CONFIG_FILE);

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config[Self::SECTION] = serde_json::to_value(self).map_err(io::Error::other)?;

        let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
        fs::create_dir_all(config_dir)?;
        fs::write(&config_file, content)
    }
}

/// 同步选项（命令行解析后的结果）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// 递归进入目录
    pub recursive: bool,
    /// 不递归时也同步目录本身
    pub dirs: bool,
    /// 不跨越文件系统边界
    pub one_file_system: bool,
    /// 保留修改时间
    pub times: bool,
    /// 保留权限
    pub perms: bool,
    /// 保留属主
    pub owner: bool,
    /// 保留属组
    pub group: bool,
    /// 用校验和而非大小和时间判断是否变化
    pub checksum: bool,
    /// 跳过目标更新的文件
    pub update: bool,
    /// 只更新目标已有的条目
    pub existing: bool,
    /// 跳过目标已有的条目
    pub ignore_existing: bool,
    /// 追加数据到较短的目标文件
    pub append: bool,
    /// 只比较大小
    pub size_only: bool,
    /// 不跳过大小和时间相同的文件
    pub ignore_times: bool,
    /// 输出条目变更明细
    pub itemize_changes: bool,
    pub verbose: bool,
    pub dry_run: bool,
    /// 在目标下使用完整源路径
    pub relative: bool,
    /// 把目标当作单个文件
    pub force_dest_file: bool,
}

impl SyncOptions {
    /// 归档模式：递归并保留时间、权限、属主、属组
    pub fn archive() -> Self {
        Self {
            recursive: true,
            times: true,
            perms: true,
            owner: true,
            group: true,
            ..Default::default()
        }
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 分块大小（KB）
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: u64,
    /// 分块失败后的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），按指数退避
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_chunk_size_kb() -> u64 {
    1024 // 1 MiB
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_kb: default_chunk_size_kb(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl TransferConfig {
    /// 分块大小（字节），至少 1 字节
    pub fn chunk_size(&self) -> usize {
        (self.chunk_size_kb.max(1) * 1024) as usize
    }
}

impl ConfigSection for TransferConfig {
    const SECTION: &'static str = "transfer";
}

/// 远程存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    /// 本地目录模拟的远程存储
    #[default]
    Fs,
    S3,
    Webdav,
    /// 进程内存储，进程退出即丢失
    Memory,
}

/// 远程存储配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    #[serde(rename = "type")]
    pub remote_type: RemoteType,
    /// 存储内的根路径（fs 为本地目录）
    pub root: String,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub endpoint: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConfigSection for RemoteConfig {
    const SECTION: &'static str = "remote";
}
