//! 统一的文件元数据模型（本地与远程共用）

use crate::config::SyncOptions;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Folder,
    File,
}

impl FileKind {
    /// 条目明细第 1 位的字符
    pub fn as_char(self) -> u8 {
        match self {
            FileKind::Folder => b'd',
            FileKind::File => b'f',
        }
    }
}

/// UTC 修改时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModifiedTime(DateTime<Utc>);

impl ModifiedTime {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self(time)
    }

    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        Self(DateTime::<Utc>::from(time))
    }

    /// 自 epoch 起的整秒数
    pub fn as_secs(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn to_system_time(&self) -> SystemTime {
        let nanos = self.0.timestamp_subsec_nanos();
        let secs = self.0.timestamp();
        if secs >= 0 {
            UNIX_EPOCH + std::time::Duration::new(secs as u64, nanos)
        } else {
            UNIX_EPOCH - std::time::Duration::from_secs(secs.unsigned_abs())
        }
    }
}

impl std::ops::Sub for ModifiedTime {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0 - rhs.0
    }
}

impl std::fmt::Display for ModifiedTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.6f+00:00"))
    }
}

/// 当前属性块格式版本
const ATTRIBUTES_VERSION: u32 = 1;

/// 平台属性（权限、属主、属组、访问时间）
///
/// 远程存储没有存放 POSIX 属性的位置，因此编码后放在描述字段里往返。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NativeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// 访问时间（epoch 秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct AttributeBlob {
    v: u32,
    #[serde(flatten)]
    attrs: NativeAttributes,
}

impl NativeAttributes {
    /// 编码为描述字段中的属性块
    pub fn encode(&self) -> String {
        let blob = AttributeBlob {
            v: ATTRIBUTES_VERSION,
            attrs: *self,
        };
        // 仅含整数字段，序列化不会失败
        serde_json::to_string(&blob).unwrap_or_default()
    }

    /// 从描述字段解码；不是属性块的描述返回 None
    pub fn decode(description: &str) -> Option<Self> {
        match serde_json::from_str::<AttributeBlob>(description) {
            Ok(blob) => Some(blob.attrs),
            Err(e) => {
                debug!("描述字段不是属性块: {}", e);
                None
            }
        }
    }

    /// 仅权限位（去掉文件类型位）
    pub fn permissions(&self) -> Option<u32> {
        self.mode.map(|m| m & 0o7777)
    }

    /// 用 `update` 中存在的字段覆盖自身，缺失字段保持不变
    pub fn merge(&self, update: &NativeAttributes) -> NativeAttributes {
        NativeAttributes {
            mode: update.mode.or(self.mode),
            uid: update.uid.or(self.uid),
            gid: update.gid.or(self.gid),
            atime: update.atime.or(self.atime),
        }
    }
}

/// 单个条目的元数据快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// 仅远程条目有 id
    pub id: Option<String>,
    pub title: String,
    pub path: String,
    pub modified_time: ModifiedTime,
    pub kind: FileKind,
    /// 目录恒为 0
    pub size: u64,
    pub checksum: Option<String>,
    pub native: Option<NativeAttributes>,
}

impl FileMetadata {
    pub fn is_folder(&self) -> bool {
        self.kind == FileKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

/// 要应用到目标的属性，`None` 表示不修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeSet {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<ModifiedTime>,
    pub atime: Option<ModifiedTime>,
}

impl AttributeSet {
    /// 根据源条目和选项计算要写入目标的属性
    ///
    /// 不保留时间时不包含时间；源没有访问时间时用修改时间代替。
    pub fn from_source(source: &FileMetadata, options: &SyncOptions) -> Self {
        let native = source.native.unwrap_or_default();

        let (mtime, atime) = if options.times {
            let mtime = source.modified_time;
            let atime = native.atime.map(ModifiedTime::from_secs).unwrap_or(mtime);
            (Some(mtime), Some(atime))
        } else {
            (None, None)
        };

        Self {
            mode: if options.perms { native.mode } else { None },
            uid: if options.owner { native.uid } else { None },
            gid: if options.group { native.gid } else { None },
            mtime,
            atime,
        }
    }

    /// 只包含时间的属性集（用于目录时间回写）
    pub fn times_only(mtime: ModifiedTime, atime: Option<ModifiedTime>) -> Self {
        Self {
            mtime: Some(mtime),
            atime: Some(atime.unwrap_or(mtime)),
            ..Default::default()
        }
    }

    /// 需要写入描述字段的那部分属性
    pub fn native(&self) -> NativeAttributes {
        NativeAttributes {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime.map(|t| t.as_secs()),
        }
    }
}
