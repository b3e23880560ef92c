//! 决策引擎：比较源与目标元数据，得出最小动作和条目变更明细

use crate::config::SyncOptions;
use crate::core::metadata::{FileKind, FileMetadata};
use crate::path::Location;
use tracing::debug;

/// 同步动作位掩码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncAction(u8);

impl SyncAction {
    pub const NO_CHANGE: SyncAction = SyncAction(0);
    pub const CREATE: SyncAction = SyncAction(1);
    pub const UPDATE_DATA: SyncAction = SyncAction(1 << 1);
    pub const UPDATE_ATTRS: SyncAction = SyncAction(1 << 2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: SyncAction) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SyncAction) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for SyncAction {
    type Output = SyncAction;

    fn bitor(self, rhs: SyncAction) -> SyncAction {
        SyncAction(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SyncAction {
    fn bitor_assign(&mut self, rhs: SyncAction) {
        self.0 |= rhs.0;
    }
}

/// 条目变更明细 `YXcstpoguax`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemizedChange([u8; 11]);

impl ItemizedChange {
    pub const POS_UPDATE: usize = 0;
    pub const POS_KIND: usize = 1;
    pub const POS_CHECKSUM: usize = 2;
    pub const POS_SIZE: usize = 3;
    pub const POS_TIME: usize = 4;
    pub const POS_PERMS: usize = 5;
    pub const POS_OWNER: usize = 6;
    pub const POS_GROUP: usize = 7;
    pub const POS_RESERVED: usize = 8;
    pub const POS_ACL: usize = 9;
    pub const POS_XATTR: usize = 10;

    /// 全部为 `.`
    pub fn unchanged() -> Self {
        Self([b'.'; 11])
    }

    /// 全部为 `+`
    pub fn created() -> Self {
        Self([b'+'; 11])
    }

    pub fn set(&mut self, pos: usize, value: u8) {
        self.0[pos] = value;
    }

    pub fn get(&self, pos: usize) -> u8 {
        self.0[pos]
    }
}

impl Default for ItemizedChange {
    fn default() -> Self {
        Self::unchanged()
    }
}

impl std::fmt::Display for ItemizedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 只会写入 ASCII
        for &b in &self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

/// 决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: SyncAction,
    pub changes: ItemizedChange,
}

impl Decision {
    fn skip() -> Self {
        Self {
            action: SyncAction::NO_CHANGE,
            changes: ItemizedChange::unchanged(),
        }
    }

    pub fn is_no_change(&self) -> bool {
        self.action.is_empty()
    }
}

/// 比较源与目标，得出动作
///
/// `dest` 为目标端所在位置，决定文件传输方向标记。
pub fn decide(
    source: &FileMetadata,
    destination: Option<&FileMetadata>,
    options: &SyncOptions,
    dest: Location,
) -> Decision {
    let mut changes;
    let mut action = SyncAction::NO_CHANGE;

    match destination {
        Some(dst) if dst.kind == source.kind => {
            changes = ItemizedChange::unchanged();

            if options.ignore_existing {
                debug!("目标已存在，跳过: {}", source.path);
                return Decision::skip();
            }

            let src_secs = source.modified_time.as_secs();
            let dst_secs = dst.modified_time.as_secs();

            if options.update && dst_secs >= src_secs {
                debug!("目标不比源旧，跳过: {}", source.path);
                return Decision::skip();
            }

            if quick_check_matches(source, dst, options) {
                debug!("大小和时间一致，跳过: {}", source.path);
                return Decision::skip();
            }

            let is_file = source.kind == FileKind::File;

            if options.checksum && is_file {
                if let (Some(src_sum), Some(dst_sum)) = (&source.checksum, &dst.checksum) {
                    if src_sum != dst_sum {
                        debug!("校验和不同: {} (src={}, dst={})", source.path, src_sum, dst_sum);
                        changes.set(ItemizedChange::POS_CHECKSUM, b'c');
                        action |= SyncAction::UPDATE_DATA;
                    }
                }
            }

            if options.append && is_file && source.size <= dst.size {
                debug!("追加模式下源文件不大于目标，跳过: {}", source.path);
                return Decision::skip();
            }

            if is_file && source.size != dst.size {
                debug!(
                    "文件大小不同: {} (src={}, dst={})",
                    source.path, source.size, dst.size
                );
                changes.set(ItemizedChange::POS_SIZE, b's');
                action |= SyncAction::UPDATE_DATA;
            }

            if times_differ(src_secs, dst_secs, is_file, options) {
                debug!("修改时间不同: {} (src={}, dst={})", source.path, src_secs, dst_secs);
                let marker = if options.times { b't' } else { b'T' };
                changes.set(ItemizedChange::POS_TIME, marker);
                action |= SyncAction::UPDATE_ATTRS;
            }

            if let (Some(src_native), Some(dst_native)) = (&source.native, &dst.native) {
                if options.perms && src_native.permissions() != dst_native.permissions() {
                    changes.set(ItemizedChange::POS_PERMS, b'p');
                    action |= SyncAction::UPDATE_ATTRS;
                }
                if options.owner && src_native.uid != dst_native.uid {
                    changes.set(ItemizedChange::POS_OWNER, b'o');
                    action |= SyncAction::UPDATE_ATTRS;
                }
                if options.group && src_native.gid != dst_native.gid {
                    changes.set(ItemizedChange::POS_GROUP, b'g');
                    action |= SyncAction::UPDATE_ATTRS;
                }
            }

            if action.is_empty() {
                debug!("已是最新: {}", source.path);
                return Decision::skip();
            }
        }
        _ => {
            if destination.is_none() && options.existing {
                debug!("目标不存在且只更新已有条目，跳过: {}", source.path);
                return Decision::skip();
            }
            if let Some(dst) = destination {
                debug!(
                    "类型不同: {} (src={:?}, dst={:?})",
                    source.path, source.kind, dst.kind
                );
            }
            changes = ItemizedChange::created();
            action = SyncAction::CREATE;
        }
    }

    changes.set(ItemizedChange::POS_KIND, source.kind.as_char());

    let moves_data =
        action.contains(SyncAction::CREATE) || action.contains(SyncAction::UPDATE_DATA);
    match source.kind {
        FileKind::Folder if action.contains(SyncAction::CREATE) => {
            changes.set(ItemizedChange::POS_UPDATE, b'c');
        }
        FileKind::File if moves_data => {
            let marker = match dest {
                Location::Local => b'>',
                Location::Remote => b'<',
            };
            changes.set(ItemizedChange::POS_UPDATE, marker);
        }
        _ => {}
    }

    Decision { action, changes }
}

/// 快速检查：不计算校验和时，大小和修改时间相同即视为未变
fn quick_check_matches(source: &FileMetadata, dst: &FileMetadata, options: &SyncOptions) -> bool {
    if options.checksum || options.ignore_times {
        return false;
    }

    // 目录大小没有意义
    let size_equal = source.kind == FileKind::Folder || source.size == dst.size;
    if options.size_only {
        return size_equal;
    }

    size_equal && source.modified_time.as_secs() == dst.modified_time.as_secs()
}

/// 保留时间时任何差异都算；不保留时只看源是否更新，且目录不参与
fn times_differ(src_secs: i64, dst_secs: i64, is_file: bool, options: &SyncOptions) -> bool {
    if options.times {
        src_secs != dst_secs
    } else {
        is_file && src_secs > dst_secs
    }
}
