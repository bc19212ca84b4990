//! 索引节点的在盘形态。
//!
//! 每个 inode 固定 128 字节，整齐打包进 inode 表的块中；
//! 其编号即它在表中的序号。块指针是数据区的绝对块号，
//! 直接槽用 0 表示空缺，两个间接槽用 -1。

use enumflags2::bitflags;
use enumflags2::BitFlags;

use super::{get_i32, get_i64, get_u32, put_i32, put_i64, put_u32};
use crate::unix_now;
use crate::DIRECT_COUNT;

pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: usize = crate::BLOCK_SIZE / INODE_SIZE;

/// 文件类型与权限位。`mode` 为零的 inode 视为死亡。
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFlag {
    Regular = 0x8000,
    Directory = 0x4000,
    Read = 0x400,
    Write = 0x200,
    Execute = 0x100,
}

impl ModeFlag {
    /// 目录的默认模式：目录类型加全部权限
    pub fn directory_default() -> BitFlags<ModeFlag> {
        ModeFlag::Directory | ModeFlag::Read | ModeFlag::Write | ModeFlag::Execute
    }

    /// 普通文件的默认权限
    pub fn file_default() -> BitFlags<ModeFlag> {
        ModeFlag::Read | ModeFlag::Write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInode {
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    pub links: u32,
    /// 文件大小（字节），非负
    pub size: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub direct: [i32; DIRECT_COUNT],
    pub indirect: i32,
    pub double_indirect: i32,
}

impl DiskInode {
    /// 新分配 inode 的模板：时间戳取当前，间接槽置空。
    pub fn new(mode: BitFlags<ModeFlag>, links: u32) -> Self {
        let now = unix_now();
        Self {
            mode: mode.bits(),
            owner: 0,
            group: 0,
            links,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            direct: [0; DIRECT_COUNT],
            indirect: -1,
            double_indirect: -1,
        }
    }

    /// 全零记录，回收 inode 时写回
    pub fn zeroed() -> Self {
        Self {
            mode: 0,
            owner: 0,
            group: 0,
            links: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            double_indirect: 0,
        }
    }

    #[inline]
    pub fn flags(&self) -> BitFlags<ModeFlag> {
        BitFlags::from_bits_truncate(self.mode)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags().contains(ModeFlag::Directory)
    }

    #[inline]
    pub fn is_regular(&self) -> bool {
        !self.is_dir()
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.mode != 0
    }

    /// 从 inode 表块内偏移处解码，`raw` 至少 [`INODE_SIZE`] 字节。
    pub fn decode(raw: &[u8]) -> Self {
        let mut direct = [0i32; DIRECT_COUNT];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = get_i32(raw, 48 + i * 4);
        }

        Self {
            mode: get_u32(raw, 0),
            owner: get_u32(raw, 4),
            group: get_u32(raw, 8),
            links: get_u32(raw, 12),
            size: get_i64(raw, 16),
            atime: get_i64(raw, 24),
            mtime: get_i64(raw, 32),
            ctime: get_i64(raw, 40),
            direct,
            indirect: get_i32(raw, 88),
            double_indirect: get_i32(raw, 92),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..INODE_SIZE].fill(0);
        put_u32(out, 0, self.mode);
        put_u32(out, 4, self.owner);
        put_u32(out, 8, self.group);
        put_u32(out, 12, self.links);
        put_i64(out, 16, self.size);
        put_i64(out, 24, self.atime);
        put_i64(out, 32, self.mtime);
        put_i64(out, 40, self.ctime);
        for (i, slot) in self.direct.iter().enumerate() {
            put_i32(out, 48 + i * 4, *slot);
        }
        put_i32(out, 88, self.indirect);
        put_i32(out, 92, self.double_indirect);
    }
}

/// 指针槽的取值 0 与 -1 均表示空缺；数据区起点恒大于 0，
/// 因此合法块号一定为正。
#[inline]
pub fn block_ptr(slot: i32) -> Option<u32> {
    (slot > 0).then_some(slot as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut inode = DiskInode::new(ModeFlag::directory_default(), 2);
        inode.size = 528;
        inode.direct[0] = 7;
        inode.direct[9] = 99;
        inode.indirect = 120;

        let mut raw = [0u8; INODE_SIZE];
        inode.encode(&mut raw);
        assert_eq!(DiskInode::decode(&raw), inode);
    }

    #[test]
    fn fresh_inode_has_empty_indirect_slots() {
        let inode = DiskInode::new(ModeFlag::file_default(), 1);
        assert_eq!(inode.indirect, -1);
        assert_eq!(inode.double_indirect, -1);
        assert!(inode.is_live());
        assert!(inode.is_regular());
        assert!(!DiskInode::zeroed().is_live());
    }

    #[test]
    fn both_sentinels_read_as_absent() {
        assert_eq!(block_ptr(0), None);
        assert_eq!(block_ptr(-1), None);
        assert_eq!(block_ptr(42), Some(42));
    }
}
