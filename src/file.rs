//! # 文件读写层
//!
//! 把（块列表，字节偏移，长度）映射为一串块读写：首块按
//! `offset % B` 拼接，被部分覆盖的块先读后写以保全未改动字节。
//! 另提供打开文件表：描述符从 3 起步，游标前进分配，
//! 越过 1024 折回 3。

use std::collections::BTreeMap;

use enumflags2::bitflags;
use enumflags2::BitFlags;
use log::error;

use crate::DiskImage;
use crate::FsError;
use crate::BLOCK_SIZE;

/// 首个可分配的描述符；0/1/2 留给标准流
pub const FD_FIRST: u32 = 3;
/// 描述符编号上限，越过后折回 [`FD_FIRST`]
pub const FD_LIMIT: u32 = 1024;

/// 打开模式。打开时锁定，之后的读写按它裁决。
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read = 0x01,
    Write = 0x02,
    /// 文件不存在时创建
    Create = 0x04,
    /// 打开后把游标放到文件末尾
    Append = 0x08,
}

/// 打开文件表中的一项。
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    pub inode: u32,
    pub mode: BitFlags<OpenMode>,
    /// 当前读写位置（字节偏移）
    pub position: i64,
    pub open: bool,
}

impl OpenFile {
    pub fn new(inode: u32, mode: BitFlags<OpenMode>) -> Self {
        Self {
            inode,
            mode,
            position: 0,
            open: true,
        }
    }
}

/// 描述符到打开文件项的映射。
#[derive(Debug, Default)]
pub struct HandleTable {
    entries: BTreeMap<u32, OpenFile>,
    next_fd: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_fd: FD_FIRST,
        }
    }

    /// 游标扫描分配一个描述符。表满则失败。
    pub fn allocate(&mut self, entry: OpenFile) -> Result<u32, FsError> {
        if self.next_fd < FD_FIRST || self.next_fd > FD_LIMIT {
            self.next_fd = FD_FIRST;
        }

        let capacity = FD_LIMIT - FD_FIRST + 1;
        for _ in 0..capacity {
            let fd = self.next_fd;
            self.next_fd = if fd >= FD_LIMIT { FD_FIRST } else { fd + 1 };
            if !self.entries.contains_key(&fd) {
                self.entries.insert(fd, entry);
                return Ok(fd);
            }
        }

        error!("no available file descriptors");
        Err(FsError::InvalidDescriptor)
    }

    pub fn get(&self, fd: u32) -> Result<&OpenFile, FsError> {
        match self.entries.get(&fd) {
            Some(entry) if entry.open => Ok(entry),
            _ => {
                error!("file descriptor not open: fd={fd}");
                Err(FsError::InvalidDescriptor)
            }
        }
    }

    pub fn get_mut(&mut self, fd: u32) -> Result<&mut OpenFile, FsError> {
        match self.entries.get_mut(&fd) {
            Some(entry) if entry.open => Ok(entry),
            _ => {
                error!("file descriptor not open: fd={fd}");
                Err(FsError::InvalidDescriptor)
            }
        }
    }

    pub fn release(&mut self, fd: u32) -> Result<OpenFile, FsError> {
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.open = false;
        }
        self.entries.remove(&fd).ok_or_else(|| {
            error!("invalid file descriptor: {fd}");
            FsError::InvalidDescriptor
        })
    }

    pub fn descriptors(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 从块序列的 `offset` 字节处读满 `buf`；
/// 块列表为空而请求非空、或任何一块读取失败都算错误。
pub fn read_from_blocks(
    disk: &DiskImage,
    blocks: &[u32],
    offset: usize,
    buf: &mut [u8],
) -> Result<(), FsError> {
    if blocks.is_empty() && !buf.is_empty() {
        error!("failed to read data blocks at offset {offset}");
        return Err(FsError::Io);
    }

    let mut copied = 0;
    let mut block_offset = offset % BLOCK_SIZE;
    let mut block = [0u8; BLOCK_SIZE];

    for block_num in blocks.iter().skip(offset / BLOCK_SIZE) {
        if copied == buf.len() {
            break;
        }
        disk.read_block(*block_num, &mut block)?;

        let take = (BLOCK_SIZE - block_offset).min(buf.len() - copied);
        buf[copied..copied + take].copy_from_slice(&block[block_offset..block_offset + take]);
        copied += take;
        block_offset = 0;
    }

    if copied != buf.len() {
        error!("failed to read data blocks at offset {offset}");
        return Err(FsError::Io);
    }
    Ok(())
}

/// 把 `data` 写进块序列的 `offset` 字节处。
/// 首尾被部分覆盖的块先读后写，整块覆盖则跳过读取。
pub fn write_to_blocks(
    disk: &DiskImage,
    blocks: &[u32],
    offset: usize,
    data: &[u8],
) -> Result<(), FsError> {
    if blocks.is_empty() && !data.is_empty() {
        error!("failed to write data blocks at offset {offset}");
        return Err(FsError::Io);
    }

    let mut written = 0;
    let mut block_offset = offset % BLOCK_SIZE;
    let mut block = [0u8; BLOCK_SIZE];

    for block_num in blocks.iter().skip(offset / BLOCK_SIZE) {
        if written == data.len() {
            break;
        }

        let partial = block_offset > 0 || data.len() - written < BLOCK_SIZE;
        if partial {
            disk.read_block(*block_num, &mut block)?;
        } else {
            block.fill(0);
        }

        let take = (BLOCK_SIZE - block_offset).min(data.len() - written);
        block[block_offset..block_offset + take].copy_from_slice(&data[written..written + take]);
        disk.write_block(*block_num, &block)?;

        written += take;
        block_offset = 0;
    }

    if written != data.len() {
        error!("failed to write data blocks at offset {offset}");
        return Err(FsError::Io);
    }
    Ok(())
}
