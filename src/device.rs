//! # 镜像设备层
//!
//! [`DiskImage`] 把一个宿主文件当作按块编址的磁盘：
//! 打开时对宿主文件加排它性建议锁，同一镜像同一时刻只允许一个进程挂载；
//! 块读写在内部互斥锁下完成定位与传输，因此块级操作彼此原子。

use std::fs::File;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use log::error;

use crate::layout::DiskLayout;
use crate::layout::SuperBlock;
use crate::Block;
use crate::FsError;
use crate::BLOCK_SIZE;

pub struct DiskImage {
    /// 宿主文件；互斥锁串行化全部 seek 与传输
    file: Mutex<Option<File>>,
    path: Option<PathBuf>,
    /// 镜像总长度（字节）
    size: u64,
    /// 镜像总块数（向下取整）
    total_blocks: u32,
}

impl Default for DiskImage {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskImage {
    pub fn new() -> Self {
        Self {
            file: Mutex::new(None),
            path: None,
            size: 0,
            total_blocks: 0,
        }
    }

    /// 创建一个新的镜像文件：定位到末尾写一个字节做稀疏扩展。
    /// 创建完成后镜像不处于打开状态。
    pub fn create(&self, path: impl AsRef<Path>, size_mb: u32) -> Result<(), FsError> {
        let path = path.as_ref();
        if self.is_open() {
            error!("create failed: a disk image is already open");
            return Err(FsError::AlreadyOpen);
        }
        if size_mb == 0 {
            error!("disk size must be a positive number");
            return Err(FsError::InvalidArgument);
        }

        let mut file = File::create(path).map_err(|err| {
            error!("failed to create disk image {}: {err}", path.display());
            FsError::Io
        })?;

        let size = u64::from(size_mb) * 1024 * 1024;
        file.seek(SeekFrom::Start(size - 1)).map_err(|err| {
            error!("failed to extend disk image: {err}");
            FsError::Io
        })?;
        file.write_all(&[0]).map_err(|err| {
            error!("failed to write the last byte of the disk image: {err}");
            FsError::Io
        })?;

        Ok(())
    }

    /// 打开已存在的镜像并取得宿主文件的排它锁；
    /// 锁被其它进程占用时立即失败而不是阻塞等待。
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let path = path.as_ref();
        if self.file.get_mut().unwrap().is_some() {
            error!("open failed: a disk image is already open");
            return Err(FsError::AlreadyOpen);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                error!("failed to open disk image {}: {err}", path.display());
                FsError::Io
            })?;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            error!("failed to lock disk image: {}", path.display());
            return Err(FsError::Io);
        }

        let size = file
            .metadata()
            .map_err(|err| {
                error!("failed to stat disk image: {err}");
                FsError::Io
            })?
            .len();

        self.size = size;
        self.total_blocks = (size / BLOCK_SIZE as u64) as u32;
        self.path = Some(path.to_owned());
        *self.file.get_mut().unwrap() = Some(file);
        Ok(())
    }

    /// 释放锁并关闭镜像。可重复调用。
    pub fn close(&mut self) {
        if let Some(file) = self.file.get_mut().unwrap().take() {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        self.path = None;
        self.size = 0;
        self.total_blocks = 0;
    }

    pub fn read_block(&self, block_num: u32, buf: &mut Block) -> Result<(), FsError> {
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or_else(|| {
            error!("I/O operation failed: disk not open");
            FsError::NotOpen
        })?;
        check_block(block_num, self.total_blocks)?;

        seek_to_block(file, block_num)?;
        file.read_exact(buf).map_err(|err| {
            error!("failed to read block {block_num}: {err}");
            FsError::Io
        })
    }

    pub fn write_block(&self, block_num: u32, buf: &Block) -> Result<(), FsError> {
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or_else(|| {
            error!("I/O operation failed: disk not open");
            FsError::NotOpen
        })?;
        check_block(block_num, self.total_blocks)?;

        seek_to_block(file, block_num)?;
        file.write_all(buf).map_err(|err| {
            error!("failed to write block {block_num}: {err}");
            FsError::Io
        })?;
        file.flush().map_err(|err| {
            error!("failed to flush block {block_num}: {err}");
            FsError::Io
        })
    }

    /// 格式化：写超级块，清零两张位图与 inode 表。
    /// 根目录的安置由门面在挂载/格式化后统一完成。
    pub fn format(&self) -> Result<(), FsError> {
        if !self.is_open() {
            error!("format failed: disk not open");
            return Err(FsError::NotOpen);
        }

        let layout = self.layout();
        let superblock = SuperBlock::new(&layout, self.total_blocks);
        let mut block = [0u8; BLOCK_SIZE];
        superblock.encode(&mut block);
        self.write_block(layout.superblock_start, &block)?;

        self.write_zeroed(layout.inode_bitmap_start, layout.inode_bitmap_blocks)?;
        self.write_zeroed(layout.data_bitmap_start, layout.data_bitmap_blocks)?;
        self.write_zeroed(layout.inode_table_start, layout.inode_table_blocks)?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().unwrap().is_some()
    }

    #[inline]
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 布局由总块数唯一决定，不落盘，每次重新计算
    #[inline]
    pub fn layout(&self) -> DiskLayout {
        DiskLayout::compute(self.total_blocks)
    }

    fn write_zeroed(&self, start_block: u32, num_blocks: u32) -> Result<(), FsError> {
        let zeroes = [0u8; BLOCK_SIZE];
        for i in 0..num_blocks {
            self.write_block(start_block + i, &zeroes)?;
        }
        Ok(())
    }
}

fn check_block(block_num: u32, total_blocks: u32) -> Result<(), FsError> {
    if block_num >= total_blocks {
        error!("I/O operation failed: invalid block number: {block_num}");
        return Err(FsError::InvalidBlock);
    }
    Ok(())
}

fn seek_to_block(file: &mut File, block_num: u32) -> Result<(), FsError> {
    let offset = u64::from(block_num) * BLOCK_SIZE as u64;
    file.seek(SeekFrom::Start(offset)).map_err(|err| {
        error!("failed to seek to block {block_num}: {err}");
        FsError::Io
    })?;
    Ok(())
}

impl Drop for DiskImage {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_produces_exact_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let disk = DiskImage::new();
        disk.create(&path, 4).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 1024 * 1024);
    }

    #[test]
    fn open_counts_blocks_and_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut disk = DiskImage::new();
        disk.create(&path, 4).unwrap();
        disk.open(&path).unwrap();
        assert_eq!(disk.total_blocks(), 1024);
        assert!(disk.is_open());

        disk.close();
        disk.close();
        assert!(!disk.is_open());
    }

    #[test]
    fn block_io_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut disk = DiskImage::new();
        disk.create(&path, 1).unwrap();
        disk.open(&path).unwrap();

        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        block[BLOCK_SIZE - 1] = 0xCD;
        disk.write_block(7, &block).unwrap();

        let mut back = [0u8; BLOCK_SIZE];
        disk.read_block(7, &mut back).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn io_rejects_out_of_range_and_unopened() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut disk = DiskImage::new();
        disk.create(&path, 1).unwrap();

        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(disk.read_block(0, &mut block), Err(FsError::NotOpen));

        disk.open(&path).unwrap();
        assert_eq!(
            disk.read_block(disk.total_blocks(), &mut block),
            Err(FsError::InvalidBlock)
        );
    }

    #[test]
    fn second_open_fails_while_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut first = DiskImage::new();
        first.create(&path, 1).unwrap();
        first.open(&path).unwrap();

        let mut second = DiskImage::new();
        assert_eq!(second.open(&path), Err(FsError::Io));
    }
}
