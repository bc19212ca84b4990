//! # 位图层
//!
//! 第 k 位为 1 表示第 k 个资源已被占用。位在字节内按小端排布
//! （`byte = bit / 8`，`offset = bit % 8`）。缓存的空闲计数让
//! `free_count` / `used` 查询保持 O(1)；全部操作经内部互斥锁。
//!
//! 持久化时只持设备锁：落盘前在位图锁内做快照，装载后按实际位
//! 重新统计空闲数，以容忍镜像上可能的不一致。

use std::sync::Mutex;

use log::error;

use crate::DiskImage;
use crate::FsError;
use crate::BLOCK_SIZE;

pub struct Bitmap {
    total: u32,
    inner: Mutex<BitmapInner>,
}

struct BitmapInner {
    bits: Vec<u8>,
    free: u32,
}

impl Bitmap {
    /// 建立管理 `total` 个资源的位图，所有位初始为空闲。
    pub fn new(total: u32) -> Result<Self, FsError> {
        let len = (total as usize).div_ceil(8);
        let mut bits = Vec::new();
        if bits.try_reserve_exact(len).is_err() {
            error!("failed to allocate memory for bitmap");
            return Err(FsError::OutOfMemory);
        }
        bits.resize(len, 0);

        Ok(Self {
            total,
            inner: Mutex::new(BitmapInner { bits, free: total }),
        })
    }

    /// 占用编号最小的空闲位并返回其编号。
    pub fn allocate(&self) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free == 0 {
            return None;
        }

        // 按字节跳过全满区段
        for index in 0..inner.bits.len() {
            let byte = inner.bits[index];
            if byte == u8::MAX {
                continue;
            }
            let bit = index as u32 * 8 + byte.trailing_ones();
            if bit >= self.total {
                break;
            }
            inner.bits[index] |= 1 << (bit % 8);
            inner.free -= 1;
            return Some(bit);
        }

        None
    }

    /// 释放一个位。释放本就空闲的位是静默无操作。
    pub fn free(&self, bit: u32) -> Result<(), FsError> {
        if bit >= self.total {
            error!("invalid bit number to free: {bit}");
            return Err(FsError::InvalidArgument);
        }

        let mut inner = self.inner.lock().unwrap();
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        if inner.bits[byte] & mask != 0 {
            inner.bits[byte] &= !mask;
            inner.free += 1;
        }
        Ok(())
    }

    pub fn is_set(&self, bit: u32) -> bool {
        if bit >= self.total {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        inner.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn free_count(&self) -> u32 {
        self.inner.lock().unwrap().free
    }

    pub fn used(&self) -> u32 {
        self.total - self.free_count()
    }

    /// 清空所有位
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.bits.fill(0);
        inner.free = self.total;
    }

    /// 从镜像的连续块装载位图字节，随后重算空闲计数。
    pub fn load_from(
        &self,
        disk: &DiskImage,
        start_block: u32,
        num_blocks: u32,
    ) -> Result<(), FsError> {
        let byte_len = (self.total as usize).div_ceil(8);
        let mut data = Vec::with_capacity(byte_len);
        let mut block = [0u8; BLOCK_SIZE];

        for i in 0..num_blocks {
            let remaining = byte_len - data.len();
            if remaining == 0 {
                break;
            }
            disk.read_block(start_block + i, &mut block).map_err(|err| {
                error!("failed to read bitmap block: {}", start_block + i);
                err
            })?;
            data.extend_from_slice(&block[..remaining.min(BLOCK_SIZE)]);
        }

        let mut inner = self.inner.lock().unwrap();
        let len = data.len().min(inner.bits.len());
        inner.bits[..len].copy_from_slice(&data[..len]);
        inner.free = self.total - count_used(&inner.bits, self.total);
        Ok(())
    }

    /// 把位图字节流入镜像的连续块，末块尾部补零。
    pub fn save_to(
        &self,
        disk: &DiskImage,
        start_block: u32,
        num_blocks: u32,
    ) -> Result<(), FsError> {
        let snapshot = self.inner.lock().unwrap().bits.clone();

        let mut offset = 0;
        for i in 0..num_blocks {
            let mut block = [0u8; BLOCK_SIZE];
            if offset < snapshot.len() {
                let take = (snapshot.len() - offset).min(BLOCK_SIZE);
                block[..take].copy_from_slice(&snapshot[offset..offset + take]);
                offset += take;
            }
            disk.write_block(start_block + i, &block).map_err(|err| {
                error!("failed to write bitmap block: {}", start_block + i);
                err
            })?;
        }
        Ok(())
    }
}

/// 统计前 `total` 位中已占用的数量，末字节按掩码截断
fn count_used(bits: &[u8], total: u32) -> u32 {
    let mut used = 0;
    for (index, byte) in bits.iter().enumerate() {
        let base = index as u32 * 8;
        if base >= total {
            break;
        }
        let value = if base + 8 <= total {
            *byte
        } else {
            byte & ((1u8 << (total - base)) - 1)
        };
        used += value.count_ones();
    }
    used
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocates_lowest_free_bit() {
        let bitmap = Bitmap::new(20).unwrap();
        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.allocate(), Some(1));
        bitmap.free(0).unwrap();
        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.allocate(), Some(2));
        assert_eq!(bitmap.free_count(), 17);
    }

    #[test]
    fn exhaustion_returns_none() {
        let bitmap = Bitmap::new(9).unwrap();
        for expected in 0..9 {
            assert_eq!(bitmap.allocate(), Some(expected));
        }
        assert_eq!(bitmap.allocate(), None);
        assert_eq!(bitmap.free_count(), 0);
        assert_eq!(bitmap.used(), 9);
    }

    #[test]
    fn freeing_a_clear_bit_is_a_no_op() {
        let bitmap = Bitmap::new(8).unwrap();
        bitmap.free(3).unwrap();
        assert_eq!(bitmap.free_count(), 8);
        assert_eq!(bitmap.free(8), Err(FsError::InvalidArgument));
    }

    #[test]
    fn clear_resets_everything() {
        let bitmap = Bitmap::new(16).unwrap();
        for _ in 0..5 {
            let _ = bitmap.allocate();
        }
        bitmap.clear();
        assert_eq!(bitmap.free_count(), 16);
        assert!(!bitmap.is_set(0));
    }

    #[test]
    fn save_and_load_round_trip_recomputes_free_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = DiskImage::new();
        disk.create(&path, 1).unwrap();
        disk.open(&path).unwrap();

        let bitmap = Bitmap::new(1000).unwrap();
        for _ in 0..123 {
            let _ = bitmap.allocate();
        }
        bitmap.save_to(&disk, 2, 1).unwrap();

        let restored = Bitmap::new(1000).unwrap();
        restored.load_from(&disk, 2, 1).unwrap();
        assert_eq!(restored.free_count(), 1000 - 123);
        assert!(restored.is_set(122));
        assert!(!restored.is_set(123));
    }
}
