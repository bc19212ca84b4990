//! # inode 仓库层
//!
//! 持有两张位图与磁盘布局，负责 inode 的分配回收、在盘 inode 的
//! 读写，以及直接 / 一级间接 / 二级间接三级块寻址。
//!
//! 约定：每次成功的变更都把相应位图写回镜像；已改位图而后续步骤
//! 失败时，回滚本次的位翻转再返回错误。

use log::error;

use crate::layout::block_ptr;
use crate::layout::{DiskInode, DiskLayout, INODES_PER_BLOCK, INODE_SIZE};
use crate::layout::{get_i32, put_i32};
use crate::unix_now;
use crate::Bitmap;
use crate::DiskImage;
use crate::FsError;
use crate::BLOCK_SIZE;
use crate::INDIRECT_COUNT;
use crate::MAX_FILE_BLOCKS;

pub struct InodeStore {
    layout: DiskLayout,
    inode_bitmap: Bitmap,
    data_bitmap: Bitmap,
}

impl InodeStore {
    pub fn new(layout: DiskLayout) -> Result<Self, FsError> {
        Ok(Self {
            inode_bitmap: Bitmap::new(layout.total_inodes())?,
            data_bitmap: Bitmap::new(layout.data_blocks_count)?,
            layout,
        })
    }

    /// 从镜像装载两张位图。
    pub fn load(&self, disk: &DiskImage) -> Result<(), FsError> {
        self.inode_bitmap.load_from(
            disk,
            self.layout.inode_bitmap_start,
            self.layout.inode_bitmap_blocks,
        )?;
        self.data_bitmap.load_from(
            disk,
            self.layout.data_bitmap_start,
            self.layout.data_bitmap_blocks,
        )
    }

    #[inline]
    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    #[inline]
    pub fn total_inodes(&self) -> u32 {
        self.inode_bitmap.total()
    }

    #[inline]
    pub fn free_inodes(&self) -> u32 {
        self.inode_bitmap.free_count()
    }

    #[inline]
    pub fn total_data_blocks(&self) -> u32 {
        self.data_bitmap.total()
    }

    #[inline]
    pub fn free_data_blocks(&self) -> u32 {
        self.data_bitmap.free_count()
    }

    /// 位图是 inode 存活与否的唯一权威。
    #[inline]
    pub fn is_inode_allocated(&self, inode_num: u32) -> bool {
        self.inode_bitmap.is_set(inode_num)
    }

    /// 分配一个空闲 inode，写入零值模板并持久化 inode 位图。
    pub fn allocate_inode(&self, disk: &DiskImage) -> Result<u32, FsError> {
        let inode_num = self.inode_bitmap.allocate().ok_or_else(|| {
            error!("no free inodes available");
            FsError::NoFreeInodes
        })?;

        let template = DiskInode::new(Default::default(), 1);
        if let Err(err) = self.write_inode(disk, inode_num, &template) {
            error!("failed to write newly allocated inode: {inode_num}");
            let _ = self.inode_bitmap.free(inode_num);
            return Err(err);
        }

        if let Err(err) = self.save_inode_bitmap(disk) {
            error!("failed to save inode bitmap to disk");
            let _ = self.inode_bitmap.free(inode_num);
            return Err(err);
        }

        Ok(inode_num)
    }

    /// 回收 inode：释放其可达的全部数据块与间接元数据块，
    /// 写回全零记录，清位并持久化两张位图。
    pub fn free_inode(&self, disk: &DiskImage, inode_num: u32) -> Result<(), FsError> {
        if !self.is_inode_allocated(inode_num) {
            error!("inode {inode_num} is not allocated");
            return Err(FsError::InvalidArgument);
        }

        let inode = self.read_inode(disk, inode_num)?;
        self.release_all_blocks(disk, &inode)?;
        self.write_inode(disk, inode_num, &DiskInode::zeroed())?;
        self.save_data_bitmap(disk)?;

        self.inode_bitmap.free(inode_num)?;
        self.save_inode_bitmap(disk)
    }

    pub fn read_inode(&self, disk: &DiskImage, inode_num: u32) -> Result<DiskInode, FsError> {
        let (block_num, offset) = self.inode_position(inode_num)?;
        let mut block = [0u8; BLOCK_SIZE];
        disk.read_block(block_num, &mut block)?;
        Ok(DiskInode::decode(&block[offset..offset + INODE_SIZE]))
    }

    /// 写 inode 必须读-改-写所在块，保全同块的其它 inode。
    pub fn write_inode(
        &self,
        disk: &DiskImage,
        inode_num: u32,
        inode: &DiskInode,
    ) -> Result<(), FsError> {
        let (block_num, offset) = self.inode_position(inode_num)?;
        let mut block = [0u8; BLOCK_SIZE];
        disk.read_block(block_num, &mut block)?;
        inode.encode(&mut block[offset..offset + INODE_SIZE]);
        disk.write_block(block_num, &block)
    }

    /// 按逻辑顺序收集 inode 的全部数据块：
    /// 直接块，然后一级间接，最后二级间接。
    pub fn data_blocks(&self, disk: &DiskImage, inode_num: u32) -> Result<Vec<u32>, FsError> {
        let inode = self.read_inode(disk, inode_num)?;
        self.collect_blocks(disk, &inode)
    }

    /// 为 inode 追加 `count` 个数据块并返回新块的绝对块号。
    ///
    /// 指针更新是整体重排：旧块列表并上新块，重新摊入
    /// 直接 → 一级间接 → 二级间接槽位，被替换下来的旧间接
    /// 元数据块在重排成功后归还。任何失败都会释放本次占用的位。
    pub fn allocate_data_blocks(
        &self,
        disk: &DiskImage,
        inode_num: u32,
        count: u32,
    ) -> Result<Vec<u32>, FsError> {
        if count == 0 {
            error!("data block allocation requires a positive count");
            return Err(FsError::InvalidArgument);
        }

        let inode = self.read_inode(disk, inode_num)?;
        let existing = self.collect_blocks(disk, &inode)?;

        if existing.len() + count as usize > MAX_FILE_BLOCKS {
            error!("file size exceeds double indirect block limit");
            return Err(FsError::DiskFull);
        }

        // 一次性预定全部新块，不足则整体回滚
        let mut fresh = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.data_bitmap.allocate() {
                Some(bit) => fresh.push(self.layout.data_blocks_start + bit),
                None => {
                    self.release_blocks(&fresh);
                    error!("failed to allocate {count} data blocks");
                    return Err(FsError::NoFreeBlocks);
                }
            }
        }

        let mut combined = existing;
        combined.extend_from_slice(&fresh);

        let old_meta = self.collect_meta_blocks(disk, &inode)?;
        let mut new_meta = Vec::new();
        if let Err(err) = self.relayout(disk, inode_num, &inode, &combined, &mut new_meta) {
            error!("failed to update block pointers for inode {inode_num}");
            self.release_blocks(&fresh);
            self.release_blocks(&new_meta);
            return Err(err);
        }

        self.release_blocks(&old_meta);
        self.save_data_bitmap(disk)?;
        Ok(fresh)
    }

    pub(crate) fn save_inode_bitmap(&self, disk: &DiskImage) -> Result<(), FsError> {
        self.inode_bitmap.save_to(
            disk,
            self.layout.inode_bitmap_start,
            self.layout.inode_bitmap_blocks,
        )
    }

    pub(crate) fn save_data_bitmap(&self, disk: &DiskImage) -> Result<(), FsError> {
        self.data_bitmap.save_to(
            disk,
            self.layout.data_bitmap_start,
            self.layout.data_bitmap_blocks,
        )
    }

    fn inode_position(&self, inode_num: u32) -> Result<(u32, usize), FsError> {
        if inode_num >= self.total_inodes() {
            error!("invalid inode number: {inode_num}");
            return Err(FsError::InvalidInode);
        }
        let block_num = self.layout.inode_table_start + inode_num / INODES_PER_BLOCK as u32;
        let offset = (inode_num as usize % INODES_PER_BLOCK) * INODE_SIZE;
        Ok((block_num, offset))
    }

    fn collect_blocks(&self, disk: &DiskImage, inode: &DiskInode) -> Result<Vec<u32>, FsError> {
        let mut blocks = Vec::new();

        for slot in inode.direct {
            if let Some(block_num) = block_ptr(slot) {
                blocks.push(block_num);
            }
        }

        if let Some(indirect) = block_ptr(inode.indirect) {
            blocks.extend(self.read_indirect(disk, indirect)?);
        }

        if let Some(double_indirect) = block_ptr(inode.double_indirect) {
            for sub in self.read_indirect(disk, double_indirect)? {
                blocks.extend(self.read_indirect(disk, sub)?);
            }
        }

        Ok(blocks)
    }

    /// 收集旧的间接元数据块（不含数据块本身）
    fn collect_meta_blocks(&self, disk: &DiskImage, inode: &DiskInode) -> Result<Vec<u32>, FsError> {
        let mut meta = Vec::new();
        if let Some(indirect) = block_ptr(inode.indirect) {
            meta.push(indirect);
        }
        if let Some(double_indirect) = block_ptr(inode.double_indirect) {
            meta.extend(self.read_indirect(disk, double_indirect)?);
            meta.push(double_indirect);
        }
        Ok(meta)
    }

    /// 把完整块列表重新摊入三级槽位并写回 inode。
    /// 新建的间接元数据块记入 `new_meta` 供调用者回滚。
    fn relayout(
        &self,
        disk: &DiskImage,
        inode_num: u32,
        base: &DiskInode,
        blocks: &[u32],
        new_meta: &mut Vec<u32>,
    ) -> Result<(), FsError> {
        let mut inode = *base;
        inode.direct = [0; crate::DIRECT_COUNT];
        inode.indirect = -1;
        inode.double_indirect = -1;

        for (slot, block_num) in inode.direct.iter_mut().zip(blocks) {
            *slot = *block_num as i32;
        }

        if blocks.len() > inode.direct.len() {
            let rest = &blocks[inode.direct.len()..];

            let indirect = self.allocate_meta_block(disk)?;
            new_meta.push(indirect);
            self.write_indirect(disk, indirect, &rest[..rest.len().min(INDIRECT_COUNT)])?;
            inode.indirect = indirect as i32;

            if rest.len() > INDIRECT_COUNT {
                let tail = &rest[INDIRECT_COUNT..];

                let double_indirect = self.allocate_meta_block(disk)?;
                new_meta.push(double_indirect);

                let mut subs = Vec::new();
                for chunk in tail.chunks(INDIRECT_COUNT) {
                    let sub = self.allocate_meta_block(disk)?;
                    new_meta.push(sub);
                    self.write_indirect(disk, sub, chunk)?;
                    subs.push(sub);
                }
                self.write_indirect(disk, double_indirect, &subs)?;
                inode.double_indirect = double_indirect as i32;
            }
        }

        inode.mtime = unix_now();
        self.write_inode(disk, inode_num, &inode)
    }

    /// 间接块内是从块首致密排列的 32 位块号，0 槽终止枚举。
    fn read_indirect(&self, disk: &DiskImage, block_num: u32) -> Result<Vec<u32>, FsError> {
        let mut block = [0u8; BLOCK_SIZE];
        disk.read_block(block_num, &mut block)?;

        let mut blocks = Vec::new();
        for i in 0..INDIRECT_COUNT {
            match block_ptr(get_i32(&block, i * 4)) {
                Some(block_num) => blocks.push(block_num),
                None => break,
            }
        }
        Ok(blocks)
    }

    fn write_indirect(
        &self,
        disk: &DiskImage,
        block_num: u32,
        blocks: &[u32],
    ) -> Result<(), FsError> {
        let mut block = [0u8; BLOCK_SIZE];
        for (i, entry) in blocks.iter().take(INDIRECT_COUNT).enumerate() {
            put_i32(&mut block, i * 4, *entry as i32);
        }
        disk.write_block(block_num, &block)
    }

    /// 为间接元数据分配一个清零的数据区块。
    fn allocate_meta_block(&self, disk: &DiskImage) -> Result<u32, FsError> {
        let bit = self.data_bitmap.allocate().ok_or(FsError::NoFreeBlocks)?;
        let block_num = self.layout.data_blocks_start + bit;

        let zeroes = [0u8; BLOCK_SIZE];
        if let Err(err) = disk.write_block(block_num, &zeroes) {
            let _ = self.data_bitmap.free(bit);
            return Err(err);
        }
        Ok(block_num)
    }

    fn release_all_blocks(&self, disk: &DiskImage, inode: &DiskInode) -> Result<(), FsError> {
        for slot in inode.direct {
            if let Some(block_num) = block_ptr(slot) {
                self.release_data_block(block_num);
            }
        }

        if let Some(indirect) = block_ptr(inode.indirect) {
            for block_num in self.read_indirect(disk, indirect)? {
                self.release_data_block(block_num);
            }
            self.release_data_block(indirect);
        }

        // 二级间接：先放数据块，再放每个一级块，最后放二级块自身
        if let Some(double_indirect) = block_ptr(inode.double_indirect) {
            for sub in self.read_indirect(disk, double_indirect)? {
                for block_num in self.read_indirect(disk, sub)? {
                    self.release_data_block(block_num);
                }
                self.release_data_block(sub);
            }
            self.release_data_block(double_indirect);
        }

        Ok(())
    }

    fn release_data_block(&self, block_num: u32) {
        if block_num >= self.layout.data_blocks_start {
            let _ = self.data_bitmap.free(block_num - self.layout.data_blocks_start);
        }
    }

    fn release_blocks(&self, blocks: &[u32]) {
        for block_num in blocks {
            self.release_data_block(*block_num);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DIRECT_COUNT;
    use tempfile::tempdir;

    fn fresh_store(size_mb: u32) -> (tempfile::TempDir, DiskImage, InodeStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = DiskImage::new();
        disk.create(&path, size_mb).unwrap();
        disk.open(&path).unwrap();
        disk.format().unwrap();

        let store = InodeStore::new(disk.layout()).unwrap();
        store.load(&disk).unwrap();
        (dir, disk, store)
    }

    #[test]
    fn inode_allocation_persists_and_rolls_forward() {
        let (_dir, disk, store) = fresh_store(4);

        let first = store.allocate_inode(&disk).unwrap();
        let second = store.allocate_inode(&disk).unwrap();
        assert_eq!((first, second), (0, 1));
        assert_eq!(store.free_inodes(), store.total_inodes() - 2);

        // 位图已持久化:重新装载后仍然占用
        let reloaded = InodeStore::new(disk.layout()).unwrap();
        reloaded.load(&disk).unwrap();
        assert!(reloaded.is_inode_allocated(0));
        assert!(reloaded.is_inode_allocated(1));
        assert!(!reloaded.is_inode_allocated(2));
    }

    #[test]
    fn write_inode_preserves_neighbours() {
        let (_dir, disk, store) = fresh_store(4);
        let a = store.allocate_inode(&disk).unwrap();
        let b = store.allocate_inode(&disk).unwrap();

        let mut inode = store.read_inode(&disk, b).unwrap();
        inode.size = 4242;
        store.write_inode(&disk, b, &inode).unwrap();

        let other = store.read_inode(&disk, a).unwrap();
        assert_eq!(other.size, 0);
        assert_eq!(other.links, 1);
        assert_eq!(store.read_inode(&disk, b).unwrap().size, 4242);
    }

    #[test]
    fn allocation_spills_into_indirect_tiers() {
        let (_dir, disk, store) = fresh_store(8);
        let inode_num = store.allocate_inode(&disk).unwrap();

        // 直接槽装满:无间接块
        store
            .allocate_data_blocks(&disk, inode_num, DIRECT_COUNT as u32)
            .unwrap();
        let inode = store.read_inode(&disk, inode_num).unwrap();
        assert_eq!(inode.indirect, -1);
        assert_eq!(
            store.data_blocks(&disk, inode_num).unwrap().len(),
            DIRECT_COUNT
        );

        // 再加一块:溢出到一级间接
        store.allocate_data_blocks(&disk, inode_num, 1).unwrap();
        let inode = store.read_inode(&disk, inode_num).unwrap();
        assert!(inode.indirect > 0);
        assert_eq!(inode.double_indirect, -1);

        let blocks = store.data_blocks(&disk, inode_num).unwrap();
        assert_eq!(blocks.len(), DIRECT_COUNT + 1);

        // 越过一级间接容量:动用二级间接
        store
            .allocate_data_blocks(&disk, inode_num, INDIRECT_COUNT as u32)
            .unwrap();
        let inode = store.read_inode(&disk, inode_num).unwrap();
        assert!(inode.double_indirect > 0);
        assert_eq!(
            store.data_blocks(&disk, inode_num).unwrap().len(),
            DIRECT_COUNT + 1 + INDIRECT_COUNT
        );
    }

    #[test]
    fn relayout_keeps_logical_order() {
        let (_dir, disk, store) = fresh_store(8);
        let inode_num = store.allocate_inode(&disk).unwrap();

        store.allocate_data_blocks(&disk, inode_num, 3).unwrap();
        let before = store.data_blocks(&disk, inode_num).unwrap();
        store.allocate_data_blocks(&disk, inode_num, 20).unwrap();
        let after = store.data_blocks(&disk, inode_num).unwrap();

        assert_eq!(&after[..3], &before[..]);
        assert_eq!(after.len(), 23);
    }

    #[test]
    fn free_inode_returns_every_block() {
        let (_dir, disk, store) = fresh_store(8);
        let free_before = store.free_data_blocks();

        let inode_num = store.allocate_inode(&disk).unwrap();
        // 足够深入二级间接,检验整棵寻址树都被归还
        store
            .allocate_data_blocks(&disk, inode_num, (DIRECT_COUNT + INDIRECT_COUNT + 3) as u32)
            .unwrap();
        assert!(store.free_data_blocks() < free_before);

        store.free_inode(&disk, inode_num).unwrap();
        assert_eq!(store.free_data_blocks(), free_before);
        assert!(!store.is_inode_allocated(inode_num));
        assert!(!store.read_inode(&disk, inode_num).unwrap().is_live());
    }

    #[test]
    fn freeing_an_unallocated_inode_fails() {
        let (_dir, disk, store) = fresh_store(4);
        assert_eq!(store.free_inode(&disk, 5), Err(FsError::InvalidArgument));
    }

    #[test]
    fn exhausting_data_blocks_rolls_back() {
        let (_dir, disk, store) = fresh_store(4);
        let inode_num = store.allocate_inode(&disk).unwrap();
        let free_before = store.free_data_blocks();

        let err = store
            .allocate_data_blocks(&disk, inode_num, free_before + 1)
            .unwrap_err();
        assert_eq!(err, FsError::NoFreeBlocks);
        assert_eq!(store.free_data_blocks(), free_before);
    }
}
