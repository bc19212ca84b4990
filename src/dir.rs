//! # 目录编码层
//!
//! 目录就是 payload 为定长目录项数组的 inode。本层在 inode 仓库
//! 之上提供按名增删查；重写只增不缩，条目删除后尾部块保持占用。

use log::error;

use crate::layout::{DirEntry, DIR_ENTRY_SIZE, ENTRIES_PER_BLOCK};
use crate::DiskImage;
use crate::FsError;
use crate::InodeStore;
use crate::BLOCK_SIZE;

/// 读出目录的全部存活条目，按块序排列。
pub fn read_dir(
    store: &InodeStore,
    disk: &DiskImage,
    inode_num: u32,
) -> Result<Vec<DirEntry>, FsError> {
    let inode = store.read_inode(disk, inode_num)?;
    if !inode.is_dir() {
        error!("inode is not a directory: {inode_num}");
        return Err(FsError::NotADirectory);
    }

    if inode.size == 0 {
        return Ok(Vec::new());
    }

    let blocks = store.data_blocks(disk, inode_num)?;
    let mut entries = Vec::new();
    let mut block = [0u8; BLOCK_SIZE];

    for block_num in blocks {
        disk.read_block(block_num, &mut block)?;
        for slot in 0..ENTRIES_PER_BLOCK {
            let entry = DirEntry::decode(&block[slot * DIR_ENTRY_SIZE..]);
            if entry.is_live() {
                entries.push(entry);
            }
        }
    }

    Ok(entries)
}

/// 整体重写目录：不足的块就地补齐，块缓冲先清零再填充，
/// 末尾空槽因此保持干净；随后更新目录 inode 的大小与修改时间。
pub fn write_dir(
    store: &InodeStore,
    disk: &DiskImage,
    inode_num: u32,
    entries: &[DirEntry],
) -> Result<(), FsError> {
    let required_size = entries.len() * DIR_ENTRY_SIZE;
    let required_blocks = required_size.div_ceil(BLOCK_SIZE);

    let mut blocks = store.data_blocks(disk, inode_num)?;
    if blocks.len() < required_blocks {
        let deficit = (required_blocks - blocks.len()) as u32;
        store
            .allocate_data_blocks(disk, inode_num, deficit)
            .map_err(|err| {
                error!("failed to allocate additional blocks for directory");
                err
            })?;
        blocks = store.data_blocks(disk, inode_num)?;
    }

    let mut pending = entries.iter();
    for block_num in &blocks {
        let mut block = [0u8; BLOCK_SIZE];
        for slot in 0..ENTRIES_PER_BLOCK {
            let Some(entry) = pending.next() else { break };
            entry.encode(&mut block[slot * DIR_ENTRY_SIZE..slot * DIR_ENTRY_SIZE + DIR_ENTRY_SIZE]);
        }
        disk.write_block(*block_num, &block)?;
    }

    // 块分配已重写过 inode，重读后再落大小，避免覆盖新指针
    let mut inode = store.read_inode(disk, inode_num)?;
    inode.size = required_size as i64;
    inode.mtime = crate::unix_now();
    store.write_inode(disk, inode_num, &inode)
}

/// 追加一个条目；重名拒绝。
pub fn add_entry(
    store: &InodeStore,
    disk: &DiskImage,
    dir_inode: u32,
    name: &str,
    inode_num: u32,
) -> Result<(), FsError> {
    let mut entries = read_dir(store, disk, dir_inode)?;

    if find_entry(&entries, name).is_some() {
        error!("directory entry already exists: {name}");
        return Err(FsError::AlreadyExists);
    }

    entries.push(DirEntry::new(name, inode_num));
    write_dir(store, disk, dir_inode, &entries)
}

/// 按名移除一个条目并重写目录。
pub fn remove_entry(
    store: &InodeStore,
    disk: &DiskImage,
    dir_inode: u32,
    name: &str,
) -> Result<(), FsError> {
    let mut entries = read_dir(store, disk, dir_inode)?;

    let Some(index) = find_entry(&entries, name) else {
        error!("directory entry not found: {name}");
        return Err(FsError::NotFound);
    };

    entries.remove(index);
    write_dir(store, disk, dir_inode, &entries)
}

pub(crate) fn find_entry(entries: &[DirEntry], name: &str) -> Option<usize> {
    entries.iter().position(|entry| entry.matches(name))
}
