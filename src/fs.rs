//! # 文件系统门面
//!
//! 引擎唯一对外表面。把设备、位图、inode 仓库、目录与路径各层
//! 拢在一把读写锁之后：只读操作（存在性、列目录、磁盘信息）走
//! 共享锁，其余一律独占。调用方传入规范化前的路径即可，
//! 门面统一规范化。

use std::path::Path;
use std::sync::RwLock;

use enumflags2::BitFlags;
use log::{error, warn};

use crate::dir;
use crate::file;
use crate::file::{HandleTable, OpenFile, OpenMode};
use crate::layout::{DirEntry, DiskInode, ModeFlag, SuperBlock};
use crate::path;
use crate::path::ROOT_INODE;
use crate::unix_now;
use crate::DiskImage;
use crate::FsError;
use crate::InodeStore;
use crate::BLOCK_SIZE;

pub struct MindFileSystem {
    core: RwLock<FsCore>,
}

struct FsCore {
    disk: DiskImage,
    store: Option<InodeStore>,
    superblock: Option<SuperBlock>,
    handles: HandleTable,
    mounted: bool,
}

impl Default for MindFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MindFileSystem {
    pub fn new() -> Self {
        Self {
            core: RwLock::new(FsCore {
                disk: DiskImage::new(),
                store: None,
                superblock: None,
                handles: HandleTable::new(),
                mounted: false,
            }),
        }
    }

    /// 创建镜像文件；不挂载。
    pub fn create_image(&self, image_path: impl AsRef<Path>, size_mb: u32) -> Result<(), FsError> {
        self.core.write().unwrap().disk.create(image_path, size_mb)
    }

    /// 挂载：打开镜像、校验超级块、装载位图、安置根目录。
    pub fn mount(&self, image_path: impl AsRef<Path>) -> Result<(), FsError> {
        self.core.write().unwrap().mount(image_path.as_ref())
    }

    /// 卸载：关闭全部描述符后关闭镜像。
    pub fn unmount(&self) -> Result<(), FsError> {
        self.core.write().unwrap().unmount()
    }

    /// 格式化已挂载的镜像并重新安置根目录。
    pub fn format(&self) -> Result<(), FsError> {
        self.core.write().unwrap().format()
    }

    pub fn is_mounted(&self) -> bool {
        self.core.read().unwrap().mounted
    }

    /// 创建普通文件，返回其 inode 编号。
    pub fn create_file(&self, file_path: &str, perms: BitFlags<ModeFlag>) -> Result<u32, FsError> {
        let file_path = path::normalize(file_path);
        self.core.write().unwrap().create_file(&file_path, perms)
    }

    /// 删除普通文件；目录请用 [`remove_directory`](Self::remove_directory)。
    pub fn delete_file(&self, file_path: &str) -> Result<(), FsError> {
        let file_path = path::normalize(file_path);
        self.core.write().unwrap().delete_file(&file_path)
    }

    pub fn file_exists(&self, file_path: &str) -> bool {
        let file_path = path::normalize(file_path);
        self.core.read().unwrap().file_exists(&file_path)
    }

    /// 打开文件并返回描述符。
    pub fn open_file(&self, file_path: &str, mode: BitFlags<OpenMode>) -> Result<u32, FsError> {
        let file_path = path::normalize(file_path);
        self.core.write().unwrap().open_file(&file_path, mode)
    }

    pub fn close_file(&self, fd: u32) -> Result<(), FsError> {
        self.core.write().unwrap().close_file(fd)
    }

    /// 从当前位置读，返回实际读到的字节数（到尾为 0）。
    pub fn read_file(&self, fd: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.core.write().unwrap().read_file(fd, buf)
    }

    /// 向当前位置写，必要时扩展文件，返回写入的字节数。
    pub fn write_file(&self, fd: u32, data: &[u8]) -> Result<usize, FsError> {
        self.core.write().unwrap().write_file(fd, data)
    }

    /// 定位读写位置，接受 `0 ..= 文件大小`。
    pub fn seek_file(&self, fd: u32, position: i64) -> Result<(), FsError> {
        self.core.write().unwrap().seek_file(fd, position)
    }

    pub fn create_directory(&self, dir_path: &str) -> Result<(), FsError> {
        let dir_path = path::normalize(dir_path);
        self.core.write().unwrap().create_directory(&dir_path)
    }

    /// 删除空目录；根目录与非空目录都会被拒绝。
    pub fn remove_directory(&self, dir_path: &str) -> Result<(), FsError> {
        let dir_path = path::normalize(dir_path);
        self.core.write().unwrap().remove_directory(&dir_path)
    }

    pub fn list_directory(&self, dir_path: &str) -> Result<Vec<DirEntry>, FsError> {
        let dir_path = path::normalize(dir_path);
        self.core.read().unwrap().list_directory(&dir_path)
    }

    /// 人读的磁盘概览。
    pub fn get_disk_info(&self) -> Result<String, FsError> {
        self.core.read().unwrap().disk_info()
    }

    pub fn is_directory(&self, dir_path: &str) -> bool {
        let dir_path = path::normalize(dir_path);
        self.core.read().unwrap().is_directory(&dir_path)
    }

    pub fn find_inode(&self, file_path: &str) -> Result<u32, FsError> {
        let file_path = path::normalize(file_path);
        self.core.read().unwrap().find_inode(&file_path)
    }

    #[inline]
    pub fn get_parent_path(&self, file_path: &str) -> String {
        path::parent_path(file_path)
    }

    #[inline]
    pub fn get_basename(&self, file_path: &str) -> String {
        path::basename(file_path)
    }
}

impl FsCore {
    fn ensure_mounted(&self, operation: &str) -> Result<(), FsError> {
        if self.mounted {
            return Ok(());
        }
        error!("{operation} requires a mounted file system to proceed");
        Err(FsError::NotMounted)
    }

    fn store(&self) -> Result<&InodeStore, FsError> {
        self.store.as_ref().ok_or(FsError::NotMounted)
    }

    fn mount(&mut self, image_path: &Path) -> Result<(), FsError> {
        if self.mounted {
            error!("file system already mounted");
            return Err(FsError::AlreadyMounted);
        }

        self.disk.open(image_path)?;
        if let Err(err) = self.init_after_open() {
            self.disk.close();
            return Err(err);
        }

        self.mounted = true;
        Ok(())
    }

    fn init_after_open(&mut self) -> Result<(), FsError> {
        let superblock = load_superblock(&self.disk)?;

        let store = InodeStore::new(self.disk.layout())?;
        store.load(&self.disk)?;
        ensure_root(&self.disk, &store)?;

        self.superblock = Some(superblock);
        self.store = Some(store);
        Ok(())
    }

    fn unmount(&mut self) -> Result<(), FsError> {
        self.ensure_mounted("unmount")?;

        self.close_all_files();
        self.disk.close();
        self.store = None;
        self.superblock = None;
        self.mounted = false;
        Ok(())
    }

    fn format(&mut self) -> Result<(), FsError> {
        self.ensure_mounted("format")?;

        self.disk.format()?;
        self.superblock = Some(load_superblock(&self.disk)?);

        let store = self.store()?;
        store.load(&self.disk)?;
        if ensure_root(&self.disk, store).is_err() {
            error!("failed to initialize root directory after format");
            return Err(FsError::FormatFailed);
        }
        Ok(())
    }

    fn create_file(&self, file_path: &str, perms: BitFlags<ModeFlag>) -> Result<u32, FsError> {
        self.ensure_mounted("create_file")?;
        let store = self.store()?;
        let disk = &self.disk;

        if path::resolve(store, disk, file_path).is_ok() {
            error!("file already exists: {file_path}");
            return Err(FsError::AlreadyExists);
        }

        let (parent, name) = path::split(file_path)?;
        if name.is_empty() {
            error!("invalid path: {file_path}");
            return Err(FsError::PathInvalid);
        }
        let parent_inode = path::resolve(store, disk, &parent).map_err(|err| {
            error!("parent directory not found: {parent}");
            err
        })?;

        let inode_num = store.allocate_inode(disk)?;
        let attach = || -> Result<(), FsError> {
            let mut inode = store.read_inode(disk, inode_num)?;
            inode.mode = (perms | ModeFlag::Regular).bits();
            store.write_inode(disk, inode_num, &inode)?;
            dir::add_entry(store, disk, parent_inode, &name, inode_num)
        };
        if let Err(err) = attach() {
            error!("failed to add directory entry for: {name}");
            let _ = store.free_inode(disk, inode_num);
            return Err(err);
        }

        Ok(inode_num)
    }

    fn delete_file(&self, file_path: &str) -> Result<(), FsError> {
        self.ensure_mounted("delete_file")?;
        let store = self.store()?;
        let disk = &self.disk;

        let inode_num = path::resolve(store, disk, file_path).map_err(|err| {
            error!("file not found: {file_path}");
            err
        })?;

        let inode = store.read_inode(disk, inode_num)?;
        if inode.is_dir() {
            error!("use remove_directory for directories: {file_path}");
            return Err(FsError::IsADirectory);
        }

        let (parent, name) = path::split(file_path)?;
        let parent_inode = path::resolve(store, disk, &parent)?;

        dir::remove_entry(store, disk, parent_inode, &name)?;
        store.free_inode(disk, inode_num)
    }

    fn file_exists(&self, file_path: &str) -> bool {
        if self.ensure_mounted("file_exists").is_err() {
            return false;
        }
        match self.store() {
            Ok(store) => path::resolve(store, &self.disk, file_path).is_ok(),
            Err(_) => false,
        }
    }

    fn open_file(&mut self, file_path: &str, mode: BitFlags<OpenMode>) -> Result<u32, FsError> {
        self.ensure_mounted("open_file")?;
        path::validate(file_path)?;

        let inode_num = {
            let store = self.store()?;
            match path::resolve(store, &self.disk, file_path) {
                Ok(inode_num) => inode_num,
                Err(FsError::NotFound) if mode.contains(OpenMode::Create) => {
                    self.create_file(file_path, ModeFlag::file_default())?
                }
                Err(err) => {
                    error!("file not found: {file_path}");
                    return Err(err);
                }
            }
        };

        let mut entry = OpenFile::new(inode_num, mode);
        if mode.contains(OpenMode::Append) {
            entry.position = self.store()?.read_inode(&self.disk, inode_num)?.size;
        }

        let fd = self.handles.allocate(entry)?;
        touch_atime(&self.disk, self.store()?, inode_num);
        Ok(fd)
    }

    fn close_file(&mut self, fd: u32) -> Result<(), FsError> {
        self.ensure_mounted("close_file")?;

        let inode_num = self.handles.get(fd)?.inode;
        touch_mtime(&self.disk, self.store()?, inode_num);
        self.handles.release(fd)?;
        Ok(())
    }

    fn read_file(&mut self, fd: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.ensure_mounted("read_file")?;

        let handle = *self.handles.get(fd)?;
        if !handle.mode.contains(OpenMode::Read) {
            error!("file not opened for reading: fd={fd}");
            return Err(FsError::InvalidArgument);
        }

        let store = self.store()?;
        let disk = &self.disk;
        let inode = store.read_inode(disk, handle.inode)?;

        if handle.position >= inode.size {
            return Ok(0);
        }
        let want = buf.len().min((inode.size - handle.position) as usize);

        let blocks = store.data_blocks(disk, handle.inode)?;
        file::read_from_blocks(disk, &blocks, handle.position as usize, &mut buf[..want])?;

        touch_atime(disk, store, handle.inode);
        self.handles.get_mut(fd)?.position += want as i64;
        Ok(want)
    }

    fn write_file(&mut self, fd: u32, data: &[u8]) -> Result<usize, FsError> {
        self.ensure_mounted("write_file")?;

        let handle = *self.handles.get(fd)?;
        if !handle.mode.contains(OpenMode::Write) {
            error!("file not opened for writing: fd={fd}");
            return Err(FsError::InvalidArgument);
        }

        let store = self.store()?;
        let disk = &self.disk;
        let inode = store.read_inode(disk, handle.inode)?;

        let position = handle.position as usize;
        let current_blocks = (inode.size as usize).div_ceil(BLOCK_SIZE);
        let required_blocks = (position + data.len()).div_ceil(BLOCK_SIZE);
        if required_blocks > current_blocks {
            store
                .allocate_data_blocks(disk, handle.inode, (required_blocks - current_blocks) as u32)
                .map_err(|err| {
                    error!("failed to allocate data blocks for fd={fd}");
                    err
                })?;
        }

        let blocks = store.data_blocks(disk, handle.inode)?;
        file::write_to_blocks(disk, &blocks, position, data)?;

        // 块分配可能已改写 inode，重读后再更新大小
        let mut inode = store.read_inode(disk, handle.inode)?;
        inode.size = inode.size.max(handle.position + data.len() as i64);
        inode.mtime = unix_now();
        store.write_inode(disk, handle.inode, &inode)?;

        self.handles.get_mut(fd)?.position += data.len() as i64;
        Ok(data.len())
    }

    fn seek_file(&mut self, fd: u32, position: i64) -> Result<(), FsError> {
        self.ensure_mounted("seek_file")?;

        let inode_num = self.handles.get(fd)?.inode;
        let size = self.store()?.read_inode(&self.disk, inode_num)?.size;
        if position < 0 || position > size {
            error!("invalid seek position: {position}");
            return Err(FsError::InvalidArgument);
        }

        self.handles.get_mut(fd)?.position = position;
        Ok(())
    }

    fn create_directory(&self, dir_path: &str) -> Result<(), FsError> {
        self.ensure_mounted("create_directory")?;
        let store = self.store()?;
        let disk = &self.disk;

        if path::resolve(store, disk, dir_path).is_ok() {
            error!("directory already exists: {dir_path}");
            return Err(FsError::AlreadyExists);
        }

        let (parent, name) = path::split(dir_path)?;
        if name.is_empty() {
            error!("invalid path: {dir_path}");
            return Err(FsError::PathInvalid);
        }
        let parent_inode = path::resolve(store, disk, &parent).map_err(|err| {
            error!("parent directory not found: {parent}");
            err
        })?;

        let inode_num = store.allocate_inode(disk)?;
        let install = || -> Result<(), FsError> {
            let inode = DiskInode::new(ModeFlag::directory_default(), 2);
            store.write_inode(disk, inode_num, &inode)?;
            store.allocate_data_blocks(disk, inode_num, 1)?;

            let entries = [
                DirEntry::new(".", inode_num),
                DirEntry::new("..", parent_inode),
            ];
            dir::write_dir(store, disk, inode_num, &entries)?;
            dir::add_entry(store, disk, parent_inode, &name, inode_num)
        };
        if let Err(err) = install() {
            error!("failed to create directory: {dir_path}");
            let _ = store.free_inode(disk, inode_num);
            return Err(err);
        }

        Ok(())
    }

    fn remove_directory(&self, dir_path: &str) -> Result<(), FsError> {
        self.ensure_mounted("remove_directory")?;
        let store = self.store()?;
        let disk = &self.disk;

        if dir_path == "/" {
            error!("cannot remove root directory");
            return Err(FsError::InvalidArgument);
        }

        let inode_num = path::resolve(store, disk, dir_path).map_err(|err| {
            error!("directory not found: {dir_path}");
            err
        })?;

        let inode = store.read_inode(disk, inode_num)?;
        if !inode.is_dir() {
            error!("not a directory: {dir_path}");
            return Err(FsError::NotADirectory);
        }

        let entries = dir::read_dir(store, disk, inode_num)?;
        if entries.len() > 2 {
            error!("directory not empty: {dir_path}");
            return Err(FsError::DirectoryNotEmpty);
        }

        let (parent, name) = path::split(dir_path)?;
        let parent_inode = path::resolve(store, disk, &parent)?;

        dir::remove_entry(store, disk, parent_inode, &name)?;
        store.free_inode(disk, inode_num)
    }

    fn list_directory(&self, dir_path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.ensure_mounted("list_directory")?;
        let store = self.store()?;

        let inode_num = path::resolve(store, &self.disk, dir_path).map_err(|err| {
            error!("directory not found: {dir_path}");
            err
        })?;
        dir::read_dir(store, &self.disk, inode_num)
    }

    fn disk_info(&self) -> Result<String, FsError> {
        self.ensure_mounted("get_disk_info")?;
        let store = self.store()?;
        let superblock = self.superblock.ok_or(FsError::NotMounted)?;

        Ok(format!(
            "Disk Information:\n\
             \x20 Disk Size: {} MB\n\
             \x20 Block Size: {} bytes\n\
             \x20 Total Blocks: {}\n\
             \x20 Free Blocks: {}\n\
             \x20 Total Inodes: {}\n\
             \x20 Free Inodes: {}\n\
             \x20 Mount Time: {}\n\
             \x20 Write Time: {}\n",
            self.disk.size() / (1024 * 1024),
            BLOCK_SIZE,
            self.disk.total_blocks(),
            store.free_data_blocks(),
            store.total_inodes(),
            store.free_inodes(),
            superblock.mount_time,
            superblock.write_time,
        ))
    }

    fn is_directory(&self, dir_path: &str) -> bool {
        if self.ensure_mounted("is_directory").is_err() {
            return false;
        }
        let Ok(store) = self.store() else { return false };
        let Ok(inode_num) = path::resolve(store, &self.disk, dir_path) else {
            return false;
        };
        store
            .read_inode(&self.disk, inode_num)
            .map(|inode| inode.is_dir())
            .unwrap_or(false)
    }

    fn find_inode(&self, file_path: &str) -> Result<u32, FsError> {
        self.ensure_mounted("find_inode")?;
        path::resolve(self.store()?, &self.disk, file_path)
    }

    fn close_all_files(&mut self) {
        for fd in self.handles.descriptors() {
            if let (Ok(entry), Ok(store)) = (self.handles.get(fd), self.store()) {
                touch_mtime(&self.disk, store, entry.inode);
            }
            let _ = self.handles.release(fd);
        }
    }
}

fn load_superblock(disk: &DiskImage) -> Result<SuperBlock, FsError> {
    let mut block = [0u8; BLOCK_SIZE];
    disk.read_block(0, &mut block).map_err(|err| {
        error!("failed to read superblock");
        err
    })?;

    let superblock = SuperBlock::decode(&block);
    if !superblock.is_valid() {
        error!("invalid file system format");
        return Err(FsError::Io);
    }
    Ok(superblock)
}

/// 安置根目录：0 号 inode 必须存活、是带 rwx 的目录、链接数不小于 2、
/// 至少持有一个数据块，且 `.` 与 `..` 都指向自身；缺什么补什么。
fn ensure_root(disk: &DiskImage, store: &InodeStore) -> Result<(), FsError> {
    if !store.is_inode_allocated(ROOT_INODE) {
        let allocated = store.allocate_inode(disk)?;
        if allocated != ROOT_INODE {
            error!("unexpected root inode index: {allocated}");
            return Err(FsError::InvalidInode);
        }
    }

    let mut root = store.read_inode(disk, ROOT_INODE)?;
    let mut inode_updated = false;

    if !root.is_dir() {
        root = DiskInode::new(ModeFlag::directory_default(), 2);
        inode_updated = true;
    } else {
        let required = ModeFlag::Read | ModeFlag::Write | ModeFlag::Execute;
        if !root.flags().contains(required) {
            root.mode |= required.bits();
            inode_updated = true;
        }
        if root.links < 2 {
            root.links = 2;
            inode_updated = true;
        }
    }
    if inode_updated {
        store.write_inode(disk, ROOT_INODE, &root)?;
    }

    let (mut entries, mut needs_write) = match dir::read_dir(store, disk, ROOT_INODE) {
        Ok(entries) => (entries, false),
        Err(_) => (Vec::new(), true),
    };

    let mut has_dot = false;
    let mut has_dotdot = false;
    for entry in entries.iter_mut() {
        if entry.matches(".") {
            has_dot = true;
            if entry.inode() != ROOT_INODE {
                entry.redirect(ROOT_INODE);
                needs_write = true;
            }
        } else if entry.matches("..") {
            has_dotdot = true;
            if entry.inode() != ROOT_INODE {
                entry.redirect(ROOT_INODE);
                needs_write = true;
            }
        }
    }

    if !has_dot {
        entries.insert(0, DirEntry::new(".", ROOT_INODE));
        has_dot = true;
        needs_write = true;
    }
    if !has_dotdot {
        let position = usize::from(has_dot);
        entries.insert(position, DirEntry::new("..", ROOT_INODE));
        needs_write = true;
    }

    if !needs_write {
        return Ok(());
    }

    if store.data_blocks(disk, ROOT_INODE)?.is_empty() {
        store.allocate_data_blocks(disk, ROOT_INODE, 1)?;
    }
    dir::write_dir(store, disk, ROOT_INODE, &entries)
}

fn touch_atime(disk: &DiskImage, store: &InodeStore, inode_num: u32) {
    let updated = store.read_inode(disk, inode_num).and_then(|mut inode| {
        inode.atime = unix_now();
        store.write_inode(disk, inode_num, &inode)
    });
    if updated.is_err() {
        warn!("failed to update access time for inode {inode_num}");
    }
}

fn touch_mtime(disk: &DiskImage, store: &InodeStore, inode_num: u32) {
    let updated = store.read_inode(disk, inode_num).and_then(|mut inode| {
        inode.mtime = unix_now();
        store.write_inode(disk, inode_num, &inode)
    });
    if updated.is_err() {
        warn!("failed to update modification time for inode {inode_num}");
    }
}
