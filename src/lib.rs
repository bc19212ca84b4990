//! # mindfs
//!
//! 宿主在单个镜像文件里的 Unix 风格文件系统，自下而上：
//! 镜像设备 | 位图 | 磁盘数据结构 | inode 仓库 | 目录与路径 | 文件读写 | 门面 | 派发器

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

// 错误分类：整个引擎共用的封闭错误枚举
mod error;
pub use error::FsError;

// 镜像设备层：块粒度的持久存储
mod device;
pub use device::DiskImage;

// 位图层：带 O(1) 空闲计数的定长位向量
mod bitmap;
pub use bitmap::Bitmap;

// 磁盘数据结构层：布局计算与定宽小端编码
mod layout;
pub use layout::{DirEntry, DiskInode, DiskLayout, ModeFlag, SuperBlock};

// inode 仓库层：分配、回收与三级块寻址
mod store;
pub use store::InodeStore;

// 目录编码层
mod dir;

// 路径解析层
mod path;

// 文件读写层：按字节偏移映射块序列，外加打开文件表
mod file;
pub use file::{HandleTable, OpenFile, OpenMode};

// 文件系统门面：唯一对外表面，执行读写锁纪律
mod fs;
pub use fs::MindFileSystem;

// 工作线程派发器
mod dispatch;
pub use dispatch::{DispatchMode, Dispatcher, ThreadPool};

/// 文件系统魔数（"MIND"）
pub const MAGIC: u32 = 0x4D49_4E44;

/// 磁盘块大小（字节）
pub const BLOCK_SIZE: usize = 4096;
/// 每个块承载的位数
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

/// inode 内直接块指针数量
pub const DIRECT_COUNT: usize = 10;
/// 单个间接块承载的 32 位块号数量
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 4;
/// 三级寻址合计的文件块数上限
pub const MAX_FILE_BLOCKS: usize = DIRECT_COUNT + INDIRECT_COUNT + INDIRECT_COUNT * INDIRECT_COUNT;

/// 文件名最大长度（字节）
pub const NAME_MAX_LEN: usize = 255;
/// 路径最大长度（字节）
pub const PATH_MAX_LEN: usize = 1024;

pub(crate) type Block = [u8; BLOCK_SIZE];

/// 当前 Unix 时间（秒）
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
