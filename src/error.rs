use thiserror::Error;

/// 引擎全部操作可能返回的错误码，封闭枚举。
///
/// 失败在发生处向标准错误记一行日志后原样向上传播，
/// 末四种留给外部的命令行壳使用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("invalid path")]
    PathInvalid,
    #[error("file not found")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("no free inodes available")]
    NoFreeInodes,
    #[error("no free blocks available")]
    NoFreeBlocks,
    #[error("disk full")]
    DiskFull,
    #[error("invalid block number")]
    InvalidBlock,
    #[error("invalid inode")]
    InvalidInode,
    #[error("invalid file descriptor")]
    InvalidDescriptor,
    #[error("file not open")]
    NotOpen,
    #[error("file already open")]
    AlreadyOpen,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("I/O error")]
    Io,
    #[error("not mounted")]
    NotMounted,
    #[error("already mounted")]
    AlreadyMounted,
    #[error("mount failed")]
    MountFailed,
    #[error("format failed")]
    FormatFailed,
    #[error("unmount failed")]
    UnmountFailed,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unknown command")]
    UnknownCommand,
    #[error("invalid syntax")]
    InvalidSyntax,
    #[error("permission denied")]
    PermissionDenied,
    #[error("buffer overflow")]
    BufferOverflow,
}
