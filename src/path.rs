//! # 路径解析层
//!
//! 路径按根锚定：相对路径视作相对根目录。`\` 统一成 `/`，
//! 连续分隔符折叠，除根以外去掉尾随 `/`。解析从 0 号 inode 出发，
//! 逐分量在目录里线性查找；`.` 与 `..` 不做特殊化，
//! 直接命中目录里存储的自指/父指条目。

use log::error;

use crate::dir;
use crate::DiskImage;
use crate::FsError;
use crate::InodeStore;
use crate::PATH_MAX_LEN;

/// 根目录的 inode 编号
pub(crate) const ROOT_INODE: u32 = 0;

/// 规范化路径；不校验合法性。
pub fn normalize(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());

    let mut last_was_slash = false;
    for ch in path.chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' && last_was_slash {
            continue;
        }
        last_was_slash = ch == '/';
        normalized.push(ch);
    }

    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// 空、超长或含控制字符（NUL/换行/回车）的路径非法。
pub fn validate(path: &str) -> Result<(), FsError> {
    if path.is_empty() || path.len() > PATH_MAX_LEN {
        error!("invalid path: bad length");
        return Err(FsError::PathInvalid);
    }
    if path.bytes().any(|b| b == 0 || b == b'\n' || b == b'\r') {
        error!("invalid path: control character");
        return Err(FsError::PathInvalid);
    }
    Ok(())
}

/// 父目录路径；根的父目录是它自己。
pub fn parent_path(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return String::from("/");
    }

    let rooted = ensure_rooted(path);
    match rooted.rfind('/') {
        Some(0) | None => String::from("/"),
        Some(pos) => rooted[..pos].to_string(),
    }
}

/// 末级分量名；根没有名字。
pub fn basename(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return String::new();
    }

    let rooted = ensure_rooted(path);
    match rooted.rfind('/') {
        Some(pos) => rooted[pos + 1..].to_string(),
        None => rooted,
    }
}

/// 拆出 (父目录, 末级名)，先做合法性校验。
pub fn split(path: &str) -> Result<(String, String), FsError> {
    validate(path)?;
    Ok((parent_path(path), basename(path)))
}

/// 拆分路径分量，空分量丢弃。
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// 从根解析路径到 inode 编号；任何一步落空即 not-found。
pub fn resolve(store: &InodeStore, disk: &DiskImage, path: &str) -> Result<u32, FsError> {
    if path.is_empty() {
        return Err(FsError::NotFound);
    }
    // 根目录无需任何磁盘访问
    if path == "/" {
        return Ok(ROOT_INODE);
    }

    let mut current = ROOT_INODE;
    for component in components(path) {
        current = lookup(store, disk, current, component)?.ok_or(FsError::NotFound)?;
    }
    Ok(current)
}

/// 在一个目录下按名查找条目的 inode。
/// 目标不是目录时也按 not-found 处理。
pub fn lookup(
    store: &InodeStore,
    disk: &DiskImage,
    dir_inode: u32,
    name: &str,
) -> Result<Option<u32>, FsError> {
    let entries = match dir::read_dir(store, disk, dir_inode) {
        Ok(entries) => entries,
        Err(FsError::NotADirectory) => return Err(FsError::NotFound),
        Err(err) => return Err(err),
    };

    Ok(entries
        .iter()
        .find(|entry| entry.matches(name))
        .map(|entry| entry.inode()))
}

fn ensure_rooted(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
