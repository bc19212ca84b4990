//! 目录项：目录的数据就是定长目录项的致密数组。
//!
//! 每项 264 字节，每个块容纳 15 项；`name_len` 为 0 的槽位视为空。
//! 查找不做散列，按块序线性扫描。

use std::fmt;

use super::{get_u32, put_u32};
use crate::NAME_MAX_LEN;

pub const DIR_ENTRY_SIZE: usize = 264;
pub const ENTRIES_PER_BLOCK: usize = crate::BLOCK_SIZE / DIR_ENTRY_SIZE;

/// 名字缓冲区最后一字节留给 NUL
const NAME_BUF_LEN: usize = NAME_MAX_LEN + 1;

#[derive(Clone)]
pub struct DirEntry {
    inode: u32,
    name: [u8; NAME_BUF_LEN],
    name_len: u32,
}

impl DirEntry {
    /// 超过 255 字节的名字会被截断。
    pub fn new(name: &str, inode: u32) -> Self {
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_MAX_LEN);
        let mut buf = [0u8; NAME_BUF_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);

        Self {
            inode,
            name: buf,
            name_len: len as u32,
        }
    }

    #[inline]
    pub fn inode(&self) -> u32 {
        self.inode
    }

    #[inline]
    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..(self.name_len as usize).min(NAME_MAX_LEN)]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.name_len > 0
    }

    /// 逐字节比较名字，以名字长度为界
    #[inline]
    pub fn matches(&self, name: &str) -> bool {
        self.name_bytes() == name.as_bytes()
    }

    pub(crate) fn redirect(&mut self, inode: u32) {
        self.inode = inode;
    }

    /// `raw` 至少 [`DIR_ENTRY_SIZE`] 字节。
    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; NAME_BUF_LEN];
        name.copy_from_slice(&raw[4..4 + NAME_BUF_LEN]);

        Self {
            inode: get_u32(raw, 0),
            name,
            name_len: get_u32(raw, 4 + NAME_BUF_LEN),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.inode);
        out[4..4 + NAME_BUF_LEN].copy_from_slice(&self.name);
        put_u32(out, 4 + NAME_BUF_LEN, self.name_len);
    }
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry")
            .field("inode", &self.inode)
            .field("name", &self.name())
            .finish()
    }
}
