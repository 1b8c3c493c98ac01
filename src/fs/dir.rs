//! 目录层
//!
//! 目录是内容为定长目录项数组的 inode，目录项中 inode 号为 0 表示空位。
//! 这里的所有函数都要求调用者已经锁定目录 inode。

use alloc::vec::Vec;

use core::fmt;
use core::iter::StepBy;
use core::mem;
use core::ops::Range;

use crate::consts::fs::DIRSIZ;
use crate::error::{FsError, Result};
use super::inode::{Inode, InodeGuard, InodeType};

pub const DIRENT_SIZE: usize = mem::size_of::<DirEntry>();

/// 磁盘上的目录项，名字不足 `DIRSIZ` 时以 0 填充
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DirEntry {
    inum: u32,
    name: [u8; DIRSIZ],
}

impl DirEntry {
    pub const fn empty() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }

    pub fn new(inum: u32, name: &DirName) -> Self {
        Self { inum, name: name.bytes }
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub fn name(&self) -> DirName {
        DirName::new(&self.name)
    }

    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut bytes = [0; DIRENT_SIZE];
        bytes[..4].copy_from_slice(&self.inum.to_le_bytes());
        bytes[4..].copy_from_slice(&self.name);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; DIRENT_SIZE]) -> Self {
        let mut entry = Self::empty();
        let mut inum = [0; 4];
        inum.copy_from_slice(&bytes[..4]);
        entry.inum = u32::from_le_bytes(inum);
        entry.name.copy_from_slice(&bytes[4..]);
        entry
    }
}

/// 目录项名字，最长 `DIRSIZ` 字节，更长的名字被截断
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DirName {
    bytes: [u8; DIRSIZ],
    len: usize,
}

impl DirName {
    /// 取 `name` 中第一个 0 之前的部分，超过 `DIRSIZ` 的部分被丢弃
    pub fn new(name: &[u8]) -> Self {
        let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
        let len = core::cmp::min(len, DIRSIZ);
        let mut bytes = [0; DIRSIZ];
        bytes[..len].copy_from_slice(&name[..len]);
        Self { bytes, len }
    }

    pub fn dot() -> Self {
        Self::new(b".")
    }

    pub fn dotdot() -> Self {
        Self::new(b"..")
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 是否为 "." 或 ".."
    pub fn is_special(&self) -> bool {
        self.as_bytes() == b"." || self.as_bytes() == b".."
    }

    fn matches(&self, raw: &[u8; DIRSIZ]) -> bool {
        self.bytes == *raw
    }
}

impl fmt::Debug for DirName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

impl<'i, 'fs> InodeGuard<'i, 'fs> {
    fn read_entry(&mut self, offset: u32) -> DirEntry {
        let mut bytes = [0; DIRENT_SIZE];
        match self.read(&mut bytes, offset) {
            Ok(n) if n == DIRENT_SIZE => DirEntry::from_bytes(&bytes),
            _ => panic!("dir: short entry read at {}", offset),
        }
    }

    fn write_entry(&mut self, offset: u32, entry: &DirEntry) -> Result<()> {
        self.write(&entry.to_bytes(), offset).map(|_| ())
    }

    fn entry_offsets(&self, from: u32) -> StepBy<Range<u32>> {
        (from..self.size()).step_by(DIRENT_SIZE)
    }

    fn find_entry(&mut self, name: &DirName) -> Option<(DirEntry, u32)> {
        if self.itype() != InodeType::Directory {
            panic!("dir: lookup in non-directory inode {}", self.inode().inum());
        }
        for offset in self.entry_offsets(0) {
            let entry = self.read_entry(offset);
            if entry.inum != 0 && name.matches(&entry.name) {
                return Some((entry, offset))
            }
        }
        None
    }

    /// 在目录中查找名为 `name` 的目录项。
    ///
    /// # 返回值
    /// 找到时返回该项指向的 inode（未加锁）以及目录项在目录中的字节偏移。
    ///
    /// # 可能的错误
    /// - 在非目录 inode 上调用会 panic。
    pub fn dir_lookup(&mut self, name: &DirName) -> Option<(Inode<'fs>, u32)> {
        let (entry, offset) = self.find_entry(name)?;
        Some((self.fs().iget(entry.inum), offset))
    }

    /// 在目录中新增目录项 `(name, inum)`。
    ///
    /// # 功能说明
    /// 优先复用第一个空位，没有空位时追加到目录末尾。
    /// 不修改 `inum` 对应 inode 的链接数，由调用者负责。
    ///
    /// # 可能的错误
    /// - 名字为空或包含 `/` 时返回 `InvalidName`；
    /// - 同名目录项已存在时返回 `Exists`；
    /// - 目录超过最大文件大小时返回 `FileTooLarge`。
    pub fn dir_link(&mut self, name: &DirName, inum: u32) -> Result<()> {
        if name.is_empty() || name.as_bytes().contains(&b'/') {
            return Err(FsError::InvalidName)
        }
        if self.find_entry(name).is_some() {
            return Err(FsError::Exists)
        }

        let mut offset = self.size();
        for off in self.entry_offsets(0) {
            if self.read_entry(off).inum == 0 {
                offset = off;
                break
            }
        }
        self.write_entry(offset, &DirEntry::new(inum, name))
    }

    /// 删除目录项 `name`，并减少目标 inode 的链接数。
    ///
    /// # 流程解释
    /// 1. 拒绝 "." 与 ".."；
    /// 2. 查找目录项并锁定目标 inode；
    /// 3. 目标为非空目录时拒绝；
    /// 4. 清空目录项；目标是目录时，当前目录因失去一个 ".." 引用而减少链接数；
    /// 5. 目标链接数减一并写回。目标的最后一个引用被释放时由 inode 层回收。
    ///
    /// # 可能的错误
    /// - `name` 为 "." 或 ".." 时返回 `Invalid`；
    /// - 目录项不存在时返回 `NotFound`；
    /// - 目标为非空目录时返回 `NotEmpty`。
    pub fn dir_unlink(&mut self, name: &DirName) -> Result<()> {
        if name.is_special() {
            return Err(FsError::Invalid)
        }

        let (inode, offset) = self.dir_lookup(name).ok_or(FsError::NotFound)?;
        let mut idata = inode.lock();
        if idata.nlink() < 1 {
            panic!("dir: unlink of inode {} with no links", inode.inum());
        }
        let is_dir = idata.itype() == InodeType::Directory;
        if is_dir && !idata.is_dir_empty() {
            return Err(FsError::NotEmpty)
        }

        self.write_entry(offset, &DirEntry::empty())?;
        if is_dir {
            self.unlink();
            self.update();
        }
        idata.unlink();
        idata.update();
        Ok(())
    }

    /// 只清空目录项 `name`，不修改任何链接数。
    pub(crate) fn dir_remove(&mut self, name: &DirName) -> Result<()> {
        let (_, offset) = self.find_entry(name).ok_or(FsError::NotFound)?;
        self.write_entry(offset, &DirEntry::empty())
    }

    /// 把已有目录项 `name` 改为指向 `inum`。
    pub(crate) fn dir_replace(&mut self, name: &DirName, inum: u32) -> Result<()> {
        let (_, offset) = self.find_entry(name).ok_or(FsError::NotFound)?;
        self.write_entry(offset, &DirEntry::new(inum, name))
    }

    /// 目录中除 "." 与 ".." 外是否没有其他目录项。
    pub fn is_dir_empty(&mut self) -> bool {
        for offset in self.entry_offsets(2 * DIRENT_SIZE as u32) {
            if self.read_entry(offset).inum != 0 {
                return false
            }
        }
        true
    }

    /// 列出目录中所有有效目录项
    pub fn read_dir(&mut self) -> Vec<(DirName, u32)> {
        if self.itype() != InodeType::Directory {
            panic!("dir: listing non-directory inode {}", self.inode().inum());
        }
        let mut entries = Vec::new();
        for offset in self.entry_offsets(0) {
            let entry = self.read_entry(offset);
            if entry.inum != 0 {
                entries.push((entry.name(), entry.inum));
            }
        }
        entries
    }
}
