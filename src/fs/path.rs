//! 路径解析
//!
//! 逐级查找路径分量，任意时刻最多锁定一个目录：
//! 先取得下一级的引用，再释放当前目录的锁。

use alloc::vec::Vec;
use log::warn;

use crate::consts::fs::{MAXPATH, NLINK_DEREF, ROOTINUM};
use crate::error::{FsError, Result};
use super::FileSystem;
use super::dir::DirName;
use super::inode::{Inode, InodeType};

/// 拆出路径中的第一个分量。
///
/// # 返回值
/// 返回 `(分量, 剩余路径)`，剩余路径不含前导的 `/`；
/// 路径中已没有分量时返回 `None`。
///
/// # 示例
/// - `"a/bb/c"` → `("a", "bb/c")`
/// - `"///a//bb"` → `("a", "bb")`
/// - `"a"` → `("a", "")`
/// - `""`、`"////"` → `None`
fn skip_path(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let rest = &path[end..];
    let rest_start = rest.iter().position(|&c| c != b'/').unwrap_or(rest.len());
    Some((&path[..end], &rest[rest_start..]))
}

/// 截去第一个 0 之后的内容，并检查长度
pub(super) fn path_bytes(path: &[u8]) -> Result<&[u8]> {
    let len = path.iter().position(|&c| c == 0).unwrap_or(path.len());
    if len > MAXPATH {
        return Err(FsError::NameTooLong)
    }
    if len == 0 {
        return Err(FsError::NotFound)
    }
    Ok(&path[..len])
}

impl FileSystem {
    /// 解析路径。
    ///
    /// # 功能说明
    /// 绝对路径从根目录开始，相对路径从 `cwd` 开始（没有提供时从根目录开始）。
    /// `parent` 为真时在最后一个分量之前停下，返回其父目录以及最后一个分量的名字。
    ///
    /// # 流程解释
    /// 1. 取得起始目录的引用；
    /// 2. 对每个分量：锁定当前目录，检查其为目录，查找下一级并取得其引用，释放锁；
    /// 3. 用下一级替换当前目录，旧引用随之释放。
    ///
    /// # 可能的错误
    /// - 中间分量不是目录时返回 `NotDir`；
    /// - 某一分量不存在时返回 `NotFound`；
    /// - 在 `parent` 模式下查询根目录的父目录时返回 `NotFound`。
    fn namex<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>, parent: bool)
        -> Result<(Inode<'fs>, DirName)>
    {
        let path = path_bytes(path)?;
        let mut inode = match cwd {
            Some(cwd) if path[0] != b'/' => cwd.clone(),
            _ => self.iget(ROOTINUM),
        };

        let mut name = DirName::new(b"");
        let mut rest = path;
        while let Some((elem, next)) = skip_path(rest) {
            name = DirName::new(elem);
            rest = next;

            let mut guard = inode.lock();
            if guard.itype() != InodeType::Directory {
                return Err(FsError::NotDir)
            }
            if parent && rest.is_empty() {
                drop(guard);
                return Ok((inode, name))
            }
            let next_inode = match guard.dir_lookup(&name) {
                Some((next_inode, _)) => next_inode,
                None => return Err(FsError::NotFound),
            };
            drop(guard);
            inode = next_inode;
        }

        if parent {
            // 只有查询根目录的父目录时才会走到这里
            warn!("path: querying the parent of the root directory");
            return Err(FsError::NotFound)
        }
        Ok((inode, name))
    }

    /// 解析路径，返回其 inode，不跟随最后一个分量上的符号链接。
    ///
    /// 沿途释放的目录引用可能是被并发删除的目录的最后一个引用，
    /// 释放时会回收其磁盘空间，因此必须在事务中调用。
    pub fn namei<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>) -> Result<Inode<'fs>> {
        self.namex(path, cwd, false).map(|(inode, _)| inode)
    }

    /// 解析路径的父目录，同时返回最后一个分量的名字。必须在事务中调用。
    pub fn namei_parent<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>)
        -> Result<(Inode<'fs>, DirName)>
    {
        self.namex(path, cwd, true)
    }

    /// 解析路径，并跟随最后一个分量上的符号链接。
    ///
    /// # 功能说明
    /// 最多解引用 `NLINK_DEREF` 次。绝对链接目标从根目录开始解析，
    /// 相对链接目标从链接所在的目录开始解析。与 [`FileSystem::namei`] 一样必须在事务中调用。
    ///
    /// # 可能的错误
    /// - 解引用次数超出限制时返回 `TooManyLinks`；
    /// - 其余同 [`FileSystem::namei`]。
    pub fn namei_follow<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>) -> Result<Inode<'fs>> {
        let mut link_path: Vec<u8> = path_bytes(path)?.to_vec();
        let mut base: Option<Inode<'fs>> = cwd.cloned();
        let mut target = [0u8; MAXPATH];
        let mut derefs = 0;
        loop {
            let inode = self.namei(&link_path, base.as_ref())?;
            let mut guard = inode.lock();
            if guard.itype() != InodeType::Symlink {
                drop(guard);
                return Ok(inode)
            }
            if derefs == NLINK_DEREF {
                warn!("path: too many levels of symbolic links");
                return Err(FsError::TooManyLinks)
            }
            derefs += 1;

            let n = guard.read(&mut target, 0)?;
            drop(guard);
            drop(inode);
            let (dir, _) = self.namei_parent(&link_path, base.as_ref())?;
            link_path = target[..n].to_vec();
            base = Some(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_path_splits_components() {
        assert_eq!(skip_path(b"a/bb/c"), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_path(b"///a//bb"), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_path(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_path(b"a/"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_path(b""), None);
        assert_eq!(skip_path(b"////"), None);
    }

    #[test]
    fn path_bytes_stops_at_nul() {
        assert_eq!(path_bytes(b"/a\0garbage"), Ok(&b"/a"[..]));
        assert_eq!(path_bytes(b"\0"), Err(FsError::NotFound));
        assert_eq!(path_bytes(&[b'a'; MAXPATH + 1]), Err(FsError::NameTooLong));
    }
}
