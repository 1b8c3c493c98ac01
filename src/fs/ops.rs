//! 命名空间操作
//!
//! 除 [`FileSystem::create`] 外，每个操作都自行开启一个事务。
//! 任意时刻最多锁定两个 inode，且总是先锁目录、后锁目录中的项。

use alloc::vec;
use alloc::vec::Vec;
use log::debug;

use crate::error::{FsError, Result};
use super::FileSystem;
use super::dir::DirName;
use super::inode::{FileStat, Inode, InodeType, Permissions};
use super::path::path_bytes;

impl FileSystem {
    /// 在 `path` 处创建一个类型为 `itype` 的 inode，返回其句柄（未加锁）。
    ///
    /// # 功能说明
    /// 调用者必须已经处于事务之中。若同名项已经存在，
    /// 且与请求的类型同为普通文件或同为符号链接，则直接返回已有的 inode。
    ///
    /// # 流程解释
    /// 1. 解析父目录并加锁，查找同名项；
    /// 2. 分配新 inode，写入设备号并把链接数置为 1；
    /// 3. 新建目录时父目录因 ".." 而增加一个链接，并写入 "." 与 ".."；
    /// 4. 在父目录中写入新目录项。
    ///
    /// # 可能的错误
    /// - 父目录不存在或不是目录时返回 `NotFound`/`NotDir`；
    /// - 同名项已存在且不可复用时返回 `Exists`；
    /// - 新建目录而父目录的链接数已达上限时返回 `TooManyLinks`。
    pub fn create<'fs>(
        &'fs self,
        path: &[u8],
        itype: InodeType,
        major: u16,
        minor: u16,
        cwd: Option<&Inode<'fs>>,
    ) -> Result<Inode<'fs>> {
        if itype == InodeType::Empty {
            return Err(FsError::Invalid)
        }
        let (dir, name) = self.namei_parent(path, cwd)?;
        let mut dguard = dir.lock();

        if let Some((inode, _)) = dguard.dir_lookup(&name) {
            drop(dguard);
            let existing = inode.lock().itype();
            let reusable = existing == itype
                && matches!(itype, InodeType::File | InodeType::Symlink);
            return if reusable { Ok(inode) } else { Err(FsError::Exists) }
        }

        // 先占用父目录的链接数，失败时磁盘上还没有任何修改
        if itype == InodeType::Directory {
            dguard.link()?;
        }

        let inode = self.inode_alloc(itype);
        let mut iguard = inode.lock();
        iguard.set_devnum(major, minor);
        iguard.set_nlink(1);
        iguard.update();

        if itype == InodeType::Directory {
            dguard.update();
            if iguard.dir_link(&DirName::dot(), inode.inum()).is_err()
                || iguard.dir_link(&DirName::dotdot(), dir.inum()).is_err()
            {
                panic!("create: cannot initialize directory {}", inode.inum());
            }
        }

        if let Err(err) = dguard.dir_link(&name, inode.inum()) {
            panic!("create: cannot link {:?} into {}: {}", name, dir.inum(), err);
        }
        debug!("create: {:?} as inum {} ({:?})", name, inode.inum(), itype);

        drop(iguard);
        drop(dguard);
        Ok(inode)
    }

    /// 创建目录
    pub fn mkdir<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>) -> Result<()> {
        let _tx = self.transaction();
        let dir = self.create(path, InodeType::Directory, 0, 0, cwd)?;
        drop(dir);
        Ok(())
    }

    /// 创建主设备号为 `major`、次设备号为 `minor` 的设备文件
    pub fn mknod<'fs>(&'fs self, path: &[u8], major: u16, minor: u16, cwd: Option<&Inode<'fs>>)
        -> Result<()>
    {
        let _tx = self.transaction();
        let node = self.create(path, InodeType::Device, major, minor, cwd)?;
        drop(node);
        Ok(())
    }

    /// 为 `old` 指向的 inode 在 `new` 处建立一个硬链接。
    ///
    /// # 流程解释
    /// 先增加目标的链接数并写回，释放其锁之后再在新父目录中写入目录项，
    /// 写入失败时撤销链接数的修改。
    ///
    /// # 可能的错误
    /// - `old` 是目录时返回 `IsDir`；
    /// - 目标的链接数已达上限时返回 `TooManyLinks`；
    /// - 新旧路径位于不同设备时返回 `CrossDevice`；
    /// - `new` 已存在时返回 `Exists`。
    pub fn link<'fs>(&'fs self, old: &[u8], new: &[u8], cwd: Option<&Inode<'fs>>) -> Result<()> {
        let _tx = self.transaction();
        let inode = self.namei(old, cwd)?;

        let mut guard = inode.lock();
        if guard.itype() == InodeType::Directory {
            return Err(FsError::IsDir)
        }
        guard.link()?;
        guard.update();
        drop(guard);

        if let Err(err) = self.link_into(&inode, new, cwd) {
            let mut guard = inode.lock();
            guard.unlink();
            guard.update();
            return Err(err)
        }
        Ok(())
    }

    fn link_into<'fs>(&'fs self, inode: &Inode<'fs>, path: &[u8], cwd: Option<&Inode<'fs>>)
        -> Result<()>
    {
        let (dir, name) = self.namei_parent(path, cwd)?;
        if dir.dev() != inode.dev() {
            return Err(FsError::CrossDevice)
        }
        let mut dguard = dir.lock();
        dguard.dir_link(&name, inode.inum())
    }

    /// 删除 `path` 对应的目录项。
    ///
    /// 目标的链接数降为 0 后，其磁盘空间在最后一个引用释放时回收。
    ///
    /// # 可能的错误
    /// - 最后一个分量为 "." 或 ".." 时返回 `Invalid`；
    /// - 目标为非空目录时返回 `NotEmpty`。
    pub fn unlink<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>) -> Result<()> {
        let _tx = self.transaction();
        let (dir, name) = self.namei_parent(path, cwd)?;
        let mut dguard = dir.lock();
        let result = dguard.dir_unlink(&name);
        drop(dguard);
        result
    }

    /// 在 `linkpath` 处创建指向 `target` 的符号链接。
    ///
    /// 链接内容按原样保存，不检查目标是否存在。
    pub fn symlink<'fs>(&'fs self, target: &[u8], linkpath: &[u8], cwd: Option<&Inode<'fs>>)
        -> Result<()>
    {
        let target = path_bytes(target)?;
        let _tx = self.transaction();
        if self.namei(linkpath, cwd).is_ok() {
            return Err(FsError::Exists)
        }
        let inode = self.create(linkpath, InodeType::Symlink, 0, 0, cwd)?;
        let mut guard = inode.lock();
        guard.write(target, 0)?;
        Ok(())
    }

    /// 读取符号链接的内容，不跟随链接。
    ///
    /// # 可能的错误
    /// - `path` 不是符号链接时返回 `Invalid`。
    pub fn readlink<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>) -> Result<Vec<u8>> {
        let _tx = self.transaction();
        let inode = self.namei(path, cwd)?;
        let mut guard = inode.lock();
        if guard.itype() != InodeType::Symlink {
            return Err(FsError::Invalid)
        }
        let mut target = vec![0; guard.size() as usize];
        let n = guard.read(&mut target, 0)?;
        target.truncate(n);
        Ok(target)
    }

    /// 把 `old` 移动到 `new`。
    ///
    /// # 功能说明
    /// 整个操作处于同一个事务中，崩溃后要么完全生效，要么完全没有发生。
    /// 不覆盖已存在的目标，也不检查把目录移动到其自身子树中的情况。
    ///
    /// # 流程解释
    /// 1. 分别解析新旧路径的父目录，拒绝 "." 与 ".."；
    /// 2. 在旧父目录中查找被移动的 inode，确定其是否为目录；
    /// 3. 在新父目录中写入目录项；目录跨父目录移动时新父目录增加一个链接；
    /// 4. 清空旧父目录中的目录项；目录跨父目录移动时旧父目录减少一个链接；
    /// 5. 目录跨父目录移动时把其 ".." 改为指向新父目录。
    ///
    /// 每一步只锁一个 inode。
    ///
    /// # 可能的错误
    /// - 旧路径不存在时返回 `NotFound`；
    /// - 新路径已存在时返回 `Exists`；
    /// - 任一路径的最后一个分量为 "." 或 ".."，或把目录移动到自身之下时返回 `Invalid`。
    pub fn rename<'fs>(&'fs self, old: &[u8], new: &[u8], cwd: Option<&Inode<'fs>>) -> Result<()> {
        let _tx = self.transaction();
        let (old_dir, old_name) = self.namei_parent(old, cwd)?;
        let (new_dir, new_name) = self.namei_parent(new, cwd)?;
        if old_name.is_special() || new_name.is_special() {
            return Err(FsError::Invalid)
        }
        if old_dir.dev() != new_dir.dev() {
            return Err(FsError::CrossDevice)
        }

        let mut guard = old_dir.lock();
        let (inode, _) = guard.dir_lookup(&old_name).ok_or(FsError::NotFound)?;
        drop(guard);
        if inode.inum() == new_dir.inum() {
            return Err(FsError::Invalid)
        }
        let is_dir = inode.lock().itype() == InodeType::Directory;
        let moves_dir = is_dir && old_dir.inum() != new_dir.inum();

        let mut guard = new_dir.lock();
        if guard.itype() != InodeType::Directory {
            return Err(FsError::NotDir)
        }
        if moves_dir {
            guard.link()?;
        }
        if let Err(err) = guard.dir_link(&new_name, inode.inum()) {
            if moves_dir {
                guard.unlink();
            }
            return Err(err)
        }
        if moves_dir {
            guard.update();
        }
        drop(guard);

        let mut guard = old_dir.lock();
        if let Err(err) = guard.dir_remove(&old_name) {
            panic!("rename: lost entry {:?} in {}: {}", old_name, old_dir.inum(), err);
        }
        if moves_dir {
            guard.unlink();
            guard.update();
        }
        drop(guard);

        if moves_dir {
            let mut guard = inode.lock();
            if let Err(err) = guard.dir_replace(&DirName::dotdot(), new_dir.inum()) {
                panic!("rename: directory {} has no parent entry: {}", inode.inum(), err);
            }
        }
        debug!("rename: {:?} in {} to {:?} in {}", old_name, old_dir.inum(), new_name, new_dir.inum());
        Ok(())
    }

    /// 修改 `path` 的权限位，保留类型位。
    pub fn set_permissions<'fs>(&'fs self, path: &[u8], perm: Permissions, cwd: Option<&Inode<'fs>>)
        -> Result<()>
    {
        let _tx = self.transaction();
        let inode = self.namei_follow(path, cwd)?;
        let mut guard = inode.lock();
        guard.set_permissions(perm);
        guard.update();
        Ok(())
    }

    /// 获取 `path` 的元数据，不跟随最后一个分量上的符号链接。
    pub fn stat<'fs>(&'fs self, path: &[u8], cwd: Option<&Inode<'fs>>) -> Result<FileStat> {
        let _tx = self.transaction();
        let inode = self.namei(path, cwd)?;
        let stat = inode.lock().stat();
        Ok(stat)
    }
}
