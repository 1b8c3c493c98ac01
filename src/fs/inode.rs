//! 索引节点层

use array_macro::array;
use log::trace;

use core::cmp::min;
use core::fmt;
use core::mem;

use crate::spinlock::SpinLock;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::consts::fs::{NINODE, BSIZE, NDIRECT, NINDIRECT, NDINDIRECT, MAX_FILE_SIZE, DEFAULT_UID, DEFAULT_GID};
use crate::error::{FsError, Result};
use super::FileSystem;
use super::bio::OnDisk;

/// 内存中活跃索引节点的缓存池。
///
/// - `meta` 记录每个槽位对应的 `(dev, inum)` 以及引用计数，由一把自旋锁保护；
/// - `data` 保存索引节点内容，每个槽位由独立的睡眠锁保护。
///
/// 文件系统只管理一个设备，所以按设备划分的桶退化为一个桶，
/// 整个元信息数组共用一把锁。
pub struct InodeCache {
    meta: SpinLock<[InodeMeta; NINODE]>,
    data: [SleepLock<InodeData>; NINODE],
}

impl InodeCache {
    pub(crate) fn new() -> Self {
        Self {
            meta: SpinLock::new(array![_ => InodeMeta::new(); NINODE], "InodeMeta"),
            data: array![_ => SleepLock::new(InodeData::new(), "InodeData"); NINODE],
        }
    }

    /// 在 inode 缓存中查找指定编号的 inode，返回槽位下标。
    ///
    /// # 流程解释
    /// 1. 加锁 `meta`；
    /// 2. 查找引用计数大于 0 且 `(dev, inum)` 匹配的槽位，找到则增加引用计数；
    /// 3. 否则占用第一个空闲槽位，引用计数置为 1，但不从磁盘加载内容。
    ///
    /// # 可能的错误
    /// - 没有空闲槽位时 panic，表示同时活跃的 inode 数量超过了 `NINODE`。
    fn get(&self, dev: u32, inum: u32) -> usize {
        let mut guard = self.meta.lock();

        let mut empty_i: Option<usize> = None;
        for i in 0..NINODE {
            if guard[i].inum == inum && guard[i].refs > 0 && guard[i].dev == dev {
                guard[i].refs += 1;
                return i
            }
            if empty_i.is_none() && guard[i].refs == 0 {
                empty_i = Some(i);
            }
        }

        let empty_i = match empty_i {
            Some(i) => i,
            None => panic!("inode: cache exhausted"),
        };
        guard[empty_i].dev = dev;
        guard[empty_i].inum = inum;
        guard[empty_i].refs = 1;
        empty_i
    }

    fn dup(&self, index: usize) {
        let mut guard = self.meta.lock();
        guard[index].refs += 1;
    }

    /// 释放对一个 inode 的引用，并在合适时回收该 inode。
    ///
    /// # 功能说明
    /// 当引用计数降至 0 且该 inode 已没有任何目录项引用（nlink 为 0）时，
    /// 释放其全部数据块并在磁盘上标记为空闲。
    /// 回收磁盘 inode 会写入日志，因此最后一次释放必须发生在事务之内。
    ///
    /// # 流程解释
    /// 1. 加锁 `meta`，若引用计数大于 1，仅减少计数；
    /// 2. 否则锁定数据，若内容未加载或仍有硬链接，只清除缓存有效性；
    /// 3. 否则先释放 `meta` 锁，截断文件、清空类型并写回，
    ///    完成后再重新加锁，把引用计数降为 0。
    fn put(&self, inode: &Inode<'_>) {
        let mut guard = self.meta.lock();
        let i = inode.index;
        if guard[i].refs > 1 {
            guard[i].refs -= 1;
            drop(guard);
            return
        }

        // 引用计数为 1，因此这个锁不会阻塞。
        let mut idata = self.data[i].lock();
        if idata.valid.is_none() || idata.dinode.nlink > 0 {
            idata.valid.take();
            drop(idata);
            guard[i].refs -= 1;
            drop(guard);
            return
        }
        drop(guard);

        trace!("inode: freeing inum {}", inode.inum);
        let mut iguard = InodeGuard { inode, data: idata };
        iguard.truncate();
        iguard.data.dinode.mode = 0;
        iguard.update();
        iguard.data.valid.take();
        drop(iguard);

        // 当缓存中的此 inode 内容不再有效后再回收槽位，
        // 否则新的使用者可能在旧内容写回之前复用它。
        let mut guard = self.meta.lock();
        guard[i].refs -= 1;
        debug_assert_eq!(guard[i].refs, 0);
        drop(guard);
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, inum: u32) -> usize {
        let guard = self.meta.lock();
        guard.iter()
            .filter(|m| m.inum == inum && m.refs > 0)
            .map(|m| m.refs)
            .sum()
    }
}

impl FileSystem {
    /// 获取 `inum` 对应的 inode 句柄，不加锁也不读取磁盘。
    pub fn iget(&self, inum: u32) -> Inode<'_> {
        let index = self.icache.get(self.dev, inum);
        Inode { fs: self, dev: self.dev, inum, index }
    }

    /// 在磁盘上分配一个新的 inode 并返回其句柄，必须在事务中调用。
    pub(crate) fn inode_alloc(&self, itype: InodeType) -> Inode<'_> {
        let inum = self.ialloc(itype);
        self.iget(inum)
    }
}

/// 内存中 inode 的句柄，持有一个缓存引用。
///
/// 克隆即增加引用计数，析构即释放引用；
/// 最后一个引用的析构可能回收磁盘上的 inode，所以应当在事务中丢弃。
pub struct Inode<'fs> {
    fs: &'fs FileSystem,
    dev: u32,
    inum: u32,
    index: usize,
}

impl<'fs> Clone for Inode<'fs> {
    fn clone(&self) -> Self {
        self.fs.icache.dup(self.index);
        Self { fs: self.fs, dev: self.dev, inum: self.inum, index: self.index }
    }
}

impl<'fs> Inode<'fs> {
    #[inline]
    pub fn inum(&self) -> u32 {
        self.inum
    }

    #[inline]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    #[inline]
    pub(crate) fn fs(&self) -> &'fs FileSystem {
        self.fs
    }

    /// 锁定 inode，必要时从磁盘加载其内容。
    ///
    /// # 可能的错误
    /// - 加载到的磁盘 inode 类型为空时 panic，说明有人持有了一个已被释放的 inode。
    pub fn lock<'i>(&'i self) -> InodeGuard<'i, 'fs> {
        let mut data = self.fs.icache.data[self.index].lock();

        if data.valid.is_none() {
            let buf = self.fs.bread(self.fs.sb.locate_inode(self.inum));
            data.dinode = *buf.get::<DiskInode>(locate_inode_offset(self.inum));
            drop(buf);
            data.valid = Some((self.dev, self.inum));
            if data.dinode.is_free() {
                panic!("inode: lock of free inode {}", self.inum);
            }
        }

        InodeGuard { inode: self, data }
    }
}

impl<'fs> fmt::Debug for Inode<'fs> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("dev", &self.dev)
            .field("inum", &self.inum)
            .field("index", &self.index)
            .finish()
    }
}

impl<'fs> Drop for Inode<'fs> {
    fn drop(&mut self) {
        self.fs.icache.put(self);
    }
}

#[derive(Debug)]
struct InodeMeta {
    dev: u32,
    inum: u32,
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refs: 0,
        }
    }
}

/// inode 的内存内容，由睡眠锁保护
#[derive(Debug)]
pub struct InodeData {
    /// 已从磁盘加载时为 `Some((dev, inum))`
    valid: Option<(u32, u32)>,
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: None,
            dinode: DiskInode::new(),
        }
    }
}

/// 已锁定的 inode，持有期间可以读写其内容。
///
/// 修改磁盘上存在的字段后必须调用 [`InodeGuard::update`] 写回，
/// 修改操作必须处于事务之中。
pub struct InodeGuard<'i, 'fs> {
    inode: &'i Inode<'fs>,
    data: SleepLockGuard<'i, InodeData>,
}

impl<'i, 'fs> InodeGuard<'i, 'fs> {
    #[inline]
    pub fn inode(&self) -> &'i Inode<'fs> {
        self.inode
    }

    #[inline]
    pub(crate) fn fs(&self) -> &'fs FileSystem {
        self.inode.fs
    }

    #[inline]
    pub fn itype(&self) -> InodeType {
        self.data.dinode.itype()
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.data.dinode.size
    }

    #[inline]
    pub fn nlink(&self) -> u16 {
        self.data.dinode.nlink
    }

    #[inline]
    pub fn devnum(&self) -> (u16, u16) {
        (self.data.dinode.major, self.data.dinode.minor)
    }

    #[inline]
    pub fn permissions(&self) -> Permissions {
        Permissions::from_bits_truncate(self.data.dinode.mode)
    }

    pub(crate) fn set_devnum(&mut self, major: u16, minor: u16) {
        self.data.dinode.major = major;
        self.data.dinode.minor = minor;
    }

    pub(crate) fn set_permissions(&mut self, perm: Permissions) {
        let dinode = &mut self.data.dinode;
        dinode.mode = (dinode.mode & S_IFMT) | perm.bits();
    }

    /// 链接数加一，达到上限时返回 `TooManyLinks`，不做任何修改。
    pub(crate) fn link(&mut self) -> Result<()> {
        let nlink = self.data.dinode.nlink.checked_add(1).ok_or(FsError::TooManyLinks)?;
        self.data.dinode.nlink = nlink;
        Ok(())
    }

    pub(crate) fn unlink(&mut self) {
        if self.data.dinode.nlink == 0 {
            panic!("inode: unlink of inode {} with no links", self.inode.inum);
        }
        self.data.dinode.nlink -= 1;
    }

    pub(crate) fn set_nlink(&mut self, nlink: u16) {
        self.data.dinode.nlink = nlink;
    }

    /// 把内存中的 inode 写回磁盘，同时刷新修改与访问时间。
    pub fn update(&mut self) {
        let fs = self.fs();
        let now = fs.clock.now();
        self.data.dinode.mtime = now;
        self.data.dinode.atime = now;

        let inum = self.inode.inum;
        let mut buf = fs.bread(fs.sb.locate_inode(inum));
        *buf.get_mut::<DiskInode>(locate_inode_offset(inum)) = self.data.dinode;
        fs.log_write(buf);
    }

    /// 释放 inode 的全部数据块并把大小置零。
    ///
    /// # 流程解释
    /// 1. 释放所有直接块；
    /// 2. 释放一级间接块指向的数据块，再释放间接块本身；
    /// 3. 释放二级间接块下的每个一级间接块及其数据块，再释放二级间接块本身；
    /// 4. 大小置零并写回。
    pub fn truncate(&mut self) {
        let fs = self.fs();
        for i in 0..NDIRECT {
            let bn = self.data.dinode.addrs[i];
            if bn > 0 {
                fs.bfree(bn);
                self.data.dinode.addrs[i] = 0;
            }
        }

        let indirect = self.data.dinode.addrs[NDIRECT];
        if indirect > 0 {
            free_indirect(fs, indirect, 1);
            self.data.dinode.addrs[NDIRECT] = 0;
        }

        let dindirect = self.data.dinode.addrs[NDIRECT + 1];
        if dindirect > 0 {
            free_indirect(fs, dindirect, 2);
            self.data.dinode.addrs[NDIRECT + 1] = 0;
        }

        self.data.dinode.size = 0;
        self.update();
    }

    /// 返回文件第 `bn` 个逻辑块对应的磁盘块号。
    ///
    /// # 功能说明
    /// - `bn < NDIRECT`：直接块；
    /// - 其后 `NINDIRECT` 个块：一级间接块中的第 `bn - NDIRECT` 项；
    /// - 其余：把 `bn - NDIRECT - NINDIRECT` 拆成 `(外层下标, 内层下标)`，
    ///   先在二级间接块中找到一级间接块，再在其中找到数据块。
    ///
    /// `alloc` 为真时按需分配缺失的块（包括中间的索引块）并写入日志；
    /// 为假时遇到缺失的块直接返回 `None`，不会修改任何东西。
    ///
    /// # 可能的错误
    /// - `bn` 超出最大文件块数时 panic。
    pub(crate) fn bmap(&mut self, bn: usize, alloc: bool) -> Option<u32> {
        if bn < NDIRECT {
            return self.addr_slot(bn, alloc)
        }

        let bn = bn - NDIRECT;
        if bn < NINDIRECT {
            let indirect = self.addr_slot(NDIRECT, alloc)?;
            return indirect_entry(self.fs(), indirect, bn, alloc)
        }

        let bn = bn - NINDIRECT;
        if bn < NDINDIRECT {
            let fs = self.fs();
            let outer = self.addr_slot(NDIRECT + 1, alloc)?;
            let inner = indirect_entry(fs, outer, bn / NINDIRECT, alloc)?;
            return indirect_entry(fs, inner, bn % NINDIRECT, alloc)
        }

        panic!("inode: block index {} out of range", bn + NDIRECT + NINDIRECT);
    }

    fn addr_slot(&mut self, i: usize, alloc: bool) -> Option<u32> {
        match self.data.dinode.addrs[i] {
            0 if alloc => {
                let bn = self.fs().balloc();
                self.data.dinode.addrs[i] = bn;
                Some(bn)
            },
            0 => None,
            bn => Some(bn),
        }
    }

    /// 从 inode 中读取数据。
    ///
    /// # 功能说明
    /// 从偏移 `offset` 开始最多读取 `dst.len()` 个字节，遇到文件末尾截止，返回实际读取的字节数。
    /// 从未写入过的块按全零读出，不会分配磁盘块。
    /// 设备文件交给设备表中注册的读函数。
    ///
    /// # 可能的错误
    /// - 设备文件的主设备号未注册时返回 `NoDevice`。
    pub fn read(&mut self, dst: &mut [u8], offset: u32) -> Result<usize> {
        if self.itype() == InodeType::Device {
            let (major, minor) = self.devnum();
            let device = self.fs().devices.get(major)?;
            return (device.read)(minor, dst)
        }

        let size = self.data.dinode.size;
        if offset >= size {
            return Ok(0)
        }
        let count = min(dst.len(), (size - offset) as usize);
        let fs = self.fs();
        let mut offset = offset as usize;
        let mut total = 0;
        while total < count {
            let block_offset = offset % BSIZE;
            let n = min(count - total, BSIZE - block_offset);
            let dst = &mut dst[total..total + n];
            match self.bmap(offset / BSIZE, false) {
                Some(bn) => {
                    let buf = fs.bread(bn);
                    dst.copy_from_slice(&buf.data()[block_offset..block_offset + n]);
                },
                None => dst.fill(0),
            }
            total += n;
            offset += n;
        }
        Ok(count)
    }

    /// 把数据写入 inode。
    ///
    /// # 功能说明
    /// 从偏移 `offset` 开始写入 `src` 的全部内容，按需分配磁盘块，
    /// 文件变大或块地址发生变化时写回 inode。必须在事务中调用，
    /// 且一次写入涉及的块数不能超过单个操作的日志预算。
    ///
    /// # 可能的错误
    /// - `offset` 超过当前文件大小时返回 `OutOfRange`；
    /// - 写入后超过最大文件大小时返回 `FileTooLarge`；
    /// - 设备文件的主设备号未注册时返回 `NoDevice`。
    pub fn write(&mut self, src: &[u8], offset: u32) -> Result<usize> {
        if self.itype() == InodeType::Device {
            let (major, minor) = self.devnum();
            let device = self.fs().devices.get(major)?;
            return (device.write)(minor, src)
        }

        if offset > self.data.dinode.size {
            return Err(FsError::OutOfRange)
        }
        let end = (offset as usize).checked_add(src.len()).ok_or(FsError::FileTooLarge)?;
        if end > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge)
        }

        let fs = self.fs();
        let addrs = self.data.dinode.addrs;
        let mut offset = offset as usize;
        let mut total = 0;
        while total < src.len() {
            let block_offset = offset % BSIZE;
            let n = min(src.len() - total, BSIZE - block_offset);
            let bn = match self.bmap(offset / BSIZE, true) {
                Some(bn) => bn,
                None => panic!("inode: bmap failed to allocate"),
            };
            let mut buf = fs.bread(bn);
            buf.data_mut()[block_offset..block_offset + n].copy_from_slice(&src[total..total + n]);
            fs.log_write(buf);
            total += n;
            offset += n;
        }

        // end <= MAX_FILE_SIZE <= u32::MAX
        let end = end as u32;
        let grown = end > self.data.dinode.size;
        if grown {
            self.data.dinode.size = end;
        }
        if grown || addrs != self.data.dinode.addrs {
            self.update();
        }
        Ok(src.len())
    }

    pub fn stat(&self) -> FileStat {
        let dinode = &self.data.dinode;
        FileStat {
            dev: self.inode.dev,
            inum: self.inode.inum,
            itype: dinode.itype(),
            perm: Permissions::from_bits_truncate(dinode.mode),
            nlink: dinode.nlink,
            size: dinode.size as u64,
            uid: dinode.uid,
            gid: dinode.gid,
            major: dinode.major,
            minor: dinode.minor,
            atime: dinode.atime,
            mtime: dinode.mtime,
            ctime: dinode.ctime,
        }
    }
}

/// 读取间接块 `block` 的第 `i` 项，`alloc` 为真时为空项分配新块。
fn indirect_entry(fs: &FileSystem, block: u32, i: usize, alloc: bool) -> Option<u32> {
    let mut buf = fs.bread(block);
    let bn = *buf.get::<BlockNo>(i);
    if bn != 0 {
        return Some(bn)
    }
    if !alloc {
        return None
    }
    let bn = fs.balloc();
    *buf.get_mut::<BlockNo>(i) = bn;
    fs.log_write(buf);
    Some(bn)
}

/// 释放间接块 `block` 引用的所有块以及它自身，`depth` 为其下方的索引层数。
fn free_indirect(fs: &FileSystem, block: u32, depth: usize) {
    let buf = fs.bread(block);
    let mut entries = [0 as BlockNo; NINDIRECT];
    for (i, entry) in entries.iter_mut().enumerate() {
        *entry = *buf.get::<BlockNo>(i);
    }
    drop(buf);

    for &bn in entries.iter().filter(|&&bn| bn > 0) {
        if depth > 1 {
            free_indirect(fs, bn, depth - 1);
        } else {
            fs.bfree(bn);
        }
    }
    fs.bfree(block);
}

/// 每个磁盘块包含的 inode 数
pub const IPB: usize = BSIZE / mem::size_of::<DiskInode>();

#[inline]
pub fn locate_inode_offset(inum: u32) -> usize {
    inum as usize % IPB
}

type BlockNo = u32;

/// inode 状态信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u32,
    pub inum: u32,
    pub itype: InodeType,
    pub perm: Permissions,
    pub nlink: u16,
    pub size: u64,
    pub uid: u16,
    pub gid: u16,
    pub major: u16,
    pub minor: u16,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// 类型位掩码
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;

bitflags! {
    /// 文件权限位，存放在 `mode` 的低 12 位
    pub struct Permissions: u32 {
        const SETUID = 0o4000;
        const SETGID = 0o2000;
        const STICKY = 0o1000;
        const USER_READ = 0o400;
        const USER_WRITE = 0o200;
        const USER_EXEC = 0o100;
        const GROUP_READ = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC = 0o010;
        const OTHER_READ = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC = 0o001;
    }
}

/// 磁盘上的 inode 结构
///
/// `mode` 的高位是类型（`S_IFMT`），低位是权限；类型位全为 0 表示空闲。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    ctime: u64,
    atime: u64,
    mtime: u64,
    size: u32,
    mode: u32,
    gid: u16,
    uid: u16,
    /// `NDIRECT` 个直接块、一个一级间接块、一个二级间接块
    addrs: [u32; NDIRECT + 2],
    major: u16,
    minor: u16,
    nlink: u16,
    _pad: [u16; 3],
}

unsafe impl OnDisk for DiskInode {}

impl DiskInode {
    pub(crate) const fn new() -> Self {
        Self {
            ctime: 0,
            atime: 0,
            mtime: 0,
            size: 0,
            mode: 0,
            gid: 0,
            uid: 0,
            addrs: [0; NDIRECT + 2],
            major: 0,
            minor: 0,
            nlink: 0,
            _pad: [0; 3],
        }
    }

    /// 如果该 inode 空闲，则清零并以类型 `itype` 分配它。
    pub fn try_alloc(&mut self, itype: InodeType, now: u64) -> core::result::Result<(), ()> {
        if !self.is_free() {
            return Err(())
        }
        *self = Self::new();
        self.mode = itype.bits() | itype.default_permissions().bits();
        self.uid = DEFAULT_UID;
        self.gid = DEFAULT_GID;
        self.ctime = now;
        self.atime = now;
        self.mtime = now;
        Ok(())
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.mode & S_IFMT == 0
    }

    pub fn itype(&self) -> InodeType {
        InodeType::from_mode(self.mode)
    }

    /// 格式化时直接构造已分配的 inode
    pub(crate) fn init(&mut self, itype: InodeType, nlink: u16, now: u64) {
        *self = Self::new();
        self.mode = itype.bits() | itype.default_permissions().bits();
        self.nlink = nlink;
        self.ctime = now;
        self.atime = now;
        self.mtime = now;
    }

    pub(crate) fn addrs_mut(&mut self) -> &mut [u32; NDIRECT + 2] {
        &mut self.addrs
    }

    pub(crate) fn set_size(&mut self, size: u32) {
        self.size = size;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Empty,
    Directory,
    File,
    Symlink,
    Device,
}

impl InodeType {
    pub fn bits(self) -> u32 {
        match self {
            Self::Empty => 0,
            Self::Directory => S_IFDIR,
            Self::File => S_IFREG,
            Self::Symlink => S_IFLNK,
            Self::Device => S_IFCHR,
        }
    }

    /// 从 `mode` 的类型位解码
    ///
    /// # 可能的错误
    /// - 未知的类型位说明磁盘 inode 已经损坏，触发 panic。
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            0 => Self::Empty,
            S_IFDIR => Self::Directory,
            S_IFREG => Self::File,
            S_IFLNK => Self::Symlink,
            S_IFCHR => Self::Device,
            other => panic!("inode: unknown type bits {:#o}", other),
        }
    }

    pub fn default_permissions(self) -> Permissions {
        let bits = match self {
            Self::Empty => 0,
            Self::Directory => 0o755,
            Self::File => 0o644,
            Self::Symlink => 0o777,
            Self::Device => 0o666,
        };
        Permissions::from_bits_truncate(bits)
    }
}
