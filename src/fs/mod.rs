//! 文件系统实现，自底向上分为以下几层：
//!
//! - 块设备：由 [`BlockDevice`] 特质抽象；
//! - 缓存层：缓存磁盘块并同步对块的访问，见 [`bio`]；
//! - 日志层：把多个写操作打包成可以在崩溃后恢复的事务，见 [`log`]；
//! - 索引节点层：inode 的分配、读写与元数据，见 [`inode`]；
//! - 目录层：内容为目录项列表的特殊 inode，见 [`dir`]；
//! - 路径层：逐级解析路径名，见 [`path`]；
//! - 操作层：create、link、rename 等命名空间操作，见 [`ops`]；
//! - 文件描述层：带偏移量的打开文件，见 [`file`]。

use ::log::info;

use crate::driver::{BlockDevice, Clock, Device, DeviceTable};
use crate::error::Result;
use crate::process;

mod bio;
mod block;
mod dir;
mod file;
mod inode;
mod log;
mod ops;
mod path;
mod superblock;

pub mod mkfs;

#[cfg(test)]
mod tests;

pub use bio::{Bcache, Buf};
pub use dir::{DirEntry, DirName, DIRENT_SIZE};
pub use file::{File, OpenFlags, SeekFrom};
pub use inode::{FileStat, Inode, InodeGuard, InodeType, Permissions};
pub use superblock::SuperBlock;

use self::inode::InodeCache;
use self::log::Log;

/// 一个已挂载的文件系统实例。
///
/// 所有层共享同一个实例，通过 `&FileSystem` 显式传递，不依赖任何全局状态。
/// 内核通常把它放在一个 `'static` 位置上，例如 `spin::Once`。
pub struct FileSystem {
    dev: u32,
    sb: SuperBlock,
    bcache: Bcache,
    log: Log,
    icache: InodeCache,
    clock: &'static dyn Clock,
    devices: DeviceTable,
}

impl FileSystem {
    /// 挂载设备 `dev` 上的文件系统。
    ///
    /// # 流程解释
    /// 1. 按活动硬件线程数建立缓冲区缓存；
    /// 2. 读取并校验超级块；
    /// 3. 初始化日志层，若日志中有已提交但未安装的事务则重放；
    /// 4. 建立空的 inode 缓存和设备表。
    ///
    /// # 可能的错误
    /// - 超级块魔数不符时 panic。
    pub fn mount(dev: u32, disk: &'static dyn BlockDevice, clock: &'static dyn Clock) -> Self {
        let bcache = Bcache::new(disk, process::scheduler().ncpu());
        let sb = SuperBlock::read(&bcache, dev);
        let log = Log::new(&bcache, dev, &sb);
        info!("fs: mounted dev {} with {} blocks, {} inodes", dev, sb.size, sb.ninodes);
        Self {
            dev,
            sb,
            bcache,
            log,
            icache: InodeCache::new(),
            clock,
            devices: DeviceTable::new(),
        }
    }

    #[inline]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    #[inline]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// 开始一个文件系统操作，日志空间不足或正在提交时会休眠等待。
    pub fn begin_op(&self) {
        self.log.begin_op();
    }

    /// 结束一个文件系统操作，最后一个结束的操作负责提交。
    pub fn end_op(&self) {
        self.log.end_op(&self.bcache);
    }

    /// 开始一个操作，返回的守卫在析构时结束该操作。
    pub fn transaction(&self) -> Transaction<'_> {
        self.begin_op();
        Transaction { fs: self }
    }

    /// 注册主设备号为 `major` 的设备读写入口。
    pub fn register_device(&self, major: u16, device: Device) -> Result<()> {
        self.devices.register(major, device)
    }

    /// 统计文件系统的容量与剩余空间。
    pub fn statfs(&self) -> FsStat {
        FsStat {
            size: self.sb.size,
            nblocks: self.sb.nblocks,
            free_blocks: self.count_free_blocks(),
            ninodes: self.sb.ninodes,
            free_inodes: self.count_free_inodes(),
        }
    }

    #[inline]
    pub(crate) fn bread(&self, blockno: u32) -> Buf<'_> {
        self.bcache.bread(self.dev, blockno)
    }

    #[inline]
    pub(crate) fn log_write(&self, buf: Buf<'_>) {
        self.log.write(&self.bcache, buf);
    }
}

/// 一个进行中的文件系统操作
#[must_use]
pub struct Transaction<'fs> {
    fs: &'fs FileSystem,
}

impl<'fs> Drop for Transaction<'fs> {
    fn drop(&mut self) {
        self.fs.end_op();
    }
}

/// 文件系统容量信息，单位均为块或 inode 个数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub size: u32,
    pub nblocks: u32,
    pub free_blocks: u32,
    pub ninodes: u32,
    pub free_inodes: u32,
}
