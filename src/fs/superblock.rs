//! 超级块操作

#[cfg(feature = "verbose_init_info")]
use log::info;

use crate::consts::fs::{BPB, FSMAGIC};
use super::bio::{Bcache, OnDisk};
use super::inode::IPB;

/// 超级块所在的块号，0 号块为引导块
pub const SUPERBLOCK_NO: u32 = 1;

/// 磁盘上的超级块，挂载后在内存中保留一份只读副本。
/// 字段按磁盘上的顺序排列，以小端序存储。
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,      // 文件系统魔数，必须为`FSMAGIC`
    pub size: u32,       // 文件系统映像总块数
    pub nblocks: u32,    // 数据块数量（不含元数据）
    pub ninodes: u32,    // 索引节点总数
    pub nlog: u32,       // 日志块数量
    pub logstart: u32,   // 第一个日志块的块号
    pub inodestart: u32, // 第一个索引节点块的块号
    pub bmapstart: u32,  // 第一个位图块的块号
}

unsafe impl OnDisk for SuperBlock {}

impl SuperBlock {
    /// 读取设备 `dev` 的 1 号块并校验魔数，魔数不符时 panic。
    pub fn read(bcache: &Bcache, dev: u32) -> Self {
        let buf = bcache.bread(dev, SUPERBLOCK_NO);
        let sb = *buf.get::<SuperBlock>(0);
        drop(buf);
        if sb.magic != FSMAGIC {
            panic!("superblock: invalid file system magic {:#x}", sb.magic);
        }

        #[cfg(feature = "verbose_init_info")]
        info!("super block data: {:?}", sb);

        sb
    }

    /// 日志区的 `(起始块号, 块数)`，起始块存放日志头
    pub fn log_region(&self) -> (u32, u32) {
        (self.logstart, self.nlog)
    }

    /// 第 `inum` 个 inode 所在的块号，`inum` 越界时 panic
    pub fn locate_inode(&self, inum: u32) -> u32 {
        if inum >= self.ninodes {
            panic!("superblock: inum {} out of {} inodes", inum, self.ninodes);
        }
        inum / (IPB as u32) + self.inodestart
    }

    /// 定位管理数据块 `blockno` 的位图块
    pub fn bitmap_blockno(&self, blockno: u32) -> u32 {
        blockno / BPB + self.bmapstart
    }

    /// 第一个数据块的块号
    pub fn data_start(&self) -> u32 {
        self.size - self.nblocks
    }
}
