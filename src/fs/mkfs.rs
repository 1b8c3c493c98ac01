//! 格式化
//!
//! 磁盘布局：
//! [ 引导块 | 超级块 | 日志头 + 日志块 | inode 块 | 位图块 | 数据块 ]

use bit_field::BitField;
use log::info;

use crate::consts::fs::{BSIZE, BPB, FSMAGIC, LOGSIZE, ROOTINUM};
use crate::driver::{BlockDevice, Clock};
use super::bio::Bcache;
use super::dir::{DirEntry, DirName, DIRENT_SIZE};
use super::inode::{DiskInode, InodeType, IPB, locate_inode_offset};
use super::superblock::{SuperBlock, SUPERBLOCK_NO};

/// 在设备 `dev` 上建立一个大小为 `size` 块、含 `ninodes` 个 inode 的空文件系统。
///
/// # 功能说明
/// 清零整个设备，写入超级块，建立只含 "." 与 ".." 的根目录，
/// 并在位图中标记全部元数据块与根目录的数据块为已占用。
/// 直接写盘，不经过日志，只能在挂载之前调用。
///
/// # 返回值
/// 写入磁盘的超级块。
///
/// # 可能的错误
/// - `size` 容纳不下元数据与根目录时 panic。
pub fn format(disk: &'static dyn BlockDevice, dev: u32, size: u32, ninodes: u32, clock: &dyn Clock)
    -> SuperBlock
{
    let nlog = LOGSIZE as u32 + 1;
    let ninodeblocks = ninodes / IPB as u32 + 1;
    let nbitmap = size / BPB + 1;
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    if size <= nmeta {
        panic!("mkfs: {} blocks cannot hold {} metadata blocks", size, nmeta);
    }

    let sb = SuperBlock {
        magic: FSMAGIC,
        size,
        nblocks: size - nmeta,
        ninodes,
        nlog,
        logstart: 2,
        inodestart: 2 + nlog,
        bmapstart: 2 + nlog + ninodeblocks,
    };
    info!(
        "mkfs: nmeta {} (boot, super, log blocks {} inode blocks {}, bitmap blocks {}) blocks {} total {}",
        nmeta, nlog, ninodeblocks, nbitmap, sb.nblocks, size,
    );

    let zeroes = [0u8; BSIZE];
    for blockno in 0..size {
        disk.write(dev, blockno, &zeroes);
    }

    let bcache = Bcache::new(disk, 1);

    let mut buf = bcache.bread(dev, SUPERBLOCK_NO);
    *buf.get_mut::<SuperBlock>(0) = sb;
    buf.bwrite();
    drop(buf);

    // 根目录占用第一个数据块
    let root_block = sb.data_start();
    let mut buf = bcache.bread(dev, root_block);
    let entries = [DirEntry::new(ROOTINUM, &DirName::dot()), DirEntry::new(ROOTINUM, &DirName::dotdot())];
    for (i, entry) in entries.iter().enumerate() {
        buf.data_mut()[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE].copy_from_slice(&entry.to_bytes());
    }
    buf.bwrite();
    drop(buf);

    let mut buf = bcache.bread(dev, sb.locate_inode(ROOTINUM));
    let dinode = buf.get_mut::<DiskInode>(locate_inode_offset(ROOTINUM));
    dinode.init(InodeType::Directory, 1, clock.now());
    dinode.addrs_mut()[0] = root_block;
    dinode.set_size((entries.len() * DIRENT_SIZE) as u32);
    buf.bwrite();
    drop(buf);

    let used = root_block + 1;
    for base in (0..used).step_by(BPB as usize) {
        let mut buf = bcache.bread(dev, sb.bitmap_blockno(base));
        for blockno in base..core::cmp::min(used, base + BPB) {
            let offset = blockno - base;
            buf.data_mut()[(offset / 8) as usize].set_bit((offset % 8) as usize, true);
        }
        buf.bwrite();
    }

    sb
}
