//! 磁盘块操作，包括位映射与索引节点分配

use bit_field::BitField;
use log::debug;

use crate::consts::fs::BPB;
use super::FileSystem;
use super::inode::{DiskInode, InodeType, locate_inode_offset};

impl FileSystem {
    /// 从文件系统的位图中分配一个空闲的磁盘块，并将该块内容清零后返回其块号。
    ///
    /// # 流程解释
    /// 1. 按照 BPB（每个位图块能管理的块数）分段遍历全部块；
    /// 2. 对每个位图块，找到第一个为 0 的位，将其置为 1 并交给日志；
    /// 3. 读取对应的数据块，清零后同样交给日志，返回该块号。
    ///
    /// 元数据区在格式化时已被标记为占用，因此不会被分配出去。
    ///
    /// # 可能的错误
    /// - 没有空闲块时 panic。
    pub(crate) fn balloc(&self) -> u32 {
        let total_block = self.sb.size;
        for base in (0..total_block).step_by(BPB as usize) {
            let mut buf = self.bread(self.sb.bitmap_blockno(base));
            for offset in 0..BPB {
                if base + offset >= total_block {
                    break;
                }
                let index = (offset / 8) as usize;
                let bit = (offset % 8) as usize;
                let byte = &mut buf.data_mut()[index];
                if byte.get_bit(bit) {
                    continue;
                }
                byte.set_bit(bit, true);
                self.log_write(buf);

                let free_bn = base + offset;
                let mut free_buf = self.bread(free_bn);
                free_buf.data_mut().fill(0);
                self.log_write(free_buf);
                debug!("bitmap: allocated block {}", free_bn);
                return free_bn
            }
            drop(buf);
        }

        panic!("bitmap: out of free blocks");
    }

    /// 释放一个磁盘块，把位图中对应的位清零。
    ///
    /// # 可能的错误
    /// - 释放一个未被分配的块会触发 panic。
    pub(crate) fn bfree(&self, blockno: u32) {
        let bm_offset = blockno % BPB;
        let index = (bm_offset / 8) as usize;
        let bit = (bm_offset % 8) as usize;
        let mut buf = self.bread(self.sb.bitmap_blockno(blockno));

        let byte = &mut buf.data_mut()[index];
        if !byte.get_bit(bit) {
            panic!("bitmap: double freeing block {}", blockno);
        }
        byte.set_bit(bit, false);
        self.log_write(buf);
        debug!("bitmap: freed block {}", blockno);
    }

    /// 在磁盘上分配一个类型为 `itype` 的空闲索引节点，返回其编号。
    ///
    /// # 流程解释
    /// 从 1 号开始（0 号保留）依次检查每个磁盘索引节点，
    /// 找到类型为空的节点后清零、写入类型和时间戳并交给日志。
    ///
    /// # 可能的错误
    /// - 索引节点耗尽时 panic。
    pub(crate) fn ialloc(&self, itype: InodeType) -> u32 {
        let now = self.clock.now();
        for inum in 1..self.sb.ninodes {
            let mut buf = self.bread(self.sb.locate_inode(inum));
            let dinode = buf.get_mut::<DiskInode>(locate_inode_offset(inum));
            if dinode.try_alloc(itype, now).is_ok() {
                self.log_write(buf);
                debug!("inode: allocated inum {} as {:?}", inum, itype);
                return inum
            }
        }

        panic!("inode: out of free inodes");
    }

    /// 统计位图中空闲的数据块数。
    pub(crate) fn count_free_blocks(&self) -> u32 {
        let total_block = self.sb.size;
        let mut free = 0;
        for base in (0..total_block).step_by(BPB as usize) {
            let buf = self.bread(self.sb.bitmap_blockno(base));
            let bits = core::cmp::min(BPB, total_block - base);
            free += (0..bits)
                .filter(|&offset| !buf.data()[(offset / 8) as usize].get_bit((offset % 8) as usize))
                .count() as u32;
        }
        free
    }

    /// 统计类型为空的磁盘索引节点数，0 号节点不计入。
    pub(crate) fn count_free_inodes(&self) -> u32 {
        let mut free = 0;
        let mut inum = 1;
        while inum < self.sb.ninodes {
            let blockno = self.sb.locate_inode(inum);
            let buf = self.bread(blockno);
            while inum < self.sb.ninodes && self.sb.locate_inode(inum) == blockno {
                if buf.get::<DiskInode>(locate_inode_offset(inum)).is_free() {
                    free += 1;
                }
                inum += 1;
            }
        }
        free
    }
}
