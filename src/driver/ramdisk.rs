//! 内存盘：把块保存在内存里的块设备
//!
//! 没有真实磁盘时可以用它承载文件系统映像，测试中也用它模拟磁盘。

use alloc::vec;
use alloc::vec::Vec;

use crate::consts::fs::BSIZE;
use crate::spinlock::SpinLock;
use super::BlockDevice;

pub struct RamDisk {
    dev: u32,
    blocks: SpinLock<Vec<[u8; BSIZE]>>,
}

impl RamDisk {
    /// 创建一个全零的、包含 `nblocks` 个块的内存盘。
    pub fn new(dev: u32, nblocks: usize) -> Self {
        Self {
            dev,
            blocks: SpinLock::new(vec![[0; BSIZE]; nblocks], "ramdisk"),
        }
    }

    /// 导出整个磁盘映像的副本。
    pub fn image(&self) -> Vec<u8> {
        let blocks = self.blocks.lock();
        let mut image = Vec::with_capacity(blocks.len() * BSIZE);
        for block in blocks.iter() {
            image.extend_from_slice(block);
        }
        image
    }

    /// 用映像覆盖磁盘内容，映像大小必须与磁盘一致。
    pub fn restore(&self, image: &[u8]) {
        let mut blocks = self.blocks.lock();
        if image.len() != blocks.len() * BSIZE {
            panic!("ramdisk: image size {} mismatch", image.len());
        }
        for (block, chunk) in blocks.iter_mut().zip(image.chunks(BSIZE)) {
            block.copy_from_slice(chunk);
        }
    }

    fn check(&self, dev: u32, blockno: u32, nblocks: usize) {
        if dev != self.dev {
            panic!("ramdisk: request for dev {} on dev {}", dev, self.dev);
        }
        if blockno as usize >= nblocks {
            panic!("ramdisk: block {} out of range", blockno);
        }
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock();
        self.check(dev, blockno, blocks.len());
        data.copy_from_slice(&blocks[blockno as usize]);
    }

    fn write(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock();
        self.check(dev, blockno, blocks.len());
        blocks[blockno as usize].copy_from_slice(data);
    }
}
