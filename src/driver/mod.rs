//! 设备驱动接口，文件系统通过这里定义的特质访问块设备、时钟与设备文件

use crate::consts::{driver::NDEV, fs::BSIZE};
use crate::error::{FsError, Result};
use crate::spinlock::SpinLock;

pub mod ramdisk;

/// 块设备驱动特质。
///
/// 读写均为同步操作，调用者可能在操作完成前被挂起。
/// 驱动内部的失败对请求者来说是致命的，由驱动自行 panic。
pub trait BlockDevice: Send + Sync {
    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]);
    fn write(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]);
}

/// 实时时钟，为索引节点提供时间戳（秒）。
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// 设备文件的读写入口，按主设备号注册。
#[derive(Clone, Copy)]
pub struct Device {
    pub read: fn(minor: u16, dst: &mut [u8]) -> Result<usize>,
    pub write: fn(minor: u16, src: &[u8]) -> Result<usize>,
}

/// 主设备号到设备入口的映射表
pub struct DeviceTable {
    table: SpinLock<[Option<Device>; NDEV]>,
}

impl DeviceTable {
    pub const fn new() -> Self {
        Self {
            table: SpinLock::new([None; NDEV], "devsw"),
        }
    }

    /// 注册主设备号为 `major` 的设备，重复注册会覆盖之前的入口。
    pub fn register(&self, major: u16, device: Device) -> Result<()> {
        let major = major as usize;
        if major >= NDEV {
            return Err(FsError::NoDevice)
        }
        self.table.lock()[major] = Some(device);
        Ok(())
    }

    /// 查找设备入口；不持有表锁调用设备函数，设备读写可能会休眠。
    pub fn get(&self, major: u16) -> Result<Device> {
        let major = major as usize;
        if major >= NDEV {
            return Err(FsError::NoDevice)
        }
        self.table.lock()[major].ok_or(FsError::NoDevice)
    }
}
