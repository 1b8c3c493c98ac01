//! 宿主机上的测试环境：用操作系统线程模拟硬件线程，用内存盘模拟磁盘。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::consts::fs::BSIZE;
use crate::driver::ramdisk::RamDisk;
use crate::driver::{BlockDevice, Clock};
use crate::fs::{mkfs, FileSystem};
use crate::process::{self, Scheduler};

pub const TEST_DEV: u32 = 1;
pub const FS_BLOCKS: u32 = 2000;
pub const FS_INODES: u32 = 200;

/// 每个测试线程占用一个独立的“硬件线程”编号。
///
/// 休眠者等待一个全局的唤醒代数发生变化，不区分通道，
/// 调用者总会在循环中重新检查条件，多余的唤醒无害。
struct HostScheduler {
    generation: Mutex<u64>,
    cond: Condvar,
}

static HOST: HostScheduler = HostScheduler {
    generation: Mutex::new(0),
    cond: Condvar::new(),
};

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static CPU_ID: usize = NEXT_CPU.fetch_add(1, Ordering::Relaxed);
}

impl HostScheduler {
    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Scheduler for HostScheduler {
    fn cpu_id(&self) -> usize {
        CPU_ID.with(|id| *id)
    }

    fn ncpu(&self) -> usize {
        4
    }

    fn sleep(&self, _chan: usize, unlock: &mut dyn FnMut()) {
        let mut generation = self.generation();
        let seen = *generation;
        unlock();
        while *generation == seen {
            generation = self.cond.wait(generation).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn wakeup(&self, _chan: usize) {
        let mut generation = self.generation();
        *generation += 1;
        self.cond.notify_all();
    }
}

/// 注册调度器并初始化日志输出，可以重复调用。
pub fn setup() {
    process::register(&HOST);
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 停止的时钟，保证同样的操作序列产生逐字节相同的磁盘映像
pub struct TestClock(u64);

impl Clock for TestClock {
    fn now(&self) -> u64 {
        self.0
    }
}

pub static CLOCK: TestClock = TestClock(1_000_000);

/// 可以模拟断电的内存盘。
///
/// 统计读写次数；设置写入预算后，预算耗尽之后的写入全部被丢弃，
/// 相当于在那一刻断电，之后磁盘内容不再变化。
pub struct CrashDisk {
    disk: RamDisk,
    reads: AtomicUsize,
    writes: AtomicUsize,
    budget: Mutex<Option<usize>>,
}

impl CrashDisk {
    pub fn leak(nblocks: usize) -> &'static Self {
        Box::leak(Box::new(Self {
            disk: RamDisk::new(TEST_DEV, nblocks),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            budget: Mutex::new(None),
        }))
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 实际落盘的写入次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 之后只允许再写入 `n` 次
    pub fn crash_after(&self, n: usize) {
        *self.budget.lock().unwrap() = Some(n);
    }

    /// 解除写入预算，模拟重新上电。
    pub fn power_on(&self) {
        *self.budget.lock().unwrap() = None;
    }

    /// 绕过统计直接读取磁盘上的块
    pub fn raw_block(&self, blockno: u32) -> [u8; BSIZE] {
        let mut data = [0; BSIZE];
        self.disk.read(TEST_DEV, blockno, &mut data);
        data
    }

    pub fn image(&self) -> Vec<u8> {
        self.disk.image()
    }

    pub fn restore(&self, image: &[u8]) {
        self.disk.restore(image);
    }
}

impl BlockDevice for CrashDisk {
    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.disk.read(dev, blockno, data);
    }

    fn write(&self, dev: u32, blockno: u32, data: &[u8; BSIZE]) {
        let mut budget = self.budget.lock().unwrap();
        match *budget {
            Some(0) => return,
            Some(ref mut n) => *n -= 1,
            None => {},
        }
        drop(budget);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.disk.write(dev, blockno, data);
    }
}

/// 格式化一块新的测试盘
pub fn formatted_disk() -> &'static CrashDisk {
    setup();
    let disk = CrashDisk::leak(FS_BLOCKS as usize);
    mkfs::format(disk, TEST_DEV, FS_BLOCKS, FS_INODES, &CLOCK);
    disk
}

/// 在 `disk` 上挂载一个新的文件系统实例，模拟重启后的挂载。
pub fn mount(disk: &'static CrashDisk) -> &'static FileSystem {
    setup();
    Box::leak(Box::new(FileSystem::mount(TEST_DEV, disk, &CLOCK)))
}

pub fn fresh_fs() -> &'static FileSystem {
    mount(formatted_disk())
}
