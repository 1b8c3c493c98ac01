//! 睡眠锁
//!
//! 抢不到锁的线程交给调度器挂起，直到持有者释放时被唤醒。
//! 缓冲块数据与索引节点内容都由睡眠锁保护，持有期间可以进行磁盘 I/O。

use core::ops::{Deref, DerefMut, Drop};
use core::cell::{Cell, UnsafeCell};

use crate::process;
use crate::spinlock::SpinLock;

pub struct SleepLock<T: ?Sized> {
    /// 保护 `locked` 状态的内部自旋锁
    lock: SpinLock<()>,
    /// 锁是否已被占用，只在持有 `lock` 时访问
    locked: Cell<bool>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁，锁被占用时当前线程休眠直到被唤醒。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();
        while self.locked.get() {
            process::sleep(self.chan(), guard);
            guard = self.lock.lock();
        }
        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 锁当前是否被任意线程持有。
    pub fn is_locked(&self) -> bool {
        let guard = self.lock.lock();
        let locked = self.locked.get();
        drop(guard);
        locked
    }

    fn unlock(&self) {
        let guard = self.lock.lock();
        if !self.locked.get() {
            panic!("sleeplock {} release", self.name);
        }
        self.locked.set(false);
        process::wakeup(self.chan());
        drop(guard);
    }

    #[inline]
    fn chan(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
