//! 调度器接口
//!
//! 文件系统本身不实现进程调度，只消费调度器提供的三种能力：
//! 查询当前硬件线程编号、在某个等待通道上休眠、唤醒某个等待通道上的所有休眠者。
//! 内核在挂载文件系统之前通过 [`register`] 注册唯一的调度器实现。

use spin::Once;

use crate::spinlock::SpinLockGuard;

static SCHEDULER: Once<&'static dyn Scheduler> = Once::new();

/// 调度器能力。
///
/// # 约定
/// - `sleep` 必须先让调用者进入可被唤醒的状态，再调用一次 `unlock`
///   释放调用者持有的自旋锁，之后挂起调用者直到 `wakeup` 作用于同一通道。
///   允许虚假唤醒，所有调用者都会在循环中重新检查条件。
/// - `push_off`/`pop_off` 成对出现，用于在持有自旋锁期间屏蔽中断。
pub trait Scheduler: Sync {
    /// 当前硬件线程编号，用于自旋锁的持有者检查。
    fn cpu_id(&self) -> usize;

    /// 当前处于活动状态的硬件线程数量。
    fn ncpu(&self) -> usize;

    fn sleep(&self, chan: usize, unlock: &mut dyn FnMut());

    fn wakeup(&self, chan: usize);

    fn push_off(&self) {}

    fn pop_off(&self) {}
}

/// 注册调度器，只有第一次调用生效。
pub fn register(scheduler: &'static dyn Scheduler) {
    SCHEDULER.call_once(|| scheduler);
}

/// 获取已注册的调度器；在注册之前使用任何锁都是内核初始化顺序错误。
pub(crate) fn scheduler() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(s) => *s,
        None => panic!("process: scheduler used before registration"),
    }
}

/// 在通道 `chan` 上休眠，休眠前释放 `guard`。
/// 返回时不再持有该自旋锁，调用者需要重新获取。
pub(crate) fn sleep<T: ?Sized>(chan: usize, guard: SpinLockGuard<'_, T>) {
    let mut guard = Some(guard);
    scheduler().sleep(chan, &mut || drop(guard.take()));
    // 调度器必须已经释放了锁
    debug_assert!(guard.is_none());
}

pub(crate) fn wakeup(chan: usize) {
    scheduler().wakeup(chan);
}
