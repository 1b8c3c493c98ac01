//! 缓存层
//!
//! 缓冲块按块号散列到若干个桶中，每个桶由独立的自旋锁保护，
//! 桶内按最近释放的先后顺序维护一条双向链表（以数组下标代替指针）。
//! 同一时刻最多持有一个桶锁；跨桶回收时逐个加锁、逐个释放。

use array_macro::array;
use log::trace;

use core::cmp::{max, min};
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{Ordering, AtomicBool};

use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use crate::consts::fs::{NBUF, NBUCKET, BSIZE};

/// 全局缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问并提升 I/O 性能。它结合 LRU（最近最少使用）替换策略
/// 维护块缓冲的使用顺序，并通过自旋锁与睡眠锁机制实现线程安全的数据访问。
///
/// 每个 `(dev, blockno)` 在缓存中至多对应一个缓冲块。
/// 被日志标记为脏的缓冲块在提交完成之前永远不会被回收。
pub struct Bcache {
    disk: &'static dyn BlockDevice,

    /// 实际使用的桶数，等于 `min(NBUCKET, 活动硬件线程数)`
    nbucket: usize,

    /// 每个桶的 LRU 链表及其成员的元信息，由桶自旋锁保护。
    buckets: [SpinLock<BufLru>; NBUCKET],

    /// 缓冲块数组，长度为固定值 `NBUF`。
    ///
    /// 每个缓冲块包含块数据和一个睡眠锁（`SleepLock`），
    /// 数据在持有睡眠锁期间才可访问，元信息由所在桶的自旋锁管理。
    bufs: [BufInner; NBUF],
}

impl Bcache {
    /// 创建缓冲区缓存，并把所有缓冲块轮流分配到各个桶中。
    ///
    /// # 参数
    /// - `disk`: 缓存背后的块设备；
    /// - `ncpu`: 活动硬件线程数，用于确定桶数。
    pub fn new(disk: &'static dyn BlockDevice, ncpu: usize) -> Self {
        let bcache = Self {
            disk,
            nbucket: min(NBUCKET, max(ncpu, 1)),
            buckets: array![_ => SpinLock::new(BufLru::new(), "bcache.bucket"); NBUCKET],
            bufs: array![_ => BufInner::new(); NBUF],
        };
        for index in 0..NBUF {
            let mut lru = bcache.buckets[index % bcache.nbucket].lock();
            lru.push_back(index);
        }
        bcache
    }

    #[inline]
    fn bucket_of(&self, blockno: u32) -> usize {
        blockno as usize % self.nbucket
    }

    /// 获取指定设备与块号对应的缓冲块，返回时已持有其睡眠锁。
    ///
    /// # 流程解释
    /// - 在目标桶中查找是否已缓存该块，命中则增加引用计数；
    /// - 未命中时从目标桶的 LRU 尾部寻找引用计数为 0 且不脏的缓冲块并改作他用；
    /// - 目标桶中没有可回收的缓冲块时，依次扫描其他桶，把可回收的缓冲块迁入目标桶；
    /// - 所有桶都没有可回收的缓冲块时 panic。
    ///
    /// 该函数不涉及实际磁盘读写，调用者需通过 `valid` 字段判断是否需要从磁盘加载数据。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let b = self.bucket_of(blockno);
        let mut lru = self.buckets[b].lock();

        // 查找缓存块
        if let Some(index) = lru.find_cached(dev, blockno) {
            drop(lru);
            trace!("bcache: hit dev {} block {} in slot {}", dev, blockno, index);
            return self.locked_buf(index, dev, blockno)
        }

        // 未缓存，回收本桶中最近最少使用（LRU）的空闲缓冲区
        if let Some(index) = lru.recycle(dev, blockno) {
            self.bufs[index].valid.store(false, Ordering::Relaxed);
            drop(lru);
            return self.locked_buf(index, dev, blockno)
        }
        drop(lru);

        // 从其他桶借用，每次只持有一个桶锁
        for other in (1..self.nbucket).map(|i| (b + i) % self.nbucket) {
            let mut other_lru = self.buckets[other].lock();
            let stolen = other_lru.steal();
            drop(other_lru);

            if let Some(index) = stolen {
                trace!("bcache: slot {} moves from bucket {} to {}", index, other, b);
                let mut lru = self.buckets[b].lock();
                // 未持有本桶锁期间，其他线程可能已经缓存了该块
                if let Some(cached) = lru.find_cached(dev, blockno) {
                    lru.adopt(index, None);
                    drop(lru);
                    return self.locked_buf(cached, dev, blockno)
                }
                lru.adopt(index, Some((dev, blockno)));
                self.bufs[index].valid.store(false, Ordering::Relaxed);
                drop(lru);
                return self.locked_buf(index, dev, blockno)
            }
        }

        panic!("bcache: no usable buffer")
    }

    fn locked_buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            bcache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 若缓冲块未被标记为有效（即未曾从磁盘加载），则会自动触发一次从磁盘读取操作，
    /// 因此缓冲块保持有效期间同一块不会被重复读取。
    ///
    /// # 返回值
    /// - 返回一个 `Buf` 对象，内部持有锁保护的数据访问权，析构时释放。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.read(dev, blockno, b.data_mut());
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 释放缓冲块的引用，如果不再被引用，将其移动到所在桶的最近使用位置。
    fn brelse(&self, index: usize, blockno: u32) {
        self.buckets[self.bucket_of(blockno)].lock().move_if_no_ref(index);
    }

    /// 设置缓冲块的脏标志。脏缓冲块不会被回收，只由日志在提交后清除。
    pub(crate) fn set_dirty(&self, buf: &Buf<'_>, dirty: bool) {
        let mut lru = self.buckets[self.bucket_of(buf.blockno)].lock();
        lru.inner[buf.index].dirty = dirty;
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, dev: u32, blockno: u32) -> Option<usize> {
        let lru = self.buckets[self.bucket_of(blockno)].lock();
        let found = lru
            .iter()
            .find(|&i| lru.inner[i].key == Some((dev, blockno)))
            .map(|i| lru.inner[i].refcnt);
        found
    }

    #[cfg(test)]
    pub(crate) fn nbucket(&self) -> usize {
        self.nbucket
    }
}

/// 缓冲块数据的包装结构，表示一个已加锁的磁盘块缓存实体。
///
/// `Buf` 结构代表一个特定 `(dev, blockno)` 的缓冲区块，
/// 持有对其数据的独占访问权限（由 `SleepLockGuard` 保护），
/// 并在生命周期结束时自动调用 `Drop`，先释放睡眠锁再更新 LRU 状态。
pub struct Buf<'a> {
    bcache: &'a Bcache,

    /// 缓冲块在缓冲数组中的索引位置。
    index: usize,

    dev: u32,

    blockno: u32,

    /// 缓冲数据的睡眠锁保护访问器。
    ///
    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// 析构时先取出并释放该字段，实现先释放锁再减少引用计数。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    #[inline]
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 把缓冲块内容同步写回磁盘。
    /// 文件系统内部的修改应当交给日志层，只有日志自身直接写盘。
    pub fn bwrite(&mut self) {
        let (dev, blockno) = (self.dev, self.blockno);
        let disk = self.bcache.disk;
        disk.write(dev, blockno, self.data());
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.guard().0
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.guard_mut().0
    }

    /// 把缓冲块视为 `T` 的数组，返回第 `i` 个元素的引用。
    pub(crate) fn get<T: OnDisk>(&self, i: usize) -> &T {
        self.guard().get(i)
    }

    pub(crate) fn get_mut<T: OnDisk>(&mut self, i: usize) -> &mut T {
        self.guard_mut().get_mut(i)
    }

    #[cfg(test)]
    pub(crate) fn slot(&self) -> usize {
        self.index
    }

    fn guard(&self) -> &BufData {
        match self.data.as_ref() {
            Some(guard) => guard.deref(),
            None => panic!("buf: data accessed after release"),
        }
    }

    fn guard_mut(&mut self) -> &mut BufData {
        match self.data.as_mut() {
            Some(guard) => guard.deref_mut(),
            None => panic!("buf: data accessed after release"),
        }
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.bcache.brelse(self.index, self.blockno);
    }
}

/// 一个桶的 LRU（最近最少使用）链表控制结构。
///
/// `inner` 与全局缓冲数组一一对应，但只有当前属于本桶的缓冲块的条目有意义；
/// 链表通过 `prev`/`next` 下标串联本桶成员，头部是最近释放的块，尾部是最久未用的块。
/// 缓冲块从一个桶迁移到另一个桶时，其元信息随之复制。
struct BufLru {
    inner: [BufCtrl; NBUF],
    head: Option<usize>,
    tail: Option<usize>,
}

impl BufLru {
    fn new() -> Self {
        Self {
            inner: [BufCtrl::new(); NBUF],
            head: None,
            tail: None,
        }
    }

    /// 从头部开始查找已缓存的块，命中则引用计数加一。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = self.head;
        while let Some(i) = b {
            let ctrl = &mut self.inner[i];
            if ctrl.key == Some((dev, blockno)) {
                ctrl.refcnt += 1;
                return Some(i)
            }
            b = ctrl.next;
        }
        None
    }

    /// 从 LRU 链表尾部回收一个引用计数为 0 且不脏的缓冲块，并把它绑定到新的块。
    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let i = self.find_free()?;
        let ctrl = &mut self.inner[i];
        ctrl.key = Some((dev, blockno));
        ctrl.refcnt = 1;
        Some(i)
    }

    /// 把一个可回收的缓冲块摘出本桶，交给其他桶使用。
    fn steal(&mut self) -> Option<usize> {
        let i = self.find_free()?;
        self.detach(i);
        self.inner[i].key = None;
        Some(i)
    }

    /// 接收从其他桶迁入的缓冲块。
    /// `key` 为 `Some` 时该块立即被当前请求占用，否则作为空闲块放在尾部。
    fn adopt(&mut self, i: usize, key: Option<(u32, u32)>) {
        let ctrl = &mut self.inner[i];
        ctrl.key = key;
        ctrl.dirty = false;
        if key.is_some() {
            ctrl.refcnt = 1;
            self.push_front(i);
        } else {
            ctrl.refcnt = 0;
            self.push_back(i);
        }
    }

    fn find_free(&self) -> Option<usize> {
        let mut b = self.tail;
        while let Some(i) = b {
            let ctrl = &self.inner[i];
            // 即使引用计数为 0，脏标志也说明该块已被日志修改但尚未提交
            if ctrl.refcnt == 0 && !ctrl.dirty {
                return Some(i)
            }
            b = ctrl.prev;
        }
        None
    }

    /// 引用计数减一，若归零则把该块移到链表头部。
    fn move_if_no_ref(&mut self, i: usize) {
        let ctrl = &mut self.inner[i];
        if ctrl.refcnt == 0 {
            panic!("bcache: release of unheld buffer {}", i);
        }
        ctrl.refcnt -= 1;
        if ctrl.refcnt == 0 && self.head != Some(i) {
            self.detach(i);
            self.push_front(i);
        }
    }

    fn detach(&mut self, i: usize) {
        let (prev, next) = (self.inner[i].prev, self.inner[i].next);
        match prev {
            Some(p) => self.inner[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.inner[n].prev = prev,
            None => self.tail = prev,
        }
        self.inner[i].prev = None;
        self.inner[i].next = None;
    }

    fn push_front(&mut self, i: usize) {
        self.inner[i].prev = None;
        self.inner[i].next = self.head;
        match self.head {
            Some(h) => self.inner[h].prev = Some(i),
            None => self.tail = Some(i),
        }
        self.head = Some(i);
    }

    fn push_back(&mut self, i: usize) {
        self.inner[i].next = None;
        self.inner[i].prev = self.tail;
        match self.tail {
            Some(t) => self.inner[t].next = Some(i),
            None => self.head = Some(i),
        }
        self.tail = Some(i);
    }

    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut b = self.head;
        core::iter::from_fn(move || {
            let i = b?;
            b = self.inner[i].next;
            Some(i)
        })
    }
}

/// 缓冲块控制结构，记录缓冲块的元信息并构建 LRU 链表。
#[derive(Clone, Copy)]
struct BufCtrl {
    /// 缓冲块绑定的 `(dev, blockno)`，尚未使用过的块为 `None`
    key: Option<(u32, u32)>,

    /// 表示该块当前正在被多少个 `Buf` 实例使用；为 0 且不脏时可被回收。
    refcnt: usize,

    /// 已被日志记录、尚未安装到原位置
    dirty: bool,

    prev: Option<usize>,
    next: Option<usize>,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            key: None,
            refcnt: 0,
            dirty: false,
            prev: None,
            next: None,
        }
    }
}

/// 缓冲块的数据部分，包含实际的磁盘块内容及其有效性标志。
struct BufInner {
    /// 标志该缓冲块的数据是否与磁盘一致。
    ///
    /// 该字段在 `bget` 中持有桶锁时清除，在 `bread` 中持有数据睡眠锁时设置。
    valid: AtomicBool,

    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }

    fn get<T: OnDisk>(&self, i: usize) -> &T {
        Self::check::<T>(i);
        unsafe { &*(self.0.as_ptr() as *const T).add(i) }
    }

    fn get_mut<T: OnDisk>(&mut self, i: usize) -> &mut T {
        Self::check::<T>(i);
        unsafe { &mut *(self.0.as_mut_ptr() as *mut T).add(i) }
    }

    #[inline]
    fn check<T: OnDisk>(i: usize) {
        debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<T>(), 0);
        if (i + 1) * mem::size_of::<T>() > BSIZE {
            panic!("buf: element {} of size {} out of block", i, mem::size_of::<T>());
        }
    }
}

/// 可以直接按字节映射到磁盘块上的结构。
///
/// # 安全性
/// 实现者必须是 `repr(C)` 且任意位模式都合法的类型，
/// 对齐要求不超过 [`BufData`] 的对齐。
pub(crate) unsafe trait OnDisk: Copy {}

unsafe impl OnDisk for u32 {}
