//! 日志层
//!
//! 一次事务由若干个文件系统操作组成，每个操作以 `begin_op` 开始、以 `end_op` 结束。
//! 操作中被修改的块只记录块号并在缓存中标记为脏，
//! 最后一个操作结束时统一提交：先写日志区，再写日志头，再安装到原位置，最后清空日志头。

use log::{debug, info};

use core::mem;

use crate::consts::fs::{MAXOPBLOCKS, LOGSIZE, BSIZE};
use crate::process;
use crate::spinlock::SpinLock;
use super::bio::{Bcache, Buf, OnDisk};
use super::superblock::SuperBlock;

/// 日志协调器。
///
/// 在内存中维护日志头的副本以及正在进行的操作数，由一把自旋锁保护。
/// 文件系统只持有一个 `Log` 实例，挂载时通过 [`Log::new`] 构造并执行崩溃恢复。
pub struct Log {
    state: SpinLock<LogState>,
}

struct LogState {
    /// 日志区在磁盘中的起始块号（由超级块中读取），即日志头所在块
    start: u32,
    /// 日志区域中的块数（包括日志头块和数据块）
    size: u32,
    dev: u32,
    /// 当前正在进行的文件系统操作数
    outstanding: u32,
    /// 提交进行中，新的操作必须等待
    committing: bool,
    /// 本次事务已记录的块号
    lh: LogHeader,
}

impl Log {
    /// 读取日志区位置，重放上次崩溃时已提交但未安装完的事务。
    ///
    /// # 功能说明
    /// 在文件系统挂载阶段调用，从超级块读取日志区域的起始位置与大小。
    /// 若磁盘上的日志头中仍有记录，说明上次提交已越过原子点但未完成安装，
    /// 此时把日志区中的块重新写回原位置，再清空日志头。
    ///
    /// # 参数
    /// - `bcache`: 缓冲区缓存；
    /// - `dev`: 日志所在的块设备编号；
    /// - `sb`: 已验证的超级块。
    ///
    /// # 可能的错误
    /// - 日志区比日志头能描述的范围还小时 panic。
    pub fn new(bcache: &Bcache, dev: u32, sb: &SuperBlock) -> Self {
        debug_assert!(mem::size_of::<LogHeader>() < BSIZE);
        let (start, size) = sb.log_region();
        if (size as usize) < 2 {
            panic!("log: log region of {} blocks is too small", size);
        }
        let log = Self {
            state: SpinLock::new(LogState {
                start,
                size,
                dev,
                outstanding: 0,
                committing: false,
                lh: LogHeader::empty(),
            }, "log"),
        };
        log.recover(bcache);
        log
    }

    /// 执行日志恢复，可以重复执行：重放已经安装过的块不会改变结果。
    fn recover(&self, bcache: &Bcache) {
        let mut guard = self.state.lock();
        let (start, dev) = (guard.start, guard.dev);
        drop(guard);

        let lh = read_head(bcache, dev, start);
        if lh.len > 0 {
            info!("log: recovering {} blocks", lh.len);
            install_trans(bcache, dev, start, &lh, true);
            write_head(bcache, dev, start, &LogHeader::empty());
        } else {
            info!("log: no need to recover");
        }

        guard = self.state.lock();
        guard.lh = LogHeader::empty();
        drop(guard);
    }

    /// 在每次文件系统操作开始时调用。
    ///
    /// # 流程解释
    /// 1. 若日志正在提交，休眠等待；
    /// 2. 若接纳本操作后，已记录的块数加上所有未结束操作可能写入的块数会超过日志容量，休眠等待；
    /// 3. 否则递增 `outstanding` 并返回。
    pub fn begin_op(&self) {
        let mut guard = self.state.lock();
        loop {
            if guard.committing ||
                guard.lh.len as usize + (guard.outstanding + 1) as usize * MAXOPBLOCKS > LOGSIZE
            {
                process::sleep(self.chan(), guard);
                guard = self.state.lock();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// 将给定的缓冲块记录到当前事务中，并标记为脏以阻止缓存回收。
    ///
    /// # 功能说明
    /// 代替 `bwrite`：调用者修改完缓冲块数据后把它交给日志，
    /// 同一事务中重复记录同一块只占用一个日志槽位（日志吸收）。
    ///
    /// # 可能的错误
    /// - 不在任何操作中调用时 panic；
    /// - 日志已满时 panic，说明某个操作写入的块数超过了 `MAXOPBLOCKS` 的约定。
    pub fn write(&self, bcache: &Bcache, buf: Buf<'_>) {
        let mut guard = self.state.lock();
        if guard.outstanding < 1 {
            panic!("log: write outside of a transaction");
        }

        let blockno = buf.read_blockno();
        if guard.lh.blocknos().contains(&blockno) {
            drop(guard);
            drop(buf);
            return
        }

        if guard.lh.len as usize >= LOGSIZE || guard.lh.len + 1 >= guard.size {
            panic!("log: transaction too big");
        }
        bcache.set_dirty(&buf, true);
        let len = guard.lh.len as usize;
        guard.lh.blocknos[len] = blockno;
        guard.lh.len += 1;
        drop(guard);
        drop(buf);
    }

    /// 在每次文件系统操作结束时调用，最后一个结束的操作负责提交。
    ///
    /// # 流程解释
    /// 1. 递减 `outstanding`；
    /// 2. 若仍有其他操作未结束，唤醒等待日志空间的线程后返回；
    /// 3. 否则设置 `committing`，释放锁后提交日志头的快照；
    /// 4. 提交完成后清空内存日志头，清除 `committing` 并唤醒所有等待者。
    ///
    /// # 可能的错误
    /// - 提交过程中调用 `end_op` 说明 begin/end 不配对，触发 panic。
    pub fn end_op(&self, bcache: &Bcache) {
        let mut guard = self.state.lock();
        if guard.committing {
            panic!("log: end_op while the log is committing");
        }
        if guard.outstanding == 0 {
            panic!("log: end_op without begin_op");
        }
        guard.outstanding -= 1;
        if guard.outstanding > 0 {
            // begin_op 可能在等待日志空间，减少 outstanding 会减少预留的空间
            process::wakeup(self.chan());
            drop(guard);
            return
        }

        guard.committing = true;
        let (dev, start, lh) = (guard.dev, guard.start, guard.lh);
        drop(guard);

        // 提交期间不持有自旋锁，committing 标志阻止其他操作进入
        commit(bcache, dev, start, &lh);

        let mut guard = self.state.lock();
        guard.lh = LogHeader::empty();
        guard.committing = false;
        process::wakeup(self.chan());
        drop(guard);
    }

    #[inline]
    fn chan(&self) -> usize {
        self as *const Log as usize
    }

    /// 返回 `(outstanding, committing, 已记录块数)`
    #[cfg(test)]
    pub(crate) fn status(&self) -> (u32, bool, u32) {
        let guard = self.state.lock();
        (guard.outstanding, guard.committing, guard.lh.len)
    }
}

/// 提交一个事务
///
/// # 流程解释
/// - 调用 [`write_log`]：将缓存中的块复制到日志区域；
/// - 调用 [`write_head`]：将日志头写入磁盘，这是事务的原子点；
/// - 调用 [`install_trans`]：将日志块中的内容写回到它们的原始位置；
/// - 写入空日志头，表示日志区可复用。
fn commit(bcache: &Bcache, dev: u32, start: u32, lh: &LogHeader) {
    if lh.len == 0 {
        return
    }
    debug!("log: committing {} blocks", lh.len);
    write_log(bcache, dev, start, lh);
    write_head(bcache, dev, start, lh);
    install_trans(bcache, dev, start, lh, false);
    write_head(bcache, dev, start, &LogHeader::empty());
}

/// 将缓存中被修改的块复制到日志区域中对应的槽位。
fn write_log(bcache: &Bcache, dev: u32, start: u32, lh: &LogHeader) {
    for (i, &blockno) in lh.blocknos().iter().enumerate() {
        let mut log_buf = bcache.bread(dev, start + 1 + i as u32);
        let cache_buf = bcache.bread(dev, blockno);
        log_buf.data_mut().copy_from_slice(cache_buf.data());
        log_buf.bwrite();
        drop(cache_buf);
        drop(log_buf);
    }
}

/// 将日志区中的块复制回原位置。
///
/// 正常提交时（`recovering == false`）还要清除缓存中的脏标志，允许缓存回收这些块。
fn install_trans(bcache: &Bcache, dev: u32, start: u32, lh: &LogHeader, recovering: bool) {
    for (i, &blockno) in lh.blocknos().iter().enumerate() {
        let log_buf = bcache.bread(dev, start + 1 + i as u32);
        let mut disk_buf = bcache.bread(dev, blockno);
        disk_buf.data_mut().copy_from_slice(log_buf.data());
        disk_buf.bwrite();
        if !recovering {
            bcache.set_dirty(&disk_buf, false);
        }
        drop(log_buf);
        drop(disk_buf);
    }
}

fn read_head(bcache: &Bcache, dev: u32, start: u32) -> LogHeader {
    let buf = bcache.bread(dev, start);
    let lh = *buf.get::<LogHeader>(0);
    if lh.len as usize > LOGSIZE {
        panic!("log: corrupted log header with {} entries", lh.len);
    }
    lh
}

/// 将日志头写入磁盘。写入非空日志头是当前事务真正被提交的时间点。
fn write_head(bcache: &Bcache, dev: u32, start: u32, lh: &LogHeader) {
    let mut buf = bcache.bread(dev, start);
    *buf.get_mut::<LogHeader>(0) = *lh;
    buf.bwrite();
}

/// 日志头结构体，记录当前事务中被修改的磁盘块号。
///
/// 存储在日志区域的第一个块中，磁盘日志头中 `len` 非零表示存在已提交但可能未安装的事务。
#[repr(C)]
#[derive(Clone, Copy)]
struct LogHeader {
    /// `blocknos` 数组中有效元素的数量
    len: u32,
    blocknos: [u32; LOGSIZE],
}

unsafe impl OnDisk for LogHeader {}

impl LogHeader {
    const fn empty() -> Self {
        Self { len: 0, blocknos: [0; LOGSIZE] }
    }

    fn blocknos(&self) -> &[u32] {
        &self.blocknos[..self.len as usize]
    }
}
