//! 打开的文件

use core::cmp::min;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::consts::fs::{MAXOPBLOCKS, BSIZE};
use crate::error::{FsError, Result};
use super::FileSystem;
use super::inode::{FileStat, Inode, InodeType};

bitflags! {
    /// 打开标志，全部为零表示只读。
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
    }
}

/// 调整文件偏移量时的基准
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i64),
    End(i64),
}

/// 一个打开的文件，构建在 inode 之上。
///
/// 普通文件与目录带有偏移量，读写从偏移量处开始并推进偏移量；
/// 设备文件的读写直接交给设备表中注册的驱动。
/// 偏移量只在持有 inode 锁时读写，因此同一个 `File` 可以在多个线程之间共享。
/// 丢弃 `File` 时在一个事务中释放其 inode 引用。
pub struct File<'fs> {
    inner: FileInner<'fs>,
    readable: bool,
    writable: bool,
}

enum FileInner<'fs> {
    Regular(FileRegular<'fs>),
    Device(FileDevice<'fs>),
}

struct FileRegular<'fs> {
    offset: AtomicU32,
    inode: Option<Inode<'fs>>,
}

struct FileDevice<'fs> {
    major: u16,
    inode: Option<Inode<'fs>>,
}

impl<'fs> File<'fs> {
    /// 打开 `path` 指向的文件。
    ///
    /// # 功能说明
    /// 带 `CREATE` 时在不存在的路径上创建普通文件，已存在的普通文件被直接打开；
    /// 否则解析路径并跟随符号链接。以可写方式带 `TRUNC` 打开普通文件时截断其内容。
    ///
    /// # 流程解释
    /// 1. 开启事务，创建或解析得到 inode；
    /// 2. 锁定 inode，按类型检查打开方式：目录只能只读打开，设备必须已经注册；
    /// 3. 释放锁并结束事务，构造 `File`。
    ///
    /// # 可能的错误
    /// - 路径不存在且未指定 `CREATE` 时返回 `NotFound`；
    /// - 以可写方式打开目录时返回 `IsDir`；
    /// - 设备文件的主设备号没有注册驱动时返回 `NoDevice`。
    pub fn open(fs: &'fs FileSystem, path: &[u8], flags: OpenFlags, cwd: Option<&Inode<'fs>>)
        -> Result<Self>
    {
        let _tx = fs.transaction();
        let inode = if flags.contains(OpenFlags::CREATE) {
            fs.create(path, InodeType::File, 0, 0, cwd)?
        } else {
            fs.namei_follow(path, cwd)?
        };

        let readable = !flags.contains(OpenFlags::WRONLY);
        let writable = flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR);
        let mut idata = inode.lock();
        let inner = match idata.itype() {
            InodeType::Empty => panic!("file: open of empty inode {}", inode.inum()),
            InodeType::Directory => {
                if writable {
                    return Err(FsError::IsDir)
                }
                drop(idata);
                FileInner::Regular(FileRegular { offset: AtomicU32::new(0), inode: Some(inode) })
            },
            InodeType::File | InodeType::Symlink => {
                if writable && flags.contains(OpenFlags::TRUNC) {
                    idata.truncate();
                }
                drop(idata);
                FileInner::Regular(FileRegular { offset: AtomicU32::new(0), inode: Some(inode) })
            },
            InodeType::Device => {
                let (major, _) = idata.devnum();
                fs.devices.get(major)?;
                drop(idata);
                FileInner::Device(FileDevice { major, inode: Some(inode) })
            },
        };

        Ok(Self { inner, readable, writable })
    }

    #[inline]
    pub fn readable(&self) -> bool {
        self.readable
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    fn inode(&self) -> &Inode<'fs> {
        let inode = match self.inner {
            FileInner::Regular(ref file) => &file.inode,
            FileInner::Device(ref dev) => &dev.inode,
        };
        match inode {
            Some(inode) => inode,
            None => panic!("file: inode already released"),
        }
    }

    /// 从当前偏移量处读取至多 `dst.len()` 字节，返回实际读取的字节数，到达文件末尾时返回 0。
    ///
    /// # 可能的错误
    /// - 文件不可读时返回 `BadAccess`；
    /// - 设备未注册时返回 `NoDevice`。
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(FsError::BadAccess)
        }

        match self.inner {
            FileInner::Regular(ref file) => {
                let mut idata = self.inode().lock();
                let offset = file.offset.load(Ordering::Relaxed);
                let count = idata.read(dst, offset)?;
                file.offset.store(offset + count as u32, Ordering::Relaxed);
                drop(idata);
                Ok(count)
            },
            FileInner::Device(_) => self.inode().lock().read(dst, 0),
        }
    }

    /// 从当前偏移量处写入 `src` 的全部内容。
    ///
    /// # 功能说明
    /// 普通文件的写入被拆分成若干批，每一批在独立的事务中完成，
    /// 保证单个事务涉及的块数不超过日志为一个操作预留的空间。
    /// 中途出错时，之前各批已经写入的内容仍然保留。
    ///
    /// # 可能的错误
    /// - 文件不可写时返回 `BadAccess`；
    /// - 偏移量超出文件大小时返回 `OutOfRange`；
    /// - 超过最大文件大小时返回 `FileTooLarge`。
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(FsError::BadAccess)
        }

        match self.inner {
            FileInner::Regular(ref file) => {
                // 为 inode、两级间接块、位图块以及非对齐写入留出余量
                let batch = (MAXOPBLOCKS - 1 - 2 - 2) / 2 * BSIZE;
                let inode = self.inode();
                let fs = inode.fs();
                let mut total = 0;
                while total < src.len() {
                    let n = min(batch, src.len() - total);
                    let tx = fs.transaction();
                    let mut idata = inode.lock();
                    let offset = file.offset.load(Ordering::Relaxed);
                    let ret = idata.write(&src[total..total + n], offset);
                    if let Ok(count) = ret {
                        file.offset.store(offset + count as u32, Ordering::Relaxed);
                    }
                    drop(idata);
                    drop(tx);
                    total += ret?;
                }
                Ok(total)
            },
            FileInner::Device(_) => self.inode().lock().write(src, 0),
        }
    }

    /// 调整偏移量，返回新的偏移量。允许越过文件末尾，但之后的写入会失败。
    ///
    /// # 可能的错误
    /// - 设备文件返回 `Invalid`；
    /// - 新偏移量为负或超出 `u32` 时返回 `OutOfRange`。
    pub fn seek(&self, pos: SeekFrom) -> Result<u32> {
        let file = match self.inner {
            FileInner::Regular(ref file) => file,
            FileInner::Device(_) => return Err(FsError::Invalid),
        };

        let idata = self.inode().lock();
        let offset = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => file.offset.load(Ordering::Relaxed) as i64 + delta,
            SeekFrom::End(delta) => idata.size() as i64 + delta,
        };
        if offset < 0 || offset > u32::MAX as i64 {
            return Err(FsError::OutOfRange)
        }
        file.offset.store(offset as u32, Ordering::Relaxed);
        drop(idata);
        Ok(offset as u32)
    }

    pub fn stat(&self) -> FileStat {
        self.inode().lock().stat()
    }
}

impl<'fs> fmt::Debug for File<'fs> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("File");
        match self.inner {
            FileInner::Regular(ref file) => d.field("offset", &file.offset.load(Ordering::Relaxed)),
            FileInner::Device(ref dev) => d.field("major", &dev.major),
        };
        d.field("inode", self.inode())
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

impl<'fs> Drop for File<'fs> {
    fn drop(&mut self) {
        let inode = match self.inner {
            FileInner::Regular(ref mut file) => file.inode.take(),
            FileInner::Device(ref mut dev) => dev.inode.take(),
        };
        if let Some(inode) = inode {
            let _tx = inode.fs().transaction();
            drop(inode);
        }
    }
}
