//! 类 xv6 的日志文件系统
//!
//! 自底向上由缓冲区缓存、预写日志、索引节点、目录与路径解析组成，
//! 通过 [`driver::BlockDevice`] 访问磁盘，通过 [`process::Scheduler`] 休眠与唤醒。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

pub mod consts;
pub mod driver;
pub mod error;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

#[cfg(test)]
mod testing;

pub use error::{FsError, Result};
pub use fs::{File, FileSystem, Inode, InodeType, OpenFlags};
