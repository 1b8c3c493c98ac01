//! 文件系统向调用者返回的可恢复错误
//!
//! 资源耗尽与不变式被破坏属于致命错误，直接 panic，不会出现在这里。

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("file too large")]
    FileTooLarge,
    #[error("offset out of range")]
    OutOfRange,
    #[error("no such device")]
    NoDevice,
    #[error("invalid name")]
    InvalidName,
    #[error("too many levels of symbolic links")]
    TooManyLinks,
    #[error("bad file access mode")]
    BadAccess,
    #[error("cross-device link")]
    CrossDevice,
    #[error("path name too long")]
    NameTooLong,
    #[error("invalid argument")]
    Invalid,
}

pub type Result<T> = core::result::Result<T, FsError>;
