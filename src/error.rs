//! 文件系统错误类型
//!
//! 只表示调用方可见的失败：参数非法、查找失败、语义冲突。
//! 结构性损坏（重复释放、读到已释放的 inode）与资源耗尽
//! （块、inode、缓存槽用尽）一律 panic，调用方无从等待或修复。

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// 路径分量或目录项不存在
    NotFound,
    /// 目录项已存在
    AlreadyExists,
    /// 路径中间分量不是目录，或对非目录做目录操作
    NotADirectory,
    /// 对目录做了只允许文件的操作（写打开、硬链接）
    IsADirectory,
    /// 目录中除 `.` 与 `..` 外还有条目
    DirectoryNotEmpty,
    /// 硬链接跨越了设备
    CrossesDevices,
    /// 写入越过了单文件的最大可寻址范围
    FileTooLarge,
    /// 偏移越界、算术溢出等参数错误
    InvalidArg,
    /// 符号链接解析超过跳数上限
    TooManyLinks,
    /// 删除 `.`/`..` 之类被拒绝的操作
    PermissionDenied,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "no such file or directory",
            Error::AlreadyExists => "file exists",
            Error::NotADirectory => "not a directory",
            Error::IsADirectory => "is a directory",
            Error::DirectoryNotEmpty => "directory not empty",
            Error::CrossesDevices => "cross-device link",
            Error::FileTooLarge => "file too large",
            Error::InvalidArg => "invalid argument",
            Error::TooManyLinks => "too many levels of symbolic links",
            Error::PermissionDenied => "operation not permitted",
        };
        write!(f, "{}", msg)
    }
}
