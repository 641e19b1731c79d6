//! 崩溃一致的类 UNIX 磁盘文件系统
//!
//! 在一个块设备之上提供文件、目录、硬链接、符号链接与设备节点。
//! 所有元数据更新都经过写前日志打包成事务，任意时刻掉电后重放
//! 日志即可回到事务边界。自下而上分为六层：
//!
//! - 块设备接口（[`BlockDevice`]，由宿主注册）
//! - 块缓存（定长 LRU 缓冲池）
//! - 日志（事务与崩溃恢复）
//! - 块分配器（位图）
//! - 索引节点（两级锁的 inode 缓存、块映射、读写与目录操作）
//! - 文件与路径级操作（[`File`]、`link`/`unlink`/`mkdir` 等）
//!
//! 宿主负责进程与地址空间：读写走字节切片，相对路径解析
//! 需要调用方传入其工作目录的 inode 引用。

#![no_std]

extern crate alloc;

mod bio;
mod block;
pub mod consts;
mod dev;
mod error;
mod file;
mod inode;
mod log;
mod mkfs;
mod sleeplock;
mod superblock;

pub use bio::{Buf, BCACHE};
pub use dev::{register_disk, BlockDevice};
pub use error::{Error, Result};
pub use file::{chdir, link, mkdir, mknod, symlink, unlink, File, OpenFlags};
pub use inode::{DirEntry, FileStat, Inode, InodeData, InodeType, ICACHE, IPB};
pub use self::log::LOG;
pub use self::mkfs::mkfs;
pub use sleeplock::{SleepLock, SleepLockGuard};

use core::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 挂载设备 `dev` 上的文件系统。
///
/// # 功能说明
/// 校验磁盘格式的编译期约束，装载超级块，并初始化日志子系统
/// （其中包含崩溃恢复：上次未安装完的事务在这里重放）。
/// 设备须已用 [`register_disk`] 注册。
///
/// # 参数
/// - `dev`: 根文件系统所在的设备号
///
/// # 可能的错误
/// 重复挂载、或设备上的魔数不符，均触发 panic。
pub fn init(dev: u32) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        panic!("file system: init called twice");
    }
    inode::icheck();
    superblock::SUPER_BLOCK.init(dev);
    log::LOG.init(dev);
    ::log::info!("file system: setup done");
}
