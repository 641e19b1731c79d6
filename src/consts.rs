//! 文件系统参数
//!
//! 磁盘布局与运行时容量的所有编译期常量。
//! 超级块记录的是每个镜像的实际布局，这里只固定格式本身。

use core::mem;

/// 磁盘块大小（字节）
pub const BSIZE: usize = 1024;

/// 超级块魔数
pub const FSMAGIC: u32 = 0x10203040;

/// 根文件系统所在的设备号
pub const ROOTDEV: u32 = 1;

/// 根目录的 inode 编号（0 号保留不用）
pub const ROOTINUM: u32 = 1;

/// 设备表容量
pub const NDEV: usize = 10;

/// 内存中同时活跃的 inode 数量上限
pub const NINODE: usize = 50;

/// 块缓存的缓冲区数量
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// 单次文件系统操作最多写入的块数
pub const MAXOPBLOCKS: usize = 10;

/// 日志区块数（含日志头块）
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// inode 中直接块的数量
pub const NDIRECT: usize = 11;

/// 一个一级间接块可索引的块数
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// 一个二级间接块可索引的块数
pub const NDINDIRECT: usize = NINDIRECT * NINDIRECT;

/// 单个文件可寻址的最大块数
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NDINDIRECT;

/// 单个文件的最大字节数
pub const MAX_FILE_SIZE: usize = MAXFILE * BSIZE;

/// 目录项中文件名的定长字节数
pub const MAX_DIR_SIZE: usize = 14;

/// 路径（以及符号链接目标）的最大字节数，
/// 目标串就地存放在磁盘 inode 记录内
pub const MAXPATH: usize = 64;

/// 每个位图块管理的块数（每块一位）
pub const BPB: u32 = (BSIZE * 8) as u32;

/// 符号链接解析的最大跳数，超过视为成环
pub const SYMLINK_DEPTH: usize = 10;
