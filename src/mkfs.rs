//! 文件系统格式化
//!
//! 在已注册的设备上铺出初始镜像：引导块、超级块、空日志、
//! inode 区（含根目录）、位图。只在挂载之前调用，
//! 绕过块缓存与日志直接写设备。

use core::mem;
use core::ptr;

use crate::bio::BufData;
use crate::consts::{BPB, FSMAGIC, LOGSIZE, ROOTINUM};
use crate::dev;
use crate::inode::{DirEntry, DiskInode, InodeType, IPB};
use crate::superblock::RawSuperBlock;

/// 格式化设备。
///
/// # 功能说明
/// 在空设备上铺出一个可挂载的最小镜像：超级块描述布局，
/// 日志区全零（干净日志），inode 区只有根目录，位图把全部
/// 元数据块与根目录的数据块标成已用。
///
/// # 参数
/// - `dev`: 已注册的目标设备号
/// - `size`: 镜像总块数
/// - `ninodes`: inode 总数
///
/// # 可能的错误
/// 镜像装不下元数据加一个数据块、或元数据越过了第一个位图块
/// 的管辖范围时，断言失败。
pub fn mkfs(dev: u32, size: u32, ninodes: u32) {
    let nbitmap = size / BPB + 1;
    let ninodeblocks = ninodes / IPB as u32 + 1;
    let nlog = LOGSIZE as u32;

    // 布局: [ boot | super | log | inodes | bitmap | data ]
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(nmeta + 1 < size, "mkfs: image too small");

    let sb = RawSuperBlock {
        magic: FSMAGIC,
        size,
        nblocks: size - nmeta,
        ninodes,
        nlog,
        logstart: 2,
        inodestart: 2 + nlog,
        bmapstart: 2 + nlog + ninodeblocks,
    };

    // 整盘清零
    let zero = BufData::new();
    for b in 0..size {
        dev::write(dev, b, zero.as_bytes());
    }

    // 超级块（显式小端编码）
    let mut buf = BufData::new();
    sb.encode(buf.as_bytes_mut());
    dev::write(dev, 1, buf.as_bytes());

    // 根目录 inode，内容占用第一个数据块
    let root_data_block = nmeta;
    let mut root = DiskInode::new();
    root.itype = InodeType::Directory;
    root.nlink = 1;
    root.size = 2 * mem::size_of::<DirEntry>() as u32;
    root.addrs[0] = root_data_block;

    let mut buf = BufData::new();
    let dinode_ptr = buf.as_bytes_mut().as_mut_ptr() as *mut DiskInode;
    unsafe { ptr::write(dinode_ptr.offset(ROOTINUM as isize), root) };
    dev::write(dev, sb.inodestart, buf.as_bytes());

    // `.` 与 `..` 都指向根目录自身（目录项：小端 u16 编号 + 定长名字）
    let mut buf = BufData::new();
    let de_size = mem::size_of::<DirEntry>();
    let bytes = buf.as_bytes_mut();
    bytes[0..2].copy_from_slice(&(ROOTINUM as u16).to_le_bytes());
    bytes[2] = b'.';
    bytes[de_size..de_size + 2].copy_from_slice(&(ROOTINUM as u16).to_le_bytes());
    bytes[de_size + 2] = b'.';
    bytes[de_size + 3] = b'.';
    dev::write(dev, root_data_block, buf.as_bytes());

    // 位图：所有元数据块加根目录数据块标记为已用
    let used = (nmeta + 1) as usize;
    assert!(
        used <= BPB as usize,
        "mkfs: meta blocks exceed one bitmap block"
    );
    let mut buf = BufData::new();
    for i in 0..used {
        buf.as_bytes_mut()[i / 8] |= 1 << (i % 8);
    }
    dev::write(dev, sb.bmapstart, buf.as_bytes());

    log::info!(
        "mkfs: {} blocks total, {} meta, {} data",
        size,
        nmeta,
        sb.nblocks
    );
}
