//! 测试公共设施：内存块设备、一次性挂载、原始镜像检查
#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use xv6_fs::consts::{BSIZE, ROOTDEV};
use xv6_fs::BlockDevice;

/// 测试镜像的总块数
pub const FSSIZE: u32 = 2048;
/// 测试镜像的 inode 总数
pub const NINODES: u32 = 200;

const DINODE_SIZE: usize = 128;
const DIRENT_SIZE: usize = 16;
const NAME_SIZE: usize = 14;

/// 内存里的块设备
pub struct MemDisk {
    blocks: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(nblocks: u32) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(vec![0; nblocks as usize * BSIZE]),
        })
    }

    /// 绕过缓存直接读镜像；已提交的事务在镜像中总是可见
    pub fn raw_block(&self, blockno: u32) -> Vec<u8> {
        let blocks = self.blocks.lock().unwrap();
        let start = blockno as usize * BSIZE;
        blocks[start..start + BSIZE].to_vec()
    }

    /// 绕过缓存直接写镜像，只给挂载前的测试准备用
    pub fn write_raw(&self, blockno: u32, data: &[u8]) {
        let mut blocks = self.blocks.lock().unwrap();
        let start = blockno as usize * BSIZE;
        blocks[start..start + data.len()].copy_from_slice(data);
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8]) {
        let blocks = self.blocks.lock().unwrap();
        let start = blockno as usize * BSIZE;
        buf.copy_from_slice(&blocks[start..start + buf.len()]);
    }

    fn write_block(&self, blockno: u32, buf: &[u8]) {
        let mut blocks = self.blocks.lock().unwrap();
        let start = blockno as usize * BSIZE;
        blocks[start..start + buf.len()].copy_from_slice(buf);
    }
}

static DISK: OnceLock<Arc<MemDisk>> = OnceLock::new();
static SERIAL: Mutex<()> = Mutex::new(());

/// 注册内存盘、格式化并挂载；同一测试进程内只执行一次
pub fn setup() -> &'static Arc<MemDisk> {
    DISK.get_or_init(|| {
        let disk = MemDisk::new(FSSIZE);
        xv6_fs::register_disk(ROOTDEV, disk.clone());
        xv6_fs::mkfs(ROOTDEV, FSSIZE, NINODES);
        xv6_fs::init(ROOTDEV);
        disk
    })
}

/// 做全盘断言的测试先拿这把锁，避免观察到别的测试提交到一半
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// 超级块字段（小端解码）
pub struct RawSb {
    pub magic: u32,
    pub size: u32,
    pub nblocks: u32,
    pub ninodes: u32,
    pub nlog: u32,
    pub logstart: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
}

fn le32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn le16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
}

pub fn read_sb(disk: &MemDisk) -> RawSb {
    let b = disk.raw_block(1);
    RawSb {
        magic: le32(&b, 0),
        size: le32(&b, 4),
        nblocks: le32(&b, 8),
        ninodes: le32(&b, 12),
        nlog: le32(&b, 16),
        logstart: le32(&b, 20),
        inodestart: le32(&b, 24),
        bmapstart: le32(&b, 28),
    }
}

/// 磁盘 inode 记录（小端解码）
pub struct RawInode {
    pub itype: u16,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; 13],
    pub target: Vec<u8>,
}

pub fn read_dinode(disk: &MemDisk, inum: u32) -> RawInode {
    let sb = read_sb(disk);
    assert!(inum < sb.ninodes);
    let ipb = (BSIZE / DINODE_SIZE) as u32;
    let block = disk.raw_block(sb.inodestart + inum / ipb);
    let off = (inum % ipb) as usize * DINODE_SIZE;

    let mut addrs = [0u32; 13];
    for (i, addr) in addrs.iter_mut().enumerate() {
        *addr = le32(&block, off + 12 + i * 4);
    }
    RawInode {
        itype: le16(&block, off),
        major: le16(&block, off + 2),
        minor: le16(&block, off + 4),
        nlink: le16(&block, off + 6),
        size: le32(&block, off + 8),
        addrs,
        target: block[off + 64..off + DINODE_SIZE].to_vec(),
    }
}

/// 某个块在位图中是否已分配
pub fn bit_is_set(disk: &MemDisk, blockno: u32) -> bool {
    let sb = read_sb(disk);
    let bpb = (BSIZE * 8) as u32;
    let bm = disk.raw_block(sb.bmapstart + blockno / bpb);
    let bit = (blockno % bpb) as usize;
    bm[bit / 8] & (1 << (bit % 8)) != 0
}

/// 位图中已分配的总位数
pub fn bitmap_count(disk: &MemDisk) -> u32 {
    let sb = read_sb(disk);
    let mut count = 0;
    for b in 0..sb.size {
        if bit_is_set(disk, b) {
            count += 1;
        }
    }
    count
}

/// 读取目录文件里的全部有效目录项，返回 `(inum, 定长名字)`
pub fn read_dir_entries(disk: &MemDisk, dir_inum: u32) -> Vec<(u16, Vec<u8>)> {
    let ri = read_dinode(disk, dir_inum);
    assert_eq!(ri.itype, 1, "inode {} is not a directory", dir_inum);

    let mut entries = Vec::new();
    let mut remaining = ri.size as usize;
    // 测试里的目录都不会超出直接块
    for &addr in ri.addrs[..11].iter() {
        if remaining == 0 {
            break;
        }
        assert!(addr != 0, "directory with a hole");
        let block = disk.raw_block(addr);
        let in_block = remaining.min(BSIZE);
        for off in (0..in_block).step_by(DIRENT_SIZE) {
            let inum = le16(&block, off);
            if inum != 0 {
                entries.push((inum, block[off + 2..off + DIRENT_SIZE].to_vec()));
            }
        }
        remaining -= in_block;
    }
    entries
}

/// 短名字与存储的定长名字是否相等
pub fn name_eq(stored: &[u8], name: &[u8]) -> bool {
    let mut padded = [0u8; NAME_SIZE];
    let len = name.len().min(NAME_SIZE);
    padded[..len].copy_from_slice(&name[..len]);
    stored == &padded[..]
}

/// 在目录里按名字找 inode 编号
pub fn lookup_entry(disk: &MemDisk, dir_inum: u32, name: &[u8]) -> Option<u16> {
    read_dir_entries(disk, dir_inum)
        .into_iter()
        .find(|(_, stored)| name_eq(stored, name))
        .map(|(inum, _)| inum)
}

/// 校验链接数不变式：每个已分配 inode 的 nlink 等于全盘目录中
/// 指向它的目录项个数；`.` 指向目录自身、不计数
pub fn check_nlink_invariant(disk: &MemDisk) {
    let sb = read_sb(disk);
    let mut counts = vec![0u32; sb.ninodes as usize];

    for inum in 1..sb.ninodes {
        let ri = read_dinode(disk, inum);
        if ri.itype != 1 {
            continue;
        }
        for (e_inum, name) in read_dir_entries(disk, inum) {
            if name_eq(&name, b".") {
                assert_eq!(e_inum as u32, inum, "`.` of {} points elsewhere", inum);
                continue;
            }
            counts[e_inum as usize] += 1;
        }
    }

    for inum in 1..sb.ninodes {
        let ri = read_dinode(disk, inum);
        if ri.itype != 0 {
            assert_eq!(
                ri.nlink as u32, counts[inum as usize],
                "nlink mismatch for inode {}",
                inum
            );
        } else {
            assert_eq!(counts[inum as usize], 0, "entries point at free inode {}", inum);
        }
    }
}

fn mark_reachable(disk: &MemDisk, reachable: &mut [bool], blockno: u32, depth: usize) {
    assert!(
        !reachable[blockno as usize],
        "block {} referenced twice",
        blockno
    );
    reachable[blockno as usize] = true;
    if depth > 0 {
        let block = disk.raw_block(blockno);
        for i in 0..BSIZE / 4 {
            let bn = le32(&block, i * 4);
            if bn != 0 {
                mark_reachable(disk, reachable, bn, depth - 1);
            }
        }
    }
}

/// 校验位图不变式：数据区中置位的块恰为从某个已分配 inode
/// 可达的块，且每块只被引用一次
pub fn check_block_invariant(disk: &MemDisk) {
    let sb = read_sb(disk);
    let first_data = sb.size - sb.nblocks;
    let mut reachable = vec![false; sb.size as usize];

    for inum in 1..sb.ninodes {
        let ri = read_dinode(disk, inum);
        if ri.itype == 0 {
            continue;
        }
        for &addr in ri.addrs[..11].iter() {
            if addr != 0 {
                mark_reachable(disk, &mut reachable, addr, 0);
            }
        }
        if ri.addrs[11] != 0 {
            mark_reachable(disk, &mut reachable, ri.addrs[11], 1);
        }
        if ri.addrs[12] != 0 {
            mark_reachable(disk, &mut reachable, ri.addrs[12], 2);
        }
    }

    for b in first_data..sb.size {
        assert_eq!(
            bit_is_set(disk, b),
            reachable[b as usize],
            "bitmap and reachability disagree on block {}",
            b
        );
    }
}
