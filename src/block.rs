//! 磁盘块操作，包括位映射与磁盘 inode 的分配
//!
//! 位图一位管一块，字节内低位在前。分配扫描先按字节跳过已
//! 占满的 `0xff`，再用 `trailing_ones` 直接落到第一个空闲位，
//! 不逐位循环。

use bit_field::BitField;

use crate::bio::BCACHE;
use crate::consts::BPB;
use crate::inode::{locate_inode_offset, DiskInode, InodeType, IPB};
use crate::log::LOG;
use crate::superblock::SUPER_BLOCK;

/// 把块号换算成（位图块号, 块内字节下标, 字节内位序）
fn locate_bit(blockno: u32) -> (u32, usize, usize) {
    let offset = blockno % BPB;
    (
        SUPER_BLOCK.bitmap_blockno(blockno),
        (offset / 8) as usize,
        (offset % 8) as usize,
    )
}

/// 从位图中分配一个空闲块，清零后返回其块号。
///
/// # 功能说明
/// 在位图里找到第一个空闲位并置位，随后把对应的数据块整体清零。
/// 置位与清零都经过日志，二者在崩溃语义上是一个原子动作：
/// 要么块已分配且内容为零，要么什么都没发生。
///
/// # 流程解释
/// 1. 逐个位图块读入，按字节扫描，跳过 `0xff`；
/// 2. 第一个非满字节里 `trailing_ones` 给出空闲位，换算出块号；
///    换算结果越过镜像末尾说明本窗口已无可用块，换下一个窗口；
/// 3. 置位并登记位图块，再读出新块、填零并登记；
/// 4. 返回块号。
///
/// # 参数
/// - `dev`: 在哪个设备上分配
///
/// # 返回值
/// 新分配且已清零的磁盘块号
///
/// # 可能的错误
/// 整个位图都没有空闲位时触发 panic：`"balloc: out of data blocks"`。
/// 内核组件没有等待空间的手段，容量按设计预先配足。
///
/// # 安全性
/// 调用方必须已经打开日志事务；本函数除块缓存的按块锁外
/// 不做任何加锁。
pub fn bm_alloc(dev: u32) -> u32 {
    let total = SUPER_BLOCK.size();
    for base in (0..total).step_by(BPB as usize) {
        let mut buf = BCACHE.bread(dev, SUPER_BLOCK.bitmap_blockno(base));

        let found = buf.bytes().iter().position(|&byte| byte != 0xff).and_then(|index| {
            let bit = buf.bytes()[index].trailing_ones() as usize;
            let blockno = base + (index * 8 + bit) as u32;
            if blockno < total {
                Some((index, bit, blockno))
            } else {
                None
            }
        });

        if let Some((index, bit, blockno)) = found {
            buf.bytes_mut()[index].set_bit(bit, true);
            LOG.write(buf);

            // 新块先清零再交出去，旧内容不能泄漏进新文件
            let mut data = BCACHE.bread(dev, blockno);
            data.bytes_mut().fill(0);
            LOG.write(data);
            return blockno;
        }
        drop(buf);
    }

    panic!("balloc: out of data blocks");
}

/// 释放一个磁盘块：清除位图中对应的位。
///
/// # 功能说明
/// 把 `blockno` 标回空闲，供后续 `bm_alloc` 复用。
/// 块的内容不动，分配时才清零。
///
/// # 参数
/// - `dev`: 设备号
/// - `blockno`: 要释放的块号
///
/// # 可能的错误
/// 该位已经是空闲状态说明发生了重复释放，文件系统结构已损坏，
/// 触发 panic：`"bfree: freeing a free block"`。
///
/// # 安全性
/// 调用方必须已经打开日志事务，且保证该块的全部引用均已清除。
pub fn bm_free(dev: u32, blockno: u32) {
    let (bm_blockno, index, bit) = locate_bit(blockno);
    let mut buf = BCACHE.bread(dev, bm_blockno);

    let byte = &mut buf.bytes_mut()[index];
    if !byte.get_bit(bit) {
        panic!("bfree: freeing a free block");
    }
    byte.set_bit(bit, false);
    LOG.write(buf);
}

/// 在磁盘 inode 区分配一个空闲 inode。
///
/// # 功能说明
/// 找到第一条类型为空的磁盘 inode 记录，整体清零后写入 `itype`
/// 完成分配。inode 区按块遍历：一个 inode 块装 `IPB` 条记录，
/// 读进来一次扫完，不为每条记录单独读块。
///
/// # 参数
/// - `dev`: 设备号
/// - `itype`: 新 inode 的类型（文件、目录、设备或符号链接）
///
/// # 返回值
/// 新分配的 inode 编号（磁盘上已持久化其类型）
///
/// # 可能的错误
/// 所有 inode 都已占用时触发 panic：`"ialloc: no free inodes"`。
///
/// # 安全性
/// - 按结构体解读块内容依赖缓冲区对齐与 `IPB` 整除关系，
///   两者由挂载时的 `icheck` 断言；
/// - 调用方须处于日志事务内。
pub fn inode_alloc(dev: u32, itype: InodeType) -> u32 {
    let ninodes = SUPER_BLOCK.inode_size();
    let mut inum = 1u32;
    while inum < ninodes {
        let mut buf = BCACHE.bread(dev, SUPER_BLOCK.locate_inode(inum));
        let block_end = inum - inum % IPB as u32 + IPB as u32;

        while inum < ninodes && inum < block_end {
            let dinode = unsafe {
                &mut *(buf.raw_data_mut() as *mut DiskInode).offset(locate_inode_offset(inum))
            };
            if dinode.try_alloc(itype).is_ok() {
                LOG.write(buf);
                return inum;
            }
            inum += 1;
        }
    }

    panic!("ialloc: no free inodes");
}
