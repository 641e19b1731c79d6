//! 超级块操作
//!
//! 块 1 描述整个磁盘布局。挂载时解码一次，之后只读；
//! 磁盘上全部字段为小端 `u32`，解码显式按字节进行，
//! 与主机字节序无关。

use spin::Once;

use crate::bio::BCACHE;
use crate::consts::{BPB, FSMAGIC};
use crate::inode::IPB;

/// 全局超级块。挂载时初始化一次，之后只读。
pub static SUPER_BLOCK: SuperBlock = SuperBlock::new();

/// 内存中的超级块副本
///
/// 用 `Once` 承载一次性初始化：第一次 `init` 完成解码并发布，
/// 之后的查询直接拿只读引用，不需要任何锁。
pub struct SuperBlock(Once<RawSuperBlock>);

impl SuperBlock {
    const fn new() -> Self {
        Self(Once::new())
    }

    /// 从设备的 1 号块读入超级块并校验魔数。
    ///
    /// # 功能说明
    /// 挂载的第一步。经块缓存读取块 1，按小端解码出布局描述，
    /// 校验通过后发布为全局只读状态。重复调用只有第一次生效。
    ///
    /// # 参数
    /// - `dev`: 文件系统所在设备号
    ///
    /// # 可能的错误
    /// 魔数与 `FSMAGIC` 不符说明设备上不是本文件系统的镜像，
    /// 拒绝挂载并触发 panic。
    pub(crate) fn init(&self, dev: u32) {
        self.0.call_once(|| {
            let buf = BCACHE.bread(dev, 1);
            let sb = RawSuperBlock::decode(buf.bytes());
            if sb.magic != FSMAGIC {
                panic!("mount: bad file system magic number");
            }
            sb
        });
    }

    fn read(&self) -> &RawSuperBlock {
        self.0.get().expect("superblock used before mount")
    }

    /// 日志区域信息。
    ///
    /// # 返回值
    /// 元组 `(起始块号, 日志块数量)`
    pub fn read_log(&self) -> (u32, u32) {
        let sb = self.read();
        (sb.logstart, sb.nlog)
    }

    /// 定位索引节点所在的磁盘块。
    ///
    /// # 参数
    /// - `inum`: 要查询的索引节点号
    ///
    /// # 返回值
    /// 包含该索引节点的磁盘块号
    ///
    /// # 可能的错误
    /// `inum` 超出索引节点总数时触发 panic。
    pub fn locate_inode(&self, inum: u32) -> u32 {
        let sb = self.read();
        if inum >= sb.ninodes {
            panic!("inum {} out of range ({} inodes)", inum, sb.ninodes);
        }
        (inum / (IPB as u32)) + sb.inodestart
    }

    /// 文件系统索引节点总数
    pub fn inode_size(&self) -> u32 {
        self.read().ninodes
    }

    /// 定位块对应的位图块。
    ///
    /// # 参数
    /// - `blockno`: 要查询的数据块号
    ///
    /// # 返回值
    /// 管理该块分配位的位图块号
    pub fn bitmap_blockno(&self, blockno: u32) -> u32 {
        let sb = self.read();
        (blockno / BPB) + sb.bmapstart
    }

    /// 文件系统镜像总块数
    pub fn size(&self) -> u32 {
        self.read().size
    }
}

/// 超级块的字段表示
///
/// # 字段说明
/// 与磁盘上的顺序一致，磁盘格式为依次排列的小端 `u32`。
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSuperBlock {
    /// 魔数，必须为 `FSMAGIC`
    pub magic: u32,
    /// 镜像总块数
    pub size: u32,
    /// 数据块数量（不含元数据）
    pub nblocks: u32,
    /// inode 总数
    pub ninodes: u32,
    /// 日志块数量
    pub nlog: u32,
    /// 第一个日志块的块号
    pub logstart: u32,
    /// 第一个 inode 块的块号
    pub inodestart: u32,
    /// 第一个位图块的块号
    pub bmapstart: u32,
}

impl RawSuperBlock {
    /// 从超级块的磁盘字节解码（小端）
    fn decode(bytes: &[u8]) -> Self {
        let field = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            magic: field(0),
            size: field(1),
            nblocks: field(2),
            ninodes: field(3),
            nlog: field(4),
            logstart: field(5),
            inodestart: field(6),
            bmapstart: field(7),
        }
    }

    /// 编码成小端写入给定缓冲区的开头，mkfs 格式化时使用
    pub(crate) fn encode(&self, bytes: &mut [u8]) {
        let fields = [
            self.magic,
            self.size,
            self.nblocks,
            self.ninodes,
            self.nlog,
            self.logstart,
            self.inodestart,
            self.bmapstart,
        ];
        for (i, value) in fields.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}
