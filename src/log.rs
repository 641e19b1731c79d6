//! 日志层
//!
//! 写前日志（write-ahead log）为多块更新提供原子性：事务内被修改
//! 的块先复制进日志区，日志头落盘即为提交点，之后再安装回原位。
//! 崩溃后重放日志头里记录的块即可恢复到事务边界。
//!
//! [`Log`] 只维护事务状态机（并发操作计数、提交标志、当前日志头）；
//! 提交与恢复本身是纯粹的块搬运，由模块内的自由函数完成，不碰
//! 状态机的锁。日志头以显式小端序列化，磁盘格式与主机字节序无关。

use core::hint;

use spin::Mutex;

use crate::bio::{Buf, BCACHE};
use crate::consts::{LOGSIZE, MAXOPBLOCKS};
use crate::superblock::SUPER_BLOCK;

/// 全局日志实例，文件系统所有写路径的事务入口
pub static LOG: Log = Log::uninit();

/// 日志事务状态机
///
/// # 字段说明（锁内）
/// - `dev` / `start` / `capacity`: 日志区的位置与容量，挂载时填入
/// - `outstanding`: 正在进行的文件系统操作数
/// - `committing`: 提交进行中，禁止新的操作进入
/// - `header`: 当前事务的日志头（内存态）
pub struct Log {
    inner: Mutex<LogInner>,
}

struct LogInner {
    dev: u32,
    start: u32,
    capacity: u32,
    outstanding: u32,
    committing: bool,
    header: LogHeader,
}

impl Log {
    const fn uninit() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                dev: 0,
                start: 0,
                capacity: 0,
                outstanding: 0,
                committing: false,
                header: LogHeader::empty(),
            }),
        }
    }

    /// 初始化日志并在需要时执行崩溃恢复。
    ///
    /// # 功能说明
    /// 从超级块读取日志区域的起始位置与容量，填入状态机，
    /// 随后检查磁盘上的日志头：存在已提交未安装的事务就地重放。
    ///
    /// # 参数
    /// - `dev`: 日志所在的块设备编号
    ///
    /// # 可能的错误
    /// 只能在挂载时由单一线程调用一次；此时不会有并发的日志操作，
    /// 重复调用会重复执行（无害的）恢复检查。
    pub(crate) fn init(&self, dev: u32) {
        let (start, capacity) = SUPER_BLOCK.read_log();
        {
            let mut inner = self.inner.lock();
            inner.dev = dev;
            inner.start = start;
            inner.capacity = capacity;
        }
        recover(dev, start);
    }

    /// 在每次文件系统操作开始时调用，标记事务起点。
    ///
    /// # 功能说明
    /// 为本次操作预留日志空间后放行。每个操作按 `MAXOPBLOCKS`
    /// 预留；日志正在提交、或已登记块数加上全部预留会超出日志
    /// 容量时，调用方停在等待处，直到提交完成腾出空间。
    ///
    /// # 流程解释
    /// 1. 锁住状态机，计算已有操作加本次操作的总预留；
    /// 2. 没在提交且容量足够：`outstanding` 加一，返回；
    /// 3. 否则放开锁让出，稍后重试。
    ///
    /// # 安全性
    /// 等待发生在锁外，不会与提交路径互相卡死。
    pub fn begin_op(&self) {
        loop {
            let mut inner = self.inner.lock();
            let reserved = (inner.outstanding as usize + 1) * MAXOPBLOCKS;
            if !inner.committing && 1 + inner.header.len as usize + reserved <= LOGSIZE {
                inner.outstanding += 1;
                return;
            }
            drop(inner);
            hint::spin_loop();
        }
    }

    /// 把修改过的缓冲块登记进当前事务。
    ///
    /// # 功能说明
    /// 代替直接写盘：块号记入日志头，块本身被钉在缓存里直到事务
    /// 安装完成。同一块在一次事务里只占一个日志槽（写合并），
    /// 重复登记无害。
    ///
    /// # 参数
    /// - `buf`: 已修改的缓冲块，本函数取得其所有权并在登记后释放
    ///   数据锁（钉住状态由引用计数维持）
    ///
    /// # 可能的错误
    /// - 不在任何事务内（`outstanding == 0`）时触发 panic；
    /// - 日志头已满（`begin_op` 的预留被突破，说明单个操作写了
    ///   超过 `MAXOPBLOCKS` 个块）时触发 panic。
    pub fn write(&self, buf: Buf<'_>) {
        let mut inner = self.inner.lock();

        if inner.outstanding == 0 {
            panic!("log: write outside of transaction");
        }
        if inner.header.len as usize >= LOGSIZE - 1 || inner.header.len + 1 >= inner.capacity {
            panic!("log: transaction too big");
        }

        let blockno = buf.read_blockno();
        if !inner.header.contains(blockno) {
            buf.pin();
            let len = inner.header.len as usize;
            inner.header.blocknos[len] = blockno;
            inner.header.len += 1;
        }
    }

    /// 在每次文件系统操作结束时调用，与 [`Log::begin_op`] 配对。
    ///
    /// # 功能说明
    /// `outstanding` 减一；最后一个操作离开时，当前事务的全部
    /// 修改作为一个整体提交：写日志区、落日志头（提交点）、
    /// 安装回原位、清空日志头。
    ///
    /// # 流程解释
    /// 1. 锁内递减计数；提交期间不可能有操作在结束，撞上说明
    ///    调用序错乱，直接 panic；
    /// 2. 计数归零时置起 `committing` 并拷出日志头快照；
    /// 3. 锁外用快照执行提交（`committing` 挡住一切并发进入）；
    /// 4. 重新上锁，清空内存日志头、放下提交标志。
    ///
    /// # 安全性
    /// 提交涉及磁盘 I/O，全程不持状态机的自旋锁；
    /// 互斥完全由 `committing` 标志承担。
    pub fn end_op(&self) {
        let mut to_commit = None;

        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.outstanding > 0);
            inner.outstanding -= 1;
            if inner.committing {
                panic!("log: end_op while committing");
            }
            if inner.outstanding == 0 {
                inner.committing = true;
                to_commit = Some((inner.dev, inner.start, inner.header));
            }
        }

        if let Some((dev, start, header)) = to_commit {
            commit(dev, start, &header);
            let mut inner = self.inner.lock();
            inner.header.len = 0;
            inner.committing = false;
        }
    }
}

/// 提交一个事务。
///
/// # 功能说明
/// 三步走：把缓存中的新数据复制进日志区；日志头落盘，这一刻
/// 之前崩溃事务整体消失、之后崩溃事务必然完整；把日志区内容
/// 安装回原位并清空磁盘日志头。
///
/// # 参数
/// - `dev` / `start`: 日志区位置
/// - `header`: 待提交事务的日志头快照
fn commit(dev: u32, start: u32, header: &LogHeader) {
    if header.len == 0 {
        return;
    }
    for (i, &blockno) in header.entries().iter().enumerate() {
        // 缓存里钉住的就是最新数据，先搬进日志区
        copy_block(dev, blockno, start + 1 + i as u32);
    }
    header.store(dev, start);
    install(dev, start, header, false);
    LogHeader::empty().store(dev, start);
}

/// 把日志区中记录的块安装回它们的原位。
///
/// # 功能说明
/// 对日志头里的每个块号，把日志区对应槽位的内容复制到该块的
/// 真正位置并落盘。正常提交路径（`recovering == false`）随后
/// 解除对缓存块的钉住；崩溃恢复路径上没有钉住过任何块，不碰
/// 引用计数。
///
/// # 参数
/// - `recovering`: 是否处于挂载时的日志重放
fn install(dev: u32, start: u32, header: &LogHeader, recovering: bool) {
    for (i, &blockno) in header.entries().iter().enumerate() {
        let log_buf = BCACHE.bread(dev, start + 1 + i as u32);
        let mut disk_buf = BCACHE.bread(dev, blockno);
        disk_buf.bytes_mut().copy_from_slice(log_buf.bytes());
        disk_buf.bwrite();
        if !recovering {
            disk_buf.unpin();
        }
    }
}

/// 把一个块的内容原样复制到另一个块并落盘
fn copy_block(dev: u32, from: u32, to: u32) {
    let src = BCACHE.bread(dev, from);
    let mut dst = BCACHE.bread(dev, to);
    dst.bytes_mut().copy_from_slice(src.bytes());
    dst.bwrite();
}

/// 挂载时的崩溃恢复。
///
/// # 流程解释
/// 1. 读磁盘日志头；
/// 2. `len > 0` 说明上次关机停在提交点与安装完成之间，
///    重放安装后清空日志头；
/// 3. 否则日志是干净的，什么都不做。
fn recover(dev: u32, start: u32) {
    let header = LogHeader::load(dev, start);
    if header.len > 0 {
        log::info!("file system: recovering {} blocks from log", header.len);
        install(dev, start, &header, true);
        LogHeader::empty().store(dev, start);
    } else {
        log::info!("file system: log is clean");
    }
}

/// 日志头：当前事务中被修改的块号清单。
///
/// 占据日志区第一个块。磁盘格式为小端 `u32` 序列：
/// 先是有效块数 `len`，随后依次是各块号；
/// `len > 0` 即代表存在已提交未安装的事务。
#[derive(Clone, Copy)]
struct LogHeader {
    len: u32,
    /// 另留一个块存放日志头本身
    blocknos: [u32; LOGSIZE - 1],
}

impl LogHeader {
    const fn empty() -> Self {
        Self {
            len: 0,
            blocknos: [0; LOGSIZE - 1],
        }
    }

    /// 有效的块号清单
    fn entries(&self) -> &[u32] {
        &self.blocknos[..self.len as usize]
    }

    /// 块号是否已在清单里（写合并用）
    fn contains(&self, blockno: u32) -> bool {
        self.entries().contains(&blockno)
    }

    /// 从磁盘日志头块解码（小端）
    fn load(dev: u32, start: u32) -> Self {
        let buf = BCACHE.bread(dev, start);
        let bytes = buf.bytes();
        let mut header = Self::empty();
        header.len = read_u32(bytes, 0);
        debug_assert!((header.len as usize) < LOGSIZE);
        for i in 0..header.len as usize {
            header.blocknos[i] = read_u32(bytes, 4 + i * 4);
        }
        header
    }

    /// 编码成小端写入磁盘日志头块并立即落盘。
    /// 这是事务提交与事务收尾共用的持久化点。
    fn store(&self, dev: u32, start: u32) {
        let mut buf = BCACHE.bread(dev, start);
        let bytes = buf.bytes_mut();
        bytes[0..4].copy_from_slice(&self.len.to_le_bytes());
        for (i, &blockno) in self.entries().iter().enumerate() {
            bytes[4 + i * 4..8 + i * 4].copy_from_slice(&blockno.to_le_bytes());
        }
        buf.bwrite();
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}
