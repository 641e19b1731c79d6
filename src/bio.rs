//! 块缓存层
//!
//! 固定 `NBUF` 个缓冲区。槽位元信息（设备号、块号、引用计数、
//! 最近使用时戳）集中放在一把自旋锁后面的普通数组里，淘汰时挑
//! 引用计数为零且时戳最旧的槽，不维护链表；块数据连同装载标志
//! 各自由睡眠锁保护，读写磁盘期间只占数据锁不占元信息锁。
//!
//! 日志在事务提交前通过引用计数把脏块钉在缓存里（pin/unpin），
//! 钉住的块引用计数不归零，不会被淘汰。

use array_macro::array;

use spin::Mutex;

use crate::consts::{BSIZE, NBUF};
use crate::dev;
use crate::sleeplock::{SleepLock, SleepLockGuard};

/// 全局块缓存实例
///
/// 在内核初始化阶段以常量构造，贯穿整个运行期间，
/// 是文件系统与块设备之间的唯一通道。
pub static BCACHE: Bcache = Bcache::new();

/// 块缓存
///
/// # 字段说明
/// - `meta`: 全部槽位的元信息与淘汰时钟，由一把自旋锁统一保护
/// - `bufs`: 缓冲块载荷（装载标志 + 块数据），每槽一把睡眠锁
pub struct Bcache {
    meta: Mutex<BcacheMeta>,
    bufs: [SleepLock<BufPayload>; NBUF],
}

impl Bcache {
    const fn new() -> Self {
        Self {
            meta: Mutex::new(BcacheMeta {
                slots: array![_ => BufSlot::new(); NBUF],
                ticks: 0,
            }),
            bufs: array![_ => SleepLock::new(BufPayload::new(), "buffer"); NBUF],
        }
    }

    /// 查找 `(dev, blockno)` 对应的缓冲块，未命中时淘汰一个空闲槽。
    ///
    /// # 功能说明
    /// 块缓存的底层入口。命中时直接复用缓存槽；未命中时在引用
    /// 计数为零的槽里挑最近最久未使用的一个，改写其身份并把装载
    /// 标志清掉。本函数不做磁盘 I/O，数据是否有效由装载标志决定。
    ///
    /// # 流程解释
    /// 1. 锁住元信息，按身份扫描全部槽位；
    /// 2. 命中：引用计数加一，放开元信息锁后再取数据睡眠锁
    ///    （可能要等当前使用者放手，等待期间不能占着元信息锁）；
    /// 3. 未命中：在引用计数为零的槽里取 `last_use` 最小者，
    ///    改写身份、引用计数置一；此时不可能有别人持有它的数据锁，
    ///    就地取锁清掉装载标志后才放开元信息锁，防止并发的命中者
    ///    把上一个块的旧数据错当成新块。
    ///
    /// # 参数
    /// - `dev`: 块所属的设备编号
    /// - `blockno`: 块在设备中的逻辑块号
    ///
    /// # 返回值
    /// 持有数据锁的 [`Buf`]，析构时自动归还引用计数
    ///
    /// # 可能的错误
    /// - 所有槽位都在使用中（引用计数非零）时触发 panic：
    ///   `"bget: all buffers busy"`
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut meta = self.meta.lock();

        // 命中缓存
        if let Some(index) = meta.slots.iter().position(|s| s.holds(dev, blockno)) {
            meta.slots[index].refcnt += 1;
            drop(meta);
            return Buf {
                index,
                dev,
                blockno,
                payload: Some(self.bufs[index].lock()),
            };
        }

        // 未命中：淘汰最久未使用的空闲槽
        let index = meta
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.refcnt == 0)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| i)
            .unwrap_or_else(|| panic!("bget: all buffers busy"));

        let slot = &mut meta.slots[index];
        slot.dev = dev;
        slot.blockno = blockno;
        slot.refcnt = 1;

        // 引用计数刚才是零，这把睡眠锁不会阻塞
        let mut payload = self.bufs[index].lock();
        payload.valid = false;
        drop(meta);

        Buf {
            index,
            dev,
            blockno,
            payload: Some(payload),
        }
    }

    /// 读取一个块，必要时从磁盘装载。
    ///
    /// # 功能说明
    /// 对外的读取接口。取得缓冲块后检查装载标志，尚未装载的块
    /// 触发一次设备读并置位标志；命中的块直接返回。
    ///
    /// # 参数
    /// - `dev`: 设备编号
    /// - `blockno`: 逻辑块号
    ///
    /// # 返回值
    /// 数据就绪、持有数据锁的 [`Buf`]
    pub fn bread<'a>(&'a self, dev: u32, blockno: u32) -> Buf<'a> {
        let mut buf = self.bget(dev, blockno);
        let payload = buf.payload.as_mut().unwrap();
        if !payload.valid {
            dev::read(dev, blockno, &mut payload.data.0);
            payload.valid = true;
        }
        buf
    }

    /// 归还一个引用（内部方法，由 [`Buf`] 的 Drop 调用）。
    ///
    /// 引用计数归零时打上当前时戳，记作最近刚被用过，
    /// 淘汰时据此挑最旧的槽。
    fn brelse(&self, index: usize) {
        let mut meta = self.meta.lock();
        meta.ticks += 1;
        let tick = meta.ticks;
        let slot = &mut meta.slots[index];
        slot.refcnt -= 1;
        if slot.refcnt == 0 {
            slot.last_use = tick;
        }
    }
}

/// 全部缓冲槽的元信息与淘汰时钟
///
/// `ticks` 在每次引用归还时递增，充当逻辑时间；
/// 槽位按 `last_use` 比较新旧，省掉了链表维护。
struct BcacheMeta {
    slots: [BufSlot; NBUF],
    ticks: u64,
}

/// 单个缓冲槽的元信息
///
/// # 字段说明
/// - `dev` / `blockno`: 槽位当前绑定的块身份
/// - `refcnt`: 活跃引用数，非零的槽不可淘汰
/// - `last_use`: 引用归零时刻的时戳，零表示从未使用过
struct BufSlot {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    last_use: u64,
}

impl BufSlot {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            last_use: 0,
        }
    }

    /// 槽位是否缓存着给定的块。
    /// 从未使用过的槽位身份无意义，不参与匹配。
    fn holds(&self, dev: u32, blockno: u32) -> bool {
        (self.refcnt > 0 || self.last_use > 0) && self.dev == dev && self.blockno == blockno
    }
}

/// 一个已锁定的缓冲块
///
/// 生命周期内独占块数据；析构时先放数据锁，再归还引用计数。
/// 由 `bread`/`bget` 创建，保证在作用域内安全使用。
pub struct Buf<'a> {
    /// 槽位在缓存数组中的下标
    index: usize,
    dev: u32,
    blockno: u32,
    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// 析构时先行取出以便先放锁再归还引用
    payload: Option<SleepLockGuard<'a, BufPayload>>,
}

impl<'a> Buf<'a> {
    /// 缓冲块对应的逻辑块号
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 把缓冲块内容立即写入磁盘。
    ///
    /// 只有日志层允许直接落盘；文件系统的其它部分一律通过
    /// `LOG.write` 把块交给事务。
    pub fn bwrite(&mut self) {
        let dev = self.dev;
        let blockno = self.blockno;
        dev::write(dev, blockno, self.bytes());
    }

    /// 块数据的只读视图
    pub fn bytes(&self) -> &[u8; BSIZE] {
        &self.payload.as_ref().unwrap().data.0
    }

    /// 块数据的可写视图
    pub fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.payload.as_mut().unwrap().data.0
    }

    /// 指向缓冲区数据的原始常量指针，
    /// 供按结构体解读块内容的调用方使用
    pub fn raw_data(&self) -> *const BufData {
        &self.payload.as_ref().unwrap().data
    }

    /// 指向缓冲区数据的原始可变指针
    pub fn raw_data_mut(&mut self) -> *mut BufData {
        &mut self.payload.as_mut().unwrap().data
    }

    /// 把缓冲块钉在缓存里。
    ///
    /// # 功能说明
    /// 引用计数加一，使该槽在本 `Buf` 析构后仍不可淘汰。
    /// 日志用它保住已登记进事务、尚未安装回原位的脏块。
    /// 必须与 [`Buf::unpin`] 配对。
    pub fn pin(&self) {
        let mut meta = BCACHE.meta.lock();
        meta.slots[self.index].refcnt += 1;
    }

    /// 解除钉住状态。
    ///
    /// # 可能的错误
    /// 与 `pin` 不配对（引用计数将要归零或下溢）时触发 panic。
    pub fn unpin(&self) {
        let mut meta = BCACHE.meta.lock();
        let slot = &mut meta.slots[self.index];
        if slot.refcnt <= 1 {
            panic!("unpin: refcount underflow");
        }
        slot.refcnt -= 1;
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.payload.take());
        BCACHE.brelse(self.index);
    }
}

/// 缓冲块载荷：装载标志与块数据。
/// 两者放在同一把睡眠锁下，持锁即可判断并完成装载，
/// 不需要额外的原子标志。
struct BufPayload {
    /// 数据是否已从磁盘装载；淘汰改写身份时清掉
    valid: bool,
    data: BufData,
}

impl BufPayload {
    const fn new() -> Self {
        Self {
            valid: false,
            data: BufData::new(),
        }
    }
}

/// 对齐后的块数据。对齐须满足所有会从块内整体解读的结构体
/// （磁盘 inode、块号数组）。
#[repr(C, align(8))]
pub struct BufData(pub(crate) [u8; BSIZE]);

impl BufData {
    pub(crate) const fn new() -> Self {
        Self([0; BSIZE])
    }

    pub(crate) fn as_bytes(&self) -> &[u8; BSIZE] {
        &self.0
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}
