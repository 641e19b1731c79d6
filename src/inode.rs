//! 索引节点层
//!
//! inode 缓存采用两级锁：元信息（设备号、编号、引用计数）由一把
//! 自旋锁统一保护，内容（磁盘字段的内存副本）各自由睡眠锁保护。
//! 这样持有长期引用（打开的文件、工作目录）不会与内容访问互相
//! 串行化，内容锁也允许跨磁盘 I/O 持有。
//!
//! 锁序：先取元信息自旋锁且不得在持有期间取内容锁（唯一例外是
//! `put` 在引用计数为 1 时取内容锁，此时不可能有竞争者）；需要
//! 父目录与目标两把内容锁时，先父后子。

use array_macro::array;

use core::cmp::min;
use core::mem;
use core::ptr;
use core::slice;

use spin::Mutex;

use crate::bio::{BufData, BCACHE};
use crate::block::{bm_alloc, bm_free, inode_alloc};
use crate::consts::{
    BSIZE, MAXPATH, MAX_DIR_SIZE, MAX_FILE_SIZE, NDINDIRECT, NDIRECT, NINDIRECT, NINODE, ROOTDEV,
    ROOTINUM,
};
use crate::error::{Error, Result};
use crate::log::LOG;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::superblock::SUPER_BLOCK;

/// 全局唯一的 inode 缓存，管理内存中所有活跃的 inode。
///
/// 路径解析、文件打开与创建涉及的 inode 全部经由它获取与归还；
/// 引用计数配合 [`Inode`] 的 Drop 实现自动回收。
pub static ICACHE: InodeCache = InodeCache::new();

/// 内存中活跃 inode 的缓存池
///
/// # 字段说明
/// - `meta`: 每个槽位的身份与引用计数，自旋锁统一保护，
///   用于查重、分配与生命周期管理
/// - `data`: 每个槽位的 inode 内容副本，各自由睡眠锁保护，
///   支持跨磁盘 I/O 的独占访问
pub struct InodeCache {
    meta: Mutex<[InodeMeta; NINODE]>,
    data: [SleepLock<InodeData>; NINODE],
}

impl InodeCache {
    const fn new() -> Self {
        Self {
            meta: Mutex::new(array![_ => InodeMeta::new(); NINODE]),
            data: array![_ => SleepLock::new(InodeData::new(), "InodeData"); NINODE],
        }
    }

    /// 在缓存中查找指定编号的 inode。
    ///
    /// # 功能说明
    /// 给定 `(dev, inum)`，已有匹配槽位则引用计数加一并返回句柄；
    /// 否则占用一个空闲槽位登记身份。不做磁盘 I/O，内容留待
    /// 第一次 `lock` 时装载。
    ///
    /// # 流程解释
    /// 1. 锁住元信息数组；
    /// 2. 扫描：命中（身份相符且引用计数大于零）则加一返回；
    ///    顺手记下第一个空闲槽位；
    /// 3. 未命中时占用空闲槽位，填入身份、引用计数置一。
    ///
    /// # 参数
    /// - `dev`: inode 所属设备号
    /// - `inum`: inode 在设备上的编号
    ///
    /// # 返回值
    /// 指向缓存槽位的 [`Inode`] 句柄
    ///
    /// # 可能的错误
    /// 没有空闲槽位时触发 panic：`"iget: inode cache is full"`。
    /// 同时活跃的 inode 数量按设计预先配足（`NINODE`）。
    pub(crate) fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut guard = self.meta.lock();

        let mut empty_i: Option<usize> = None;
        for i in 0..NINODE {
            if guard[i].inum == inum && guard[i].refs > 0 && guard[i].dev == dev {
                guard[i].refs += 1;
                return Inode { dev, inum, index: i };
            }
            if empty_i.is_none() && guard[i].refs == 0 {
                empty_i = Some(i);
            }
        }

        let empty_i = match empty_i {
            Some(i) => i,
            None => panic!("iget: inode cache is full"),
        };
        guard[empty_i].dev = dev;
        guard[empty_i].inum = inum;
        guard[empty_i].refs = 1;
        Inode {
            dev,
            inum,
            index: empty_i,
        }
    }

    /// 克隆一个 inode 句柄。
    ///
    /// # 功能说明
    /// 仅把引用计数加一，让多个句柄共享同一个缓存槽位。
    /// 目录遍历与工作目录安装等场景都靠它延长 inode 的生命周期。
    ///
    /// # 参数
    /// - `inode`: 原始句柄
    ///
    /// # 返回值
    /// 与原句柄指向同一槽位的新 [`Inode`]
    fn dup(&self, inode: &Inode) -> Inode {
        let mut guard = self.meta.lock();
        guard[inode.index].refs += 1;
        Inode {
            dev: inode.dev,
            inum: inode.inum,
            index: inode.index,
        }
    }

    /// 归还一个 inode 引用，必要时回收它。
    ///
    /// # 功能说明
    /// 引用计数减一。这是最后一个引用、内容已装载且硬链接数为零
    /// 时，说明没有任何路径再能到达它：截断内容、磁盘上标记为
    /// 空闲，槽位随之可复用。通常由 [`Inode`] 的 Drop 自动调用。
    ///
    /// # 流程解释
    /// 1. 锁住元信息；引用计数大于一则减一了事；
    /// 2. 引用计数恰为一时锁住内容（此时不可能有别的持有者，
    ///    不会阻塞）：
    ///    - 内容未装载或还有硬链接：只把装载标志清掉再减引用，
    ///      槽位复用时强制重新读盘，旧内容不会张冠李戴；
    ///    - 否则先放开元信息锁，截断并把磁盘 inode 标记为空，
    ///      内容失效之后才重新上锁把引用归零，过早归零会让
    ///      槽位在写回磁盘前被人复用。
    ///
    /// # 参数
    /// - `inode`: 正被归还的句柄（来自 Drop）
    ///
    /// # 安全性
    /// 回收路径会释放磁盘块并改写 inode 区，调用链必须处于
    /// 日志事务之内；这是调用约定，由所有写路径的入口保证。
    fn put(&self, inode: &mut Inode) {
        let mut guard = self.meta.lock();
        let i = inode.index;
        let imeta = &mut guard[i];

        if imeta.refs == 1 {
            // 引用计数为 1，没有别的持有者，这把睡眠锁不会阻塞
            let mut idata = self.data[i].lock();
            if idata.valid.is_none() || idata.dinode.nlink > 0 {
                idata.valid.take();
                drop(idata);
                imeta.refs -= 1;
                drop(guard);
            } else {
                drop(guard);
                idata.dinode.itype = InodeType::Empty;
                idata.truncate();
                idata.valid.take();
                drop(idata);

                // 缓存内容失效之后才能归还引用计数，
                // 过早归还会让该槽在写回磁盘前被复用
                let mut guard = self.meta.lock();
                guard[i].refs -= 1;
                debug_assert_eq!(guard[i].refs, 0);
                drop(guard);
            }
        } else {
            imeta.refs -= 1;
            drop(guard);
        }
    }

    /// 根目录的 inode 引用
    pub fn root(&self) -> Inode {
        self.get(ROOTDEV, ROOTINUM)
    }

    /// 路径解析的公共主体，为 `namei` 与 `namei_parent` 服务。
    ///
    /// # 功能说明
    /// 逐级拆出路径分量并在目录里查找。`is_parent` 为假时走到
    /// 路径末端返回末端 inode；为真时在最后一级停下，返回倒数
    /// 第二级目录并把末段名留在 `name` 里。
    ///
    /// # 流程解释
    /// 1. 以 `/` 开头从根出发，否则克隆 `cwd` 出发；
    /// 2. 循环：取下一个分量；当前 inode 必须是目录；
    ///    要父目录且这是最后一个分量则就此返回；
    ///    否则查目录项并下降，任何时刻只持有一级目录的内容锁；
    /// 3. 分量耗尽时，非父目录模式返回当前 inode。
    ///
    /// # 参数
    /// - `path`: 路径字节串，可以不带 NUL 结尾
    /// - `name`: 末段名的输出缓冲（定长）
    /// - `is_parent`: 是否要的是父目录
    /// - `cwd`: 相对路径的出发点
    ///
    /// # 返回值
    /// - `Ok(inode)`: 解析成功
    /// - `Err(NotADirectory)`: 中途撞上非目录
    /// - `Err(NotFound)`: 某级分量不存在，或对根目录要父目录
    ///
    /// # 安全性
    /// 下降时旧句柄随赋值归还；调用方若可能释放最后一个引用，
    /// 须处于日志事务之内。
    fn namex(
        &self,
        path: &[u8],
        name: &mut [u8; MAX_DIR_SIZE],
        is_parent: bool,
        cwd: &Inode,
    ) -> Result<Inode> {
        let mut inode = if at(path, 0) == b'/' {
            self.get(ROOTDEV, ROOTINUM)
        } else {
            self.dup(cwd)
        };

        let mut cur: usize = 0;
        loop {
            cur = skip_path(path, cur, name);
            if cur == 0 {
                break;
            }
            let mut data_guard = inode.lock();
            if data_guard.dinode.itype != InodeType::Directory {
                drop(data_guard);
                return Err(Error::NotADirectory);
            }
            if is_parent && at(path, cur) == 0 {
                drop(data_guard);
                return Ok(inode);
            }
            match data_guard.dir_lookup(name, false) {
                None => {
                    drop(data_guard);
                    return Err(Error::NotFound);
                }
                Some((next_inode, _)) => {
                    drop(data_guard);
                    inode = next_inode;
                }
            }
        }

        if is_parent {
            // 只有查询根目录的父目录才会走到这里
            log::warn!("namex querying root inode's parent");
            Err(Error::NotFound)
        } else {
            Ok(inode)
        }
    }

    /// 解析路径，返回末端的 inode。
    ///
    /// # 功能说明
    /// 把 UNIX 风格路径映射到 inode，是打开、链接、删除等一切
    /// 名字操作的入口。相对路径从 `cwd` 出发。
    ///
    /// # 参数
    /// - `path`: 路径字节串
    /// - `cwd`: 调用方的工作目录引用
    ///
    /// # 返回值
    /// 末端 inode 的句柄；路径非法或缺失时为相应错误
    ///
    /// # 安全性
    /// 调用方若可能释放最后一个引用，须处于日志事务之内。
    pub fn namei(&self, path: &[u8], cwd: &Inode) -> Result<Inode> {
        let mut name = [0u8; MAX_DIR_SIZE];
        self.namex(path, &mut name, false, cwd)
    }

    /// 与 `namei` 相同，但返回父目录，并把末段名拷入 `name`
    pub fn namei_parent(
        &self,
        path: &[u8],
        name: &mut [u8; MAX_DIR_SIZE],
        cwd: &Inode,
    ) -> Result<Inode> {
        self.namex(path, name, true, cwd)
    }

    /// 解析路径并创建一个新的 inode。
    ///
    /// # 功能说明
    /// 文件、目录、设备节点与符号链接创建的公共实现：解析出父
    /// 目录，分配磁盘 inode，目录类型补上 `.`/`..`，最后把名字
    /// 登记进父目录。
    ///
    /// # 流程解释
    /// 1. `namei_parent` 取得父目录并锁住；
    /// 2. 名字已存在：打开普通文件（`itype` 为文件）且已有项是
    ///    文件或设备则返回已有项，其余情况一律 `AlreadyExists`；
    ///    并发的两个 create 在父目录锁下串行，后到者按同样规则
    ///    拿到先到者的结果；
    /// 3. 分配新 inode，填入设备号与 `nlink = 1` 并写回；
    /// 4. 目录类型先建 `.` 与 `..`，父目录因新增的 `..` 引用
    ///    而加一个链接；
    /// 5. 名字登记进父目录。
    ///
    /// # 参数
    /// - `path`: 目标路径
    /// - `itype`: 新 inode 的类型
    /// - `major` / `minor`: 设备号（仅设备节点有意义）
    /// - `cwd`: 相对路径的出发点
    ///
    /// # 返回值
    /// 新建或复用的 inode 句柄（未锁定，调用方按需再锁）
    ///
    /// # 可能的错误
    /// - 父目录不存在或路径非法：来自 `namei_parent` 的错误；
    /// - 名字冲突：`AlreadyExists`；
    /// - 目录项写入失败属于"校验通过后不该失败"的一类，
    ///   直接 panic。
    ///
    /// # 安全性
    /// 须在日志事务内调用；父目录与新 inode 两把内容锁按
    /// 先父后子的次序获取。
    pub fn create(
        &self,
        path: &[u8],
        itype: InodeType,
        major: u16,
        minor: u16,
        cwd: &Inode,
    ) -> Result<Inode> {
        let mut name = [0u8; MAX_DIR_SIZE];
        let dir_inode = self.namei_parent(path, &mut name, cwd)?;
        let mut dir_idata = dir_inode.lock();

        // 先查找
        if let Some((inode, _)) = dir_idata.dir_lookup(&name, false) {
            drop(dir_idata);
            drop(dir_inode);
            if itype == InodeType::File {
                let existing = inode.lock().get_itype();
                if existing == InodeType::File || existing == InodeType::Device {
                    return Ok(inode);
                }
            }
            return Err(Error::AlreadyExists);
        }

        // 未找到，分配新 inode
        let (dev, _) = dir_idata.get_dev_inum();
        let inum = inode_alloc(dev, itype);
        let inode = self.get(dev, inum);
        let mut idata = inode.lock();
        idata.dinode.major = major;
        idata.dinode.minor = minor;
        idata.dinode.nlink = 1;
        idata.update();
        debug_assert_eq!(idata.dinode.itype, itype);

        if itype == InodeType::Directory {
            // 新目录的 `..` 引用父目录
            dir_idata.dinode.nlink += 1;
            dir_idata.update();
            let mut dot = [0u8; MAX_DIR_SIZE];
            dot[0] = b'.';
            // `.` 不增加自身 nlink，避免引用计数成环，
            // 否则目录永远无法被释放
            if idata.dir_link(&dot, inum).is_err() {
                panic!("create: dir link .");
            }
            dot[1] = b'.';
            if idata.dir_link(&dot, dir_inode.inum()).is_err() {
                panic!("create: dir link ..");
            }
        }

        if dir_idata.dir_link(&name, inum).is_err() {
            panic!("create: parent dir link");
        }

        drop(dir_idata);
        drop(idata);
        drop(dir_inode);
        Ok(inode)
    }
}

/// 取出路径中的下一个分量。
///
/// # 功能说明
/// 从 `path` 的 `cur` 处跳过前导 `/`，把接下来的分量拷入 `name`
/// （超长截断到 `MAX_DIR_SIZE`，占满时不带结尾 NUL，余下填零），
/// 再跳过后续的 `/`。
///
/// # 参数
/// - `path`: 路径字节串
/// - `cur`: 本次解析的起点
/// - `name`: 分量的输出缓冲
///
/// # 返回值
/// 该分量之后的游标；没有分量（到头或只剩 `/`）时返回 0
fn skip_path(path: &[u8], mut cur: usize, name: &mut [u8; MAX_DIR_SIZE]) -> usize {
    while at(path, cur) == b'/' {
        cur += 1;
    }
    if at(path, cur) == 0 {
        return 0;
    }

    let start = cur;
    while at(path, cur) != b'/' && at(path, cur) != 0 {
        cur += 1;
    }
    let count = min(cur - start, MAX_DIR_SIZE);
    name.fill(0);
    name[..count].copy_from_slice(&path[start..start + count]);

    while at(path, cur) == b'/' {
        cur += 1;
    }
    cur
}

/// 越过切片末尾视同 NUL 终结符，路径可以不带 NUL
#[inline]
fn at(path: &[u8], i: usize) -> u8 {
    if i < path.len() {
        path[i]
    } else {
        0
    }
}

/// 活跃 inode 的轻量句柄。
///
/// 并不直接包含 inode 数据，而是通过 `index` 指向缓存中的槽位，
/// 配合引用计数实现共享与回收：克隆即增加引用计数，析构即归还。
/// 实际数据须经 [`Inode::lock`] 访问。
#[derive(Debug)]
pub struct Inode {
    dev: u32,
    inum: u32,
    index: usize,
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        ICACHE.dup(self)
    }
}

impl Inode {
    /// inode 所属设备号
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// inode 编号
    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// 锁住 inode 内容，必要时从磁盘装载。
    ///
    /// # 功能说明
    /// 取得内容睡眠锁。槽位尚未装载（首次访问或上次归还时失效）
    /// 则从 inode 区读入磁盘记录并标记装载来源。
    ///
    /// # 流程解释
    /// 1. 取内容睡眠锁（可能要等当前使用者放手）；
    /// 2. 装载标志为空时，定位所在 inode 块与块内偏移，
    ///    整体读出磁盘记录；
    /// 3. 记录装载来源 `(dev, inum)`。
    ///
    /// # 返回值
    /// 受睡眠锁保护的 [`InodeData`] 守卫
    ///
    /// # 可能的错误
    /// 装载出来的类型为空说明读到了已释放的 inode：目录里挂着
    /// 指向空闲 inode 的项，结构已损坏，触发 panic：
    /// `"ilock: inode is unallocated"`。
    ///
    /// # 安全性
    /// 按结构体解读块内容依赖 `BufData` 的对齐与 `IPB` 整除关系，
    /// 由挂载时的 `icheck` 断言。
    pub fn lock<'a>(&'a self) -> SleepLockGuard<'a, InodeData> {
        let mut guard = ICACHE.data[self.index].lock();

        if guard.valid.is_none() {
            let buf = BCACHE.bread(self.dev, SUPER_BLOCK.locate_inode(self.inum));
            let offset = locate_inode_offset(self.inum);
            let dinode = unsafe { (buf.raw_data() as *const DiskInode).offset(offset) };
            guard.dinode = unsafe { ptr::read(dinode) };
            drop(buf);
            guard.valid = Some((self.dev, self.inum));
            if guard.dinode.itype == InodeType::Empty {
                panic!("ilock: inode is unallocated");
            }
        }

        guard
    }
}

impl Drop for Inode {
    /// 归还引用；这是最后一个引用且链接数为零时会释放磁盘 inode，
    /// 因此可能释放引用的调用方必须处于事务之内
    fn drop(&mut self) {
        ICACHE.put(self);
    }
}

/// 缓存槽的元信息：身份与引用计数。`refs == 0` 表示槽位空闲。
struct InodeMeta {
    dev: u32,
    inum: u32,
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refs: 0,
        }
    }
}

/// inode 内容的内存副本。
///
/// 写穿策略：所有落盘字段的修改之后都要调用 [`InodeData::update`]，
/// 内存与磁盘（经日志）保持一致。
pub struct InodeData {
    /// `None` 表示尚未从磁盘装载；`Some((dev, inum))` 记录装载来源
    valid: Option<(u32, u32)>,
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: None,
            dinode: DiskInode::new(),
        }
    }

    /// 所属的 `(dev, inum)`
    #[inline]
    pub fn get_dev_inum(&self) -> (u32, u32) {
        self.valid.unwrap()
    }

    /// inode 类型
    #[inline]
    pub fn get_itype(&self) -> InodeType {
        self.dinode.itype
    }

    /// 设备节点的主次设备号
    #[inline]
    pub fn get_devnum(&self) -> (u16, u16) {
        (self.dinode.major, self.dinode.minor)
    }

    /// 内容字节数
    #[inline]
    pub fn size(&self) -> u32 {
        self.dinode.size
    }

    /// 硬链接数加一（调用方随后 `update` 写回）
    pub fn link(&mut self) {
        self.dinode.nlink += 1;
    }

    /// 硬链接数减一
    pub fn unlink(&mut self) {
        self.dinode.nlink -= 1;
    }

    /// 把内存中的 inode 写回磁盘所在的 inode 块。
    ///
    /// # 功能说明
    /// 写穿的落盘半边：定位 inode 区的所在块，把整条记录覆写进
    /// 缓冲区并登记进日志。每次修改落盘字段后都要调用。
    ///
    /// # 安全性
    /// 须持有内容锁并处于日志事务内；指针写入的对齐前提由
    /// `icheck` 断言。
    pub fn update(&mut self) {
        let (dev, inum) = *self.valid.as_ref().unwrap();

        let mut buf = BCACHE.bread(dev, SUPER_BLOCK.locate_inode(inum));
        let offset = locate_inode_offset(inum);
        let dinode = unsafe { (buf.raw_data_mut() as *mut DiskInode).offset(offset) };
        unsafe { ptr::write(dinode, self.dinode) };
        LOG.write(buf);
    }

    /// 丢弃 inode 的全部内容。
    ///
    /// # 功能说明
    /// 释放 inode 引用的每一个数据块，把大小清零并写回。
    /// 文件删除与 `O_TRUNC` 打开共用这一条路径。
    ///
    /// # 流程解释
    /// 1. 逐个释放直接块；
    /// 2. 存在一级间接块时，释放其下辖的叶子块再释放它本身；
    /// 3. 存在二级间接块时，自底向上释放两层；
    /// 4. 大小清零，整条记录写回。
    ///
    /// # 安全性
    /// 须持有内容锁并处于日志事务内。
    pub fn truncate(&mut self) {
        let (dev, _) = *self.valid.as_ref().unwrap();

        for i in 0..NDIRECT {
            if self.dinode.addrs[i] > 0 {
                bm_free(dev, self.dinode.addrs[i]);
                self.dinode.addrs[i] = 0;
            }
        }

        if self.dinode.addrs[NDIRECT] > 0 {
            free_indirect(dev, self.dinode.addrs[NDIRECT], 1);
            self.dinode.addrs[NDIRECT] = 0;
        }

        if self.dinode.addrs[NDIRECT + 1] > 0 {
            free_indirect(dev, self.dinode.addrs[NDIRECT + 1], 2);
            self.dinode.addrs[NDIRECT + 1] = 0;
        }

        self.dinode.size = 0;
        self.update();
    }

    /// 从 inode 内容读出数据。
    ///
    /// # 功能说明
    /// 自 `offset` 读入至多 `dst.len()` 字节；请求越过文件尾的
    /// 部分截短。按块循环：定位所在磁盘块，把块内的一段拷进
    /// 目标缓冲。
    ///
    /// # 参数
    /// - `dst`: 目标缓冲，长度即请求字节数
    /// - `offset`: 文件内起始偏移
    ///
    /// # 返回值
    /// - `Ok(n)`: 实际读出 `n` 字节（`offset` 恰在文件尾时为 0）
    /// - `Err(InvalidArg)`: 偏移越过文件尾，或偏移加长度溢出
    ///
    /// # 安全性
    /// 调用方须持有内容锁。
    pub fn read(&mut self, dst: &mut [u8], offset: u32) -> Result<u32> {
        let size = self.dinode.size as usize;
        let offset = offset as usize;
        let end = offset.checked_add(dst.len()).ok_or(Error::InvalidArg)?;
        if offset > size {
            return Err(Error::InvalidArg);
        }
        let count = min(end, size) - offset;

        let (dev, _) = *self.valid.as_ref().unwrap();
        let mut done = 0;
        let mut off = offset;
        while done < count {
            let blockno = self.map_blockno(off / BSIZE);
            let buf = BCACHE.bread(dev, blockno);
            let m = min(count - done, BSIZE - off % BSIZE);
            dst[done..done + m].copy_from_slice(&buf.bytes()[off % BSIZE..off % BSIZE + m]);
            drop(buf);
            done += m;
            off += m;
        }
        Ok(count as u32)
    }

    /// 向 inode 内容写入数据。
    ///
    /// # 功能说明
    /// 自 `offset` 写入整个 `src`，需要的块沿途分配；写过文件尾
    /// 时增长文件。只允许在文件尾以内或恰在文件尾处落笔，不产生
    /// 空洞；越过单文件最大长度是硬错误，不做截短。
    ///
    /// # 流程解释
    /// 1. 校验偏移与总长；
    /// 2. 按块循环：映射（可能分配）所在块，读出、改写其中一段、
    ///    登记进日志；
    /// 3. 终点超过旧大小则更新大小；
    /// 4. 无论大小变没变都写回整条记录，映射块时可能改动了
    ///    地址表。
    ///
    /// # 参数
    /// - `src`: 数据来源
    /// - `offset`: 文件内起始偏移
    ///
    /// # 返回值
    /// - `Ok(n)`: 写入的字节数（等于 `src.len()`）
    /// - `Err(InvalidArg)`: 偏移越过文件尾或算术溢出
    /// - `Err(FileTooLarge)`: 终点越过单文件最大可寻址范围
    ///
    /// # 安全性
    /// 调用方须持有内容锁并处于日志事务内。
    pub fn write(&mut self, src: &[u8], offset: u32) -> Result<u32> {
        if offset > self.dinode.size {
            return Err(Error::InvalidArg);
        }
        let end = (offset as usize)
            .checked_add(src.len())
            .ok_or(Error::InvalidArg)?;
        if end > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }

        let (dev, _) = *self.valid.as_ref().unwrap();
        let mut done = 0;
        let mut off = offset as usize;
        while done < src.len() {
            let blockno = self.map_blockno(off / BSIZE);
            let mut buf = BCACHE.bread(dev, blockno);
            let m = min(src.len() - done, BSIZE - off % BSIZE);
            buf.bytes_mut()[off % BSIZE..off % BSIZE + m].copy_from_slice(&src[done..done + m]);
            LOG.write(buf);
            done += m;
            off += m;
        }

        if off as u32 > self.dinode.size {
            self.dinode.size = off as u32;
        }
        // 大小未变时映射块也可能改动了地址表，一律写回
        self.update();
        Ok(done as u32)
    }

    /// inode 的状态信息，供 `stat` 类接口上报
    pub fn stat(&self) -> FileStat {
        let (dev, inum) = self.valid.unwrap();
        FileStat {
            dev,
            inum,
            itype: self.dinode.itype,
            nlink: self.dinode.nlink,
            size: self.dinode.size as u64,
        }
    }

    /// 就地写入符号链接目标。
    ///
    /// 目标串存放在 inode 记录自身的定长字段里，超长截断，
    /// 余下填零；随后整条记录写回。
    pub fn set_target(&mut self, target: &[u8]) {
        let len = min(target.len(), MAXPATH);
        self.dinode.target.fill(0);
        self.dinode.target[..len].copy_from_slice(&target[..len]);
        self.update();
    }

    /// 符号链接目标（定长，NUL 填充）
    pub fn target(&self) -> &[u8; MAXPATH] {
        &self.dinode.target
    }

    /// 把 inode 内的逻辑块号映射为磁盘块号。
    ///
    /// # 功能说明
    /// 三级布局：前 `NDIRECT` 块直接寻址，随后 `NINDIRECT` 块经
    /// 一级间接块，再后 `NDINDIRECT` 块经二级间接块两跳。路径上
    /// 缺失的块（含间接块本身）就地分配。
    ///
    /// # 参数
    /// - `offset_bn`: 文件内从零起的逻辑块号
    ///
    /// # 返回值
    /// 承载该逻辑块的磁盘块号
    ///
    /// # 可能的错误
    /// 越过最大可寻址范围是调用方的设计错误（写入口先查过
    /// `MAX_FILE_SIZE`），触发 panic。
    ///
    /// # 安全性
    /// 地址表的改动只落在内存里，由调用方随后 `update` 写回；
    /// 间接块的改动就地登记进日志。
    fn map_blockno(&mut self, offset_bn: usize) -> u32 {
        let (dev, _) = *self.valid.as_ref().unwrap();
        if offset_bn < NDIRECT {
            if self.dinode.addrs[offset_bn] == 0 {
                self.dinode.addrs[offset_bn] = bm_alloc(dev);
            }
            self.dinode.addrs[offset_bn]
        } else if offset_bn < NDIRECT + NINDIRECT {
            let count = offset_bn - NDIRECT;
            if self.dinode.addrs[NDIRECT] == 0 {
                self.dinode.addrs[NDIRECT] = bm_alloc(dev);
            }
            indirect_entry(dev, self.dinode.addrs[NDIRECT], count as isize)
        } else if offset_bn < NDIRECT + NINDIRECT + NDINDIRECT {
            let count = offset_bn - NDIRECT - NINDIRECT;
            if self.dinode.addrs[NDIRECT + 1] == 0 {
                self.dinode.addrs[NDIRECT + 1] = bm_alloc(dev);
            }
            let mid_bn = indirect_entry(
                dev,
                self.dinode.addrs[NDIRECT + 1],
                (count / NINDIRECT) as isize,
            );
            indirect_entry(dev, mid_bn, (count % NINDIRECT) as isize)
        } else {
            panic!("bmap: block index out of range");
        }
    }

    /// 在目录中查找名为 `name` 的目录项。
    ///
    /// # 功能说明
    /// 按目录项逐条扫描目录内容，跳过空闲项。名字按定长字节比较：
    /// 两边都是 NUL 填充的定长缓冲，占满 `MAX_DIR_SIZE` 的名字
    /// 不要求结尾 NUL，前缀相同即视为同名。
    ///
    /// # 参数
    /// - `name`: 目标名字（定长缓冲）
    /// - `need_offset`: 是否同时要该项在目录内容中的字节偏移
    ///   （删除路径要用它回头改写）
    ///
    /// # 返回值
    /// - `Some((inode, Some(offset)))`: 找到且要了偏移
    /// - `Some((inode, None))`: 找到，不要偏移
    /// - `None`: 没有这个名字
    ///
    /// # 可能的错误
    /// 对非目录调用说明上层逻辑已乱，触发 panic。
    ///
    /// # 安全性
    /// 调用方须持有本目录的内容锁；返回的 inode 未锁定。
    pub fn dir_lookup(
        &mut self,
        name: &[u8; MAX_DIR_SIZE],
        need_offset: bool,
    ) -> Option<(Inode, Option<u32>)> {
        let (dev, _) = *self.valid.as_ref().unwrap();
        debug_assert!(dev != 0);
        if self.dinode.itype != InodeType::Directory {
            panic!("dirlookup: not a directory");
        }

        let de_size = mem::size_of::<DirEntry>();
        let mut dir_entry = DirEntry::empty();
        for offset in (0..self.dinode.size).step_by(de_size) {
            self.read(dir_entry.as_bytes_mut(), offset)
                .expect("read dir entry");
            if dir_entry.inum == 0 {
                continue;
            }
            if dir_entry.name == *name {
                return Some((
                    ICACHE.get(dev, dir_entry.inum as u32),
                    if need_offset { Some(offset) } else { None },
                ));
            }
        }

        None
    }

    /// 向目录写入一个新目录项。
    ///
    /// # 功能说明
    /// 建立名字到 inode 编号的映射。先确认名字不存在，再找一个
    /// 空闲槽位（`inum == 0`）复用，没有空闲槽位就追加在目录
    /// 内容末尾。
    ///
    /// # 参数
    /// - `name`: 新目录项的名字（定长缓冲）
    /// - `inum`: 目标 inode 编号
    ///
    /// # 返回值
    /// - `Ok(())`: 写入完成
    /// - `Err(AlreadyExists)`: 同名项已存在
    ///
    /// # 可能的错误
    /// 编号超出目录项格式的 `u16` 表示范围、或校验通过后目录
    /// 内容写入失败，均触发 panic。
    ///
    /// # 安全性
    /// 调用方须持有内容锁并处于日志事务内。
    pub fn dir_link(&mut self, name: &[u8; MAX_DIR_SIZE], inum: u32) -> Result<()> {
        if inum > u16::MAX as u32 {
            panic!("dirlink: inum {} too large", inum);
        }
        let inum = inum as u16;

        // 该条目不应已存在；查到的引用随即释放
        if self.dir_lookup(name, false).is_some() {
            return Err(Error::AlreadyExists);
        }

        // 找一个空闲目录项
        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut dir_entry = DirEntry::empty();
        let mut offset = self.dinode.size;
        for off in (0..self.dinode.size).step_by(de_size as usize) {
            self.read(dir_entry.as_bytes_mut(), off)
                .expect("read dir entry");
            if dir_entry.inum == 0 {
                offset = off;
                break;
            }
        }

        debug_assert_eq!(offset % de_size, 0);
        dir_entry.name.copy_from_slice(name);
        dir_entry.inum = inum;
        if self.write(dir_entry.as_bytes(), offset).is_err() {
            panic!("dirlink: inode write");
        }

        Ok(())
    }

    /// 删除目录中名为 `name` 的目录项并维护链接数。
    ///
    /// # 功能说明
    /// `unlink`/`rmdir` 的目录侧实现。找到目录项后以全零覆写，
    /// 目标的硬链接数减一；目标是子目录时本目录也减一（它的
    /// `..` 随之消失）。目标 inode 本体的回收发生在最后一个
    /// 引用归还时。
    ///
    /// # 流程解释
    /// 1. `.` 与 `..` 不可删除；
    /// 2. 查找目录项并记下偏移；
    /// 3. 锁住目标：链接数必须为正；目标是目录时必须为空；
    /// 4. 以空目录项覆写原偏移；
    /// 5. 维护双方链接数并写回。
    ///
    /// # 参数
    /// - `name`: 要删除的目录项名字
    ///
    /// # 返回值
    /// - `Ok(())`: 删除完成
    /// - `Err(PermissionDenied)`: 名字是 `.` 或 `..`
    /// - `Err(NotFound)`: 没有这个名字
    /// - `Err(DirectoryNotEmpty)`: 目标目录非空
    ///
    /// # 安全性
    /// 调用方须持有本目录内容锁并处于日志事务内；
    /// 目标的内容锁按先父后子的次序获取。
    pub fn dir_unlink(&mut self, name: &[u8; MAX_DIR_SIZE]) -> Result<()> {
        if name[0] == b'.' && (name[1] == 0 || (name[1] == b'.' && name[2] == 0)) {
            return Err(Error::PermissionDenied);
        }

        let (inode, offset) = match self.dir_lookup(name, true) {
            Some((i, Some(off))) => (i, off),
            _ => return Err(Error::NotFound),
        };

        let mut idata = inode.lock();
        if idata.dinode.nlink < 1 {
            panic!("dir_unlink: entry nlink is zero");
        }
        if idata.dinode.itype == InodeType::Directory && !idata.dir_is_empty() {
            return Err(Error::DirectoryNotEmpty);
        }

        // 清空该目录项
        let dir_entry = DirEntry::empty();
        if self.write(dir_entry.as_bytes(), offset).is_err() {
            panic!("dir_unlink: rewrite entry");
        }

        // 子目录带走了它的 `..`，父目录少一个引用
        if idata.dinode.itype == InodeType::Directory {
            self.dinode.nlink -= 1;
            self.update();
        }
        idata.dinode.nlink -= 1;
        idata.update();

        Ok(())
    }

    /// 目录除 `.` 与 `..` 外是否没有别的条目。
    /// 前两条固定是 `.` 与 `..`，从第三条扫起。
    fn dir_is_empty(&mut self) -> bool {
        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut dir_entry = DirEntry::empty();
        for offset in ((2 * de_size)..self.dinode.size).step_by(de_size as usize) {
            if self.read(dir_entry.as_bytes_mut(), offset).is_err() {
                panic!("read dir entry");
            }
            if dir_entry.inum != 0 {
                return false;
            }
        }

        true
    }
}

/// 读间接块 `indirect_bn` 的第 `index` 项，为 0 时就地分配并记日志。
///
/// 间接块整块是小端 `u32` 的块号数组；持有它的缓冲锁期间去分配
/// 新块不会与位图块的缓冲锁冲突（二者不同块）。
fn indirect_entry(dev: u32, indirect_bn: u32, index: isize) -> u32 {
    let mut buf = BCACHE.bread(dev, indirect_bn);
    let bn_ptr = unsafe { (buf.raw_data_mut() as *mut BlockNo).offset(index) };
    let bn = unsafe { ptr::read(bn_ptr) };
    if bn == 0 {
        let free_bn = bm_alloc(dev);
        unsafe { ptr::write(bn_ptr, free_bn) };
        LOG.write(buf);
        free_bn
    } else {
        drop(buf);
        bn
    }
}

/// 释放一个间接块下辖的所有块，再释放它自身。
///
/// # 参数
/// - `depth`: 该块的索引层数，1 表示它直接列着数据块号，
///   2 表示它列着下一层间接块
fn free_indirect(dev: u32, blockno: u32, depth: usize) {
    let buf = BCACHE.bread(dev, blockno);
    let entries = buf.raw_data() as *const BlockNo;
    for i in 0..NINDIRECT {
        let bn = unsafe { ptr::read(entries.offset(i as isize)) };
        if bn > 0 {
            if depth > 1 {
                free_indirect(dev, bn, depth - 1);
            } else {
                bm_free(dev, bn);
            }
        }
    }
    drop(buf);
    bm_free(dev, blockno);
}

/// 单个块中的 inode 数量
pub const IPB: usize = BSIZE / mem::size_of::<DiskInode>();

/// inode 编号在其所在块内的偏移索引
#[inline]
pub fn locate_inode_offset(inum: u32) -> isize {
    (inum as usize % IPB) as isize
}

/// 磁盘格式的编译期约束，挂载时检查。
/// 按结构体解读块内容的各处指针运算都以这些关系为前提。
pub(crate) fn icheck() {
    debug_assert_eq!(mem::size_of::<DiskInode>() * IPB, BSIZE);
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<DiskInode>(), 0);
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<BlockNo>(), 0);
    debug_assert_eq!(BSIZE % mem::size_of::<DirEntry>(), 0);
    debug_assert!(MAX_FILE_SIZE <= u32::MAX as usize);
}

type BlockNo = u32;

/// 文件状态信息，`stat` 的返回值
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub dev: u32,
    pub inum: u32,
    pub itype: InodeType,
    pub nlink: u16,
    pub size: u64,
}

impl FileStat {
    pub const fn uninit() -> Self {
        Self {
            dev: 0,
            inum: 0,
            itype: InodeType::Empty,
            nlink: 0,
            size: 0,
        }
    }
}

/// 磁盘上的 inode 记录
///
/// # 字段说明
/// 定长 128 字节，一个块里排 `IPB` 条。`addrs` 的前 `NDIRECT`
/// 项直接指数据块，随后是一级、二级间接块；`target` 只对符号
/// 链接有意义。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    pub(crate) itype: InodeType,
    /// 主设备号，仅设备节点有效
    pub(crate) major: u16,
    /// 次设备号，仅设备节点有效
    pub(crate) minor: u16,
    /// 硬链接计数：引用本 inode 的目录项个数
    pub(crate) nlink: u16,
    /// 内容字节数
    pub(crate) size: u32,
    /// 前 `NDIRECT` 项为直接块，随后是一级、二级间接块
    pub(crate) addrs: [u32; NDIRECT + 2],
    /// 符号链接目标，就地存放
    pub(crate) target: [u8; MAXPATH],
}

impl DiskInode {
    pub(crate) const fn new() -> Self {
        Self {
            itype: InodeType::Empty,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 2],
            target: [0; MAXPATH],
        }
    }

    /// 空闲（类型为空）时整条清零并写入 `itype` 完成分配
    pub fn try_alloc(&mut self, itype: InodeType) -> core::result::Result<(), ()> {
        if self.itype == InodeType::Empty {
            unsafe { ptr::write_bytes(self, 0, 1) };
            self.itype = itype;
            Ok(())
        } else {
            Err(())
        }
    }
}

/// Inode type.
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Empty = 0,
    Directory = 1,
    File = 2,
    Device = 3,
    Symlink = 4,
}

/// 目录项：名字到 inode 编号的映射。
///
/// 目录文件的内容就是一串定长目录项；`inum == 0` 表示空闲槽位，
/// 可被后续插入复用。
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub inum: u16,
    /// 定长名字，不足时 NUL 填充
    pub name: [u8; MAX_DIR_SIZE],
}

impl DirEntry {
    pub const fn empty() -> Self {
        Self {
            inum: 0,
            name: [0; MAX_DIR_SIZE],
        }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const _ as *const u8, mem::size_of::<Self>()) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self as *mut _ as *mut u8, mem::size_of::<Self>()) }
    }
}
