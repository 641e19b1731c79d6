//! 文件层与系统调用级操作
//!
//! [`File`] 是建立在 inode 之上的打开文件对象；本模块同时提供
//! `link`/`unlink`/`mkdir`/`mknod`/`symlink`/`chdir` 这些把 inode
//! 操作捆绑进日志事务的顶层入口。文件描述符表、管道以及设备驱动
//! 分派属于宿主，设备文件只向宿主暴露主次设备号。

use alloc::sync::Arc;

use core::cell::UnsafeCell;
use core::cmp::min;
use core::mem;

use bitflags::bitflags;

use crate::consts::{BSIZE, MAXOPBLOCKS, MAX_DIR_SIZE, NDEV, SYMLINK_DEPTH};
use crate::error::{Error, Result};
use crate::inode::{FileStat, Inode, InodeType, ICACHE};
use crate::log::LOG;

bitflags! {
    /// 打开标志。不含写标志即为只读打开。
    pub struct OpenFlags: u32 {
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREATE = 1 << 9;
        const TRUNC = 1 << 10;
        const NOFOLLOW = 1 << 11;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY)
    }

    fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// 打开的文件对象
///
/// 普通文件与目录共用一个带偏移的臂，设备文件只携带设备号。
/// 偏移通过 `UnsafeCell` 内部可变，由 inode 内容锁串行化访问。
pub struct File {
    inner: FileInner,
    readable: bool,
    writable: bool,
}

unsafe impl Send for File {}
unsafe impl Sync for File {}

enum FileInner {
    Regular(FileRegular),
    Device(FileDevice),
}

struct FileRegular {
    offset: UnsafeCell<u32>,
    inode: Option<Inode>,
}

struct FileDevice {
    major: u16,
    minor: u16,
    inode: Option<Inode>,
}

impl File {
    /// 打开 `path` 指向的文件。
    ///
    /// # 功能说明
    /// 统一处理普通文件、目录、设备节点与符号链接的打开。
    /// 带 `CREATE` 时按普通文件创建（已存在的文件或设备节点被
    /// 复用）；目录只允许只读打开；目标是符号链接且未带
    /// `NOFOLLOW` 时迭代解析到真正的目标。
    ///
    /// # 流程解释
    /// 1. 开启日志事务，失败路径上释放的 inode 引用都落在事务内；
    /// 2. 按 `CREATE` 走创建或查找；
    /// 3. 需要时解析符号链接（至多 `SYMLINK_DEPTH` 跳）；
    /// 4. 按最终类型装配 `File`：目录校验只读，普通文件按
    ///    `TRUNC` 截断，设备节点校验主设备号并记下设备号对；
    /// 5. 结束事务，返回 `Arc` 包装的文件对象。
    ///
    /// # 参数
    /// - `path`: 目标路径
    /// - `flags`: 打开标志组合
    /// - `cwd`: 相对路径的出发点
    ///
    /// # 返回值
    /// - `Ok(Arc<File>)`: 打开成功
    /// - `Err(_)`: 路径缺失、类型冲突、链接成环等
    ///
    /// # 可能的错误
    /// - 路径不存在且未带 `CREATE`：`NotFound`
    /// - 对目录带写标志：`IsADirectory`
    /// - 链接跳数超限：`TooManyLinks`
    /// - 设备节点的主设备号越界：`InvalidArg`
    pub fn open(path: &[u8], flags: OpenFlags, cwd: &Inode) -> Result<Arc<Self>> {
        LOG.begin_op();
        let ret = Self::open_inner(path, flags, cwd);
        LOG.end_op();
        ret
    }

    fn open_inner(path: &[u8], flags: OpenFlags, cwd: &Inode) -> Result<Arc<File>> {
        let inode = if flags.contains(OpenFlags::CREATE) {
            ICACHE.create(path, InodeType::File, 0, 0, cwd)?
        } else {
            ICACHE.namei(path, cwd)?
        };

        let inode = if flags.contains(OpenFlags::NOFOLLOW) {
            inode
        } else {
            follow_links(inode, cwd)?
        };

        let readable = flags.readable();
        let writable = flags.writable();

        let mut idata = inode.lock();
        let itype = idata.get_itype();
        let inner = match itype {
            InodeType::Empty => panic!("open: empty inode"),
            InodeType::Directory => {
                if flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR | OpenFlags::TRUNC) {
                    drop(idata);
                    return Err(Error::IsADirectory);
                }
                drop(idata);
                FileInner::Regular(FileRegular {
                    offset: UnsafeCell::new(0),
                    inode: Some(inode),
                })
            }
            InodeType::File | InodeType::Symlink => {
                if itype == InodeType::File && flags.contains(OpenFlags::TRUNC) {
                    idata.truncate();
                }
                drop(idata);
                FileInner::Regular(FileRegular {
                    offset: UnsafeCell::new(0),
                    inode: Some(inode),
                })
            }
            InodeType::Device => {
                let (major, minor) = idata.get_devnum();
                if major as usize >= NDEV {
                    drop(idata);
                    return Err(Error::InvalidArg);
                }
                drop(idata);
                FileInner::Device(FileDevice {
                    major,
                    minor,
                    inode: Some(inode),
                })
            }
        };

        Ok(Arc::new(File {
            inner,
            readable,
            writable,
        }))
    }

    /// 从当前偏移读入数据。
    ///
    /// # 功能说明
    /// 自文件当前偏移读入至多 `dst.len()` 字节并推进偏移。
    /// 偏移藏在 `UnsafeCell` 里，读取期间由 inode 内容锁串行化，
    /// 同一个 `File` 的并发读不会撕裂偏移。
    ///
    /// # 参数
    /// - `dst`: 目标缓冲
    ///
    /// # 返回值
    /// - `Ok(n)`: 实际读出 `n` 字节，文件尾处为 0
    /// - `Err(PermissionDenied)`: 文件不可读
    /// - `Err(InvalidArg)`: 设备文件（I/O 由宿主驱动分派），
    ///   或偏移已越过文件尾（他人截断所致）
    pub fn read(&self, dst: &mut [u8]) -> Result<u32> {
        if !self.readable {
            return Err(Error::PermissionDenied);
        }

        match &self.inner {
            FileInner::Regular(file) => {
                let mut idata = file.inode.as_ref().unwrap().lock();
                let offset = unsafe { &mut *file.offset.get() };
                let read_count = idata.read(dst, *offset)?;
                *offset += read_count;
                drop(idata);
                Ok(read_count)
            }
            // 设备 I/O 由宿主驱动分派
            FileInner::Device(_) => Err(Error::InvalidArg),
        }
    }

    /// 把数据写入当前偏移处。
    ///
    /// # 功能说明
    /// 自文件当前偏移写入 `src` 并推进偏移。大写入按批拆分，
    /// 每批裹在自己的日志事务里，单个事务写入的块数不会超出
    /// `begin_op` 的预留额度。
    ///
    /// # 流程解释
    /// 1. 按 `(MAXOPBLOCKS - 4) / 2` 个块的字节数切批；
    /// 2. 每批：开事务、锁 inode、写入、推进偏移、收事务；
    /// 3. 中途某批失败时，已写入的部分照常返回；
    ///    第一批就失败才报错。
    ///
    /// # 参数
    /// - `src`: 数据来源
    ///
    /// # 返回值
    /// - `Ok(n)`: 实际写入 `n` 字节
    /// - `Err(PermissionDenied)`: 文件不可写
    /// - `Err(InvalidArg)`: 设备文件
    pub fn write(&self, src: &[u8]) -> Result<u32> {
        if !self.writable {
            return Err(Error::PermissionDenied);
        }

        match &self.inner {
            FileInner::Regular(file) => {
                let batch = (MAXOPBLOCKS - 4) / 2 * BSIZE;
                let mut done = 0;
                while done < src.len() {
                    let count = min(batch, src.len() - done);
                    LOG.begin_op();
                    let mut idata = file.inode.as_ref().unwrap().lock();
                    let offset = unsafe { &mut *file.offset.get() };
                    let ret = idata.write(&src[done..done + count], *offset);
                    if let Ok(n) = ret {
                        *offset += n;
                    }
                    drop(idata);
                    LOG.end_op();
                    match ret {
                        Ok(n) => done += n as usize,
                        Err(e) => {
                            if done > 0 {
                                break;
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(done as u32)
            }
            FileInner::Device(_) => Err(Error::InvalidArg),
        }
    }

    /// 文件状态
    pub fn stat(&self) -> FileStat {
        let inode = match &self.inner {
            FileInner::Regular(f) => f.inode.as_ref().unwrap(),
            FileInner::Device(d) => d.inode.as_ref().unwrap(),
        };
        let idata = inode.lock();
        let stat = idata.stat();
        drop(idata);
        stat
    }

    /// 设备文件的主次设备号，供宿主分派驱动
    pub fn device_numbers(&self) -> Option<(u16, u16)> {
        match &self.inner {
            FileInner::Device(d) => Some((d.major, d.minor)),
            _ => None,
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // 释放 inode 引用可能触发磁盘回收，须在事务内完成
        let inode = match &mut self.inner {
            FileInner::Regular(f) => f.inode.take(),
            FileInner::Device(d) => d.inode.take(),
        };
        if let Some(inode) = inode {
            LOG.begin_op();
            drop(inode);
            LOG.end_op();
        }
    }
}

/// 迭代解析符号链接。
///
/// # 功能说明
/// 目标仍是符号链接时继续解析，直到落在非链接的 inode 上。
/// 跳数超过 `SYMLINK_DEPTH` 按成环处理。
///
/// # 流程解释
/// 1. 锁住当前 inode 看类型，非链接即解析完成；
/// 2. 拷出目标串、放锁，按目标串重新解析
///    （相对目标仍从 `cwd` 出发）；
/// 3. 旧引用随赋值归还，失败路径上途中取得的引用
///    也都随作用域释放。
///
/// # 返回值
/// - `Ok(inode)`: 链条尽头的 inode
/// - `Err(TooManyLinks)`: 跳数超限
/// - `Err(NotFound)`: 目标悬空
fn follow_links(mut inode: Inode, cwd: &Inode) -> Result<Inode> {
    let mut depth = 0;
    loop {
        let idata = inode.lock();
        if idata.get_itype() != InodeType::Symlink {
            drop(idata);
            return Ok(inode);
        }
        depth += 1;
        if depth > SYMLINK_DEPTH {
            drop(idata);
            return Err(Error::TooManyLinks);
        }
        let target = *idata.target();
        drop(idata);
        inode = ICACHE.namei(&target, cwd)?;
    }
}

/// 为现有文件创建硬链接。
///
/// # 功能说明
/// 在 `new` 处登记一个指向 `old` 所指 inode 的目录项，
/// 并把链接数加一。目录不可硬链接，硬链接不可跨设备。
///
/// # 流程解释
/// 1. 解析原路径，拒绝目录，先把链接数加一写回
///    （先加后挂，崩溃时宁可多算不可悬空）；
/// 2. 解析新路径的父目录并登记目录项；
/// 3. 第 2 步任何失败都回滚第 1 步的链接数再返回错误。
///
/// # 参数
/// - `old`: 现有文件路径
/// - `new`: 新链接路径
/// - `cwd`: 相对路径的出发点
///
/// # 返回值
/// - `Ok(())`: 链接建立
/// - `Err(IsADirectory)` / `Err(CrossesDevices)` /
///   `Err(AlreadyExists)` / `Err(NotFound)`: 相应的拒绝原因
pub fn link(old: &[u8], new: &[u8], cwd: &Inode) -> Result<()> {
    LOG.begin_op();

    let old_inode = match ICACHE.namei(old, cwd) {
        Ok(inode) => inode,
        Err(e) => {
            LOG.end_op();
            return Err(e);
        }
    };
    let mut old_idata = old_inode.lock();
    let (old_dev, old_inum) = old_idata.get_dev_inum();
    if old_idata.get_itype() == InodeType::Directory {
        drop(old_idata);
        drop(old_inode);
        LOG.end_op();
        return Err(Error::IsADirectory);
    }
    old_idata.link();
    old_idata.update();
    drop(old_idata);

    // 新路径这边失败时回滚已加的链接数
    let revert_link = |inode: Inode| {
        let mut idata = inode.lock();
        idata.unlink();
        idata.update();
        drop(idata);
        drop(inode);
        LOG.end_op();
    };

    let mut name = [0u8; MAX_DIR_SIZE];
    let dir_inode = match ICACHE.namei_parent(new, &mut name, cwd) {
        Ok(inode) => inode,
        Err(e) => {
            revert_link(old_inode);
            return Err(e);
        }
    };
    let mut dir_idata = dir_inode.lock();
    if dir_idata.get_dev_inum().0 != old_dev {
        drop(dir_idata);
        drop(dir_inode);
        revert_link(old_inode);
        return Err(Error::CrossesDevices);
    }
    if let Err(e) = dir_idata.dir_link(&name, old_inum) {
        drop(dir_idata);
        drop(dir_inode);
        revert_link(old_inode);
        return Err(e);
    }
    drop(dir_idata);
    drop(dir_inode);
    drop(old_inode);

    LOG.end_op();
    Ok(())
}

/// 删除路径指向的目录项。
///
/// # 功能说明
/// 解析出父目录，把末段名对应的目录项清掉并维护链接数。
/// 最后一个链接与最后一个引用都消失后，inode 连同内容在
/// 引用归还时被回收；仍被打开的文件继续可用。
///
/// # 参数
/// - `path`: 要删除的路径
/// - `cwd`: 相对路径的出发点
///
/// # 返回值
/// - `Ok(())`: 删除完成
/// - `Err(_)`: 路径缺失、名字是 `.`/`..`、目录非空等
pub fn unlink(path: &[u8], cwd: &Inode) -> Result<()> {
    LOG.begin_op();

    let mut name = [0u8; MAX_DIR_SIZE];
    let dir_inode = match ICACHE.namei_parent(path, &mut name, cwd) {
        Ok(inode) => inode,
        Err(e) => {
            LOG.end_op();
            return Err(e);
        }
    };

    let mut dir_idata = dir_inode.lock();
    let ret = dir_idata.dir_unlink(&name);
    drop(dir_idata);
    drop(dir_inode);
    LOG.end_op();

    ret
}

/// 在 `path` 处创建目录。
///
/// # 功能说明
/// 新目录自带 `.` 与 `..` 两个目录项；父目录因新增的 `..`
/// 引用而加一个链接。同名路径已存在时失败。
///
/// # 返回值
/// - `Ok(())`: 创建完成
/// - `Err(AlreadyExists)` / `Err(NotFound)`: 名字冲突或父目录缺失
pub fn mkdir(path: &[u8], cwd: &Inode) -> Result<()> {
    LOG.begin_op();
    let ret = ICACHE
        .create(path, InodeType::Directory, 0, 0, cwd)
        .map(|inode| drop(inode));
    LOG.end_op();
    ret
}

/// 在 `path` 处创建设备节点。
///
/// # 参数
/// - `major` / `minor`: 主次设备号，打开时原样交还给宿主
///
/// # 返回值
/// 同名路径已存在时为 `Err(AlreadyExists)`，设备节点不做复用。
pub fn mknod(path: &[u8], major: u16, minor: u16, cwd: &Inode) -> Result<()> {
    LOG.begin_op();
    let ret = ICACHE
        .create(path, InodeType::Device, major, minor, cwd)
        .map(|inode| drop(inode));
    LOG.end_op();
    ret
}

/// 在 `path` 处创建指向 `target` 的符号链接。
///
/// # 功能说明
/// 新建一个符号链接类型的 inode，把目标串就地存进 inode 记录
/// 的定长字段（超长截断）。目标无须存在，悬空链接是合法的。
///
/// # 参数
/// - `target`: 链接指向的路径串
/// - `path`: 链接本身的位置
///
/// # 返回值
/// - `Ok(())`: 创建完成
/// - `Err(AlreadyExists)` / `Err(NotFound)`: 名字冲突或父目录缺失
pub fn symlink(target: &[u8], path: &[u8], cwd: &Inode) -> Result<()> {
    LOG.begin_op();
    let ret = match ICACHE.create(path, InodeType::Symlink, 0, 0, cwd) {
        Ok(inode) => {
            let mut idata = inode.lock();
            idata.set_target(target);
            drop(idata);
            drop(inode);
            Ok(())
        }
        Err(e) => Err(e),
    };
    LOG.end_op();
    ret
}

/// 切换工作目录。
///
/// # 功能说明
/// 解析新路径并确认是目录，随后把 `cwd` 原地换成新目录的引用。
/// 旧引用在事务内释放：工作目录可能正是一个已被删光链接的
/// 目录，最后一个引用的归还会触发磁盘回收。
///
/// # 参数
/// - `path`: 新工作目录的路径
/// - `cwd`: 调用方的工作目录引用，成功时被原地替换
///
/// # 返回值
/// - `Ok(())`: 已切换
/// - `Err(NotADirectory)` / `Err(NotFound)`: 失败，`cwd` 保持原样
pub fn chdir(path: &[u8], cwd: &mut Inode) -> Result<()> {
    LOG.begin_op();

    let inode = match ICACHE.namei(path, cwd) {
        Ok(inode) => inode,
        Err(e) => {
            LOG.end_op();
            return Err(e);
        }
    };
    let idata = inode.lock();
    if idata.get_itype() != InodeType::Directory {
        drop(idata);
        drop(inode);
        LOG.end_op();
        return Err(Error::NotADirectory);
    }
    drop(idata);

    let old = mem::replace(cwd, inode);
    drop(old);
    LOG.end_op();
    Ok(())
}
