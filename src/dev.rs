//! 块设备接口层
//!
//! 文件系统不直接驱动硬件，所有块读写都经由 [`BlockDevice`] 完成，
//! 由宿主（内核驱动或宿主机测试）实现并按设备号注册。

use alloc::sync::Arc;

use array_macro::array;
use spin::Mutex;

use crate::consts::NDEV;

/// 块设备读写接口
///
/// 块缓存层会调用这两个方法，实现方负责把一整块数据搬进/搬出
/// `buf`（长度恰为 `BSIZE`）。实现必须允许并发调用。
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blockno: u32, buf: &mut [u8]);
    fn write_block(&self, blockno: u32, buf: &[u8]);
}

static DEVICES: Mutex<[Option<Arc<dyn BlockDevice>>; NDEV]> =
    Mutex::new(array![_ => None; NDEV]);

/// 注册一个块设备。
///
/// # 功能说明
/// 把设备实现挂到设备号上，此后文件系统对该设备号的所有块
/// 读写都走这份实现。挂载（`init`）之前必须完成注册。
///
/// # 参数
/// - `dev`: 设备号，必须小于 `NDEV`
/// - `disk`: 设备实现
///
/// # 可能的错误
/// 设备号越界或重复注册同一设备号，均触发 panic。
pub fn register_disk(dev: u32, disk: Arc<dyn BlockDevice>) {
    let mut devices = DEVICES.lock();
    if dev as usize >= NDEV {
        panic!("disk: device number {} out of range", dev);
    }
    if devices[dev as usize].is_some() {
        panic!("disk: device {} already registered", dev);
    }
    devices[dev as usize] = Some(disk);
}

fn disk(dev: u32) -> Arc<dyn BlockDevice> {
    let devices = DEVICES.lock();
    match devices.get(dev as usize).and_then(|d| d.as_ref()) {
        Some(disk) => Arc::clone(disk),
        None => panic!("disk: no device {}", dev),
    }
}

// 取出 Arc 后立即放开设备表的锁，磁盘 I/O 不在自旋临界区内进行。

pub(crate) fn read(dev: u32, blockno: u32, buf: &mut [u8]) {
    disk(dev).read_block(blockno, buf);
}

pub(crate) fn write(dev: u32, blockno: u32, buf: &[u8]) {
    disk(dev).write_block(blockno, buf);
}
