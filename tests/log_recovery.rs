//! 崩溃恢复：已提交未安装的日志在挂载时重放

mod common;

use common::*;
use xv6_fs::consts::{BSIZE, ROOTDEV};
use xv6_fs::{File, OpenFlags, ICACHE};

#[test]
fn recovery_replays_committed_log() {
    let disk = MemDisk::new(FSSIZE);
    xv6_fs::register_disk(ROOTDEV, disk.clone());
    xv6_fs::mkfs(ROOTDEV, FSSIZE, NINODES);
    let sb = read_sb(&disk);

    // 受害块先放上"旧"内容
    let victim = sb.size - 1;
    disk.write_raw(victim, &[0xAA; BSIZE]);

    // 模拟崩溃现场：日志头已落盘（已提交）但尚未安装回原位。
    // 载荷写进日志区第一个数据槽，日志头记录它的去向。
    let payload = [0x5A; BSIZE];
    disk.write_raw(sb.logstart + 1, &payload);
    let mut head = vec![0u8; BSIZE];
    head[0..4].copy_from_slice(&1u32.to_le_bytes());
    head[4..8].copy_from_slice(&victim.to_le_bytes());
    disk.write_raw(sb.logstart, &head);

    // 挂载触发重放
    xv6_fs::init(ROOTDEV);

    assert_eq!(disk.raw_block(victim), payload);
    // 日志头被清空，重放不会再次发生
    assert_eq!(&disk.raw_block(sb.logstart)[0..4], &[0, 0, 0, 0]);

    // 恢复之后文件系统照常工作
    let root = ICACHE.root();
    let file = File::open(b"/after", OpenFlags::CREATE | OpenFlags::RDWR, &root).unwrap();
    file.write(b"recovered").unwrap();
    drop(file);
    let file = File::open(b"/after", OpenFlags::RDONLY, &root).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(file.read(&mut buf).unwrap(), 9);
    assert_eq!(&buf[..9], b"recovered");
    drop(file);
    check_nlink_invariant(&disk);
    check_block_invariant(&disk);
}
