//! 符号链接：解析、NOFOLLOW、链式与成环

mod common;

use common::*;
use xv6_fs::{Error, File, InodeType, OpenFlags, ICACHE};

#[test]
fn symlink_follow_nofollow_and_loop() {
    let disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    let file = File::open(b"/t", OpenFlags::CREATE | OpenFlags::RDWR, &root).unwrap();
    file.write(b"payload").unwrap();
    drop(file);

    // 打开时默认跟随链接
    xv6_fs::symlink(b"/t", b"/s", &root).unwrap();
    let file = File::open(b"/s", OpenFlags::RDONLY, &root).unwrap();
    assert_eq!(file.stat().itype, InodeType::File);
    let mut buf = [0u8; 16];
    assert_eq!(file.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"payload");
    drop(file);

    // 目标串就地存放在 inode 记录里
    let s_inum = lookup_entry(disk, 1, b"s").unwrap() as u32;
    let ri = read_dinode(disk, s_inum);
    assert_eq!(ri.itype, 4);
    assert_eq!(&ri.target[..2], b"/t");
    assert_eq!(ri.target[2], 0);

    // NOFOLLOW 打开链接本身
    let file = File::open(b"/s", OpenFlags::NOFOLLOW, &root).unwrap();
    assert_eq!(file.stat().itype, InodeType::Symlink);
    assert_eq!(file.stat().inum, s_inum);
    drop(file);

    // 链接套链接
    xv6_fs::symlink(b"/s", b"/s2", &root).unwrap();
    let file = File::open(b"/s2", OpenFlags::RDONLY, &root).unwrap();
    assert_eq!(file.read(&mut buf).unwrap(), 7);
    drop(file);

    // 互指成环，限定跳数后报错
    xv6_fs::symlink(b"/loop_b", b"/loop_a", &root).unwrap();
    xv6_fs::symlink(b"/loop_a", b"/loop_b", &root).unwrap();
    assert_eq!(
        File::open(b"/loop_a", OpenFlags::RDONLY, &root).err(),
        Some(Error::TooManyLinks)
    );

    // 环里的 inode 没有泄漏引用，仍能正常删除回收
    xv6_fs::unlink(b"/loop_a", &root).unwrap();
    xv6_fs::unlink(b"/loop_b", &root).unwrap();
    xv6_fs::unlink(b"/s2", &root).unwrap();
    xv6_fs::unlink(b"/s", &root).unwrap();
    xv6_fs::unlink(b"/t", &root).unwrap();
    check_nlink_invariant(disk);
    check_block_invariant(disk);
}

#[test]
fn dangling_symlink_fails_open() {
    let _disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    xv6_fs::symlink(b"/nowhere", b"/dangling", &root).unwrap();
    assert_eq!(
        File::open(b"/dangling", OpenFlags::RDONLY, &root).err(),
        Some(Error::NotFound)
    );
    // 链接本身还能按 NOFOLLOW 打开
    assert!(File::open(b"/dangling", OpenFlags::NOFOLLOW, &root).is_ok());
    xv6_fs::unlink(b"/dangling", &root).unwrap();
}
