//! 目录名定长语义、`.`/`..` 结构与相对路径解析

mod common;

use common::*;
use xv6_fs::{Error, File, OpenFlags, ICACHE};

#[test]
fn dirsiz_truncation_equality() {
    let disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    // 超长名字截断到定长存储
    let file = File::open(b"/abcdefghijklmnop", OpenFlags::CREATE, &root).unwrap();
    let inum = file.stat().inum;
    drop(file);
    assert_eq!(lookup_entry(disk, 1, b"abcdefghijklmn"), Some(inum as u16));

    // 前 14 字节一致的名字解析到同一个 inode
    let inode = ICACHE.namei(b"/abcdefghijklmnXX", &root).unwrap();
    assert_eq!(inode.inum(), inum);
    drop(inode);

    xv6_fs::unlink(b"/abcdefghijklmnZZ", &root).unwrap();
    assert_eq!(lookup_entry(disk, 1, b"abcdefghijklmn"), None);
}

#[test]
fn dot_entries_and_relative_paths() {
    let disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    xv6_fs::mkdir(b"/dir1", &root).unwrap();
    xv6_fs::mkdir(b"/dir1/sub", &root).unwrap();

    let d1 = lookup_entry(disk, 1, b"dir1").unwrap() as u32;
    let sub = lookup_entry(disk, d1, b"sub").unwrap() as u32;

    // 每个目录恰有一个 `.` 指向自身、一个 `..` 指向父目录
    let entries = read_dir_entries(disk, d1);
    let dots: Vec<_> = entries.iter().filter(|(_, n)| name_eq(n, b".")).collect();
    let dotdots: Vec<_> = entries.iter().filter(|(_, n)| name_eq(n, b"..")).collect();
    assert_eq!(dots.len(), 1);
    assert_eq!(dots[0].0 as u32, d1);
    assert_eq!(dotdots.len(), 1);
    assert_eq!(dotdots[0].0, 1);

    // 父目录项 + sub 的 `..`
    assert_eq!(read_dinode(disk, d1).nlink, 2);
    check_nlink_invariant(disk);

    // 相对路径从传入的工作目录出发
    let mut cwd = ICACHE.namei(b"/dir1", &root).unwrap();
    assert_eq!(ICACHE.namei(b"sub", &cwd).unwrap().inum(), sub);
    assert_eq!(ICACHE.namei(b"..", &cwd).unwrap().inum(), 1);
    assert_eq!(ICACHE.namei(b"./sub/..", &cwd).unwrap().inum(), d1);

    // chdir 替换工作目录；对非目录失败且保持原状
    xv6_fs::chdir(b"sub", &mut cwd).unwrap();
    assert_eq!(ICACHE.namei(b".", &cwd).unwrap().inum(), sub);
    let file = File::open(b"plain", OpenFlags::CREATE, &cwd).unwrap();
    drop(file);
    assert_eq!(xv6_fs::chdir(b"plain", &mut cwd), Err(Error::NotADirectory));
    assert_eq!(ICACHE.namei(b".", &cwd).unwrap().inum(), sub);
    xv6_fs::unlink(b"plain", &cwd).unwrap();
    drop(cwd);

    // 删除 `.`/`..` 被拒绝；非空目录不可删
    assert_eq!(
        xv6_fs::unlink(b"/dir1/sub/.", &root),
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        xv6_fs::unlink(b"/dir1/sub/..", &root),
        Err(Error::PermissionDenied)
    );
    assert_eq!(xv6_fs::unlink(b"/dir1", &root), Err(Error::DirectoryNotEmpty));

    // 自底向上删空
    xv6_fs::unlink(b"/dir1/sub", &root).unwrap();
    xv6_fs::unlink(b"/dir1", &root).unwrap();
    assert_eq!(read_dinode(disk, d1).itype, 0);
    assert_eq!(read_dinode(disk, sub).itype, 0);
    check_nlink_invariant(disk);
    check_block_invariant(disk);
}
