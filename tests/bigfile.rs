//! 跨过一级间接块、进入二级间接块的大文件增长与回收

mod common;

use common::*;
use xv6_fs::consts::{BSIZE, NDIRECT, NINDIRECT};
use xv6_fs::{File, OpenFlags, ICACHE};

#[test]
fn doubly_indirect_growth_and_reclaim() {
    let disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    let before_bits = bitmap_count(disk);

    // 写到二级间接区里五个块
    const NBLOCKS: usize = NDIRECT + NINDIRECT + 5;
    let file = File::open(b"/big", OpenFlags::CREATE | OpenFlags::RDWR, &root).unwrap();
    let mut block = [0u8; BSIZE];
    for k in 0..NBLOCKS {
        block.fill(k as u8);
        assert_eq!(file.write(&block).unwrap() as usize, BSIZE);
    }
    drop(file);

    let inum = lookup_entry(disk, 1, b"big").unwrap() as u32;
    let ri = read_dinode(disk, inum);
    assert_eq!(ri.size as usize, NBLOCKS * BSIZE);
    assert!(ri.addrs[NDIRECT] != 0, "singly-indirect not allocated");
    assert!(ri.addrs[NDIRECT + 1] != 0, "doubly-indirect not allocated");

    // 经由二级间接块按偏移读
    let inode = ICACHE.namei(b"/big", &root).unwrap();
    let mut idata = inode.lock();
    let probe = NDIRECT + NINDIRECT + 3;
    let mut byte = [0u8; 1];
    assert_eq!(idata.read(&mut byte, (probe * BSIZE) as u32).unwrap(), 1);
    assert_eq!(byte[0], probe as u8);
    // 直接块与一级间接块各抽查一个
    assert_eq!(idata.read(&mut byte, 0).unwrap(), 1);
    assert_eq!(byte[0], 0);
    let probe = NDIRECT + 7;
    assert_eq!(idata.read(&mut byte, (probe * BSIZE) as u32).unwrap(), 1);
    assert_eq!(byte[0], probe as u8);
    drop(idata);
    drop(inode);

    check_block_invariant(disk);

    // 删除后位图回到创建前的状态
    xv6_fs::unlink(b"/big", &root).unwrap();
    assert_eq!(read_dinode(disk, inum).itype, 0);
    assert_eq!(bitmap_count(disk), before_bits);
    check_block_invariant(disk);
}
