//! 字节粒度读写：跨块偏移、边界检查与并发写

mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use xv6_fs::consts::BSIZE;
use xv6_fs::{Error, File, OpenFlags, ICACHE, LOG};

#[test]
fn round_trip_across_block_boundaries() {
    let _disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    // 以 700 字节为步长写满 3500 字节，跨过三个块边界
    let file = File::open(b"/rt", OpenFlags::CREATE | OpenFlags::RDWR, &root).unwrap();
    let mut expected = Vec::new();
    for chunk in 0..5u8 {
        let data = vec![chunk ^ 0x6b; 700];
        assert_eq!(file.write(&data).unwrap(), 700);
        expected.extend_from_slice(&data);
    }
    drop(file);

    let file = File::open(b"/rt", OpenFlags::RDONLY, &root).unwrap();
    let mut buf = vec![0u8; 4096];
    assert_eq!(file.read(&mut buf).unwrap(), 3500);
    assert_eq!(&buf[..3500], &expected[..]);
    drop(file);

    // 在块边界两侧覆写，再读回核对
    let inode = ICACHE.namei(b"/rt", &root).unwrap();
    let mut idata = inode.lock();
    let patch = [0xEEu8; 200];
    LOG.begin_op();
    assert_eq!(idata.write(&patch, (BSIZE - 100) as u32).unwrap(), 200);
    LOG.end_op();
    expected[BSIZE - 100..BSIZE + 100].copy_from_slice(&patch);

    let mut back = vec![0u8; 3500];
    assert_eq!(idata.read(&mut back, 0).unwrap(), 3500);
    assert_eq!(&back, &expected);
    drop(idata);
    drop(inode);

    xv6_fs::unlink(b"/rt", &root).unwrap();
}

#[test]
fn write_and_read_bounds() {
    let _disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    let file = File::open(b"/bounds", OpenFlags::CREATE | OpenFlags::RDWR, &root).unwrap();
    file.write(b"abc").unwrap();
    drop(file);

    let inode = ICACHE.namei(b"/bounds", &root).unwrap();
    let mut idata = inode.lock();

    // 越过文件尾的写制造空洞，拒绝
    LOG.begin_op();
    assert_eq!(idata.write(b"x", 4), Err(Error::InvalidArg));
    // 恰在文件尾追加允许
    assert_eq!(idata.write(b"x", 3).unwrap(), 1);
    LOG.end_op();

    // 越过文件尾的读与溢出偏移
    let mut buf = [0u8; 8];
    assert_eq!(idata.read(&mut buf, 5), Err(Error::InvalidArg));
    assert_eq!(idata.read(&mut buf, u32::MAX), Err(Error::InvalidArg));
    // 文件尾处读出 0 字节
    assert_eq!(idata.read(&mut buf, 4).unwrap(), 0);
    drop(idata);
    drop(inode);

    // 只读文件拒写，只写文件拒读
    let file = File::open(b"/bounds", OpenFlags::RDONLY, &root).unwrap();
    assert_eq!(file.write(b"z"), Err(Error::PermissionDenied));
    drop(file);
    let file = File::open(b"/bounds", OpenFlags::WRONLY, &root).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(file.read(&mut buf), Err(Error::PermissionDenied));
    drop(file);

    xv6_fs::unlink(b"/bounds", &root).unwrap();
}

#[test]
fn concurrent_appenders_serialize_on_inode_lock() {
    let _disk = setup();
    let _guard = serial();
    let root = ICACHE.root();

    let file = File::open(b"/shared", OpenFlags::CREATE | OpenFlags::RDWR, &root).unwrap();

    const WRITERS: usize = 4;
    const ROUNDS: usize = 32;
    const CHUNK: usize = 512;

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let file = Arc::clone(&file);
        handles.push(thread::spawn(move || {
            let data = vec![b'A' + w as u8; CHUNK];
            for _ in 0..ROUNDS {
                assert_eq!(file.write(&data).unwrap() as usize, CHUNK);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // 总长正确，且每个 512 字节片都完整来自同一个写者
    assert_eq!(file.stat().size as usize, WRITERS * ROUNDS * CHUNK);
    drop(file);

    let file = File::open(b"/shared", OpenFlags::RDONLY, &root).unwrap();
    let mut chunk = vec![0u8; CHUNK];
    let mut seen = [0usize; WRITERS];
    for _ in 0..WRITERS * ROUNDS {
        assert_eq!(file.read(&mut chunk).unwrap() as usize, CHUNK);
        let tag = chunk[0];
        assert!(chunk.iter().all(|&b| b == tag), "torn write detected");
        seen[(tag - b'A') as usize] += 1;
    }
    for count in seen {
        assert_eq!(count, ROUNDS);
    }
    drop(file);

    xv6_fs::unlink(b"/shared", &root).unwrap();
}
