use std::sync::Arc;
use std::thread;

use enumflags2::BitFlags;
use wal_fs::{
    format, BlockDevice, Error, FileSystem, InodeKind, OpenFlag, BLOCK_BITS, BLOCK_SIZE,
};

use crate::{CrashDisk, MemDisk, RecordingDisk};

fn mkfs_image(blocks: usize, inodes: u32) -> Arc<MemDisk> {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = MemDisk::new(blocks);
    let dev: Arc<dyn BlockDevice> = disk.clone();
    format(&dev, blocks as u32, inodes);
    disk
}

fn rdwr() -> BitFlags<OpenFlag> {
    OpenFlag::RDWR.into()
}

fn create_rdwr() -> BitFlags<OpenFlag> {
    OpenFlag::CREATE | OpenFlag::RDWR
}

/// 从镜像的 1 号块直接解析超级块字段
struct SbView {
    size: u32,
    nlog: u32,
    logstart: u32,
    bmapstart: u32,
}

fn read_sb(disk: &MemDisk) -> SbView {
    let image = disk.snapshot();
    let at = |off: usize| {
        u32::from_le_bytes(
            image[BLOCK_SIZE + off..BLOCK_SIZE + off + 4]
                .try_into()
                .unwrap(),
        )
    };
    assert_eq!(at(0), 0x1020_3040, "superblock magic");
    SbView {
        size: at(4),
        nlog: at(16),
        logstart: at(20),
        bmapstart: at(28),
    }
}

/// 位图里已分配位的总数
fn allocated_blocks(disk: &MemDisk, sb: &SbView) -> u32 {
    let image = disk.snapshot();
    let mut count = 0;
    for bno in 0..sb.size as usize {
        let block = sb.bmapstart as usize + bno / BLOCK_BITS;
        let byte = image[block * BLOCK_SIZE + bno % BLOCK_BITS / 8];
        if byte & (1 << (bno % 8)) != 0 {
            count += 1;
        }
    }
    count
}

#[test]
fn create_write_read_back() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    let mut f = fs.open(&root, b"/a", create_rdwr()).unwrap();
    assert_eq!(f.write(b"hello").unwrap(), 5);
    let st = f.stat();
    assert_eq!(st.size, 5);
    assert_eq!(st.nlink, 1);
    assert_eq!(st.kind, InodeKind::File);
    drop(f);

    let mut f = fs.open(&root, b"/a", OpenFlag::read_only()).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(f.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    drop(f);

    fs.release(root);
}

#[test]
fn hard_link_unlink() {
    let disk = mkfs_image(1024, 200);
    let sb = read_sb(&disk);
    let fs = FileSystem::mount(disk.clone()).unwrap();
    let root = fs.root();
    let baseline = allocated_blocks(&disk, &sb);

    let mut f = fs.open(&root, b"/x", create_rdwr()).unwrap();
    assert_eq!(f.write(&[7u8; 100]).unwrap(), 100);
    drop(f);

    fs.link(&root, b"/x", b"/y").unwrap();
    let fx = fs.open(&root, b"/x", OpenFlag::read_only()).unwrap();
    let fy = fs.open(&root, b"/y", OpenFlag::read_only()).unwrap();
    let stx = fx.stat();
    let sty = fy.stat();
    assert_eq!(stx.inum, sty.inum, "两个名字同一个 inode");
    assert_eq!(stx.nlink, 2);
    drop(fx);
    drop(fy);

    fs.unlink(&root, b"/x").unwrap();
    assert_eq!(
        fs.open(&root, b"/x", OpenFlag::read_only()).err(),
        Some(Error::NotFound)
    );
    let fy = fs.open(&root, b"/y", OpenFlag::read_only()).unwrap();
    assert_eq!(fy.stat().nlink, 1);
    drop(fy);

    fs.unlink(&root, b"/y").unwrap();
    assert_eq!(
        fs.open(&root, b"/y", OpenFlag::read_only()).err(),
        Some(Error::NotFound)
    );
    // inode 已释放，数据块在位图里全部归零
    assert_eq!(allocated_blocks(&disk, &sb), baseline);

    fs.release(root);
}

#[test]
fn unlink_refuses_nonempty_dir() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    fs.mkdir(&root, b"/d").unwrap();
    fs.unlink(&root, b"/d").unwrap();

    fs.mkdir(&root, b"/d").unwrap();
    let ip = fs.create(&root, b"/d/f", InodeKind::File, 0, 0).unwrap();
    fs.release(ip);
    assert_eq!(fs.unlink(&root, b"/d"), Err(Error::DirectoryNotEmpty));

    fs.unlink(&root, b"/d/f").unwrap();
    fs.unlink(&root, b"/d").unwrap();

    assert_eq!(fs.unlink(&root, b"/d/."), Err(Error::NotFound));
    fs.release(root);
}

#[test]
fn unlink_refuses_dot_entries() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    fs.mkdir(&root, b"/d").unwrap();
    assert_eq!(fs.unlink(&root, b"/d/."), Err(Error::InvalidPath));
    assert_eq!(fs.unlink(&root, b"/d/.."), Err(Error::InvalidPath));
    fs.release(root);
}

#[test]
fn crash_between_commit_and_install() {
    let disk = mkfs_image(4096, 200);
    let sb = read_sb(&disk);
    let data: Vec<u8> = (0..20 * 1024).map(|i| (i % 251) as u8).collect();

    let crash = CrashDisk::new(disk.clone(), sb.logstart as usize);
    let before;
    {
        let fs = FileSystem::mount(crash.clone()).unwrap();
        let root = fs.root();
        let ip = fs.create(&root, b"/big", InodeKind::File, 0, 0).unwrap();
        before = allocated_blocks(&disk, &sb);

        // 20 KiB 会越过间接块阈值；在提交点（日志头落盘）之后、
        // 任何家位置写入之前"断电"
        crash.arm();
        fs.begin_op();
        let mut guard = fs.ilock(&ip);
        assert_eq!(guard.write(&data, 0).unwrap(), data.len());
        drop(guard);
        fs.end_op();
        assert!(crash.is_dead(), "提交点之后设备应已断电");

        fs.release(ip);
        fs.release(root);
    }

    // 重启挂载触发日志重放
    let fs = FileSystem::mount(disk.clone()).unwrap();
    let root = fs.root();
    let mut f = fs.open(&root, b"/big", OpenFlag::read_only()).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(f.read(&mut back).unwrap(), data.len());
    assert_eq!(back, data, "恢复后读到的正是日志里那 20 KiB");
    drop(f);

    // 20 个数据块 + 1 个间接块，全部反映在位图里
    assert_eq!(allocated_blocks(&disk, &sb), before + 21);
    fs.release(root);
}

#[test]
fn symlink_loop_bounded() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    fs.symlink(&root, b"/a", b"/b").unwrap();
    fs.symlink(&root, b"/b", b"/a").unwrap();
    assert_eq!(
        fs.open(&root, b"/a", OpenFlag::read_only()).err(),
        Some(Error::TooManyLinks)
    );

    // NOFOLLOW 打开链接本身
    let f = fs
        .open(&root, b"/a", BitFlags::from(OpenFlag::NOFOLLOW))
        .unwrap();
    assert_eq!(f.stat().kind, InodeKind::Symlink);
    drop(f);

    fs.release(root);
}

#[test]
fn symlink_chain_resolves() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    let mut f = fs.open(&root, b"/target", create_rdwr()).unwrap();
    f.write(b"payload").unwrap();
    drop(f);

    fs.symlink(&root, b"/target", b"/l1").unwrap();
    fs.symlink(&root, b"/l1", b"/l2").unwrap();
    fs.symlink(&root, b"/l2", b"/l3").unwrap();

    let mut f = fs.open(&root, b"/l3", OpenFlag::read_only()).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(f.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"payload");
    drop(f);

    fs.release(root);
}

#[test]
fn log_absorbs_repeated_writes() {
    let disk = mkfs_image(1024, 200);
    let sb = read_sb(&disk);
    let rec = RecordingDisk::new(disk);
    let fs = FileSystem::mount(rec.clone()).unwrap();
    let root = fs.root();

    // 先写一次，让数据块和位图都就位
    let mut f = fs.open(&root, b"/n", create_rdwr()).unwrap();
    f.write(b"0").unwrap();
    drop(f);
    rec.take_writes();

    // 同一事务里改同一个数据块 5 次
    fs.begin_op();
    let ip = fs.namei(&root, b"/n").unwrap();
    let mut guard = fs.ilock(&ip);
    for round in 0..5u8 {
        guard.write(&[b'A' + round], 0).unwrap();
    }
    drop(guard);
    fs.end_op();

    let writes = rec.take_writes();
    let head = sb.logstart as usize;

    // 日志头恰好落盘两次：提交点一次，抹除一次
    let heads: Vec<_> = writes.iter().filter(|(b, _)| *b == head).collect();
    assert_eq!(heads.len(), 2);
    // 提交的头里只记了 2 个块：数据块一次（吸收）+ inode 块一次
    let n = u32::from_le_bytes(heads[0].1[..4].try_into().unwrap());
    assert_eq!(n, 2);
    assert_eq!(u32::from_le_bytes(heads[1].1[..4].try_into().unwrap()), 0);
    // 日志数据区也只写了这 2 块
    let log_data = writes
        .iter()
        .filter(|(b, _)| *b > head && *b < head + sb.nlog as usize)
        .count();
    assert_eq!(log_data, 2);

    fs.release(ip);

    // 家位置的内容等于最后一次写入
    let mut f = fs.open(&root, b"/n", OpenFlag::read_only()).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(f.read(&mut buf).unwrap(), 1);
    assert_eq!(&buf, b"E");
    drop(f);

    fs.release(root);
}

#[test]
fn double_indirect_write_and_truncate() {
    let disk = mkfs_image(2048, 200);
    let sb = read_sb(&disk);
    let fs = FileSystem::mount(disk.clone()).unwrap();
    let root = fs.root();
    let baseline = allocated_blocks(&disk, &sb);

    // 300 块，深入二级间接区（11 + 256 之外还有 33 块）
    let data: Vec<u8> = (0..300 * BLOCK_SIZE).map(|i| (i / BLOCK_SIZE) as u8).collect();
    let mut f = fs.open(&root, b"/big", create_rdwr()).unwrap();
    assert_eq!(f.write(&data).unwrap(), data.len());
    drop(f);

    let mut f = fs.open(&root, b"/big", OpenFlag::read_only()).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(f.read(&mut back).unwrap(), data.len());
    assert_eq!(back, data);
    drop(f);

    // 300 数据块 + 一级间接 1 + 二级间接 1 + 二级下属的一级块 1
    assert_eq!(allocated_blocks(&disk, &sb), baseline + 303);

    // 释放后位图逐位归零
    fs.unlink(&root, b"/big").unwrap();
    assert_eq!(allocated_blocks(&disk, &sb), baseline);

    fs.release(root);
}

#[test]
fn chdir_and_relative_paths() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    fs.mkdir(&root, b"/sub").unwrap();
    let ip = fs.create(&root, b"/sub/f", InodeKind::File, 0, 0).unwrap();
    fs.release(ip);

    let mut cwd = fs.root();
    fs.chdir(&mut cwd, b"/sub").unwrap();

    let f = fs.open(&cwd, b"f", OpenFlag::read_only()).unwrap();
    assert_eq!(f.stat().kind, InodeKind::File);
    drop(f);

    assert_eq!(fs.chdir(&mut cwd, b"f"), Err(Error::NotADirectory));
    fs.chdir(&mut cwd, b"..").unwrap();
    let f = fs.open(&cwd, b"sub/f", OpenFlag::read_only()).unwrap();
    assert_eq!(f.stat().kind, InodeKind::File);
    drop(f);

    fs.release(cwd);
    fs.release(root);
}

#[test]
fn directories_open_read_only() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    assert_eq!(fs.open(&root, b"/", rdwr()).err(), Some(Error::IsADirectory));
    let f = fs.open(&root, b"/", OpenFlag::read_only()).unwrap();
    assert_eq!(f.stat().kind, InodeKind::Directory);
    drop(f);

    fs.release(root);
}

#[test]
fn over_long_names_truncate_consistently() {
    let disk = mkfs_image(1024, 200);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    // 路径元素在 14 字节处截断，两个同前缀的长名字指向同一个文件
    let f = fs
        .open(&root, b"/averyveryverylongname", create_rdwr())
        .unwrap();
    let st1 = f.stat();
    drop(f);
    let f = fs
        .open(&root, b"/averyveryverylong_other", OpenFlag::read_only())
        .unwrap();
    assert_eq!(f.stat().inum, st1.inum);
    drop(f);

    fs.release(root);
}

#[test]
fn concurrent_ops_smoke() {
    let disk = mkfs_image(4096, 200);
    let sb = read_sb(&disk);
    let fs = FileSystem::mount(disk.clone()).unwrap();
    let baseline = allocated_blocks(&disk, &sb);

    let mut handles = Vec::new();
    for t in 0..4u8 {
        let fs = fs.clone();
        handles.push(thread::spawn(move || {
            let root = fs.root();
            for i in 0..8u8 {
                let path = format!("/t{t}_{i}");
                let payload = vec![t * 16 + i; 1500];

                let mut f = fs.open(&root, path.as_bytes(), create_rdwr()).unwrap();
                assert_eq!(f.write(&payload).unwrap(), payload.len());
                drop(f);

                let mut f = fs
                    .open(&root, path.as_bytes(), OpenFlag::read_only())
                    .unwrap();
                let mut back = vec![0u8; payload.len()];
                assert_eq!(f.read(&mut back).unwrap(), payload.len());
                assert_eq!(back, payload);
                drop(f);

                fs.unlink(&root, path.as_bytes()).unwrap();
            }
            fs.release(root);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // 全部建了又删，数据块一个不剩
    assert_eq!(allocated_blocks(&disk, &sb), baseline);
}

#[test]
fn mount_rejects_bad_magic() {
    let disk = MemDisk::new(64);
    assert_eq!(FileSystem::mount(disk).err(), Some(Error::BadMagic));
}

#[test]
fn out_of_inodes_is_recoverable() {
    // 只有 16 个 inode（1 块），root 占掉 1 号
    let disk = mkfs_image(1024, 16);
    let fs = FileSystem::mount(disk).unwrap();
    let root = fs.root();

    let mut kept = Vec::new();
    let mut hit_limit = false;
    for i in 0..16u8 {
        let path = format!("/f{i}");
        match fs.create(&root, path.as_bytes(), InodeKind::File, 0, 0) {
            Ok(ip) => kept.push(ip),
            Err(e) => {
                assert_eq!(e, Error::NoInodes);
                hit_limit = true;
                break;
            }
        }
    }
    assert!(hit_limit, "inode 区迟早耗尽");

    // 腾出一个名额之后又能创建
    fs.unlink(&root, b"/f0").unwrap();
    for ip in kept {
        fs.release(ip);
    }
    let ip = fs.create(&root, b"/again", InodeKind::File, 0, 0).unwrap();
    fs.release(ip);
    fs.release(root);
}
