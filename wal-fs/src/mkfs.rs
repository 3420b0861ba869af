//! 离线格式化：算好各区的边界，写超级块、空日志、inode 区、
//! 位图和带 `.`/`..` 的根目录。
//!
//! 直接写设备，不经过缓存与日志：此时还没有并发，也没有要保护的
//! 旧数据。

use alloc::sync::Arc;

use crate::block_dev::BlockDevice;
use crate::layout::{DirEntry, DiskInode, InodeKind, SuperBlock, INODES_PER_BLOCK, INODE_SIZE};
use crate::{BLOCK_BITS, BLOCK_SIZE, LOG_CAP, ROOT_INODE};

/// 把 `device` 格式化成一个空文件系统。
/// `total_blocks` 是镜像总块数，`ninodes` 是 inode 总数。
pub fn format(device: &Arc<dyn BlockDevice>, total_blocks: u32, ninodes: u32) {
    let nlog = LOG_CAP as u32;
    let ninodeblocks = ninodes.div_ceil(INODES_PER_BLOCK as u32);
    let nbitmap = total_blocks.div_ceil(BLOCK_BITS as u32);

    let logstart = 2;
    let inodestart = logstart + nlog;
    let bmapstart = inodestart + ninodeblocks;
    // 引导块 + 超级块 + 日志 + inode 区 + 位图
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(
        nmeta + 1 < total_blocks,
        "mkfs: image too small for metadata"
    );

    let zero = [0u8; BLOCK_SIZE];
    for bno in 0..total_blocks {
        device.write_block(bno as usize, &zero);
    }

    // 超级块
    let sb = SuperBlock::new(
        total_blocks,
        total_blocks - nmeta,
        ninodes,
        nlog,
        logstart,
        inodestart,
        bmapstart,
    );
    let mut block = [0u8; BLOCK_SIZE];
    block[..sb.as_bytes().len()].copy_from_slice(sb.as_bytes());
    device.write_block(1, &block);

    // 根目录 inode：数据是 `.` 与 `..` 两条目录项，占第一个数据块
    let root_data = nmeta;
    let mut root = DiskInode::zeroed();
    root.kind = InodeKind::Directory as i16;
    root.nlink = 1;
    root.size = (2 * DirEntry::SIZE) as u32;
    root.addrs[0] = root_data;

    let mut block = [0u8; BLOCK_SIZE];
    let offset = ROOT_INODE as usize % INODES_PER_BLOCK * INODE_SIZE;
    block[offset..offset + INODE_SIZE].copy_from_slice(root.as_bytes());
    device.write_block(sb.iblock(ROOT_INODE) as usize, &block);

    let mut block = [0u8; BLOCK_SIZE];
    let dot = DirEntry::new(b".", ROOT_INODE as u16);
    let dotdot = DirEntry::new(b"..", ROOT_INODE as u16);
    block[..DirEntry::SIZE].copy_from_slice(dot.as_bytes());
    block[DirEntry::SIZE..2 * DirEntry::SIZE].copy_from_slice(dotdot.as_bytes());
    device.write_block(root_data as usize, &block);

    // 位图：元数据区连同根目录的数据块都标成已分配
    let used = nmeta + 1;
    for k in 0..nbitmap {
        let mut block = [0u8; BLOCK_SIZE];
        let base = k * BLOCK_BITS as u32;
        let mut bi = 0;
        while bi < BLOCK_BITS as u32 && base + bi < used {
            block[bi as usize / 8] |= 1 << (bi % 8);
            bi += 1;
        }
        device.write_block((bmapstart + k) as usize, &block);
    }

    log::info!(
        "mkfs: {} blocks total, {} meta (log {}, inode {}, bitmap {}), {} data",
        total_blocks,
        nmeta,
        nlog,
        ninodeblocks,
        nbitmap,
        total_blocks - nmeta
    );
}
