use std::mem;

use wal_fs::layout::{DirEntry, DiskInode, LogHeader, SuperBlock, INODES_PER_BLOCK};
use wal_fs::{BLOCK_SIZE, DIRECT_COUNT, INDIRECT_COUNT, LOG_CAP, MAX_FILE_BLOCKS};

#[test]
fn on_disk_sizes() {
    assert_eq!(64, mem::size_of::<DiskInode>());
    assert_eq!(16, mem::size_of::<DirEntry>());
    assert_eq!(32, mem::size_of::<SuperBlock>());
    assert_eq!(4 + 4 * LOG_CAP, mem::size_of::<LogHeader>());

    // inode 必须整除块大小
    assert_eq!(0, BLOCK_SIZE % mem::size_of::<DiskInode>());
    assert_eq!(16, INODES_PER_BLOCK);
}

#[test]
fn file_capacity() {
    assert_eq!(11, DIRECT_COUNT);
    assert_eq!(256, INDIRECT_COUNT);
    assert_eq!(11 + 256 + 256 * 256, MAX_FILE_BLOCKS);
}
