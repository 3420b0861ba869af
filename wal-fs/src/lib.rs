#![no_std]

extern crate alloc;

/* 整体架构，自下而上 */

// 磁盘块设备接口层：读写块设备的接口
mod block_dev;
pub use block_dev::BlockDevice;

// 磁盘数据结构层：表示磁盘上数据结构的布局
pub mod layout;
pub use layout::{DirEntry, DiskInode, InodeKind, SuperBlock};

// 睡眠锁：保护可能跨磁盘 I/O 持有的长临界区
mod sleeplock;

// 块缓存层：按块号散列分桶、全局 LRU 淘汰
mod block_cache;
pub use block_cache::Buf;

// 重做日志层：组提交，保证多块更新的崩溃原子性
mod wal;

// 数据块位图分配器
mod bitmap;

// 索引节点层：inode 表、两级加锁、块映射
mod inode;
pub use inode::{Inode, InodeGuard};

// 目录层：定长目录项的查找与链接
mod dir;

// 路径解析层：逐元素行走，含父目录变体
mod path;

// 文件系统对象与复合操作（create/link/unlink/open/...）
mod fs;
pub use fs::{FileSystem, OpenFlag, Stat};

// 打开文件对象：偏移量 + 读写权限，分批事务写入
mod file;
pub use file::File;

// 离线格式化
mod mkfs;
pub use mkfs::format;

mod error;
pub use error::{Error, Result};

/// 块大小（字节）
pub const BLOCK_SIZE: usize = 1024;
/// 每个位图块承载的分配位数量
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// 超级块魔数
pub const MAGIC: u32 = 0x1020_3040;

/// 单设备系统里唯一的设备号
pub const ROOT_DEV: u32 = 1;
/// 根目录的 inode 编号
pub const ROOT_INODE: u32 = 1;

/// inode 内直接索引的块数
pub const DIRECT_COUNT: usize = 11;
/// 一个间接索引块可容纳的块号数量
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 4;
/// 单个文件的块数上限：直接 + 一级间接 + 二级间接
pub const MAX_FILE_BLOCKS: usize = DIRECT_COUNT + INDIRECT_COUNT + INDIRECT_COUNT * INDIRECT_COUNT;

/// 目录项内文件名的字节数（不足时 NUL 填充，存满 14 字节时无终止符）
pub const NAME_LEN: usize = 14;
/// 路径串的长度上限，同时也是符号链接目标的长度上限
pub const PATH_MAX: usize = 128;

/// 日志区可记录的块数（含头块在内共 LOG_CAP 块）
pub const LOG_CAP: usize = 30;
/// 单个文件系统操作最多写入日志的块数，用于 begin_op 的空间预约
pub const MAX_OP_BLOCKS: usize = 10;

type DataBlock = [u8; BLOCK_SIZE];
