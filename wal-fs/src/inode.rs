//! # 索引节点层
//!
//! 内存中维护一张定长的 inode 表，为多线程并用的 inode 提供同步点。
//! 两级保护：表的自旋锁只管各槽位的 `(dev, inum, refcnt)`；
//! 槽位各自的睡眠锁保护 inode 本体（`valid`、类型、大小、块映射等）。
//!
//! 生命周期：
//! - 磁盘上：`kind` 非零即已分配，[`FileSystem::ialloc`] 分配，
//!   最后一个引用在 `nlink == 0` 时释放（截断内容并把 `kind` 清零）；
//! - 表内：`refcnt` 为零的槽位空闲，[`FileSystem::iget`] 查找或占用槽位，
//!   [`FileSystem::iput`] 归还；
//! - `valid`：本体要等 [`FileSystem::ilock`] 第一次从磁盘装载后才可信。
//!
//! 典型序列：
//!
//! ```text
//! let ip = fs.iget(dev, inum);
//! let mut guard = fs.ilock(&ip);
//! // 检查、修改 guard.xxx ...
//! drop(guard);
//! fs.iput(ip);
//! ```
//!
//! `iget` 与 `ilock` 分开，是为了让打开文件这类长期引用不必一直占着锁，
//! 也避免路径解析时的死锁与竞态；[`Inode`] 句柄不可克隆、必须显式
//! [`FileSystem::iput`]，释放动作因此总能落在调用方的事务里。

use core::cmp::min;
use core::ops::{Deref, DerefMut};

use spin::Mutex;

use crate::fs::{FileSystem, Stat};
use crate::layout::{DiskInode, IndirectBlock, InodeKind, INODES_PER_BLOCK, INODE_SIZE};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::{Error, Result, BLOCK_SIZE, DIRECT_COUNT, INDIRECT_COUNT, MAX_FILE_BLOCKS};

/// 内存 inode 表的槽位数
const INODE_SLOTS: usize = 50;

pub(crate) struct InodeTable {
    meta: Mutex<[InodeMeta; INODE_SLOTS]>,
    body: [SleepLock<InodeBody>; INODE_SLOTS],
}

#[derive(Clone, Copy)]
struct InodeMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

/// inode 本体：磁盘字段的内存副本，由槽位的睡眠锁保护。
/// 修改任何会落盘的字段之后必须在同一事务里 [`InodeGuard::update`]。
pub struct InodeBody {
    valid: bool,
    pub kind: InodeKind,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    addrs: [u32; DIRECT_COUNT + 2],
}

impl InodeBody {
    const fn new() -> Self {
        Self {
            valid: false,
            kind: InodeKind::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; DIRECT_COUNT + 2],
        }
    }
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            meta: Mutex::new(
                [InodeMeta {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                }; INODE_SLOTS],
            ),
            body: core::array::from_fn(|_| SleepLock::new(InodeBody::new())),
        }
    }
}

/// 未锁定的 inode 句柄，`(dev, inum)` 加表内槽位。
///
/// 故意不实现 `Clone` 与 `Drop`：复制引用走 [`FileSystem::idup`]，
/// 归还走 [`FileSystem::iput`]，引用计数的增减全部显式可见。
#[must_use]
pub struct Inode {
    dev: u32,
    inum: u32,
    index: usize,
}

impl Inode {
    #[inline]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    #[inline]
    pub fn inum(&self) -> u32 {
        self.inum
    }
}

impl FileSystem {
    /// 查找 `(dev, inum)` 的表内副本，或占用一个空闲槽位。
    /// 不碰磁盘也不加睡眠锁。
    pub fn iget(&self, dev: u32, inum: u32) -> Inode {
        let mut meta = self.itable.meta.lock();

        let mut free = None;
        for (i, m) in meta.iter_mut().enumerate() {
            if m.refcnt > 0 && m.dev == dev && m.inum == inum {
                m.refcnt += 1;
                return Inode { dev, inum, index: i };
            }
            if free.is_none() && m.refcnt == 0 {
                free = Some(i);
            }
        }

        let Some(index) = free else {
            panic!("iget: no inodes");
        };
        meta[index] = InodeMeta {
            dev,
            inum,
            refcnt: 1,
        };
        Inode { dev, inum, index }
    }

    /// 复制一个引用
    pub fn idup(&self, ip: &Inode) -> Inode {
        self.itable.meta.lock()[ip.index].refcnt += 1;
        Inode {
            dev: ip.dev,
            inum: ip.inum,
            index: ip.index,
        }
    }

    /// 锁住 inode 本体；第一次锁住时从磁盘装载字段。
    pub fn ilock<'a>(&'a self, ip: &Inode) -> InodeGuard<'a> {
        let mut body = self.itable.body[ip.index].lock();

        if !body.valid {
            let bp = self.cache.read(ip.dev, self.sb.iblock(ip.inum));
            let dip: &DiskInode = bp.get(ip.inum as usize % INODES_PER_BLOCK * INODE_SIZE);
            let kind = InodeKind::from_raw(dip.kind);
            body.major = dip.major;
            body.minor = dip.minor;
            body.nlink = dip.nlink;
            body.size = dip.size;
            body.addrs = dip.addrs;
            drop(bp);
            body.valid = true;
            match kind {
                Some(k) if k != InodeKind::Free => body.kind = k,
                // 磁盘上的空闲 inode 不应该被引用到
                _ => panic!("ilock: no type"),
            }
        }

        InodeGuard {
            fs: self,
            dev: ip.dev,
            inum: ip.inum,
            index: ip.index,
            body,
        }
    }

    /// 归还一个引用。若这是最后一个引用且 `nlink == 0`，
    /// 顺手把磁盘 inode 释放掉（截断内容、类型清零），
    /// 因此调用必须发生在事务内。
    pub fn iput(&self, ip: Inode) {
        let mut meta = self.itable.meta.lock();

        if meta[ip.index].refcnt == 1 {
            // refcnt == 1 意味着没有别人持有或正在等这把睡眠锁，
            // 持着表锁获取它不会阻塞
            let body = self.itable.body[ip.index].lock();
            if body.valid && body.nlink == 0 {
                drop(meta);

                let mut guard = InodeGuard {
                    fs: self,
                    dev: ip.dev,
                    inum: ip.inum,
                    index: ip.index,
                    body,
                };
                guard.truncate();
                guard.kind = InodeKind::Free;
                guard.update();
                guard.body.valid = false;
                drop(guard);

                meta = self.itable.meta.lock();
            } else {
                drop(body);
            }
        }

        let m = &mut meta[ip.index];
        if m.refcnt == 0 {
            panic!("iput: refcount underflow");
        }
        m.refcnt -= 1;
    }

    /// 在磁盘上分配一个 `kind` 类型的 inode：线性扫描 inode 区，
    /// 第一个空闲项（类型为 0）据为己有。耗尽返回 `None`（可恢复）。
    pub fn ialloc(&self, dev: u32, kind: InodeKind) -> Option<Inode> {
        for inum in 1..self.sb.ninodes {
            let mut bp = self.cache.read(dev, self.sb.iblock(inum));
            let offset = inum as usize % INODES_PER_BLOCK * INODE_SIZE;
            if bp.get::<DiskInode>(offset).kind == 0 {
                let dip: &mut DiskInode = bp.get_mut(offset);
                *dip = DiskInode::zeroed();
                // 类型落盘即占坑
                dip.kind = kind as i16;
                self.log_write(&bp);
                drop(bp);
                return Some(self.iget(dev, inum));
            }
        }
        log::warn!("ialloc: out of inodes");
        None
    }
}

/// 已锁定的 inode。解引用即本体；析构释放睡眠锁（等价于 iunlock）。
pub struct InodeGuard<'a> {
    pub(crate) fs: &'a FileSystem,
    dev: u32,
    inum: u32,
    index: usize,
    body: SleepLockGuard<'a, InodeBody>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeBody;

    #[inline]
    fn deref(&self) -> &InodeBody {
        &self.body
    }
}

impl DerefMut for InodeGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut InodeBody {
        &mut self.body
    }
}

impl InodeGuard<'_> {
    #[inline]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    #[inline]
    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// 把内存副本写回它所在的 inode 块。任何落盘字段改动之后都要调用，
    /// 和改动同属一个事务。
    pub fn update(&self) {
        let fs = self.fs;
        let mut bp = fs.cache.read(self.dev, fs.sb.iblock(self.inum));
        let dip: &mut DiskInode = bp.get_mut(self.inum as usize % INODES_PER_BLOCK * INODE_SIZE);
        dip.kind = self.body.kind as i16;
        dip.major = self.body.major;
        dip.minor = self.body.minor;
        dip.nlink = self.body.nlink;
        dip.size = self.body.size;
        dip.addrs = self.body.addrs;
        fs.log_write(&bp);
    }

    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev,
            inum: self.inum,
            kind: self.body.kind,
            nlink: self.body.nlink,
            size: self.body.size,
        }
    }

    /// 逻辑块号 -> 磁盘块号，只查不分配；缺块返回 0。
    /// 读路径用它，让未分配的洞表现为文件结尾。
    fn block_lookup(&self, bn: u32) -> u32 {
        let fs = self.fs;
        let mut bn = bn as usize;

        if bn < DIRECT_COUNT {
            return self.body.addrs[bn];
        }
        bn -= DIRECT_COUNT;

        if bn < INDIRECT_COUNT {
            let indirect = self.body.addrs[DIRECT_COUNT];
            if indirect == 0 {
                return 0;
            }
            let bp = fs.cache.read(self.dev, indirect);
            return bp.get::<IndirectBlock>(0)[bn];
        }
        bn -= INDIRECT_COUNT;

        if bn < INDIRECT_COUNT * INDIRECT_COUNT {
            let doubly = self.body.addrs[DIRECT_COUNT + 1];
            if doubly == 0 {
                return 0;
            }
            let indirect = {
                let bp = fs.cache.read(self.dev, doubly);
                bp.get::<IndirectBlock>(0)[bn / INDIRECT_COUNT]
            };
            if indirect == 0 {
                return 0;
            }
            let bp = fs.cache.read(self.dev, indirect);
            return bp.get::<IndirectBlock>(0)[bn % INDIRECT_COUNT];
        }

        panic!("bmap: out of range");
    }

    /// 逻辑块号 -> 磁盘块号，按需分配缺失的数据块和索引块。
    /// 任何一层的 `balloc` 失败都以 0 上抛，调用方就此止笔。
    fn block_map(&mut self, bn: u32) -> u32 {
        let fs = self.fs;
        let mut bn = bn as usize;

        if bn < DIRECT_COUNT {
            let mut addr = self.body.addrs[bn];
            if addr == 0 {
                addr = fs.balloc();
                if addr == 0 {
                    return 0;
                }
                self.body.addrs[bn] = addr;
            }
            return addr;
        }
        bn -= DIRECT_COUNT;

        if bn < INDIRECT_COUNT {
            // 一级间接块本身也可能要现场分配
            let mut indirect = self.body.addrs[DIRECT_COUNT];
            if indirect == 0 {
                indirect = fs.balloc();
                if indirect == 0 {
                    return 0;
                }
                self.body.addrs[DIRECT_COUNT] = indirect;
            }
            let mut bp = fs.cache.read(self.dev, indirect);
            let mut addr = bp.get::<IndirectBlock>(0)[bn];
            if addr == 0 {
                addr = fs.balloc();
                if addr != 0 {
                    bp.get_mut::<IndirectBlock>(0)[bn] = addr;
                    fs.log_write(&bp);
                }
            }
            return addr;
        }
        bn -= INDIRECT_COUNT;

        if bn < INDIRECT_COUNT * INDIRECT_COUNT {
            let mut doubly = self.body.addrs[DIRECT_COUNT + 1];
            if doubly == 0 {
                doubly = fs.balloc();
                if doubly == 0 {
                    return 0;
                }
                self.body.addrs[DIRECT_COUNT + 1] = doubly;
            }

            let mut bp = fs.cache.read(self.dev, doubly);
            let slot = bn / INDIRECT_COUNT;
            let mut indirect = bp.get::<IndirectBlock>(0)[slot];
            if indirect == 0 {
                indirect = fs.balloc();
                if indirect == 0 {
                    return 0;
                }
                bp.get_mut::<IndirectBlock>(0)[slot] = indirect;
                fs.log_write(&bp);
            }
            drop(bp);

            let mut bp = fs.cache.read(self.dev, indirect);
            let slot = bn % INDIRECT_COUNT;
            let mut addr = bp.get::<IndirectBlock>(0)[slot];
            if addr == 0 {
                addr = fs.balloc();
                if addr != 0 {
                    bp.get_mut::<IndirectBlock>(0)[slot] = addr;
                    fs.log_write(&bp);
                }
            }
            return addr;
        }

        panic!("bmap: out of range");
    }

    /// 丢弃全部内容：释放直接块、两级间接树，大小归零并写回。
    /// 必须在事务内调用。
    pub fn truncate(&mut self) {
        let fs = self.fs;

        for i in 0..DIRECT_COUNT {
            if self.body.addrs[i] != 0 {
                fs.bfree(self.body.addrs[i]);
                self.body.addrs[i] = 0;
            }
        }

        if self.body.addrs[DIRECT_COUNT] != 0 {
            {
                let bp = fs.cache.read(self.dev, self.body.addrs[DIRECT_COUNT]);
                for &addr in bp.get::<IndirectBlock>(0).iter() {
                    if addr != 0 {
                        fs.bfree(addr);
                    }
                }
            }
            fs.bfree(self.body.addrs[DIRECT_COUNT]);
            self.body.addrs[DIRECT_COUNT] = 0;
        }

        if self.body.addrs[DIRECT_COUNT + 1] != 0 {
            {
                let bp = fs.cache.read(self.dev, self.body.addrs[DIRECT_COUNT + 1]);
                for slot in 0..INDIRECT_COUNT {
                    let indirect = bp.get::<IndirectBlock>(0)[slot];
                    if indirect == 0 {
                        continue;
                    }
                    {
                        let bp2 = fs.cache.read(self.dev, indirect);
                        for &addr in bp2.get::<IndirectBlock>(0).iter() {
                            if addr != 0 {
                                fs.bfree(addr);
                            }
                        }
                    }
                    // 二级索引块自身最后释放
                    fs.bfree(indirect);
                }
            }
            fs.bfree(self.body.addrs[DIRECT_COUNT + 1]);
            self.body.addrs[DIRECT_COUNT + 1] = 0;
        }

        self.body.size = 0;
        self.update();
    }

    /// 从 `off` 起读入 `dst`，返回实际读到的字节数。
    /// 读取范围被钳到文件大小；遇到未分配的块视同文件结尾。
    pub fn read(&self, dst: &mut [u8], off: u32) -> usize {
        let size = self.body.size;
        if off > size {
            return 0;
        }
        let n = min(dst.len() as u32, size - off);

        let mut total: u32 = 0;
        while total < n {
            let pos = off + total;
            let addr = self.block_lookup(pos / BLOCK_SIZE as u32);
            if addr == 0 {
                break;
            }
            let bp = self.fs.cache.read(self.dev, addr);
            let inner = pos as usize % BLOCK_SIZE;
            let m = min(n - total, (BLOCK_SIZE - inner) as u32) as usize;
            dst[total as usize..total as usize + m].copy_from_slice(&bp[inner..inner + m]);
            total += m as u32;
        }
        total as usize
    }

    /// 从 `off` 起写入 `src`，返回实际写入的字节数（空间耗尽时可能不足）。
    /// 拒绝越过文件末尾的起点与超过容量上限的终点。
    /// 必须在事务内调用。
    pub fn write(&mut self, src: &[u8], off: u32) -> Result<usize> {
        let n = src.len() as u32;
        if off > self.body.size || off.checked_add(n).is_none() {
            return Err(Error::BadOffset);
        }
        if (off + n) as usize > MAX_FILE_BLOCKS * BLOCK_SIZE {
            return Err(Error::FileTooLarge);
        }

        let mut total: u32 = 0;
        while total < n {
            let pos = off + total;
            let addr = self.block_map(pos / BLOCK_SIZE as u32);
            if addr == 0 {
                break;
            }
            let mut bp = self.fs.cache.read(self.dev, addr);
            let inner = pos as usize % BLOCK_SIZE;
            let m = min(n - total, (BLOCK_SIZE - inner) as u32) as usize;
            bp[inner..inner + m].copy_from_slice(&src[total as usize..total as usize + m]);
            self.fs.log_write(&bp);
            total += m as u32;
        }

        if off + total > self.body.size {
            self.body.size = off + total;
        }
        // 即便 size 没变，block_map 也可能往 addrs 里添了新块
        self.update();
        Ok(total as usize)
    }
}
