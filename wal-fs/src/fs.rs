//! 文件系统对象与复合操作。
//!
//! [`FileSystem`] 把超级块、块缓存、日志和 inode 表聚合成一个显式
//! 初始化的整体：[`FileSystem::mount`] 读超级块、做崩溃恢复后交出
//! `Arc`，析构即卸载（提交过的数据都已同步落盘）。
//!
//! 复合操作（create/link/unlink/open/mkdir/mknod/symlink/chdir）各自
//! 用一对 `begin_op`/`end_op` 包住全部磁盘改动，对崩溃原子、对并发
//! 操作靠 inode 与缓冲区锁互斥；跨出括号时不得持有任何睡眠锁。
//! 锁序固定：日志状态锁、inode 表锁、桶锁（升序）、inode 睡眠锁
//! （父目录先于子项）、缓冲区睡眠锁。

use alloc::sync::Arc;

use enumflags2::{bitflags, BitFlags};

use crate::block_cache::{BlockCache, Buf};
use crate::block_dev::BlockDevice;
use crate::file::File;
use crate::inode::{Inode, InodeGuard, InodeTable};
use crate::layout::{InodeKind, SuperBlock};
use crate::path::pad_name;
use crate::wal::Log;
use crate::{Error, Result, NAME_LEN, PATH_MAX, ROOT_DEV, ROOT_INODE};

/// 符号链接解析的跳数上限，再多视为成环
const SYMLINK_MAX_HOPS: usize = 10;

pub struct FileSystem {
    pub(crate) dev: u32,
    pub(crate) sb: SuperBlock,
    pub(crate) cache: BlockCache,
    pub(crate) log: Log,
    pub(crate) itable: InodeTable,
}

/// inode 元数据快照，`stati` 的返回面
#[derive(Debug, Clone)]
pub struct Stat {
    pub dev: u32,
    pub inum: u32,
    pub kind: InodeKind,
    pub nlink: i16,
    pub size: u32,
}

#[rustfmt::skip]
#[allow(clippy::upper_case_acronyms)]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// 只写
    WRONLY   = 0x001,
    /// 读写兼备
    RDWR     = 0x002,
    /// 不存在则创建
    CREATE   = 0x200,
    /// 打开普通文件时先清空
    TRUNC    = 0x400,
    /// 打开符号链接自身，不追踪目标
    NOFOLLOW = 0x800,
}

impl OpenFlag {
    // enumflags2拒绝值为0的标志
    /// 只读
    pub const RDONLY: u32 = 0;

    #[inline]
    pub fn read_only() -> BitFlags<OpenFlag> {
        BitFlags::from_bits_truncate(Self::RDONLY)
    }
}

impl FileSystem {
    /// 挂载：校验超级块，重放残留日志，返回可跨线程共享的文件系统。
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let cache = BlockCache::new(device);
        let sb = cache.read(ROOT_DEV, 1).get::<SuperBlock>(0).clone();
        if !sb.is_valid() {
            return Err(Error::BadMagic);
        }

        let log = Log::new(ROOT_DEV, sb.logstart, sb.nlog);
        let fs = Self {
            dev: ROOT_DEV,
            sb,
            cache,
            log,
            itable: InodeTable::new(),
        };
        fs.log.recover(&fs.cache);
        log::info!(
            "wal-fs: mounted, {} blocks, {} inodes",
            fs.sb.size,
            fs.sb.ninodes
        );
        Ok(Arc::new(fs))
    }

    /// 取得根目录的引用
    pub fn root(&self) -> Inode {
        self.iget(self.dev, ROOT_INODE)
    }

    /// 开启一个文件系统操作，成为当前组提交事务的一员
    pub fn begin_op(&self) {
        self.log.begin_op();
    }

    /// 结束一个文件系统操作；最后一个离开者触发组提交
    pub fn end_op(&self) {
        self.log.end_op(&self.cache);
    }

    /// 把改过的缓冲块记入当前事务（取代直接写盘）
    pub fn log_write(&self, buf: &Buf<'_>) {
        self.log.write(&self.cache, buf);
    }

    /// 在事务外归还 inode 引用的便捷方法：自带一对 begin/end
    pub fn release(&self, ip: Inode) {
        self.begin_op();
        self.iput(ip);
        self.end_op();
    }

    /// 创建 `kind` 类型的文件系统对象并返回其引用。
    pub fn create(
        &self,
        cwd: &Inode,
        path: &[u8],
        kind: InodeKind,
        major: i16,
        minor: i16,
    ) -> Result<Inode> {
        self.begin_op();
        let r = self.create_inner(cwd, path, kind, major, minor);
        let r = r.map(|(ip, guard)| {
            drop(guard);
            ip
        });
        self.end_op();
        r
    }

    pub fn mkdir(&self, cwd: &Inode, path: &[u8]) -> Result<()> {
        self.begin_op();
        let r = self.create_inner(cwd, path, InodeKind::Directory, 0, 0);
        let r = r.map(|(ip, guard)| {
            drop(guard);
            self.iput(ip);
        });
        self.end_op();
        r
    }

    pub fn mknod(&self, cwd: &Inode, path: &[u8], major: i16, minor: i16) -> Result<()> {
        self.begin_op();
        let r = self.create_inner(cwd, path, InodeKind::Device, major, minor);
        let r = r.map(|(ip, guard)| {
            drop(guard);
            self.iput(ip);
        });
        self.end_op();
        r
    }

    /// 硬链接：让 `new` 指向 `old` 所指的 inode。
    /// 拒绝目录（防环）与跨设备；后半段失败时回退 `nlink`。
    pub fn link(&self, cwd: &Inode, old: &[u8], new: &[u8]) -> Result<()> {
        self.begin_op();
        let r = self.link_inner(cwd, old, new);
        self.end_op();
        r
    }

    fn link_inner(&self, cwd: &Inode, old: &[u8], new: &[u8]) -> Result<()> {
        let ip = self.namei(cwd, old)?;

        let mut guard = self.ilock(&ip);
        if guard.kind == InodeKind::Directory {
            drop(guard);
            self.iput(ip);
            return Err(Error::IsADirectory);
        }
        guard.nlink += 1;
        guard.update();
        drop(guard);

        let linked = self.link_target(cwd, new, &ip);
        if let Err(e) = linked {
            // 回退刚才的 nlink++
            let mut guard = self.ilock(&ip);
            guard.nlink -= 1;
            guard.update();
            drop(guard);
            self.iput(ip);
            return Err(e);
        }
        self.iput(ip);
        Ok(())
    }

    fn link_target(&self, cwd: &Inode, new: &[u8], ip: &Inode) -> Result<()> {
        let (parent, name) = self.namei_parent(cwd, new)?;
        let mut pguard = self.ilock(&parent);
        let r = if parent.dev() != ip.dev() {
            Err(Error::CrossDevice)
        } else {
            pguard.dir_link(&name, ip.inum())
        };
        drop(pguard);
        self.iput(parent);
        r
    }

    /// 摘除一条目录项；最后一个名字消失后 inode 在引用归零时回收。
    pub fn unlink(&self, cwd: &Inode, path: &[u8]) -> Result<()> {
        self.begin_op();
        let r = self.unlink_inner(cwd, path);
        self.end_op();
        r
    }

    fn unlink_inner(&self, cwd: &Inode, path: &[u8]) -> Result<()> {
        let (parent, name) = self.namei_parent(cwd, path)?;
        let mut pguard = self.ilock(&parent);

        if name == pad_name(b".") || name == pad_name(b"..") {
            drop(pguard);
            self.iput(parent);
            return Err(Error::InvalidPath);
        }

        let Some((ip, off)) = pguard.dir_lookup(&name) else {
            drop(pguard);
            self.iput(parent);
            return Err(Error::NotFound);
        };
        let mut guard = self.ilock(&ip);

        if guard.nlink < 1 {
            panic!("unlink: nlink < 1");
        }
        if guard.kind == InodeKind::Directory && !guard.is_dir_empty() {
            drop(guard);
            self.iput(ip);
            drop(pguard);
            self.iput(parent);
            return Err(Error::DirectoryNotEmpty);
        }

        // 就地清零目录项
        let zero = crate::layout::DirEntry::empty();
        match pguard.write(zero.as_bytes(), off) {
            Ok(n) if n == crate::layout::DirEntry::SIZE => {}
            _ => panic!("unlink: dirent write"),
        }
        if guard.kind == InodeKind::Directory {
            // 子目录的 `..` 随之消失
            pguard.nlink -= 1;
            pguard.update();
        }
        drop(pguard);
        self.iput(parent);

        guard.nlink -= 1;
        guard.update();
        drop(guard);
        self.iput(ip);
        Ok(())
    }

    /// 打开（或带 CREATE 创建）一个文件。目录只许只读打开；
    /// 除非 NOFOLLOW，符号链接会被一路追到非链接对象为止。
    pub fn open(&self, cwd: &Inode, path: &[u8], flags: BitFlags<OpenFlag>) -> Result<File<'_>> {
        self.begin_op();
        let r = self.open_inner(cwd, path, flags);
        self.end_op();
        r
    }

    fn open_inner(&self, cwd: &Inode, path: &[u8], flags: BitFlags<OpenFlag>) -> Result<File<'_>> {
        let (ip, guard) = if flags.contains(OpenFlag::CREATE) {
            self.create_inner(cwd, path, InodeKind::File, 0, 0)?
        } else {
            let ip = self.namei(cwd, path)?;
            let guard = self.ilock(&ip);
            if guard.kind == InodeKind::Directory && !flags.is_empty() {
                drop(guard);
                self.iput(ip);
                return Err(Error::IsADirectory);
            }
            (ip, guard)
        };

        let (ip, mut guard) = if guard.kind == InodeKind::Symlink && !flags.contains(OpenFlag::NOFOLLOW)
        {
            self.follow_symlink(cwd, ip, guard)?
        } else {
            (ip, guard)
        };

        if flags.contains(OpenFlag::TRUNC) && guard.kind == InodeKind::File {
            guard.truncate();
        }

        let readable = !flags.contains(OpenFlag::WRONLY);
        let writable = flags.contains(OpenFlag::WRONLY) || flags.contains(OpenFlag::RDWR);
        drop(guard);
        Ok(File::new(self, ip, readable, writable))
    }

    /// 迭代追踪符号链接：读出目标路径、放锁留引用、解析、换引用。
    /// 超过 [`SYMLINK_MAX_HOPS`] 跳按成环处理。
    fn follow_symlink<'a>(
        &'a self,
        cwd: &Inode,
        ip: Inode,
        guard: InodeGuard<'a>,
    ) -> Result<(Inode, InodeGuard<'a>)> {
        let mut ip = ip;
        let mut guard = guard;
        let mut hops = 0;

        while guard.kind == InodeKind::Symlink {
            hops += 1;
            if hops > SYMLINK_MAX_HOPS {
                drop(guard);
                self.iput(ip);
                return Err(Error::TooManyLinks);
            }

            let mut target = [0u8; PATH_MAX];
            let len = guard.read(&mut target, 0);
            if len == 0 {
                drop(guard);
                self.iput(ip);
                return Err(Error::NotFound);
            }
            // 解锁但保留引用，解析目标期间别人可以用这个链接
            drop(guard);

            match self.namei(cwd, &target[..len]) {
                Ok(next) => {
                    let next_guard = self.ilock(&next);
                    self.iput(ip);
                    ip = next;
                    guard = next_guard;
                }
                Err(e) => {
                    self.iput(ip);
                    return Err(e);
                }
            }
        }
        Ok((ip, guard))
    }

    /// 创建符号链接：新建 SYMLINK inode，目标路径就是它的内容。
    pub fn symlink(&self, cwd: &Inode, target: &[u8], path: &[u8]) -> Result<()> {
        if target.len() > PATH_MAX {
            return Err(Error::NameTooLong);
        }

        self.begin_op();
        let r = match self.create_inner(cwd, path, InodeKind::Symlink, 0, 0) {
            Ok((ip, mut guard)) => {
                let r = match guard.write(target, 0) {
                    Ok(n) if n == target.len() => Ok(()),
                    Ok(_) => Err(Error::NoSpace),
                    Err(e) => Err(e),
                };
                drop(guard);
                self.iput(ip);
                r
            }
            Err(e) => Err(e),
        };
        self.end_op();
        r
    }

    /// 切换工作目录：解析并验证是目录后，换掉调用方手里的 cwd 引用。
    /// 旧 cwd 的释放可能回收资源，所以整个操作在事务里。
    pub fn chdir(&self, cwd: &mut Inode, path: &[u8]) -> Result<()> {
        self.begin_op();
        let r = (|| {
            let ip = self.namei(cwd, path)?;
            let guard = self.ilock(&ip);
            if guard.kind != InodeKind::Directory {
                drop(guard);
                self.iput(ip);
                return Err(Error::NotADirectory);
            }
            drop(guard);
            Ok(ip)
        })();
        let r = r.map(|ip| {
            let old = core::mem::replace(cwd, ip);
            self.iput(old);
        });
        self.end_op();
        r
    }

    /// create 的事务内主体：返回已锁定的新（或既有）inode。
    ///
    /// 带 CREATE 的 open 语义：要创建普通文件时撞上已存在的
    /// 文件或设备不算失败，直接交出现有的。目录类型先在自己身上
    /// 挂好 `.` 与 `..`，父目录的 `nlink` 等一切就绪再加。
    /// `ialloc` 之后任何一步失败都把 `nlink` 清零，半成品随引用
    /// 释放被回收。
    fn create_inner<'a>(
        &'a self,
        cwd: &Inode,
        path: &[u8],
        kind: InodeKind,
        major: i16,
        minor: i16,
    ) -> Result<(Inode, InodeGuard<'a>)> {
        let (parent, name) = self.namei_parent(cwd, path)?;
        let mut pguard = self.ilock(&parent);

        if let Some((existing, _)) = pguard.dir_lookup(&name) {
            drop(pguard);
            self.iput(parent);
            let eguard = self.ilock(&existing);
            if kind == InodeKind::File && matches!(eguard.kind, InodeKind::File | InodeKind::Device)
            {
                return Ok((existing, eguard));
            }
            drop(eguard);
            self.iput(existing);
            return Err(Error::AlreadyExists);
        }

        let Some(ip) = self.ialloc(self.dev, kind) else {
            drop(pguard);
            self.iput(parent);
            return Err(Error::NoInodes);
        };
        let mut guard = self.ilock(&ip);
        guard.major = major;
        guard.minor = minor;
        guard.nlink = 1;
        guard.update();

        let linked = Self::create_links(&mut pguard, &parent, &mut guard, &name, kind);
        match linked {
            Ok(()) => {
                if kind == InodeKind::Directory {
                    // 新目录的 `..` 指着父目录
                    pguard.nlink += 1;
                    pguard.update();
                }
                drop(pguard);
                self.iput(parent);
                Ok((ip, guard))
            }
            Err(e) => {
                // 让半成品在引用归零时被回收
                guard.nlink = 0;
                guard.update();
                drop(guard);
                self.iput(ip);
                drop(pguard);
                self.iput(parent);
                Err(e)
            }
        }
    }

    fn create_links(
        pguard: &mut InodeGuard<'_>,
        parent: &Inode,
        guard: &mut InodeGuard<'_>,
        name: &[u8; NAME_LEN],
        kind: InodeKind,
    ) -> Result<()> {
        if kind == InodeKind::Directory {
            let me = guard.inum();
            // 自引用不另计 nlink，创建时的 1 已经算上 `.`
            guard.dir_link(b".", me)?;
            guard.dir_link(b"..", parent.inum())?;
        }
        pguard.dir_link(&name[..], guard.inum())
    }
}
