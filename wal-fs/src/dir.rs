//! 目录层：目录就是内容为定长目录项序列的 inode。
//!
//! 调用方必须已经锁住目录 inode，所以这些操作都长在 [`InodeGuard`] 上。

use crate::inode::{Inode, InodeGuard};
use crate::layout::{DirEntry, InodeKind};
use crate::{Error, Result, NAME_LEN};

impl InodeGuard<'_> {
    /// 在目录里查找名字。命中时返回带引用、未锁定的 inode
    /// 和目录项的字节偏移；空槽跳过，第一个匹配生效。
    pub fn dir_lookup(&self, name: &[u8]) -> Option<(Inode, u32)> {
        if self.kind != InodeKind::Directory {
            panic!("dirlookup: not a directory");
        }

        let mut entry = DirEntry::empty();
        let mut off = 0;
        while off < self.size {
            if self.read(entry.as_bytes_mut(), off) != DirEntry::SIZE {
                panic!("dirlookup: bad dirent read");
            }
            if entry.inum() != 0 && entry.name_eq(name) {
                return Some((self.fs.iget(self.dev(), entry.inum() as u32), off));
            }
            off += DirEntry::SIZE as u32;
        }
        None
    }

    /// 往目录里写一条 `(name, inum)`：先确认名字不存在，
    /// 再复用第一个空槽，没有空槽就追加到末尾。
    /// 必须在事务内调用。
    pub fn dir_link(&mut self, name: &[u8], inum: u32) -> Result<()> {
        if name.len() > NAME_LEN {
            return Err(Error::NameTooLong);
        }
        if let Some((ip, _)) = self.dir_lookup(name) {
            self.fs.iput(ip);
            return Err(Error::AlreadyExists);
        }

        let mut entry = DirEntry::empty();
        let mut off = 0;
        while off < self.size {
            if self.read(entry.as_bytes_mut(), off) != DirEntry::SIZE {
                panic!("dirlink: bad dirent read");
            }
            if entry.inum() == 0 {
                break;
            }
            off += DirEntry::SIZE as u32;
        }

        let entry = DirEntry::new(name, inum as u16);
        match self.write(entry.as_bytes(), off) {
            Ok(n) if n == DirEntry::SIZE => Ok(()),
            Ok(_) => Err(Error::NoSpace),
            Err(e) => Err(e),
        }
    }

    /// 除 `.` 与 `..` 外是否全为空槽
    pub fn is_dir_empty(&self) -> bool {
        let mut entry = DirEntry::empty();
        let mut off = (2 * DirEntry::SIZE) as u32;
        while off < self.size {
            if self.read(entry.as_bytes_mut(), off) != DirEntry::SIZE {
                panic!("isdirempty: bad dirent read");
            }
            if entry.inum() != 0 {
                return false;
            }
            off += DirEntry::SIZE as u32;
        }
        true
    }
}
