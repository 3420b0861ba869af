//! 路径解析：逐元素行走目录树。
//!
//! 以 `/` 开头为绝对路径，从根出发；否则从调用方给的 cwd 出发。
//! 单个元素最长 14 字节，超出的部分在拷贝时被静默截断，
//! 调用方不应依赖这一行为。

use crate::fs::FileSystem;
use crate::inode::Inode;
use crate::layout::InodeKind;
use crate::{Error, Result, NAME_LEN, ROOT_INODE};

/// 取出下一个路径元素（截断到 14 字节），并返回去掉前导斜杠的剩余部分。
/// 没有元素可取时返回 `None`。
///
/// 例：
///   skip_elem("a/bb/c") = Some(("a", "bb/c"))
///   skip_elem("///a//bb") = Some(("a", "bb"))
///   skip_elem("a") = Some(("a", ""))
///   skip_elem("") = skip_elem("////") = None
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut i = 0;
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    if i == path.len() {
        return None;
    }

    let start = i;
    while i < path.len() && path[i] != b'/' {
        i += 1;
    }
    let name = &path[start..(start + NAME_LEN).min(i)];

    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    Some((name, &path[i..]))
}

/// NUL 填充到目录项名字的宽度
pub(crate) fn pad_name(name: &[u8]) -> [u8; NAME_LEN] {
    let n = name.len().min(NAME_LEN);
    let mut padded = [0; NAME_LEN];
    padded[..n].copy_from_slice(&name[..n]);
    padded
}

impl FileSystem {
    /// 解析路径，返回对应 inode 的引用。
    /// 必须在事务内调用（途中会 iput）。
    pub fn namei(&self, cwd: &Inode, path: &[u8]) -> Result<Inode> {
        self.namex(cwd, path, false).map(|(ip, _)| ip)
    }

    /// 同 [`namei`]，但停在倒数第二级：返回父目录的引用，
    /// 以及最后一个路径元素。
    ///
    /// [`namei`]: FileSystem::namei
    pub fn namei_parent(&self, cwd: &Inode, path: &[u8]) -> Result<(Inode, [u8; NAME_LEN])> {
        self.namex(cwd, path, true)
    }

    fn namex(&self, cwd: &Inode, path: &[u8], parent: bool) -> Result<(Inode, [u8; NAME_LEN])> {
        let mut ip = if path.first() == Some(&b'/') {
            self.iget(self.dev, ROOT_INODE)
        } else {
            self.idup(cwd)
        };

        let mut rest = path;
        while let Some((name, next)) = skip_elem(rest) {
            let guard = self.ilock(&ip);
            if guard.kind != InodeKind::Directory {
                drop(guard);
                self.iput(ip);
                return Err(Error::NotADirectory);
            }
            if parent && next.is_empty() {
                // 提前一级收手：解锁但保留引用
                drop(guard);
                return Ok((ip, pad_name(name)));
            }
            let found = guard.dir_lookup(name);
            drop(guard);
            let Some((child, _)) = found else {
                self.iput(ip);
                return Err(Error::NotFound);
            };
            self.iput(ip);
            ip = child;
            rest = next;
        }

        if parent {
            // 只剩根可走，要不到父目录
            self.iput(ip);
            return Err(Error::NotFound);
        }
        Ok((ip, [0; NAME_LEN]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_elem_examples() {
        assert_eq!(skip_elem(b"a/bb/c"), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_elem(b"///a//bb"), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_elem(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b""), None);
        assert_eq!(skip_elem(b"////"), None);
    }

    #[test]
    fn skip_elem_truncates() {
        let (name, rest) = skip_elem(b"somereallyoverlongname/x").unwrap();
        assert_eq!(name, b"somereallyover");
        assert_eq!(rest, b"x");
    }
}
