//! 打开文件对象：inode 引用 + 偏移量 + 读写权限。
//!
//! 读写自带事务括号。一次写入可能超出单个事务的日志预算，
//! 因此按块数拆成多批，每批一个事务。中途崩溃最多丢掉尾部
//! 几批，已提交的前缀仍然完整。

use core::cmp::min;

use crate::fs::{FileSystem, Stat};
use crate::inode::Inode;
use crate::{Error, Result, BLOCK_SIZE, MAX_OP_BLOCKS};

pub struct File<'fs> {
    fs: &'fs FileSystem,
    // 始终为 Some；析构时取出，在自己的事务里归还
    ip: Option<Inode>,
    offset: u32,
    readable: bool,
    writable: bool,
}

impl<'fs> File<'fs> {
    pub(crate) fn new(fs: &'fs FileSystem, ip: Inode, readable: bool, writable: bool) -> Self {
        Self {
            fs,
            ip: Some(ip),
            offset: 0,
            readable,
            writable,
        }
    }

    #[inline]
    fn inode(&self) -> &Inode {
        self.ip.as_ref().unwrap()
    }

    pub fn stat(&self) -> Stat {
        self.fs.ilock(self.inode()).stat()
    }

    /// 从当前偏移读入 `dst`，返回读到的字节数
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(Error::NotReadable);
        }
        let guard = self.fs.ilock(self.inode());
        let n = guard.read(dst, self.offset);
        drop(guard);
        self.offset += n as u32;
        Ok(n)
    }

    /// 把 `src` 写到当前偏移，返回写入的字节数。
    /// 空间耗尽时可能写短；已写入的部分保持有效。
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::NotWritable);
        }

        // 单批上限：扣除 inode 块、位图块和两个间接块的最坏情形，
        // 余量对半取，保证一批稳稳落在一个事务的预算内
        let batch = (MAX_OP_BLOCKS - 1 - 1 - 2) / 2 * BLOCK_SIZE;

        let mut done = 0;
        while done < src.len() {
            let n = min(src.len() - done, batch);

            self.fs.begin_op();
            let mut guard = self.fs.ilock(self.inode());
            let r = guard.write(&src[done..done + n], self.offset);
            drop(guard);
            self.fs.end_op();

            match r {
                Ok(written) => {
                    self.offset += written as u32;
                    done += written;
                    if written < n {
                        // 数据块耗尽
                        break;
                    }
                }
                Err(e) => {
                    return if done == 0 { Err(e) } else { Ok(done) };
                }
            }
        }
        Ok(done)
    }
}

impl Drop for File<'_> {
    fn drop(&mut self) {
        if let Some(ip) = self.ip.take() {
            // 归还引用可能触发磁盘 inode 的回收，放进事务里
            self.fs.begin_op();
            self.fs.iput(ip);
            self.fs.end_op();
        }
    }
}
