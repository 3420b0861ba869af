//! 数据块位图分配器：每块一位，0 空闲 1 已分配，字节内低位在前。
//!
//! 按块号首次适配，没有提示缓存，确定性优先于局部性。
//! 新分配的块先在事务内清零，调用方看到它时一定是全零的。

use crate::fs::FileSystem;
use crate::BLOCK_BITS;

impl FileSystem {
    /// 分配一个已清零的数据块并返回块号；空间耗尽返回 0（可恢复）。
    /// 必须在事务内调用。
    pub(crate) fn balloc(&self) -> u32 {
        let mut base = 0;
        while base < self.sb.size {
            let mut bp = self.cache.read(self.dev, self.sb.bblock(base));
            let mut bi = 0;
            while bi < BLOCK_BITS as u32 && base + bi < self.sb.size {
                let mask = 1u8 << (bi % 8);
                if bp[bi as usize / 8] & mask == 0 {
                    bp[bi as usize / 8] |= mask;
                    self.log_write(&bp);
                    drop(bp);
                    self.bzero(base + bi);
                    return base + bi;
                }
                bi += 1;
            }
            drop(bp);
            base += BLOCK_BITS as u32;
        }
        log::warn!("balloc: out of blocks");
        0
    }

    /// 释放数据块。重复释放说明元数据已经乱了，直接终止。
    pub(crate) fn bfree(&self, bno: u32) {
        let mut bp = self.cache.read(self.dev, self.sb.bblock(bno));
        let bi = bno % BLOCK_BITS as u32;
        let mask = 1u8 << (bi % 8);
        if bp[bi as usize / 8] & mask == 0 {
            panic!("bfree: freeing free block");
        }
        bp[bi as usize / 8] &= !mask;
        self.log_write(&bp);
    }

    fn bzero(&self, bno: u32) {
        let mut bp = self.cache.read(self.dev, bno);
        bp.fill(0);
        self.log_write(&bp);
    }
}
