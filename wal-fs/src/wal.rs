//! # 重做日志层
//!
//! 物理重做日志 + 组提交：并发的文件系统操作共享同一个事务，
//! 只有当在途操作数归零时才提交，因此永远不用考虑"提交会不会把
//! 未完成操作的修改写下去"。
//!
//! 磁盘上的日志格式：头块（目的块号表）后面紧跟各数据块的副本。
//! 携带 `n > 0` 的头块落盘即为提交点：在此之前崩溃等价于事务从未
//! 发生；在此之后崩溃，启动时的恢复流程会把日志重放到家位置，
//! 重复崩溃重复重放也是幂等的。
//!
//! 典型用法（`log_write` 取代直接的 `Buf::write`）：
//!
//! ```text
//! begin_op();
//! let mut bp = cache.read(dev, bno);
//! // 修改 bp ...
//! log_write(&bp);
//! drop(bp);
//! end_op();
//! ```

use core::hint;

use spin::Mutex;

use crate::block_cache::{BlockCache, Buf};
use crate::layout::LogHeader;
use crate::{LOG_CAP, MAX_OP_BLOCKS};

pub(crate) struct Log {
    dev: u32,
    /// 日志区起始块号（头块所在）
    start: u32,
    /// 日志区块数（含头块）
    size: u32,
    state: Mutex<LogState>,
}

struct LogState {
    /// 在途的文件系统操作数
    outstanding: u32,
    /// 正在提交；为真时不放任何操作进来
    committing: bool,
    /// 内存中的日志头，记录本事务已吸收的块号
    header: LogHeader,
}

impl Log {
    pub fn new(dev: u32, start: u32, size: u32) -> Self {
        Self {
            dev,
            start,
            size,
            state: Mutex::new(LogState {
                outstanding: 0,
                committing: false,
                header: LogHeader::empty(),
            }),
        }
    }

    /// 启动时恢复：日志头非空说明上次崩溃发生在提交点之后，
    /// 把日志块重放到家位置，然后清空日志头。
    pub fn recover(&self, cache: &BlockCache) {
        let header = self.read_head(cache);
        if header.n > 0 {
            log::info!("log: recovering {} blocks", header.n);
            self.install(cache, &header, true);
        }
        self.write_head(cache, &LogHeader::empty());
    }

    /// 每个文件系统操作开始时调用。
    /// 正在提交、或按最坏情况预约后日志可能装不下时，等到下一轮提交腾出空间。
    pub fn begin_op(&self) {
        loop {
            let mut state = self.state.lock();
            let reserved =
                state.header.n as usize + (state.outstanding as usize + 1) * MAX_OP_BLOCKS;
            if state.committing || reserved > LOG_CAP {
                drop(state);
                hint::spin_loop();
            } else {
                state.outstanding += 1;
                return;
            }
        }
    }

    /// 记录一个已修改的缓冲块。同一事务内重复修改同一块只占一个名额
    /// （吸收），新登记的块被 pin 在缓存里直到提交安装完毕。
    pub fn write(&self, cache: &BlockCache, buf: &Buf<'_>) {
        let mut state = self.state.lock();

        let n = state.header.n as usize;
        if n >= LOG_CAP || n as u32 >= self.size - 1 {
            panic!("log_write: transaction too big");
        }
        if state.outstanding < 1 {
            panic!("log_write: outside of transaction");
        }

        if !state.header.block[..n].contains(&buf.blockno()) {
            cache.pin(buf.dev(), buf.blockno());
            state.header.block[n] = buf.blockno();
            state.header.n += 1;
        }
    }

    /// 每个文件系统操作结束时调用；最后一个离开的操作负责提交。
    /// 提交在不持有状态锁的情况下进行（其间要做磁盘 I/O），
    /// `committing` 标志挡住新的进入者。
    pub fn end_op(&self, cache: &BlockCache) {
        let header = {
            let mut state = self.state.lock();
            state.outstanding -= 1;
            if state.committing {
                panic!("end_op: already committing");
            }
            if state.outstanding > 0 {
                // 等在 begin_op 里的操作下一轮重新检查预约
                return;
            }
            state.committing = true;
            state.header.clone()
        };

        if header.n > 0 {
            self.write_log(cache, &header);
            // 提交点
            self.write_head(cache, &header);
            self.install(cache, &header, false);
            // 抹掉已完成的事务
            self.write_head(cache, &LogHeader::empty());
        }

        let mut state = self.state.lock();
        state.header.n = 0;
        state.committing = false;
    }

    /// 把缓存里的脏块副本写进日志区
    fn write_log(&self, cache: &BlockCache, header: &LogHeader) {
        for i in 0..header.n as usize {
            let home = cache.read(self.dev, header.block[i]);
            let mut to = cache.read(self.dev, self.start + 1 + i as u32);
            *to.bytes_mut() = *home.bytes();
            to.write();
        }
    }

    /// 把已提交的日志块安装到家位置。
    /// 恢复路径上没有谁 pin 过这些块，不做 unpin。
    fn install(&self, cache: &BlockCache, header: &LogHeader, recovering: bool) {
        for i in 0..header.n as usize {
            let lbuf = cache.read(self.dev, self.start + 1 + i as u32);
            let mut dbuf = cache.read(self.dev, header.block[i]);
            *dbuf.bytes_mut() = *lbuf.bytes();
            dbuf.write();
            if !recovering {
                cache.unpin(self.dev, header.block[i]);
            }
        }
    }

    fn read_head(&self, cache: &BlockCache) -> LogHeader {
        let buf = cache.read(self.dev, self.start);
        buf.get::<LogHeader>(0).clone()
    }

    fn write_head(&self, cache: &BlockCache, header: &LogHeader) {
        let mut buf = cache.read(self.dev, self.start);
        *buf.get_mut::<LogHeader>(0) = header.clone();
        buf.write();
    }
}
