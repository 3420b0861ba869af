//! # 块缓存层
//!
//! 固定大小的缓冲池，缓存磁盘块内容，既减少真实的块读写，
//! 也为多线程访问同一磁盘块提供同步点。
//!
//! 缓冲区按 `blockno % BUCKET_COUNT` 散列进若干桶，每个桶由
//! 自己的自旋锁保护，命中路径只碰一把桶锁。未命中时释放目标桶锁、
//! 按编号升序拿齐全部桶锁（全局栅栏），复查目标桶后在全表范围内
//! 淘汰 `refcnt == 0` 且 `last_use` 最小的缓冲区，把它挪进目标桶。
//! 固定的获取顺序避免了跨桶搬移时的死锁。
//!
//! 用法：
//! - 要读写某个磁盘块，调用 [`BlockCache::read`] 取得已锁定的 [`Buf`]；
//! - 修改数据后调用 [`Buf::write`] 同步写盘（或交给日志层记录）；
//! - `Buf` 离开作用域即归还引用并更新 LRU；
//! - 日志层用 [`BlockCache::pin`]/[`BlockCache::unpin`] 让脏块跨操作驻留。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::array;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::block_dev::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::{BLOCK_SIZE, DataBlock};

/// 缓冲区总数
const BUF_COUNT: usize = 30;
/// 桶数量，取质数
const BUCKET_COUNT: usize = 13;

pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    buckets: [Mutex<Bucket>; BUCKET_COUNT],
    slots: Vec<BufSlot>,
    /// 单调递增的逻辑时钟，释放时给 `last_use` 打戳
    ticks: AtomicU64,
}

/// 桶内链：持有本桶所有缓冲区的元数据。
/// `dev`/`blockno`/`refcnt`/`last_use` 都由所在桶的锁保护，
/// 缓冲区在桶间搬移时元数据随链表项一起移动。
struct Bucket {
    chain: Vec<BufMeta>,
}

struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    last_use: u64,
    /// 指向 `slots` 中的数据槽
    slot: usize,
}

/// 数据槽：`valid` 表示缓冲区内容是否已从磁盘装载，
/// 在持有桶锁或数据睡眠锁时才允许改动；
/// 数据本体由睡眠锁保护，持锁即独占。
struct BufSlot {
    valid: AtomicBool,
    data: SleepLock<BlockData>,
}

/// 对齐到 8 字节，保证可以就地映射成磁盘上的各种结构体
#[repr(C, align(8))]
pub struct BlockData(DataBlock);

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let buckets: [Mutex<Bucket>; BUCKET_COUNT] =
            array::from_fn(|_| Mutex::new(Bucket { chain: Vec::new() }));
        // 初始全部空闲缓冲区都挂在 0 号桶
        buckets[0].lock().chain = (0..BUF_COUNT)
            .map(|slot| BufMeta {
                dev: 0,
                blockno: 0,
                refcnt: 0,
                last_use: 0,
                slot,
            })
            .collect();

        Self {
            device,
            buckets,
            slots: (0..BUF_COUNT)
                .map(|_| BufSlot {
                    valid: AtomicBool::new(false),
                    data: SleepLock::new(BlockData([0; BLOCK_SIZE])),
                })
                .collect(),
            ticks: AtomicU64::new(0),
        }
    }

    /// 取得 `(dev, blockno)` 的缓冲区并装载磁盘内容，返回已锁定的 [`Buf`]。
    /// 并发请求同一块的调用者在睡眠锁上排队，只有观察到 `valid == false`
    /// 的那一个真正读盘。
    pub fn read(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut buf = self.get(dev, blockno);
        if !self.slots[buf.slot].valid.load(Ordering::Relaxed) {
            self.device.read_block(blockno as usize, &mut buf.bytes_mut()[..]);
            self.slots[buf.slot].valid.store(true, Ordering::Relaxed);
        }
        buf
    }

    /// 查找或分配缓冲区。命中只加目标桶锁；
    /// 未命中走全局栅栏 + LRU 淘汰。
    fn get(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let target = blockno as usize % BUCKET_COUNT;

        {
            let mut bucket = self.buckets[target].lock();
            if let Some(meta) = bucket
                .chain
                .iter_mut()
                .find(|m| m.dev == dev && m.blockno == blockno)
            {
                meta.refcnt += 1;
                let slot = meta.slot;
                drop(bucket);
                return self.hold(slot, dev, blockno);
            }
        }

        // 未命中。升序拿齐所有桶锁，构成全局栅栏
        let mut all: Vec<MutexGuard<'_, Bucket>> =
            self.buckets.iter().map(|b| b.lock()).collect();

        // 等锁期间别的线程可能已装入同一块，先复查目标桶
        if let Some(meta) = all[target]
            .chain
            .iter_mut()
            .find(|m| m.dev == dev && m.blockno == blockno)
        {
            meta.refcnt += 1;
            let slot = meta.slot;
            Self::unlock_all(all);
            return self.hold(slot, dev, blockno);
        }

        // 全表淘汰：refcnt == 0 中 last_use 最小者
        let mut victim: Option<(usize, usize)> = None;
        let mut oldest = u64::MAX;
        for (bi, bucket) in all.iter().enumerate() {
            for (ci, m) in bucket.chain.iter().enumerate() {
                if m.refcnt == 0 && m.last_use <= oldest {
                    oldest = m.last_use;
                    victim = Some((bi, ci));
                }
            }
        }
        let Some((bi, ci)) = victim else {
            panic!("bget: no buffers");
        };

        let mut meta = all[bi].chain.remove(ci);
        // refcnt 为 0，没有谁持有或正在等它的睡眠锁，可以安全作废
        self.slots[meta.slot].valid.store(false, Ordering::Relaxed);
        meta.dev = dev;
        meta.blockno = blockno;
        meta.refcnt = 1;
        let slot = meta.slot;
        all[target].chain.push(meta);

        Self::unlock_all(all);
        self.hold(slot, dev, blockno)
    }

    /// 逆序释放全局栅栏
    fn unlock_all(mut guards: Vec<MutexGuard<'_, Bucket>>) {
        while guards.pop().is_some() {}
    }

    fn hold(&self, slot: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            cache: self,
            slot,
            dev,
            blockno,
            data: Some(self.slots[slot].data.lock()),
        }
    }

    /// 提升引用计数，让缓冲区跨越 `Buf` 的生命周期继续驻留。
    /// 日志层在 `log_write` 里固定脏块，提交安装后再解除。
    pub(crate) fn pin(&self, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[blockno as usize % BUCKET_COUNT].lock();
        let meta = bucket
            .chain
            .iter_mut()
            .find(|m| m.dev == dev && m.blockno == blockno)
            .expect("bpin: missing buffer");
        meta.refcnt += 1;
    }

    pub(crate) fn unpin(&self, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[blockno as usize % BUCKET_COUNT].lock();
        let meta = bucket
            .chain
            .iter_mut()
            .find(|m| m.dev == dev && m.blockno == blockno)
            .expect("bunpin: missing buffer");
        if meta.refcnt == 0 {
            panic!("bunpin: refcount underflow");
        }
        meta.refcnt -= 1;
    }

    /// `Buf` 析构时归还引用；归零的缓冲区打上 LRU 时间戳
    fn release(&self, slot: usize, blockno: u32) {
        let mut bucket = self.buckets[blockno as usize % BUCKET_COUNT].lock();
        let meta = bucket
            .chain
            .iter_mut()
            .find(|m| m.slot == slot)
            .expect("brelse: missing buffer");
        meta.refcnt -= 1;
        if meta.refcnt == 0 {
            meta.last_use = self.ticks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// 已锁定的缓冲区。持有期间独占 `data`；
/// 析构即释放睡眠锁并归还引用（等价于 brelse）。
pub struct Buf<'a> {
    cache: &'a BlockCache,
    slot: usize,
    dev: u32,
    blockno: u32,
    // 始终为 Some；析构时先取出释放睡眠锁，再更新桶内元数据
    data: Option<SleepLockGuard<'a, BlockData>>,
}

impl Buf<'_> {
    #[inline]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    #[inline]
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 把缓冲区内容同步写入磁盘。
    /// `&mut self` 保证了调用者确实持有这块缓冲区。
    pub fn write(&mut self) {
        self.cache
            .device
            .write_block(self.blockno as usize, &self.bytes()[..]);
    }

    #[inline]
    pub fn bytes(&self) -> &DataBlock {
        &self.data.as_ref().unwrap().0
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut DataBlock {
        &mut self.data.as_mut().unwrap().0
    }

    /// 获取缓冲区内偏移 `offset` 处的磁盘数据结构的不可变引用
    pub fn get<T: Sized>(&self, offset: usize) -> &T {
        assert!(offset + mem::size_of::<T>() <= BLOCK_SIZE);
        let addr = self.bytes()[offset..].as_ptr().cast();
        unsafe { &*addr }
    }

    /// 获取缓冲区内偏移 `offset` 处的磁盘数据结构的可变引用
    pub fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        assert!(offset + mem::size_of::<T>() <= BLOCK_SIZE);
        let addr = self.bytes_mut()[offset..].as_mut_ptr().cast();
        unsafe { &mut *addr }
    }
}

impl Deref for Buf<'_> {
    type Target = DataBlock;

    #[inline]
    fn deref(&self) -> &DataBlock {
        self.bytes()
    }
}

impl DerefMut for Buf<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut DataBlock {
        self.bytes_mut()
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.release(self.slot, self.blockno);
    }
}
