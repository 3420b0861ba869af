//! wal-fs 的宿主侧块设备实现与测试台。

#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wal_fs::BlockDevice;
use wal_fs::BLOCK_SIZE;

/// 宿主文件系统上的一个普通文件充当磁盘镜像。
/// `File` 的读写不支持随机访问，访问每个块之前都要先 seek 过去。
pub struct BlockFile(pub Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(file.read(buf).unwrap(), BLOCK_SIZE, "not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(
            file.write(buf).unwrap(),
            BLOCK_SIZE,
            "not a complete block!"
        );
    }
}

/// 驻留内存的磁盘镜像，测试用
pub struct MemDisk(Mutex<Vec<u8>>);

impl MemDisk {
    pub fn new(blocks: usize) -> Arc<Self> {
        Arc::new(Self(Mutex::new(vec![0; blocks * BLOCK_SIZE])))
    }

    /// 当前镜像内容的一份拷贝
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let image = self.0.lock().unwrap();
        let start = block_id * BLOCK_SIZE;
        buf.copy_from_slice(&image[start..start + BLOCK_SIZE]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut image = self.0.lock().unwrap();
        let start = block_id * BLOCK_SIZE;
        image[start..start + BLOCK_SIZE].copy_from_slice(buf);
    }
}

/// 模拟断电的设备包装：`arm` 之后，一旦看到日志头块带着非零计数
/// 落盘（即提交点），后续所有写入都被丢弃，镜像就停在"提交刚刚
/// 生效、家位置还没动"的瞬间。
pub struct CrashDisk {
    inner: Arc<MemDisk>,
    log_head: usize,
    armed: AtomicBool,
    dead: AtomicBool,
}

impl CrashDisk {
    pub fn new(inner: Arc<MemDisk>, log_head: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            log_head,
            armed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        })
    }

    /// 从现在起守株待兔，等下一次提交点
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

impl BlockDevice for CrashDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.inner.read_block(block_id, buf);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        if self.dead.load(Ordering::SeqCst) {
            return;
        }
        self.inner.write_block(block_id, buf);
        if self.armed.load(Ordering::SeqCst)
            && block_id == self.log_head
            && buf[..4] != [0, 0, 0, 0]
        {
            // 提交点已持久化，此后断电
            self.dead.store(true, Ordering::SeqCst);
        }
    }
}

/// 记录写入流量的设备包装：保留每次写块的块号和前 8 个字节，
/// 用来观察日志的提交行为。
pub struct RecordingDisk {
    inner: Arc<MemDisk>,
    writes: Mutex<Vec<(usize, [u8; 8])>>,
}

impl RecordingDisk {
    pub fn new(inner: Arc<MemDisk>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn take_writes(&self) -> Vec<(usize, [u8; 8])> {
        std::mem::take(&mut self.writes.lock().unwrap())
    }
}

impl BlockDevice for RecordingDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.inner.read_block(block_id, buf);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut head = [0u8; 8];
        head.copy_from_slice(&buf[..8]);
        self.writes.lock().unwrap().push((block_id, head));
        self.inner.write_block(block_id, buf);
    }
}
