//! 睡眠锁：保护可能跨磁盘 I/O 持有的长临界区（缓冲区数据、inode 本体）。
//!
//! 自旋锁只护住 `locked` 标志本身，占用失败就让出再试，
//! 持有者做 I/O 期间不会把任何自旋锁一起占住。
//! 注意获取顺序：持有自旋锁时不得再获取睡眠锁
//! （inode 释放路径是唯一的例外，见 `iput`）。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};

use spin::Mutex;

pub struct SleepLock<T> {
    locked: Mutex<bool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: Mutex::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            let mut locked = self.locked.lock();
            if !*locked {
                *locked = true;
                return SleepLockGuard { lock: self };
            }
            drop(locked);
            hint::spin_loop();
        }
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        *self.lock.locked.lock() = false;
    }
}
