//! 睡眠锁模块
//! 提供可长期持有的同步原语，持有期间允许发生磁盘 I/O。
//!
//! 锁状态压缩成一个原子布尔，获取走 test-and-test-and-set：
//! 先只读地等到锁看起来空闲，再用一次 CAS 去抢，抢不到回到
//! 只读等待。在内核环境中等待处会挂起进程，宿主环境下退化为
//! 自旋让出，对外的阻塞语义一致。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicBool, Ordering};

/// 睡眠锁，保护可能跨磁盘 I/O 持有的数据
///
/// # 字段说明
/// - `locked`: 锁的占用状态，所有同步都经由它的原子操作
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过 `UnsafeCell` 实现内部可变性
pub struct SleepLock<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 数据只会被唯一持有守卫的线程访问，Acquire/Release 配对
// 保证了跨线程交接时的可见性
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据
    /// - `name`: 锁的标识名称
    ///
    /// # 返回值
    /// 初始化完成的 `SleepLock<T>`，可放入 `static` 或 `const` 上下文
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞）
    ///
    /// # 功能说明
    /// 尝试获取睡眠锁。锁被占用时当前线程停在等待处，直到持有者
    /// 释放后才能继续。返回的守卫对象提供对数据的独占访问。
    ///
    /// # 流程解释
    /// 1. 用 `compare_exchange_weak` 尝试把 `locked` 从假翻成真；
    /// 2. 失败则进入只读等待，反复加载 `locked` 直到看起来空闲，
    ///    避免持续的写竞争；
    /// 3. 回到第 1 步重试，成功后构造并返回守卫。
    ///
    /// # 返回值
    /// `SleepLockGuard<T>` 守卫对象，析构时自动释放锁
    ///
    /// # 安全性
    /// - `Acquire` 序保证看到前一个持有者的全部写入；
    /// - 数据指针来自 `UnsafeCell`，但独占性由 `locked` 翻转成功
    ///   这一事实保证，守卫存活期间不会有第二个访问者。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            // 等到锁空闲再去抢，读比写便宜
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 释放锁（内部方法，由守卫的 Drop 调用）
    ///
    /// `Release` 序把本次持有期间的写入发布给下一个获取者。
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// 锁的标识名称
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// 睡眠锁的守卫对象
///
/// 生命周期内独占被保护的数据，通过 `Deref`/`DerefMut` 访问；
/// 离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
