//! 有界在途计数器
//!
//! 重连的发送线程每发出一个请求 `on_ramp` 一次，处理线程每收到一个应答
//! `off_ramp` 一次；计数达到容量时发送方阻塞，从而限制在途请求数。
//!
//! 阻塞等待先自旋一小段时间，然后在 `parking_lot::Condvar` 上 park，
//! 不占用线程池的工作线程。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// 自旋重试次数
const SPIN_LIMIT: u32 = 64;

/// 观察中断时的轮询间隔
const INTERRUPT_POLL: Duration = Duration::from_millis(5);

/// 协作式中断标志
///
/// 被中断的等待者不会放弃等待：`on_ramp_observing` 会继续等到有空位，
/// 然后报告中断曾经发生。标志保持置位，由调用方决定何时清除。
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 有界计数器
#[derive(Debug)]
pub struct BackpressureCounter {
    capacity: u64,
    count: AtomicU64,
    lock: Mutex<()>,
    /// 计数下降，可能有空位
    space: Condvar,
    /// 计数归零
    empty: Condvar,
}

impl BackpressureCounter {
    /// 创建容量为 `capacity` 的计数器
    pub fn new(capacity: u64) -> Self {
        assert!(capacity > 0, "backpressure capacity must be positive");
        Self {
            capacity,
            count: AtomicU64::new(0),
            lock: Mutex::new(()),
            space: Condvar::new(),
            empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// 当前计数（无锁快照）
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// 不阻塞地尝试加一；已满返回 false
    pub fn attempt_on_ramp(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 加一，必要时阻塞直到有空位
    pub fn on_ramp(&self) {
        if self.spin() {
            return;
        }
        let mut guard = self.lock.lock();
        while !self.attempt_on_ramp() {
            self.space.wait(&mut guard);
        }
    }

    /// 与 `on_ramp` 相同，但观察中断标志
    ///
    /// 返回等待期间是否观察到中断。中断不会让调用提前返回。
    pub fn on_ramp_observing(&self, interrupt: &Interrupt) -> bool {
        let mut interrupted = interrupt.is_interrupted();
        if self.spin() {
            return interrupted;
        }
        let mut guard = self.lock.lock();
        while !self.attempt_on_ramp() {
            self.space.wait_for(&mut guard, INTERRUPT_POLL);
            interrupted |= interrupt.is_interrupted();
        }
        interrupted
    }

    /// 无视容量强制加一
    pub fn force_on_ramp(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// 减一并唤醒等待者
    ///
    /// 计数为零时调用属于调用方错误。
    pub fn off_ramp(&self) {
        let mut previous = self.count.load(Ordering::Acquire);
        loop {
            assert!(previous > 0, "off_ramp on an empty backpressure counter");
            match self.count.compare_exchange_weak(
                previous,
                previous - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => previous = actual,
            }
        }

        let _guard = self.lock.lock();
        self.space.notify_one();
        if previous == 1 {
            self.empty.notify_all();
        }
    }

    /// 阻塞直到计数归零
    pub fn wait_until_empty(&self) {
        let mut guard = self.lock.lock();
        while self.count() > 0 {
            self.empty.wait(&mut guard);
        }
    }

    fn spin(&self) -> bool {
        for _ in 0..SPIN_LIMIT {
            if self.attempt_on_ramp() {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }
}
