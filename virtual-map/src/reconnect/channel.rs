//! 重连传输层
//!
//! 重连只依赖两个 trait：[`MessageSink`] 发送字节帧，[`MessageSource`]
//! 带超时地接收字节帧。[`memory_channel`] 基于 crossbeam channel 提供
//! 进程内的双工实现，并通过 [`LinkControl`] 注入断链与丢包。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// 断链检查的轮询间隔
const SEVER_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel disconnected")]
    Disconnected,
    #[error("receive timed out")]
    Timeout,
}

/// 字节帧发送端
pub trait MessageSink: Send {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), ChannelError>;
}

/// 字节帧接收端
pub trait MessageSource: Send {
    /// 最多等待 `timeout`
    fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, ChannelError>;
}

/// 双工通道的一端
pub struct Channel {
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
}

impl Channel {
    pub fn new(sink: Box<dyn MessageSink>, source: Box<dyn MessageSource>) -> Self {
        Self { sink, source }
    }

    pub fn split(self) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        (self.sink, self.source)
    }
}

#[derive(Debug)]
struct LinkState {
    severed: AtomicBool,
    frames: AtomicU64,
    sever_at: AtomicU64,
    stall_at: AtomicU64,
}

/// 内存链路的故障注入句柄
#[derive(Debug, Clone)]
pub struct LinkControl(Arc<LinkState>);

impl LinkControl {
    /// 立即断开：两端的收发都返回 `Disconnected`
    pub fn sever(&self) {
        self.0.severed.store(true, Ordering::SeqCst);
    }

    /// 再传输 `frames` 帧（两个方向合计）之后断开
    pub fn sever_after(&self, frames: u64) {
        let now = self.0.frames.load(Ordering::SeqCst);
        self.0.sever_at.store(now + frames, Ordering::SeqCst);
    }

    /// 再传输 `frames` 帧之后静默丢弃所有帧，链路保持连接
    pub fn stall_after(&self, frames: u64) {
        let now = self.0.frames.load(Ordering::SeqCst);
        self.0.stall_at.store(now + frames, Ordering::SeqCst);
    }

    pub fn is_severed(&self) -> bool {
        self.0.severed.load(Ordering::SeqCst)
    }

    /// 已成功投递的帧数
    pub fn frames_delivered(&self) -> u64 {
        self.0.frames.load(Ordering::SeqCst)
    }
}

struct MemorySink {
    tx: Sender<Vec<u8>>,
    link: Arc<LinkState>,
}

impl MessageSink for MemorySink {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), ChannelError> {
        let link = &self.link;
        if link.severed.load(Ordering::SeqCst) {
            return Err(ChannelError::Disconnected);
        }
        let sent = link.frames.load(Ordering::SeqCst);
        if sent >= link.sever_at.load(Ordering::SeqCst) {
            link.severed.store(true, Ordering::SeqCst);
            return Err(ChannelError::Disconnected);
        }
        if sent >= link.stall_at.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(frame)
            .map_err(|_| ChannelError::Disconnected)?;
        link.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySource {
    rx: Receiver<Vec<u8>>,
    link: Arc<LinkState>,
}

impl MessageSource for MemorySource {
    fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.link.severed.load(Ordering::SeqCst) {
                return Err(ChannelError::Disconnected);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout);
            }
            match self.rx.recv_timeout(remaining.min(SEVER_POLL)) {
                Ok(frame) => return Ok(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Disconnected),
            }
        }
    }
}

/// 创建一对相连的内存通道端点
pub fn memory_channel() -> (Channel, Channel, LinkControl) {
    let link = Arc::new(LinkState {
        severed: AtomicBool::new(false),
        frames: AtomicU64::new(0),
        sever_at: AtomicU64::new(u64::MAX),
        stall_at: AtomicU64::new(u64::MAX),
    });
    let (a_tx, b_rx) = crossbeam_channel::unbounded();
    let (b_tx, a_rx) = crossbeam_channel::unbounded();

    let a = Channel::new(
        Box::new(MemorySink {
            tx: a_tx,
            link: Arc::clone(&link),
        }),
        Box::new(MemorySource {
            rx: a_rx,
            link: Arc::clone(&link),
        }),
    );
    let b = Channel::new(
        Box::new(MemorySink {
            tx: b_tx,
            link: Arc::clone(&link),
        }),
        Box::new(MemorySource {
            rx: b_rx,
            link: Arc::clone(&link),
        }),
    );
    (a, b, LinkControl(link))
}
