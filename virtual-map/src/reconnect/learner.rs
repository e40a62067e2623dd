//! 学习方：自顶向下比较 hash，只传输不一致的子树
//!
//! 发送线程从工作队列取出请求，经背压计数器限流后发出；处理线程（调用
//! 线程）按 FIFO 顺序接收应答、检查期限、把结果写入暂存索引，并把需要
//! 继续展开的孩子放回工作队列。工作队列与在途请求都清空时遍历结束。
//!
//! 内部节点的应答携带左右孩子的 hash，孩子可以直接与本地 hash 比较，
//! 不必再为每个孩子单独发一次 hash 请求。hash 一致的子树从学习方自己
//! 的旧快照原样复制。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::channel::{Channel, ChannelError, MessageSink, MessageSource};
use super::cursor::{Cursor, CursorState};
use super::message::{Request, RequestBody, Response, ResponseBody};
use super::{ReconnectOutcome, ReconnectStats};
use crate::backpressure::{BackpressureCounter, Interrupt};
use crate::config::ReconnectConfig;
use crate::error::{MapError, Result};
use crate::hash::{short_hex, HashOutput, Hasher};
use crate::index::{NodeIndex, Snapshot, VirtualNode};
use crate::path::{self, Path, ROOT_PATH};

/// 处理线程单次等待的上限，用于及时响应取消
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Hash,
    Node,
}

impl RequestKind {
    fn body(self, path: Path) -> RequestBody {
        match self {
            RequestKind::Hash => RequestBody::Hash(path),
            RequestKind::Node => RequestBody::Node(path),
        }
    }
}

struct Pending {
    id: u64,
    path: Path,
    kind: RequestKind,
    deadline: Instant,
}

impl Pending {
    fn describe(&self) -> String {
        format!(
            "{:?} request {} for path {} (rank {})",
            self.kind,
            self.id,
            self.path,
            path::rank(self.path)
        )
    }
}

enum Flow {
    Continue,
    Abort(ReconnectOutcome),
}

/// 学习方
pub struct Learner<'a, H: Hasher> {
    staging: &'a mut NodeIndex<H>,
    local: Option<&'a Snapshot<H>>,
    config: ReconnectConfig,
    cancel: Interrupt,
    cursor: Cursor,
    stats: ReconnectStats,
    leaf_count: u64,
}

impl<'a, H: Hasher> Learner<'a, H> {
    /// `staging` 必须是空索引；`local` 是学习方当前状态的快照
    pub fn new(
        staging: &'a mut NodeIndex<H>,
        local: Option<&'a Snapshot<H>>,
        config: ReconnectConfig,
        cancel: Interrupt,
    ) -> Self {
        Self {
            staging,
            local,
            config,
            cancel,
            cursor: Cursor::new(),
            stats: ReconnectStats::default(),
            leaf_count: 0,
        }
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats
    }

    /// 运行一次重连
    ///
    /// 成功时暂存索引包含与教学方逐位一致的树；其余结果下暂存索引的
    /// 内容没有意义，由调用方丢弃。
    pub fn run(&mut self, channel: Channel) -> Result<ReconnectOutcome> {
        let (mut sink, mut source) = channel.split();
        let timeout = self.config.request_timeout;
        if self.cancel.is_interrupted() {
            return Ok(ReconnectOutcome::Cancelled);
        }

        let start = Request {
            id: 0,
            deadline_ms: timeout.as_millis() as u64,
            body: RequestBody::Start,
        };
        if sink.send_frame(start.encode()?).is_err() {
            return Ok(ReconnectOutcome::Cancelled);
        }
        let frame = match source.recv_frame(timeout) {
            Ok(frame) => frame,
            Err(ChannelError::Timeout) => {
                warn!("No handshake response within {:?}", timeout);
                return Ok(ReconnectOutcome::Timeout);
            }
            Err(ChannelError::Disconnected) => return Ok(ReconnectOutcome::Cancelled),
        };
        let response = match Response::decode(&frame) {
            Ok(response) => response,
            Err(e) => {
                warn!("Undecodable handshake response: {}", e);
                return Ok(ReconnectOutcome::Cancelled);
            }
        };
        let (leaf_count, teacher_root) = match response.body {
            ResponseBody::Start {
                leaf_count,
                root_hash,
            } if response.id == 0 => (leaf_count, root_hash),
            other => {
                warn!("Unexpected handshake response: {}", describe(&other));
                return Ok(ReconnectOutcome::Cancelled);
            }
        };
        info!(
            "Learning {} leaves, teacher root {}",
            leaf_count,
            short_hex(&teacher_root)
        );
        self.leaf_count = leaf_count;
        self.staging.set_staged_leaf_count(leaf_count)?;

        if leaf_count > 0 {
            let (returned, flow) = self.traverse(sink, &mut *source)?;
            sink = returned;
            if let Flow::Abort(outcome) = flow {
                finish(&mut *sink);
                info!("Reconnect aborted: {:?}", outcome);
                return Ok(outcome);
            }
            debug_assert!(self.cursor.all_done());
        }
        finish(&mut *sink);

        let actual = self.staging.root_hash(true)?;
        info!(
            "Reconnect transferred {} leaves, reused {} ({} subtrees), {} requests",
            self.stats.leaves_transferred,
            self.stats.leaves_reused,
            self.stats.subtrees_reused,
            self.stats.requests_sent
        );
        if actual == teacher_root {
            Ok(ReconnectOutcome::Success { root_hash: actual })
        } else {
            warn!(
                "Reconnected tree hash {} differs from teacher {} ({} leaves, {} transferred, {} reused)",
                short_hex(&actual),
                short_hex(&teacher_root),
                leaf_count,
                self.stats.leaves_transferred,
                self.stats.leaves_reused
            );
            Ok(ReconnectOutcome::HashMismatch {
                expected: teacher_root,
                actual,
            })
        }
    }

    fn traverse(
        &mut self,
        sink: Box<dyn MessageSink>,
        source: &mut dyn MessageSource,
    ) -> Result<(Box<dyn MessageSink>, Flow)> {
        let timeout = self.config.request_timeout;
        let counter = BackpressureCounter::new(self.config.max_in_flight as u64);
        let pending: Mutex<VecDeque<Pending>> = Mutex::new(VecDeque::new());
        let abort = AtomicBool::new(false);
        let sent = AtomicU64::new(0);
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<(Path, RequestKind)>();

        let (sink, result) = thread::scope(|scope| {
            let sender = scope.spawn(|| {
                let mut sink = sink;
                let mut next_id = 1u64;
                for (path, kind) in work_rx.iter() {
                    if abort.load(Ordering::SeqCst) {
                        break;
                    }
                    counter.on_ramp();
                    if abort.load(Ordering::SeqCst) {
                        break;
                    }
                    let request = Request {
                        id: next_id,
                        deadline_ms: timeout.as_millis() as u64,
                        body: kind.body(path),
                    };
                    let frame = match request.encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Cannot encode request for path {}: {}", path, e);
                            abort.store(true, Ordering::SeqCst);
                            break;
                        }
                    };
                    pending.lock().push_back(Pending {
                        id: next_id,
                        path,
                        kind,
                        deadline: Instant::now() + timeout,
                    });
                    next_id += 1;
                    if sink.send_frame(frame).is_err() {
                        abort.store(true, Ordering::SeqCst);
                        break;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                }
                sink
            });

            let result = self.process(source, work_tx, &pending, &counter, &abort);
            if !matches!(result, Ok(Flow::Continue)) {
                abort.store(true, Ordering::SeqCst);
                // 唯一的 off_ramp 方是本线程，放行可能阻塞在 on_ramp 上的发送线程
                if counter.count() > 0 {
                    counter.off_ramp();
                }
            }
            let sink = sender
                .join()
                .unwrap_or_else(|e| std::panic::resume_unwind(e));
            (sink, result)
        });

        self.stats.requests_sent = sent.load(Ordering::SeqCst);
        Ok((sink, result?))
    }

    fn process(
        &mut self,
        source: &mut dyn MessageSource,
        work_tx: Sender<(Path, RequestKind)>,
        pending: &Mutex<VecDeque<Pending>>,
        counter: &BackpressureCounter,
        abort: &AtomicBool,
    ) -> Result<Flow> {
        let mut outstanding = 0u64;
        let root_kind = if self.local_hash(ROOT_PATH)?.is_some() {
            RequestKind::Hash
        } else {
            RequestKind::Node
        };
        self.enqueue(&work_tx, &mut outstanding, ROOT_PATH, root_kind);

        while outstanding > 0 {
            if self.cancel.is_interrupted() {
                info!("Reconnect cancelled by host");
                return Ok(Flow::Abort(ReconnectOutcome::Cancelled));
            }
            if abort.load(Ordering::SeqCst) {
                return Ok(Flow::Abort(ReconnectOutcome::Cancelled));
            }

            let front_deadline = pending.lock().front().map(|p| p.deadline);
            let wait = front_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(CANCEL_POLL)
                .min(CANCEL_POLL)
                .max(Duration::from_millis(1));

            let frame = match source.recv_frame(wait) {
                Ok(frame) => frame,
                Err(ChannelError::Timeout) => {
                    let expired = pending
                        .lock()
                        .front()
                        .filter(|p| Instant::now() >= p.deadline)
                        .map(Pending::describe);
                    if let Some(request) = expired {
                        warn!(
                            "{} missed its {:?} deadline; {}",
                            request,
                            self.config.request_timeout,
                            self.progress(outstanding)
                        );
                        return Ok(Flow::Abort(ReconnectOutcome::Timeout));
                    }
                    continue;
                }
                Err(ChannelError::Disconnected) => {
                    warn!(
                        "Teacher disconnected while {} was due; {}",
                        describe_front(pending),
                        self.progress(outstanding)
                    );
                    return Ok(Flow::Abort(ReconnectOutcome::Cancelled));
                }
            };

            let response = match Response::decode(&frame) {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Undecodable response while {} was due: {}; {}",
                        describe_front(pending),
                        e,
                        self.progress(outstanding)
                    );
                    return Ok(Flow::Abort(ReconnectOutcome::Cancelled));
                }
            };
            let entry = match pending.lock().pop_front() {
                Some(entry) if entry.id == response.id => entry,
                other => {
                    let due = other.as_ref().map_or_else(
                        || "no request".to_string(),
                        Pending::describe,
                    );
                    warn!(
                        "Response {} arrived while {} was due; {}",
                        response.id,
                        due,
                        self.progress(outstanding)
                    );
                    return Ok(Flow::Abort(ReconnectOutcome::Cancelled));
                }
            };
            counter.off_ramp();
            outstanding -= 1;
            self.stats.requests_answered += 1;

            if let Flow::Abort(outcome) =
                self.apply(entry, response.body, &work_tx, &mut outstanding)?
            {
                return Ok(Flow::Abort(outcome));
            }
        }
        Ok(Flow::Continue)
    }

    fn apply(
        &mut self,
        entry: Pending,
        body: ResponseBody,
        work_tx: &Sender<(Path, RequestKind)>,
        outstanding: &mut u64,
    ) -> Result<Flow> {
        let n = self.leaf_count;
        match (entry.kind, body) {
            (_, ResponseBody::Error(message)) => {
                warn!("Teacher failed {}: {}", entry.describe(), message);
                Ok(Flow::Abort(ReconnectOutcome::Cancelled))
            }
            (RequestKind::Hash, ResponseBody::Hash { path, hash }) if path == entry.path => {
                self.cursor.advance(path, CursorState::HashReceived);
                self.compare_and_descend(path, hash, work_tx, outstanding)
            }
            (RequestKind::Node, ResponseBody::Node { path, node }) if path == entry.path => {
                self.cursor.advance(path, CursorState::Applied);
                match node {
                    VirtualNode::Leaf { key, value } => {
                        if !path::is_leaf_path(path, n) {
                            return Ok(protocol_violation(path, "leaf"));
                        }
                        self.staging.stage_leaf(path, key, value)?;
                        self.stats.leaves_transferred += 1;
                    }
                    VirtualNode::Internal {
                        left_hash,
                        right_hash,
                    } => {
                        if !path::is_internal_path(path, n) {
                            return Ok(protocol_violation(path, "internal node"));
                        }
                        self.stats.internals_transferred += 1;
                        let children = [
                            (path::left_child(path), left_hash),
                            (path::right_child(path), right_hash),
                        ];
                        for (child, hash) in children {
                            if !path::exists(child, n) {
                                continue;
                            }
                            self.cursor.advance(child, CursorState::HashReceived);
                            if let Flow::Abort(outcome) =
                                self.compare_and_descend(child, hash, work_tx, outstanding)?
                            {
                                return Ok(Flow::Abort(outcome));
                            }
                        }
                    }
                }
                self.cursor.advance(path, CursorState::Done);
                Ok(Flow::Continue)
            }
            (_, body) => {
                warn!(
                    "Unexpected {} response to {}",
                    describe(&body),
                    entry.describe()
                );
                Ok(Flow::Abort(ReconnectOutcome::Cancelled))
            }
        }
    }

    /// 比较教学方的 hash 与本地 hash：一致则复用本地子树，否则索取节点
    fn compare_and_descend(
        &mut self,
        path: Path,
        teacher_hash: HashOutput,
        work_tx: &Sender<(Path, RequestKind)>,
        outstanding: &mut u64,
    ) -> Result<Flow> {
        if self.local_hash(path)? == Some(teacher_hash) {
            self.cursor.advance(path, CursorState::Matched);
            if let Flow::Abort(outcome) = self.reuse_local_subtree(path)? {
                return Ok(Flow::Abort(outcome));
            }
            self.cursor.advance(path, CursorState::Done);
            self.stats.subtrees_reused += 1;
        } else {
            self.cursor.advance(path, CursorState::Mismatched);
            self.enqueue(work_tx, outstanding, path, RequestKind::Node);
        }
        Ok(Flow::Continue)
    }

    fn reuse_local_subtree(&mut self, root: Path) -> Result<Flow> {
        let local = match self.local {
            Some(local) => local,
            None => return Ok(Flow::Continue),
        };
        let local_n = local.len();
        let mut stack = vec![root];
        while let Some(p) = stack.pop() {
            if path::is_leaf_path(p, local_n) {
                if !path::is_leaf_path(p, self.leaf_count) {
                    return Ok(protocol_violation(p, "reused leaf"));
                }
                let record = local.view().leaf_at(p)?.ok_or_else(|| {
                    MapError::Corrupt(format!("local snapshot has no leaf at path {}", p))
                })?;
                self.staging
                    .stage_leaf(p, record.key.clone(), record.value.clone())?;
                self.stats.leaves_reused += 1;
            } else if path::exists(p, local_n) {
                for child in [path::left_child(p), path::right_child(p)] {
                    if path::exists(child, local_n) {
                        stack.push(child);
                    }
                }
            }
        }
        debug!("Reused local subtree at path {}", root);
        Ok(Flow::Continue)
    }

    fn progress(&self, outstanding: u64) -> String {
        format!(
            "{} outstanding, {} answered, {} paths visited",
            outstanding,
            self.stats.requests_answered,
            self.cursor.visited()
        )
    }

    fn local_hash(&self, path: Path) -> Result<Option<HashOutput>> {
        match self.local {
            Some(local) => local.hash_at(path),
            None => Ok(None),
        }
    }

    fn enqueue(
        &mut self,
        work_tx: &Sender<(Path, RequestKind)>,
        outstanding: &mut u64,
        path: Path,
        kind: RequestKind,
    ) {
        match kind {
            RequestKind::Hash => {
                self.cursor.advance(path, CursorState::HashRequested);
                self.stats.hash_requests += 1;
            }
            RequestKind::Node => {
                self.cursor.advance(path, CursorState::NodeRequested);
                self.stats.node_requests += 1;
            }
        }
        *outstanding += 1;
        // 发送线程已退出时 abort 标志随后会终止处理循环
        let _ = work_tx.send((path, kind));
    }
}

fn finish(sink: &mut dyn MessageSink) {
    let request = Request {
        id: u64::MAX,
        deadline_ms: 0,
        body: RequestBody::Finish,
    };
    if let Ok(frame) = request.encode() {
        let _ = sink.send_frame(frame);
    }
}

fn protocol_violation(path: Path, what: &str) -> Flow {
    warn!(
        "Teacher tree inconsistent: unexpected {} at path {} (rank {})",
        what,
        path,
        path::rank(path)
    );
    Flow::Abort(ReconnectOutcome::Cancelled)
}

fn describe_front(pending: &Mutex<VecDeque<Pending>>) -> String {
    pending
        .lock()
        .front()
        .map_or_else(|| "no request".to_string(), Pending::describe)
}

fn describe(body: &ResponseBody) -> &'static str {
    match body {
        ResponseBody::Start { .. } => "start",
        ResponseBody::Hash { .. } => "hash",
        ResponseBody::Node { .. } => "node",
        ResponseBody::Error(_) => "error",
    }
}
