//! 教学方：从一个被保留的快照应答请求

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::channel::{Channel, ChannelError};
use super::message::{Request, RequestBody, Response, ResponseBody};
use super::{ReconnectOutcome, ReconnectStats};
use crate::error::Result;
use crate::hash::{short_hex, Hasher};
use crate::index::Snapshot;

/// 教学方
///
/// 快照在整个会话期间被保留，不会被合并；会话在收到 `Finish`、链路断开
/// 或空闲超时后结束。
pub struct Teacher<H: Hasher> {
    snapshot: Snapshot<H>,
    idle_timeout: Duration,
    stats: ReconnectStats,
}

impl<H: Hasher> Teacher<H> {
    pub fn new(snapshot: Snapshot<H>, idle_timeout: Duration) -> Self {
        Self {
            snapshot,
            idle_timeout,
            stats: ReconnectStats::default(),
        }
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats
    }

    /// 阻塞地服务一次重连会话
    ///
    /// 存储故障以 `Err` 返回（返回前尽力通知学习方）；会话层面的结束
    /// 原因以 [`ReconnectOutcome`] 返回。
    pub fn serve(&mut self, channel: Channel) -> Result<ReconnectOutcome> {
        let (mut sink, mut source) = channel.split();
        let root_hash = self.snapshot.root_hash()?;
        let leaf_count = self.snapshot.len();
        info!(
            "Teaching version {}: {} leaves, root {}",
            self.snapshot.version_id(),
            leaf_count,
            short_hex(&root_hash)
        );

        loop {
            let frame = match source.recv_frame(self.idle_timeout) {
                Ok(frame) => frame,
                Err(ChannelError::Timeout) => {
                    warn!("Learner idle for {:?}, abandoning", self.idle_timeout);
                    return Ok(ReconnectOutcome::Timeout);
                }
                Err(ChannelError::Disconnected) => {
                    info!("Learner disconnected");
                    return Ok(ReconnectOutcome::Cancelled);
                }
            };
            let request = match Request::decode(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Undecodable request: {}", e);
                    return Ok(ReconnectOutcome::Cancelled);
                }
            };

            let started = Instant::now();
            let body = match request.body {
                RequestBody::Start => ResponseBody::Start {
                    leaf_count,
                    root_hash,
                },
                RequestBody::Hash(path) => {
                    self.stats.hash_requests += 1;
                    match self.snapshot.hash_at(path) {
                        Ok(Some(hash)) => ResponseBody::Hash { path, hash },
                        Ok(None) => ResponseBody::Error(format!("no node at path {}", path)),
                        Err(e) => {
                            let _ = send(&mut *sink, request.id, ResponseBody::Error(e.to_string()));
                            return Err(e);
                        }
                    }
                }
                RequestBody::Node(path) => {
                    self.stats.node_requests += 1;
                    match self.snapshot.node_at(path) {
                        Ok(Some(node)) => {
                            if node.is_leaf() {
                                self.stats.leaves_transferred += 1;
                            } else {
                                self.stats.internals_transferred += 1;
                            }
                            ResponseBody::Node { path, node }
                        }
                        Ok(None) => ResponseBody::Error(format!("no node at path {}", path)),
                        Err(e) => {
                            let _ = send(&mut *sink, request.id, ResponseBody::Error(e.to_string()));
                            return Err(e);
                        }
                    }
                }
                RequestBody::Finish => {
                    info!(
                        "Learner finished: {} hash requests, {} node requests",
                        self.stats.hash_requests, self.stats.node_requests
                    );
                    return Ok(ReconnectOutcome::Success { root_hash });
                }
            };

            if started.elapsed().as_millis() as u64 > request.deadline_ms {
                debug!(
                    "Request {} served after its {} ms deadline",
                    request.id, request.deadline_ms
                );
            }
            self.stats.requests_answered += 1;
            if send(&mut *sink, request.id, body)?.is_err() {
                info!("Learner disconnected");
                return Ok(ReconnectOutcome::Cancelled);
            }
        }
    }
}

fn send(
    sink: &mut dyn super::channel::MessageSink,
    id: u64,
    body: ResponseBody,
) -> Result<std::result::Result<(), ChannelError>> {
    let frame = Response { id, body }.encode()?;
    Ok(sink.send_frame(frame))
}
