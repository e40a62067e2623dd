//! 树重连
//!
//! 学习方（落后的一方）从教学方（持有权威快照的一方）同步整棵树。
//! 双方自顶向下比较 hash，只有不一致的子树才会传输叶子；一致的子树
//! 直接从学习方自己的旧快照复制。结果写入一个全新的暂存索引，只有
//! 最终 root hash 与教学方一致时才替换学习方的状态。

mod channel;
mod cursor;
mod learner;
mod message;
mod teacher;

pub use channel::{
    memory_channel, Channel, ChannelError, LinkControl, MessageSink, MessageSource,
};
pub use cursor::{Cursor, CursorState};
pub use learner::Learner;
pub use message::{Request, RequestBody, Response, ResponseBody};
pub use teacher::Teacher;

use crate::hash::HashOutput;

/// 重连的结果
///
/// 会话层面的失败以结果值返回，不以 `Err` 返回；`Err` 只表示本地存储故障。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Success { root_hash: HashOutput },
    Timeout,
    HashMismatch {
        expected: HashOutput,
        actual: HashOutput,
    },
    Cancelled,
}

impl ReconnectOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReconnectOutcome::Success { .. })
    }
}

/// 重连统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectStats {
    pub requests_sent: u64,
    pub requests_answered: u64,
    pub hash_requests: u64,
    pub node_requests: u64,
    pub leaves_transferred: u64,
    pub internals_transferred: u64,
    /// hash 一致、从本地复制的子树数
    pub subtrees_reused: u64,
    pub leaves_reused: u64,
}

/// 本端在重连中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Teacher,
    Learner,
}
