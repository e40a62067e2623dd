//! 学习方的逐 path 遍历状态
//!
//! ```text
//! NotVisited ─┬─> HashRequested ──> HashReceived ─┬─> Matched ──> Done
//!             ├─> HashReceived  (hash 随父节点一起到达) │
//!             └─> NodeRequested <─── Mismatched <──────┘
//!                       └──> Applied ──> Done
//! ```

use std::collections::HashMap;

use crate::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorState {
    NotVisited,
    HashRequested,
    HashReceived,
    Matched,
    Mismatched,
    NodeRequested,
    Applied,
    Done,
}

impl CursorState {
    /// 是否允许从 `self` 转移到 `next`
    pub fn can_advance_to(self, next: CursorState) -> bool {
        use CursorState::*;
        matches!(
            (self, next),
            (NotVisited, HashRequested)
                | (NotVisited, HashReceived)
                | (NotVisited, NodeRequested)
                | (HashRequested, HashReceived)
                | (HashReceived, Matched)
                | (HashReceived, Mismatched)
                | (Matched, Done)
                | (Mismatched, NodeRequested)
                | (NodeRequested, Applied)
                | (Applied, Done)
        )
    }
}

/// 已访问 path 的状态表
#[derive(Debug, Default)]
pub struct Cursor {
    states: HashMap<Path, CursorState>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, path: Path) -> CursorState {
        self.states
            .get(&path)
            .copied()
            .unwrap_or(CursorState::NotVisited)
    }

    /// 推进 path 的状态；非法转移返回 false 且不修改
    pub fn advance(&mut self, path: Path, next: CursorState) -> bool {
        let current = self.state(path);
        if !current.can_advance_to(next) {
            return false;
        }
        self.states.insert(path, next);
        true
    }

    /// 处于 `state` 的 path 数
    pub fn count(&self, state: CursorState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }

    /// 已访问的 path 数
    pub fn visited(&self) -> usize {
        self.states.len()
    }

    /// 所有已访问的 path 是否都已完成
    pub fn all_done(&self) -> bool {
        self.states.values().all(|s| *s == CursorState::Done)
    }
}
