//! Path 编码：隐式完全二叉树的位置 ↔ 整数 path
//!
//! 树按层（rank）从左到右编号：
//!
//! ```text
//!              0                rank 0
//!        1            2         rank 1
//!     3     4      5     6      rank 2
//! ```
//!
//! - `left_child(p) = 2p + 1`，`right_child(p) = 2p + 2`
//! - `rank(p) = floor(log2(p + 1))`
//! - `index_in_rank(p) = p + 1 - 2^rank`
//!
//! 所有函数都是 O(1) 的纯函数。负数在 u64 中无法表示；越界输入（如对
//! `INVALID_PATH` 求 child）属于调用方错误，仅由 debug 断言捕获。
//!
//! # 叶子区间
//!
//! N 个叶子的树恰好占据 path `0..=last_leaf_path(N)`：
//! 内部节点为 `0..first_leaf_path(N)`，叶子为 `first_leaf_path(N)..=last_leaf_path(N)`。
//! N = 1 时唯一的叶子挂在 root 的左侧（path 1），root 的右侧为空。

/// 节点在树中的位置
pub type Path = u64;

/// 根节点 path
pub const ROOT_PATH: Path = 0;

/// 无效 path 哨兵（root 的 parent / sibling，空树的叶子边界）
pub const INVALID_PATH: Path = u64::MAX;

/// 允许的最大 rank（保证 `2^(rank+1)` 不溢出）
pub const MAX_RANK: u8 = 62;

/// 是否为根节点
#[inline]
pub fn is_root(path: Path) -> bool {
    path == ROOT_PATH
}

/// 节点深度（root = 0）
#[inline]
pub fn rank(path: Path) -> u8 {
    debug_assert!(path != INVALID_PATH, "rank of INVALID_PATH");
    (63 - (path + 1).leading_zeros()) as u8
}

/// 节点在所在层中从 0 开始的偏移
#[inline]
pub fn index_in_rank(path: Path) -> u64 {
    debug_assert!(path != INVALID_PATH, "index_in_rank of INVALID_PATH");
    (path + 1) - (1u64 << rank(path))
}

/// 由 (rank, index) 计算 path
///
/// `index` 必须小于 `2^rank`。
#[inline]
pub fn path_for_rank_and_index(rank: u8, index: u64) -> Path {
    debug_assert!(rank <= MAX_RANK, "rank {} out of range", rank);
    debug_assert!(
        index < (1u64 << rank),
        "index {} out of range for rank {}",
        index,
        rank
    );
    (1u64 << rank) - 1 + index
}

/// 父节点；root 返回 `INVALID_PATH`
#[inline]
pub fn parent(path: Path) -> Path {
    debug_assert!(path != INVALID_PATH);
    if path == ROOT_PATH {
        INVALID_PATH
    } else {
        (path - 1) >> 1
    }
}

/// 左子节点
#[inline]
pub fn left_child(path: Path) -> Path {
    debug_assert!(rank(path) < MAX_RANK, "left_child overflow at {}", path);
    (path << 1) + 1
}

/// 右子节点
#[inline]
pub fn right_child(path: Path) -> Path {
    debug_assert!(rank(path) < MAX_RANK, "right_child overflow at {}", path);
    (path << 1) + 2
}

/// 是否为左子节点（root 不是）
#[inline]
pub fn is_left(path: Path) -> bool {
    path != ROOT_PATH && path & 1 == 1
}

/// 是否为右子节点（root 不是）
#[inline]
pub fn is_right(path: Path) -> bool {
    path != ROOT_PATH && path & 1 == 0
}

/// 兄弟节点；root 返回 `INVALID_PATH`
#[inline]
pub fn sibling(path: Path) -> Path {
    if path == ROOT_PATH {
        INVALID_PATH
    } else if is_left(path) {
        path + 1
    } else {
        path - 1
    }
}

/// 是否位于所在层的最右侧（root 也算）
#[inline]
pub fn is_far_right(path: Path) -> bool {
    (path + 2).is_power_of_two()
}

/// 是否位于所在层的最左侧（root 也算）
#[inline]
pub fn is_far_left(path: Path) -> bool {
    (path + 1).is_power_of_two()
}

// ============================================================================
// 由叶子数量推导的树形状
// ============================================================================

/// N 个叶子时第一个叶子的 path
#[inline]
pub fn first_leaf_path(leaf_count: u64) -> Path {
    match leaf_count {
        0 => INVALID_PATH,
        1 => 1,
        n => n - 1,
    }
}

/// N 个叶子时最后一个叶子的 path
#[inline]
pub fn last_leaf_path(leaf_count: u64) -> Path {
    match leaf_count {
        0 => INVALID_PATH,
        1 => 1,
        n => 2 * n - 2,
    }
}

/// 在 N 个叶子的树中，`path` 是否为叶子
#[inline]
pub fn is_leaf_path(path: Path, leaf_count: u64) -> bool {
    leaf_count > 0 && path >= first_leaf_path(leaf_count) && path <= last_leaf_path(leaf_count)
}

/// 在 N 个叶子的树中，`path` 是否为内部节点
#[inline]
pub fn is_internal_path(path: Path, leaf_count: u64) -> bool {
    leaf_count > 0 && path < first_leaf_path(leaf_count)
}

/// 在 N 个叶子的树中，`path` 是否存在
#[inline]
pub fn exists(path: Path, leaf_count: u64) -> bool {
    leaf_count > 0 && path <= last_leaf_path(leaf_count)
}

/// 从 `path` 向上直到 root 的祖先（不含自身）
pub fn ancestors(path: Path) -> impl Iterator<Item = Path> {
    let mut current = path;
    std::iter::from_fn(move || {
        if current == ROOT_PATH || current == INVALID_PATH {
            None
        } else {
            current = parent(current);
            Some(current)
        }
    })
}
