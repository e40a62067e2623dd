//! 写时复制的版本链
//!
//! 每个版本只记录相对于父版本的修改（[`Delta`]）。读操作从版本自身出发
//! 沿父链向上查找，直到命中或落到基础层。版本被 `copy` 冻结后不再修改；
//! 最旧的已释放版本合并进基础层后，它的子版本与之断开。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::record::LeafRecord;
use crate::hash::HashOutput;
use crate::path::Path;

/// 一个版本相对父版本的修改
///
/// `None` 条目表示删除（key 被移除、path 被空出）。
#[derive(Debug, Default)]
pub(crate) struct Delta {
    pub keys: HashMap<Vec<u8>, Option<Path>>,
    pub leaves: HashMap<Path, Option<Arc<LeafRecord>>>,
    /// 本版本各轮 hash pass 算出的 hash
    pub hashes: HashMap<Path, HashOutput>,
    /// 自上次 hash pass 以来被修改的 path
    pub dirty: BTreeSet<Path>,
    pub leaf_count: u64,
    /// 最近一次 hash pass 的 root；`dirty` 非空时已过期
    pub root_hash: Option<HashOutput>,
}

impl Delta {
    /// 是否修改过叶子或 key（只有脏标记不算）
    pub fn has_changes(&self) -> bool {
        !self.keys.is_empty() || !self.leaves.is_empty()
    }
}

pub(crate) struct Version {
    id: u64,
    pub delta: RwLock<Delta>,
    parent: RwLock<Option<Arc<Version>>>,
    frozen: AtomicBool,
    reservations: AtomicUsize,
    /// 串行化同一版本上的 hash pass
    pub hash_lock: Mutex<()>,
}

impl Version {
    /// 直接建立在基础层之上的版本
    pub fn root(id: u64, leaf_count: u64) -> Self {
        Self::new(id, leaf_count, None)
    }

    /// 以 `parent` 为父版本的新版本
    pub fn child_of(parent: &Arc<Version>, id: u64) -> Self {
        let leaf_count = parent.leaf_count();
        Self::new(id, leaf_count, Some(Arc::clone(parent)))
    }

    fn new(id: u64, leaf_count: u64, parent: Option<Arc<Version>>) -> Self {
        Self {
            id,
            delta: RwLock::new(Delta {
                leaf_count,
                ..Delta::default()
            }),
            parent: RwLock::new(parent),
            frozen: AtomicBool::new(false),
            reservations: AtomicUsize::new(0),
            hash_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn leaf_count(&self) -> u64 {
        self.delta.read().leaf_count
    }

    pub fn parent(&self) -> Option<Arc<Version>> {
        self.parent.read().clone()
    }

    /// 父版本已合并进基础层
    pub fn detach(&self) {
        *self.parent.write() = None;
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn reserve(&self) {
        self.reservations.fetch_add(1, Ordering::AcqRel);
    }

    /// 释放一次保留，返回剩余保留数
    pub fn release(&self) -> usize {
        let previous = self.reservations.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "release of unreserved version {}", self.id);
        previous - 1
    }

    pub fn is_released(&self) -> bool {
        self.reservations.load(Ordering::Acquire) == 0
    }
}

/// 沿版本链查找；`lookup` 返回 `Some` 即命中
///
/// 返回 `None` 表示整条链都未命中，调用方应继续查询基础层。
pub(crate) fn walk_chain<T>(
    version: &Arc<Version>,
    mut lookup: impl FnMut(&Delta) -> Option<T>,
) -> Option<T> {
    let mut current = Arc::clone(version);
    loop {
        let found = {
            let delta = current.delta.read();
            lookup(&delta)
        };
        if found.is_some() {
            return found;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}
