//! 版本化的节点索引
//!
//! 索引把 key 映射到隐式完全二叉树中的叶子 path，并维护每个版本的节点
//! hash。结构分两层：
//!
//! - **基础层**（[`BaseLayer`]）：落盘的 slot 存储与 hash 存储
//! - **版本链**：内存中尚未合并的写时复制版本，head 可写，其余冻结
//!
//! # 叶子布局
//!
//! N 个叶子恰好占据 path `first_leaf_path(N)..=last_leaf_path(N)`：
//!
//! - 插入：空树放在 path 1，一个叶子时放在 path 2；否则把 first 叶子下推
//!   到它的左孩子，新叶子放在它的右孩子
//! - 删除：last 叶子填进空洞，然后 last 的兄弟上提到父节点
//!
//! 每次移动都把涉及的 path 标记为脏，下一次 hash pass 只重算这些 path 及
//! 其祖先。

mod base;
mod record;
mod version;


use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

pub(crate) use base::BaseLayer;
pub use record::{LeafRecord, VirtualNode};
pub(crate) use record::bincode_config;
use version::{walk_chain, Version};

use crate::error::{MapError, Result};
use crate::hash::{HashOutput, Hasher, NULL_HASH};
use crate::merkle::{HashStats, MerkleHasher, NodeSource};
use crate::path::{self, Path, ROOT_PATH};
use crate::slot::{SlotError, SlotStore};
use crate::store::{HashStore, StoreError};

/// 所有版本共享的状态
pub(crate) struct IndexShared<H: Hasher> {
    base: RwLock<BaseLayer>,
    hasher: Arc<MerkleHasher<H>>,
    last_stats: Mutex<HashStats>,
    retired: AtomicBool,
}

impl<H: Hasher> IndexShared<H> {
    fn find_path(&self, version: &Arc<Version>, key: &[u8]) -> Option<Path> {
        match walk_chain(version, |d| d.keys.get(key).copied()) {
            Some(found) => found,
            None => self.base.read().path_of(key),
        }
    }

    fn find_leaf(&self, version: &Arc<Version>, path: Path) -> Result<Option<Arc<LeafRecord>>> {
        match walk_chain(version, |d| d.leaves.get(&path).cloned()) {
            Some(found) => Ok(found),
            None => self.base.read().leaf_at(path),
        }
    }

    fn find_hash(&self, version: &Arc<Version>, path: Path) -> Result<Option<HashOutput>> {
        match walk_chain(version, |d| d.hashes.get(&path).copied()) {
            Some(hash) => Ok(Some(hash)),
            None => self.base.read().hash_at(path),
        }
    }

    /// 确保版本已 hash，返回 root hash
    ///
    /// 先递归 hash 父版本（冻结版本的 hash 只算一次），再对本版本的脏
    /// path 运行一次 hash pass。
    fn ensure_hashed(&self, version: &Arc<Version>, parallel: bool) -> Result<HashOutput> {
        let _guard = version.hash_lock.lock();
        {
            let delta = version.delta.read();
            if delta.dirty.is_empty() {
                if let Some(root) = delta.root_hash {
                    return Ok(root);
                }
            }
        }
        if let Some(parent) = version.parent() {
            self.ensure_hashed(&parent, parallel)?;
        }

        let (leaf_count, dirty) = {
            let delta = version.delta.read();
            (delta.leaf_count, delta.dirty.clone())
        };
        let view = VersionView {
            shared: self,
            version,
        };
        let pass = if parallel {
            self.hasher.hash_async(&view, leaf_count, &dirty)?
        } else {
            self.hasher.hash_sync(&view, leaf_count, &dirty)?
        };

        let mut delta = version.delta.write();
        delta.hashes.extend(pass.hashes);
        delta.dirty.clear();
        delta.root_hash = Some(pass.root);
        *self.last_stats.lock() = pass.stats;
        Ok(pass.root)
    }
}

/// 某个版本上的只读视图
pub struct VersionView<'a, H: Hasher> {
    shared: &'a IndexShared<H>,
    version: &'a Arc<Version>,
}

impl<'a, H: Hasher> Clone for VersionView<'a, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, H: Hasher> Copy for VersionView<'a, H> {}

impl<'a, H: Hasher> VersionView<'a, H> {
    pub fn leaf_count(&self) -> u64 {
        self.version.leaf_count()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.shared.find_path(self.version, key) {
            Some(path) => Ok(self.leaf_at(path)?.map(|record| record.value.clone())),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.shared.find_path(self.version, key).is_some()
    }

    pub fn path_of(&self, key: &[u8]) -> Option<Path> {
        self.shared.find_path(self.version, key)
    }

    pub fn leaf_at(&self, path: Path) -> Result<Option<Arc<LeafRecord>>> {
        if !path::is_leaf_path(path, self.leaf_count()) {
            return Ok(None);
        }
        self.shared.find_leaf(self.version, path)
    }

    /// 按 path 顺序遍历所有叶子
    pub fn iter(&self) -> LeafIter<'a, H> {
        let n = self.leaf_count();
        LeafIter {
            view: *self,
            next: path::first_leaf_path(n),
            last: path::last_leaf_path(n),
        }
    }
}

impl<'a, H: Hasher> NodeSource for VersionView<'a, H> {
    fn leaf(&self, path: Path) -> Result<Option<Arc<LeafRecord>>> {
        self.shared.find_leaf(self.version, path)
    }

    fn stored_hash(&self, path: Path) -> Result<Option<HashOutput>> {
        self.shared.find_hash(self.version, path)
    }
}

/// 叶子迭代器，产出 `(key, value)`
pub struct LeafIter<'a, H: Hasher> {
    view: VersionView<'a, H>,
    next: Path,
    last: Path,
}

impl<'a, H: Hasher> Iterator for LeafIter<'a, H> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.view.leaf_count() == 0 || self.next > self.last {
            return None;
        }
        let path = self.next;
        self.next += 1;
        match self.view.leaf_at(path) {
            Ok(Some(record)) => Some(Ok((record.key.clone(), record.value.clone()))),
            Ok(None) => Some(Err(MapError::Corrupt(format!(
                "no leaf record at path {}",
                path
            )))),
            Err(e) => Some(Err(e)),
        }
    }
}

/// 索引的打开参数
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub max_unflushed_versions: usize,
    pub max_leaves: u64,
}

/// 版本化节点索引
///
/// 持有可写的 head 版本；`copy` 冻结 head 并返回一个 [`Snapshot`]。
/// 写操作需要 `&mut self`，保证单写者。
pub struct NodeIndex<H: Hasher> {
    shared: Arc<IndexShared<H>>,
    head: Arc<Version>,
    /// 已冻结、尚未合并的版本，最旧的在前
    history: VecDeque<Arc<Version>>,
    next_id: u64,
    options: IndexOptions,
    capacity_warned: bool,
}

impl<H: Hasher> NodeIndex<H> {
    /// 在已打开的存储上建立索引
    ///
    /// 持久化的 hash 不可用时（内存 hash store、未 sync 的 hash 状态），
    /// 所有叶子被标记为脏，第一次取 root hash 时全量重算。
    pub fn open(
        slots: SlotStore,
        hashes: Box<dyn HashStore>,
        hasher: Arc<MerkleHasher<H>>,
        options: IndexOptions,
    ) -> Result<Self> {
        let base = BaseLayer::open(slots, hashes)?;
        let leaf_count = base.leaf_count();
        let trusted = base.hashes_trusted()?;

        let head = Version::root(0, leaf_count);
        if !trusted {
            info!(
                "Persisted hashes unusable, scheduling full rehash of {} leaves",
                leaf_count
            );
            head.delta.write().dirty.extend(
                path::first_leaf_path(leaf_count)..=path::last_leaf_path(leaf_count),
            );
        }

        Ok(Self {
            shared: Arc::new(IndexShared {
                base: RwLock::new(base),
                hasher,
                last_stats: Mutex::new(HashStats::default()),
                retired: AtomicBool::new(false),
            }),
            head: Arc::new(head),
            history: VecDeque::new(),
            next_id: 1,
            options,
            capacity_warned: false,
        })
    }

    /// head 版本的只读视图
    pub fn view(&self) -> VersionView<'_, H> {
        VersionView {
            shared: &self.shared,
            version: &self.head,
        }
    }

    pub fn leaf_count(&self) -> u64 {
        self.head.leaf_count()
    }

    /// 尚未合并的冻结版本数
    pub fn unflushed_versions(&self) -> usize {
        self.history.len()
    }

    /// 是否有尚未 sync 的修改（head、冻结版本或已合并未落盘的内容）
    pub fn has_unsynced_changes(&self) -> bool {
        self.shared.base.read().unsynced_merges() > 0
            || self.head.delta.read().has_changes()
            || self.history.iter().any(|v| v.delta.read().has_changes())
    }

    /// 最近一次 hash pass 的统计
    pub fn last_hash_stats(&self) -> HashStats {
        *self.shared.last_stats.lock()
    }

    /// 插入或更新
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let head = Arc::clone(&self.head);
        let n = head.leaf_count();

        if let Some(path) = self.shared.find_path(&head, key) {
            let record = LeafRecord::new(path, key.to_vec(), value.to_vec());
            self.check_fits(&record)?;
            let mut delta = head.delta.write();
            delta.leaves.insert(path, Some(Arc::new(record)));
            delta.dirty.insert(path);
            return Ok(());
        }

        if n >= self.options.max_leaves {
            return Err(MapError::Full(n));
        }
        let target = path::last_leaf_path(n + 1);
        let record = LeafRecord::new(target, key.to_vec(), value.to_vec());
        self.check_fits(&record)?;
        self.warn_near_capacity(n + 1);

        if n >= 2 {
            let first = path::first_leaf_path(n);
            self.move_leaf(&head, first, path::left_child(first))?;
            debug_assert_eq!(path::right_child(first), target);
        }
        place_leaf(&head, record);
        head.delta.write().leaf_count = n + 1;
        Ok(())
    }

    /// 删除，返回旧值
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let head = Arc::clone(&self.head);
        let path = match self.shared.find_path(&head, key) {
            Some(path) => path,
            None => return Ok(None),
        };
        let record = self
            .shared
            .find_leaf(&head, path)?
            .ok_or_else(|| MapError::Corrupt(format!("key maps to empty path {}", path)))?;

        let n = head.leaf_count();
        let last = path::last_leaf_path(n);
        {
            let mut delta = head.delta.write();
            delta.keys.insert(key.to_vec(), None);
            delta.leaves.insert(path, None);
            delta.dirty.insert(path);
        }

        if path != last {
            self.move_leaf(&head, last, path)?;
        }
        let last_parent = path::parent(last);
        if last_parent != ROOT_PATH {
            self.move_leaf(&head, path::sibling(last), last_parent)?;
        }
        head.delta.write().leaf_count = n - 1;

        Ok(Some(record.value.clone()))
    }

    /// 冻结 head，返回其快照；新的 head 以它为父版本
    ///
    /// 冻结版本数超过上限时，合并最旧的已释放版本。
    pub fn copy(&mut self) -> Result<Snapshot<H>> {
        let frozen = Arc::clone(&self.head);
        frozen.freeze();
        let snapshot = Snapshot::new(Arc::clone(&self.shared), Arc::clone(&frozen));

        self.head = Arc::new(Version::child_of(&frozen, self.next_id));
        self.next_id += 1;
        self.history.push_back(frozen);
        debug!(
            "Copied version {} ({} unflushed)",
            snapshot.version_id(),
            self.history.len()
        );

        self.merge_released(false)?;
        Ok(snapshot)
    }

    /// head 的 root hash
    pub fn root_hash(&self, parallel: bool) -> Result<HashOutput> {
        self.shared.ensure_hashed(&self.head, parallel)
    }

    /// 合并所有已释放的冻结版本并刷盘，返回合并的版本数
    pub fn flush(&mut self) -> Result<usize> {
        let merged = self.merge_released(true)?;
        if !self.history.is_empty() {
            warn!(
                "{} versions still reserved, left unflushed",
                self.history.len()
            );
        }
        self.shared.base.write().sync()?;
        Ok(merged)
    }

    /// 把 head 的内容也合并落盘
    pub fn persist(&mut self) -> Result<()> {
        let snapshot = self.copy()?;
        drop(snapshot);
        self.flush()?;
        Ok(())
    }

    /// 标记为已退役（被重连替换），之后的快照仍可读
    pub fn retire(&self) {
        self.shared.retired.store(true, Ordering::Release);
    }

    pub fn set_codec_versions(&self, key_version: u32, value_version: u32) {
        self.shared
            .base
            .read()
            .set_codec_versions(key_version, value_version);
    }

    pub fn codec_versions(&self) -> (u32, u32) {
        self.shared.base.read().codec_versions()
    }

    // ========================================================================
    // 重连用：直接按 path 放置叶子
    // ========================================================================

    /// 设置空索引的叶子数量，之后用 `stage_leaf` 逐个放置
    pub(crate) fn set_staged_leaf_count(&mut self, leaf_count: u64) -> Result<()> {
        if self.leaf_count() != 0 {
            return Err(MapError::Corrupt(
                "staging requires an empty index".to_string(),
            ));
        }
        if leaf_count > self.options.max_leaves {
            return Err(MapError::Full(leaf_count));
        }
        self.head.delta.write().leaf_count = leaf_count;
        Ok(())
    }

    /// 把叶子放到指定 path
    pub(crate) fn stage_leaf(&mut self, path: Path, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if !path::is_leaf_path(path, self.leaf_count()) {
            return Err(MapError::Corrupt(format!(
                "path {} is not a leaf of a {}-leaf tree",
                path,
                self.leaf_count()
            )));
        }
        let record = LeafRecord::new(path, key, value);
        self.check_fits(&record)?;
        place_leaf(&self.head, record);
        Ok(())
    }

    // ========================================================================
    // 内部实现
    // ========================================================================

    fn move_leaf(&self, version: &Arc<Version>, from: Path, to: Path) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let record = self
            .shared
            .find_leaf(version, from)?
            .ok_or_else(|| MapError::Corrupt(format!("no leaf record at path {}", from)))?;

        let mut delta = version.delta.write();
        delta.keys.insert(record.key.clone(), Some(to));
        delta.leaves.insert(to, Some(Arc::new(record.relocated(to))));
        delta.leaves.insert(from, None);
        delta.dirty.insert(from);
        delta.dirty.insert(to);
        Ok(())
    }

    fn check_fits(&self, record: &LeafRecord) -> Result<()> {
        let len = record.encoded_len()? as usize;
        let capacity = self.shared.base.read().record_capacity();
        if len > capacity {
            return Err(MapError::Slot(SlotError::RecordTooLarge { len, capacity }));
        }
        Ok(())
    }

    fn warn_near_capacity(&mut self, leaf_count: u64) {
        let threshold = self.options.max_leaves - self.options.max_leaves / 10;
        if !self.capacity_warned && leaf_count >= threshold {
            warn!(
                "Virtual map at {} of {} leaves",
                leaf_count, self.options.max_leaves
            );
            self.capacity_warned = true;
        }
    }

    /// 从最旧处开始合并已释放的冻结版本
    ///
    /// `force` 为 false 时只合并超出上限的部分；遇到仍被保留的版本即停止。
    fn merge_released(&mut self, force: bool) -> Result<usize> {
        let mut merged = 0;
        while let Some(oldest) = self.history.front().cloned() {
            let over_limit = self.history.len() > self.options.max_unflushed_versions;
            if !(force || over_limit) || !oldest.is_released() {
                break;
            }

            self.shared.ensure_hashed(&oldest, true)?;
            {
                let delta = oldest.delta.read();
                self.shared.base.write().apply(&delta)?;
            }
            self.history.pop_front();
            match self.history.front() {
                Some(next) => next.detach(),
                None => self.head.detach(),
            }
            debug!("Merged version {} into base layer", oldest.id());
            merged += 1;
        }
        Ok(merged)
    }
}

/// 冻结版本的只读快照
///
/// 快照持有一次保留：被保留的版本不会被合并。Clone 增加一次保留，
/// drop 释放。
pub struct Snapshot<H: Hasher> {
    shared: Arc<IndexShared<H>>,
    version: Arc<Version>,
}

impl<H: Hasher> Snapshot<H> {
    fn new(shared: Arc<IndexShared<H>>, version: Arc<Version>) -> Self {
        debug_assert!(version.is_frozen(), "snapshot of a mutable version");
        version.reserve();
        Self { shared, version }
    }

    pub fn version_id(&self) -> u64 {
        self.version.id()
    }

    pub fn view(&self) -> VersionView<'_, H> {
        VersionView {
            shared: &self.shared,
            version: &self.version,
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.view().get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.view().contains_key(key)
    }

    pub fn len(&self) -> u64 {
        self.version.leaf_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> LeafIter<'_, H> {
        self.view().iter()
    }

    /// 快照的 root hash（首次调用时计算）
    pub fn root_hash(&self) -> Result<HashOutput> {
        self.shared.ensure_hashed(&self.version, true)
    }

    /// path 上节点的 hash；path 不存在时返回 `None`
    pub fn hash_at(&self, path: Path) -> Result<Option<HashOutput>> {
        if !path::exists(path, self.len()) {
            return Ok(None);
        }
        self.root_hash()?;
        match self.shared.find_hash(&self.version, path)? {
            Some(hash) => Ok(Some(hash)),
            None => Err(MapError::Store(StoreError::NotFound(path))),
        }
    }

    /// path 上节点的传输形式
    pub fn node_at(&self, path: Path) -> Result<Option<VirtualNode>> {
        let n = self.len();
        if !path::exists(path, n) {
            return Ok(None);
        }
        if path::is_leaf_path(path, n) {
            return Ok(self
                .view()
                .leaf_at(path)?
                .map(|record| VirtualNode::from(record.as_ref())));
        }
        let left_hash = self.hash_at(path::left_child(path))?.unwrap_or(NULL_HASH);
        let right_hash = self.hash_at(path::right_child(path))?.unwrap_or(NULL_HASH);
        Ok(Some(VirtualNode::Internal {
            left_hash,
            right_hash,
        }))
    }

    /// 所属索引是否已被重连替换
    pub fn is_retired(&self) -> bool {
        self.shared.retired.load(Ordering::Acquire)
    }

    /// 显式释放预留，等同于 drop
    pub fn release(self) {}
}

impl<H: Hasher> Clone for Snapshot<H> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.shared), Arc::clone(&self.version))
    }
}

impl<H: Hasher> Drop for Snapshot<H> {
    fn drop(&mut self) {
        self.version.release();
    }
}

impl<H: Hasher> fmt::Debug for Snapshot<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version.id())
            .field("leaves", &self.len())
            .finish()
    }
}

fn place_leaf(version: &Version, record: LeafRecord) {
    let path = record.path;
    let mut delta = version.delta.write();
    delta.keys.insert(record.key.clone(), Some(path));
    delta.leaves.insert(path, Some(Arc::new(record)));
    delta.dirty.insert(path);
}
