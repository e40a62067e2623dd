//! 自底向上的 Merkle hashing
//!
//! 一次 hash pass 的输入是一个版本的脏 path 集合与叶子数量：
//!
//! 1. 把每个脏 path（若仍存在）及其所有存在的祖先加入待算集合
//! 2. 按 rank 从深到浅逐层计算：叶子用 `digest_leaf`，内部节点用
//!    `digest_internal(left, right)`，缺失的右孩子用 `NULL_HASH`
//! 3. 同一 rank 内的节点互不依赖，异步模式下用 rayon 线程池并行
//!
//! 子节点 hash 依次从本轮结果、版本链、基础层 hash 存储中读取。
//! 同步与异步两种模式对同一输入产生逐位相同的结果。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use rayon::prelude::*;

use crate::error::{MapError, Result};
use crate::hash::{digest_internal, digest_leaf, HashOutput, Hasher, NULL_HASH};
use crate::index::LeafRecord;
use crate::path::{self, Path, ROOT_PATH};
use crate::store::StoreError;

/// hash pass 读取树内容的接口
///
/// 由版本视图实现：`leaf` 返回 path 上的叶子记录，`stored_hash` 返回
/// 本轮之前已经算好的 hash。
pub trait NodeSource: Sync {
    fn leaf(&self, path: Path) -> Result<Option<Arc<LeafRecord>>>;

    fn stored_hash(&self, path: Path) -> Result<Option<HashOutput>>;
}

/// 一次 hash pass 的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HashStats {
    /// 输入的脏 path 数
    pub dirty_leaves: usize,
    /// 重新计算的叶子数
    pub leaves_hashed: usize,
    /// 重新计算的内部节点数
    pub internal_hashed: usize,
    /// 涉及的 rank 数
    pub ranks: usize,
    /// 本轮耗时
    pub duration: Duration,
}

/// hash pass 的结果
#[derive(Debug, Clone)]
pub struct HashPass {
    pub root: HashOutput,
    /// 本轮重新计算的 (path, hash)
    pub hashes: HashMap<Path, HashOutput>,
    pub stats: HashStats,
}

/// Merkle hasher
///
/// 持有一个专用 rayon 线程池，避免 hashing 与宿主的全局池互相抢占。
pub struct MerkleHasher<H: Hasher> {
    pool: rayon::ThreadPool,
    threads: usize,
    _hasher: PhantomData<H>,
}

impl<H: Hasher> MerkleHasher<H> {
    /// 创建 hasher，`threads` 为线程池大小
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("vmap-hash-{}", i))
            .build()
            .map_err(|e| MapError::Pool(e.to_string()))?;
        Ok(Self {
            pool,
            threads,
            _hasher: PhantomData,
        })
    }

    /// 线程池大小
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// 在调用线程上顺序计算
    pub fn hash_sync<S: NodeSource>(
        &self,
        source: &S,
        leaf_count: u64,
        dirty: &BTreeSet<Path>,
    ) -> Result<HashPass> {
        self.run(source, leaf_count, dirty, false)
    }

    /// 在线程池上逐 rank 并行计算
    pub fn hash_async<S: NodeSource>(
        &self,
        source: &S,
        leaf_count: u64,
        dirty: &BTreeSet<Path>,
    ) -> Result<HashPass> {
        self.run(source, leaf_count, dirty, true)
    }

    fn run<S: NodeSource>(
        &self,
        source: &S,
        leaf_count: u64,
        dirty: &BTreeSet<Path>,
        parallel: bool,
    ) -> Result<HashPass> {
        let start = Instant::now();
        let mut stats = HashStats {
            dirty_leaves: dirty.len(),
            ..HashStats::default()
        };

        if leaf_count == 0 {
            return Ok(HashPass {
                root: NULL_HASH,
                hashes: HashMap::new(),
                stats,
            });
        }
        if dirty.is_empty() {
            let root = source.stored_hash(ROOT_PATH)?.unwrap_or(NULL_HASH);
            return Ok(HashPass {
                root,
                hashes: HashMap::new(),
                stats,
            });
        }

        let by_rank = expand_dirty(dirty, leaf_count);
        stats.ranks = by_rank.len();

        let mut computed: HashMap<Path, HashOutput> = HashMap::new();
        for (rank, paths) in by_rank.iter().rev() {
            let results: Vec<(Path, HashOutput)> = if parallel && paths.len() > 1 {
                self.pool.install(|| {
                    paths
                        .par_iter()
                        .map(|&p| Ok((p, self.node_hash(source, &computed, leaf_count, p)?)))
                        .collect::<Result<Vec<_>>>()
                })?
            } else {
                paths
                    .iter()
                    .map(|&p| Ok((p, self.node_hash(source, &computed, leaf_count, p)?)))
                    .collect::<Result<Vec<_>>>()?
            };

            for &p in paths {
                if path::is_leaf_path(p, leaf_count) {
                    stats.leaves_hashed += 1;
                } else {
                    stats.internal_hashed += 1;
                }
            }
            trace!("Hashed rank {}: {} nodes", rank, results.len());
            computed.extend(results);
        }

        let root = computed
            .get(&ROOT_PATH)
            .copied()
            .ok_or(MapError::Store(StoreError::NotFound(ROOT_PATH)))?;
        stats.duration = start.elapsed();
        debug!(
            "{} hash pass ({}): {} dirty -> {} leaves, {} internals in {:?}",
            if parallel { "Async" } else { "Sync" },
            H::name(),
            stats.dirty_leaves,
            stats.leaves_hashed,
            stats.internal_hashed,
            stats.duration
        );

        Ok(HashPass {
            root,
            hashes: computed,
            stats,
        })
    }

    fn node_hash<S: NodeSource>(
        &self,
        source: &S,
        computed: &HashMap<Path, HashOutput>,
        leaf_count: u64,
        p: Path,
    ) -> Result<HashOutput> {
        if path::is_leaf_path(p, leaf_count) {
            let record = source
                .leaf(p)?
                .ok_or_else(|| MapError::Corrupt(format!("no leaf record at path {}", p)))?;
            return Ok(digest_leaf::<H>(&record.key, &record.value));
        }

        let left = child_hash(source, computed, leaf_count, path::left_child(p))?;
        let right = child_hash(source, computed, leaf_count, path::right_child(p))?;
        Ok(digest_internal::<H>(&left, &right))
    }
}

fn child_hash<S: NodeSource>(
    source: &S,
    computed: &HashMap<Path, HashOutput>,
    leaf_count: u64,
    child: Path,
) -> Result<HashOutput> {
    if !path::exists(child, leaf_count) {
        return Ok(NULL_HASH);
    }
    if let Some(hash) = computed.get(&child) {
        return Ok(*hash);
    }
    source
        .stored_hash(child)?
        .ok_or(MapError::Store(StoreError::NotFound(child)))
}

/// 脏 path 及其祖先，按 rank 分组
fn expand_dirty(dirty: &BTreeSet<Path>, leaf_count: u64) -> BTreeMap<u8, Vec<Path>> {
    let mut all: BTreeSet<Path> = BTreeSet::new();
    for &p in dirty {
        if path::exists(p, leaf_count) {
            all.insert(p);
        }
        for ancestor in path::ancestors(p) {
            if !path::exists(ancestor, leaf_count) {
                continue;
            }
            if !all.insert(ancestor) {
                break;
            }
        }
    }

    let mut by_rank: BTreeMap<u8, Vec<Path>> = BTreeMap::new();
    for p in all {
        by_rank.entry(path::rank(p)).or_default().push(p);
    }
    by_rank
}
