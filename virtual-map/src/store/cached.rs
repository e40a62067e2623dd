//! 带 Write-Back 缓存的 hash 存储
//!
//! - get 操作：先查缓存，未命中则读取底层存储并缓存（标记为 Clean）
//! - put/remove 操作：直接写入缓存（标记为 Dirty / Removed）
//! - flush 操作：将所有脏条目写入底层存储，然后清空缓存

use std::collections::HashMap;

use parking_lot::RwLock;

use super::error::Result;
use super::traits::HashStore;
use crate::hash::HashOutput;
use crate::path::Path;

/// 缓存条目状态
#[derive(Clone, Copy)]
enum CacheState {
    /// 从存储读取的干净数据（不需要写回）
    Clean(HashOutput),
    /// 新写入的脏数据（待持久化）
    Dirty(HashOutput),
    /// 待删除
    Removed,
}

impl CacheState {
    fn value(&self) -> Option<HashOutput> {
        match self {
            CacheState::Clean(v) | CacheState::Dirty(v) => Some(*v),
            CacheState::Removed => None,
        }
    }

    fn is_dirty(&self) -> bool {
        !matches!(self, CacheState::Clean(_))
    }
}

/// 缓存统计信息
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// 缓存命中次数
    pub hits: u64,
    /// 缓存未命中次数
    pub misses: u64,
    /// flush 时写入的 hash 数
    pub hashes_flushed: u64,
    /// flush 时删除的 hash 数
    pub hashes_removed: u64,
}

impl CacheStats {
    /// 缓存命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// 带 Write-Back 缓存的 hash 存储
///
/// 装饰器模式：包装任意 `HashStore` 实现，添加缓存层。合并一个版本会
/// 写入同一批祖先路径上的 hash，缓存把这些重复写合并成一次底层写入。
///
/// ```ignore
/// let kv_store = KvHashStore::new(db, 0);
/// let mut cached = CachedHashStore::new(kv_store);
/// cached.put_hash(path, &hash)?;
/// cached.flush()?;
/// ```
pub struct CachedHashStore<S: HashStore> {
    /// 底层存储
    inner: S,
    cache: RwLock<HashMap<Path, CacheState>>,
    stats: RwLock<CacheStats>,
}

impl<S: HashStore> CachedHashStore<S> {
    /// 创建带缓存的 hash 存储
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// 获取缓存统计的副本
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// 重置统计
    pub fn reset_stats(&self) {
        *self.stats.write() = CacheStats::default();
    }

    /// 当前缓存的条目数
    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// 获取底层存储的不可变引用
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: HashStore> HashStore for CachedHashStore<S> {
    fn get_hash(&self, path: Path) -> Result<Option<HashOutput>> {
        if let Some(state) = self.cache.read().get(&path) {
            self.stats.write().hits += 1;
            return Ok(state.value());
        }

        self.stats.write().misses += 1;
        let found = self.inner.get_hash(path)?;
        if let Some(hash) = found {
            self.cache.write().insert(path, CacheState::Clean(hash));
        }
        Ok(found)
    }

    fn put_hash(&mut self, path: Path, hash: &HashOutput) -> Result<()> {
        self.cache.write().insert(path, CacheState::Dirty(*hash));
        Ok(())
    }

    fn remove_hash(&mut self, path: Path) -> Result<()> {
        self.cache.write().insert(path, CacheState::Removed);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<(Path, CacheState)> = self
            .cache
            .read()
            .iter()
            .filter(|(_, state)| state.is_dirty())
            .map(|(path, state)| (*path, *state))
            .collect();
        dirty.sort_unstable_by_key(|(path, _)| *path);

        let mut written = 0u64;
        let mut removed = 0u64;
        for (path, state) in &dirty {
            match state {
                CacheState::Dirty(hash) => {
                    self.inner.put_hash(*path, hash)?;
                    written += 1;
                }
                CacheState::Removed => {
                    self.inner.remove_hash(*path)?;
                    removed += 1;
                }
                CacheState::Clean(_) => {}
            }
        }

        {
            let mut stats = self.stats.write();
            stats.hashes_flushed += written;
            stats.hashes_removed += removed;
        }

        self.cache.write().clear();
        self.inner.flush()
    }

    fn is_persistent(&self) -> bool {
        self.inner.is_persistent()
    }

    fn contains(&self, path: Path) -> Result<bool> {
        if let Some(state) = self.cache.read().get(&path) {
            return Ok(state.value().is_some());
        }
        self.inner.contains(path)
    }
}
