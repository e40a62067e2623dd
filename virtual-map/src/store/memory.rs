//! 内存 hash 存储实现

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::Result;
use super::traits::HashStore;
use crate::hash::HashOutput;
use crate::path::Path;

/// 内存 hash 存储
///
/// 使用 `HashMap` 存储，主要用于测试和不需要持久化 hash 的场景。
/// Clone 共享同一份底层数据。
pub struct MemoryHashStore {
    hashes: Arc<RwLock<HashMap<Path, HashOutput>>>,
}

impl MemoryHashStore {
    /// 创建空的内存存储
    pub fn new() -> Self {
        Self {
            hashes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 存储的 hash 数量
    pub fn len(&self) -> usize {
        self.hashes.read().len()
    }

    /// 检查存储是否为空
    pub fn is_empty(&self) -> bool {
        self.hashes.read().is_empty()
    }

    /// 清空所有数据
    pub fn clear(&mut self) {
        self.hashes.write().clear();
    }
}

impl Default for MemoryHashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryHashStore {
    fn clone(&self) -> Self {
        Self {
            hashes: Arc::clone(&self.hashes),
        }
    }
}

impl HashStore for MemoryHashStore {
    fn get_hash(&self, path: Path) -> Result<Option<HashOutput>> {
        Ok(self.hashes.read().get(&path).copied())
    }

    fn put_hash(&mut self, path: Path, hash: &HashOutput) -> Result<()> {
        self.hashes.write().insert(path, *hash);
        Ok(())
    }

    fn remove_hash(&mut self, path: Path) -> Result<()> {
        self.hashes.write().remove(&path);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // 内存存储无需刷新
        Ok(())
    }

    fn contains(&self, path: Path) -> Result<bool> {
        Ok(self.hashes.read().contains_key(&path))
    }
}
