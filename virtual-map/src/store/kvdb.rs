//! 基于 kvdb 的 hash 存储实现

#![cfg(feature = "kvdb-backend")]

use std::sync::Arc;

use kvdb::{DBTransaction, KeyValueDB};

use super::error::{Result, StoreError};
use super::traits::HashStore;
use crate::hash::HashOutput;
use crate::path::Path;

/// Key 前缀：节点 hash
const KEY_PREFIX_HASH: u8 = 0x02;

/// 基于 kvdb 的 hash 存储
///
/// Key 格式：`[0x02][path: 8B big-endian]`，big-endian 使同一 rank 的
/// path 在底层有序存储中相邻。
///
/// # 示例
///
/// ```ignore
/// let db = Arc::new(kvdb_memorydb::create(1));
/// let mut store = KvHashStore::new(db, 0);
/// ```
pub struct KvHashStore {
    db: Arc<dyn KeyValueDB>,
    col: u32,
}

impl KvHashStore {
    /// 创建新的 KvHashStore
    ///
    /// # 参数
    /// - `db`: kvdb 后端（RocksDB、内存等）
    /// - `col`: 使用的 column family
    pub fn new(db: Arc<dyn KeyValueDB>, col: u32) -> Self {
        Self { db, col }
    }

    /// 底层数据库
    pub fn backend(&self) -> &Arc<dyn KeyValueDB> {
        &self.db
    }

    fn make_key(path: Path) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = KEY_PREFIX_HASH;
        key[1..9].copy_from_slice(&path.to_be_bytes());
        key
    }
}

impl HashStore for KvHashStore {
    fn get_hash(&self, path: Path) -> Result<Option<HashOutput>> {
        match self.db.get(self.col, &Self::make_key(path)) {
            Ok(Some(bytes)) => {
                let hash: HashOutput = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::DeserializationError(format!(
                        "hash at path {} has {} bytes",
                        path,
                        bytes.len()
                    ))
                })?;
                Ok(Some(hash))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::StorageError(e.to_string())),
        }
    }

    fn put_hash(&mut self, path: Path, hash: &HashOutput) -> Result<()> {
        let mut tx = DBTransaction::new();
        tx.put(self.col, &Self::make_key(path), hash);
        self.db
            .write(tx)
            .map_err(|e| StoreError::StorageError(e.to_string()))
    }

    fn remove_hash(&mut self, path: Path) -> Result<()> {
        let mut tx = DBTransaction::new();
        tx.delete(self.col, &Self::make_key(path));
        self.db
            .write(tx)
            .map_err(|e| StoreError::StorageError(e.to_string()))
    }

    fn flush(&mut self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::StorageError(e.to_string()))
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
