//! 基础层：已合并版本的落盘状态
//!
//! 叶子记录存放在 [`SlotStore`] 中，key → path 与 path → slot 两张映射表
//! 常驻内存，打开时扫描所有在用 slot 重建。内部节点与叶子的 hash 存放
//! 在 [`HashStore`] 中。

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use super::record::LeafRecord;
use super::version::Delta;
use crate::error::{MapError, Result};
use crate::hash::{HashOutput, NULL_HASH};
use crate::path::{self, Path, ROOT_PATH};
use crate::slot::{Location, SlotStore, TreeState};
use crate::store::HashStore;

pub(crate) struct BaseLayer {
    slots: SlotStore,
    keys: HashMap<Vec<u8>, Path>,
    locations: HashMap<Path, Location>,
    hashes: Box<dyn HashStore>,
    leaf_count: u64,
    root_hash: HashOutput,
    /// 上次 sync 以来合并的版本数
    unsynced_merges: usize,
}

impl BaseLayer {
    /// 扫描 slot 存储重建内存映射
    pub fn open(slots: SlotStore, hashes: Box<dyn HashStore>) -> Result<Self> {
        let state = slots.tree_state();
        let root_hash = slots.metadata().root_hash;
        let mut keys = HashMap::new();
        let mut locations = HashMap::new();

        for loc in slots.used_locations() {
            let record = LeafRecord::from_bytes(&slots.read(loc)?)?;
            if !path::is_leaf_path(record.path, state.leaf_count) {
                return Err(MapError::Corrupt(format!(
                    "slot {} holds path {} outside the leaf range of {} leaves",
                    loc, record.path, state.leaf_count
                )));
            }
            if locations.insert(record.path, loc).is_some() {
                return Err(MapError::Corrupt(format!(
                    "path {} stored in more than one slot",
                    record.path
                )));
            }
            if keys.insert(record.key, record.path).is_some() {
                return Err(MapError::Corrupt(format!(
                    "duplicate key at path {}",
                    record.path
                )));
            }
        }

        if locations.len() as u64 != state.leaf_count {
            return Err(MapError::Corrupt(format!(
                "metadata records {} leaves, found {}",
                state.leaf_count,
                locations.len()
            )));
        }

        info!(
            "Loaded base layer from {}: {} leaves",
            slots.dir().display(),
            state.leaf_count
        );
        Ok(Self {
            slots,
            keys,
            locations,
            hashes,
            leaf_count: state.leaf_count,
            root_hash,
            unsynced_merges: 0,
        })
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// slot 可容纳的最大记录长度
    pub fn record_capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn path_of(&self, key: &[u8]) -> Option<Path> {
        self.keys.get(key).copied()
    }

    pub fn leaf_at(&self, path: Path) -> Result<Option<Arc<LeafRecord>>> {
        let loc = match self.locations.get(&path) {
            Some(loc) => *loc,
            None => return Ok(None),
        };
        let record = LeafRecord::from_bytes(&self.slots.read(loc)?)?;
        if record.path != path {
            return Err(MapError::Corrupt(format!(
                "slot {} mapped to path {} holds path {}",
                loc, path, record.path
            )));
        }
        Ok(Some(Arc::new(record)))
    }

    pub fn hash_at(&self, path: Path) -> Result<Option<HashOutput>> {
        Ok(self.hashes.get_hash(path)?)
    }

    /// 持久化的 hash 能否直接使用（否则需要全量重算）
    pub fn hashes_trusted(&self) -> Result<bool> {
        if self.leaf_count == 0 {
            return Ok(true);
        }
        let meta = self.slots.metadata();
        if !meta.hashes_persisted || !self.hashes.is_persistent() {
            return Ok(false);
        }
        Ok(self.hashes.get_hash(ROOT_PATH)? == Some(meta.root_hash))
    }

    /// 合并一个已 hash 的版本
    ///
    /// 上次 sync 时在用的 slot 不会被原地覆盖：新内容写入新分配的 slot，
    /// 旧 slot 交给 [`SlotStore::free`] 延迟回收，保证 reopen 仍能读到上次
    /// sync 的完整状态。
    pub fn apply(&mut self, delta: &Delta) -> Result<()> {
        let old_count = self.leaf_count;

        let mut leaves: Vec<_> = delta.leaves.iter().collect();
        leaves.sort_unstable_by_key(|(path, _)| **path);
        let mut written = 0usize;
        let mut freed = 0usize;
        for (path, entry) in leaves {
            match entry {
                Some(record) => {
                    let bytes = record.to_bytes()?;
                    let previous = self.locations.get(path).copied();
                    let loc = match previous {
                        Some(loc) if self.slots.is_fresh(loc) => loc,
                        _ => self.slots.new_slot()?,
                    };
                    self.slots.write(loc, &bytes)?;
                    if let Some(old) = previous.filter(|old| *old != loc) {
                        self.slots.free(old)?;
                    }
                    self.locations.insert(*path, loc);
                    written += 1;
                }
                None => {
                    if let Some(loc) = self.locations.remove(path) {
                        self.slots.free(loc)?;
                        freed += 1;
                    }
                }
            }
        }

        for (key, entry) in &delta.keys {
            match entry {
                Some(path) => {
                    self.keys.insert(key.clone(), *path);
                }
                None => {
                    self.keys.remove(key);
                }
            }
        }

        // ROOT 先于其它 hash 改写，reopen 时据它判断 hash store 是否仍是上次
        // sync 的状态
        match delta.hashes.get(&ROOT_PATH) {
            Some(root) if delta.leaf_count > 0 => self.hashes.put_hash(ROOT_PATH, root)?,
            _ if delta.leaf_count == 0 && old_count > 0 => self.hashes.remove_hash(ROOT_PATH)?,
            _ => {}
        }
        for (path, hash) in &delta.hashes {
            if *path != ROOT_PATH && path::exists(*path, delta.leaf_count) {
                self.hashes.put_hash(*path, hash)?;
            }
        }
        if old_count > delta.leaf_count {
            let start = if delta.leaf_count == 0 {
                ROOT_PATH
            } else {
                path::last_leaf_path(delta.leaf_count) + 1
            };
            for vacated in start..=path::last_leaf_path(old_count) {
                self.hashes.remove_hash(vacated)?;
            }
        }

        self.leaf_count = delta.leaf_count;
        self.root_hash = delta.root_hash.unwrap_or(NULL_HASH);
        self.unsynced_merges += 1;
        self.slots.set_tree_state(TreeState {
            leaf_count: delta.leaf_count,
            first_leaf_path: path::first_leaf_path(delta.leaf_count),
            last_leaf_path: path::last_leaf_path(delta.leaf_count),
        });

        debug!(
            "Merged delta: {} records written, {} slots freed, {} hashes, {} leaves",
            written,
            freed,
            delta.hashes.len(),
            self.leaf_count
        );
        Ok(())
    }

    /// 刷盘：hash store 先于 slot 元数据
    pub fn sync(&mut self) -> Result<()> {
        self.hashes.flush()?;
        self.slots
            .set_hash_state(self.hashes.is_persistent(), self.root_hash);
        self.slots.sync()?;
        self.unsynced_merges = 0;
        Ok(())
    }

    pub fn unsynced_merges(&self) -> usize {
        self.unsynced_merges
    }

    pub fn set_codec_versions(&self, key_version: u32, value_version: u32) {
        self.slots.set_codec_versions(key_version, value_version);
    }

    pub fn codec_versions(&self) -> (u32, u32) {
        let meta = self.slots.metadata();
        (meta.key_codec_version, meta.value_codec_version)
    }
}
