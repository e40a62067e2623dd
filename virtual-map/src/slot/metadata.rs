//! Slot 存储元数据文件 `store.meta`
//!
//! 元数据以 bincode 编码，写入时先写临时文件再 rename，保证 reopen 时
//! 要么看到旧版本、要么看到新版本。头部的 magic 与 format version 先于
//! 其余字段单独解码，版本不匹配时拒绝打开而不是误读。

use std::fs;
use std::io::Write;
use std::path::Path as FsPath;

use bincode::Options;
use serde::{Deserialize, Serialize};

use super::error::{Result, SlotError};
use super::Location;
use crate::hash::{HashOutput, NULL_HASH};
use crate::path::{Path, INVALID_PATH};

/// 元数据文件名
pub const META_FILE: &str = "store.meta";

/// 文件魔数
pub const STORE_MAGIC: [u8; 4] = *b"VMSS";

/// 当前磁盘格式版本
pub const FORMAT_VERSION: u32 = 2;

/// 单独解码的文件头
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct MetaHeader {
    magic: [u8; 4],
    format_version: u32,
}

/// Slot 存储元数据
///
/// 除分配器状态外，还记录树形状（叶子数量与叶子区间）以及 key/value
/// codec 版本，reopen 时据此校验并重建索引。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub magic: [u8; 4],
    pub format_version: u32,
    /// 单个 slot 的字节数（含 5 字节头）
    pub slot_size: u32,
    /// 每个 segment 文件的 slot 数
    pub slots_per_segment: u64,
    /// 曾经分配过的最大 slot 数（高水位）
    pub high_water: u64,
    /// 空闲 slot，末尾最先复用
    pub free_list: Vec<Location>,
    /// 叶子数量
    pub leaf_count: u64,
    pub first_leaf_path: Path,
    pub last_leaf_path: Path,
    pub key_codec_version: u32,
    pub value_codec_version: u32,
    /// 持久化的 hash store 是否与叶子一致（false 时 reopen 需全量重算）
    pub hashes_persisted: bool,
    /// sync 时的 root hash，reopen 时与 hash store 中的 root 比对
    pub root_hash: HashOutput,
}

impl StoreMetadata {
    /// 新建空存储的元数据
    pub fn new(slot_size: usize, slots_per_segment: u64) -> Self {
        Self {
            magic: STORE_MAGIC,
            format_version: FORMAT_VERSION,
            slot_size: slot_size as u32,
            slots_per_segment,
            high_water: 0,
            free_list: Vec::new(),
            leaf_count: 0,
            first_leaf_path: INVALID_PATH,
            last_leaf_path: INVALID_PATH,
            key_codec_version: 0,
            value_codec_version: 0,
            hashes_persisted: false,
            root_hash: NULL_HASH,
        }
    }

    /// 从目录读取元数据；文件不存在返回 `Ok(None)`
    pub fn load(dir: &FsPath) -> Result<Option<Self>> {
        let path = dir.join(META_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SlotError::io(path, e)),
        };

        let header: MetaHeader = bincode_options()
            .allow_trailing_bytes()
            .deserialize(&bytes)
            .map_err(|e| SlotError::Codec(e.to_string()))?;
        if header.magic != STORE_MAGIC || header.format_version != FORMAT_VERSION {
            return Err(SlotError::FormatVersion {
                magic: header.magic,
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }

        let meta: StoreMetadata = bincode_options()
            .deserialize(&bytes)
            .map_err(|e| SlotError::Codec(e.to_string()))?;
        Ok(Some(meta))
    }

    /// 原子地写入元数据（临时文件 + fsync + rename）
    pub fn store(&self, dir: &FsPath) -> Result<()> {
        let bytes = bincode_options()
            .serialize(self)
            .map_err(|e| SlotError::Codec(e.to_string()))?;

        let tmp = dir.join(format!("{}.tmp", META_FILE));
        let target = dir.join(META_FILE);
        {
            let mut file = fs::File::create(&tmp).map_err(|e| SlotError::io(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| SlotError::io(&tmp, e))?;
            file.sync_all().map_err(|e| SlotError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &target).map_err(|e| SlotError::io(&target, e))
    }
}

/// 元数据使用的 bincode 配置：定长整数、小端
fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = StoreMetadata::new(256, 1024);
        meta.high_water = 17;
        meta.free_list = vec![4, 11, 2];
        meta.leaf_count = 9;
        meta.hashes_persisted = true;

        meta.store(dir.path()).unwrap();
        let loaded = StoreMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_missing_meta_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StoreMetadata::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_format_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = StoreMetadata::new(256, 1024);
        meta.format_version = FORMAT_VERSION + 1;
        meta.store(dir.path()).unwrap();

        match StoreMetadata::load(dir.path()) {
            Err(SlotError::FormatVersion { found, .. }) => assert_eq!(found, FORMAT_VERSION + 1),
            other => panic!("expected FormatVersion error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = StoreMetadata::new(256, 1024);
        meta.magic = *b"NOPE";
        meta.store(dir.path()).unwrap();

        assert!(matches!(
            StoreMetadata::load(dir.path()),
            Err(SlotError::FormatVersion { .. })
        ));
    }
}
