//! 集成测试共用的辅助函数

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use virtual_map::hash::{digest_internal, digest_leaf};
use virtual_map::{Blake3Hasher, VirtualMap, VirtualMapConfig, NULL_HASH};

pub fn init_logger() {
    let _ = env_logger::try_init();
}

/// 小 segment、少线程的测试配置
pub fn test_config(dir: &TempDir) -> VirtualMapConfig {
    VirtualMapConfig::new(dir.path().join("vmap"))
        .with_slot_size(128)
        .with_slots_per_segment(64)
        .with_hash_threads(2)
        .with_request_timeout(Duration::from_secs(5))
        .with_max_in_flight(16)
}

pub fn open_map(dir: &TempDir) -> VirtualMap {
    VirtualMap::open(test_config(dir)).unwrap()
}

pub fn key(i: u64) -> Vec<u8> {
    format!("key-{:06}", i).into_bytes()
}

pub fn value(i: u64) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

/// 写入 `keys` 中的每个 i
pub fn fill(map: &mut VirtualMap, keys: impl IntoIterator<Item = u64>) {
    for i in keys {
        map.put(&key(i), &value(i)).unwrap();
    }
}

/// 随机长度的 value
pub fn random_value(rng: &mut StdRng) -> Vec<u8> {
    let len = rng.gen_range(0..48);
    (0..len).map(|_| rng.gen()).collect()
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// map 的全部内容
pub fn contents(map: &VirtualMap) -> BTreeMap<Vec<u8>, Vec<u8>> {
    map.iter().map(|entry| entry.unwrap()).collect()
}

/// 按 path 顺序排列的叶子
pub fn leaves(map: &VirtualMap) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.iter().map(|entry| entry.unwrap()).collect()
}

/// 直接按定义计算一组叶子（按 path 顺序）的 root hash
///
/// 叶子 i 位于 path `first + i`，内部节点缺失的孩子取 `NULL_HASH`。
pub fn reference_root(leaves: &[(Vec<u8>, Vec<u8>)]) -> [u8; 32] {
    let n = leaves.len() as u64;
    if n == 0 {
        return NULL_HASH;
    }
    let first = if n == 1 { 1 } else { n - 1 };
    let last = if n == 1 { 1 } else { 2 * n - 2 };
    let mut hashes = vec![NULL_HASH; last as usize + 1];
    for (i, (k, v)) in leaves.iter().enumerate() {
        hashes[(first + i as u64) as usize] = digest_leaf::<Blake3Hasher>(k, v);
    }
    for p in (0..first).rev() {
        let left = hashes.get((2 * p + 1) as usize).copied().unwrap_or(NULL_HASH);
        let right = hashes.get((2 * p + 2) as usize).copied().unwrap_or(NULL_HASH);
        hashes[p as usize] = digest_internal::<Blake3Hasher>(&left, &right);
    }
    hashes[0]
}
