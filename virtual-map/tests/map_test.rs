//! VirtualMap 行为测试：读写、快照隔离、删除压缩与 hash

mod common;

use std::collections::BTreeMap;
use std::thread;

use rand::Rng;
use tempfile::tempdir;
use virtual_map::{MapError, NULL_HASH};

use common::*;

/// 测试：基本读写
#[test]
fn test_put_get_update_remove() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);

    assert!(map.is_empty());
    assert_eq!(map.root_hash().unwrap(), NULL_HASH);
    assert_eq!(map.get(b"missing").unwrap(), None);

    map.put(b"a", b"1").unwrap();
    map.put(b"b", b"2").unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(b"a").unwrap(), Some(b"1".to_vec()));

    map.put(b"a", b"one").unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(b"a").unwrap(), Some(b"one".to_vec()));

    assert_eq!(map.remove(b"a").unwrap(), Some(b"one".to_vec()));
    assert_eq!(map.remove(b"a").unwrap(), None);
    assert!(!map.contains_key(b"a"));
    assert!(map.contains_key(b"b"));
    assert_eq!(map.len(), 1);
}

/// 测试：空 key 与空 value 都是合法的
#[test]
fn test_empty_key_and_value() {
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);

    map.put(b"", b"").unwrap();
    map.put(b"k", b"").unwrap();
    assert_eq!(map.get(b"").unwrap(), Some(Vec::new()));
    assert_eq!(map.get(b"k").unwrap(), Some(Vec::new()));
    assert_eq!(map.root_hash().unwrap(), reference_root(&leaves(&map)));
}

/// 测试：root hash 与按定义计算的结果一致
#[test]
fn test_root_hash_matches_definition() {
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);

    for n in 1..=40u64 {
        map.put(&key(n), &value(n)).unwrap();
        assert_eq!(
            map.root_hash().unwrap(),
            reference_root(&leaves(&map)),
            "root hash mismatch at {} leaves",
            n
        );
    }
}

/// 测试：快照不受之后修改的影响
#[test]
fn test_copy_isolation() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    fill(&mut map, 0..50);

    let snapshot = map.copy().unwrap();
    let frozen_root = snapshot.root_hash().unwrap();
    let frozen_leaves: Vec<_> = snapshot.iter().map(|e| e.unwrap()).collect();

    map.put(&key(0), b"changed").unwrap();
    map.remove(&key(10)).unwrap();
    fill(&mut map, 50..80);

    assert_eq!(snapshot.len(), 50);
    assert_eq!(snapshot.get(&key(0)).unwrap(), Some(value(0)));
    assert_eq!(snapshot.get(&key(10)).unwrap(), Some(value(10)));
    assert_eq!(snapshot.get(&key(60)).unwrap(), None);
    assert_eq!(snapshot.root_hash().unwrap(), frozen_root);
    assert_eq!(reference_root(&frozen_leaves), frozen_root);

    assert_eq!(map.len(), 79);
    assert_eq!(map.get(&key(0)).unwrap(), Some(b"changed".to_vec()));
    assert_ne!(map.root_hash().unwrap(), frozen_root);
}

/// 测试：快照 clone 后两份都可读，全部释放后版本被合并
#[test]
fn test_snapshot_release_allows_merge() {
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    fill(&mut map, 0..10);

    let first = map.copy().unwrap();
    let second = first.clone();
    fill(&mut map, 10..20);
    drop(first);
    assert_eq!(second.len(), 10);

    for i in 20..30 {
        map.put(&key(i), &value(i)).unwrap();
        drop(map.copy().unwrap());
    }
    // 仍被保留的最旧版本阻止合并
    assert!(map.unflushed_versions() > 2);

    second.release();
    let merged = map.flush().unwrap();
    assert!(merged > 0);
    assert_eq!(map.unflushed_versions(), 0);
    assert_eq!(map.len(), 30);
    assert_eq!(map.root_hash().unwrap(), reference_root(&leaves(&map)));
}

/// 测试：写入方不断 put/remove/copy 并合并版本时，其它线程读取快照
#[test]
fn test_snapshot_readers_during_writes() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    let mut model = BTreeMap::new();
    let mut rng = rand::thread_rng();

    for round in 0..20u64 {
        for i in 0..25 {
            let k = rng.gen_range(0..200);
            if i % 4 == 3 {
                map.remove(&key(k)).unwrap();
                model.remove(&key(k));
            } else {
                let v = value(k + round * 1000);
                map.put(&key(k), &v).unwrap();
                model.insert(key(k), v);
            }
        }
        let snapshot = map.copy().unwrap();
        let expected = model.clone();

        thread::scope(|scope| {
            let readers: Vec<_> = (0..3)
                .map(|_| {
                    let snapshot = snapshot.clone();
                    let expected = &expected;
                    scope.spawn(move || {
                        let leaves: Vec<_> = snapshot.iter().map(|entry| entry.unwrap()).collect();
                        assert_eq!(leaves.len() as u64, snapshot.len());
                        let contents: BTreeMap<_, _> = leaves.iter().cloned().collect();
                        assert_eq!(&contents, expected);
                        assert_eq!(snapshot.root_hash().unwrap(), reference_root(&leaves));
                    })
                })
                .collect();

            // 读线程运行期间继续修改并触发合并
            for i in 0..10 {
                let k = 200 + round * 10 + i;
                map.put(&key(k), &value(k)).unwrap();
                model.insert(key(k), value(k));
                drop(map.copy().unwrap());
            }
            let gone = key(200 + round * 10);
            map.remove(&gone).unwrap();
            model.remove(&gone);

            for reader in readers {
                reader.join().unwrap();
            }
        });

        assert_eq!(snapshot.len() as usize, expected.len());
        drop(snapshot);
        // 最旧的预留释放后，下一次 copy 把积压的版本合并
        drop(map.copy().unwrap());
        assert!(map.unflushed_versions() <= 3);
    }

    map.flush().unwrap();
    assert_eq!(map.len() as usize, model.len());
    assert_eq!(contents(&map), model);
    assert_eq!(map.root_hash().unwrap(), reference_root(&leaves(&map)));
}

/// 测试：插入 1..=1000，删除 500..=600，剩余叶子紧密排列
#[test]
fn test_delete_range_keeps_tree_dense() {
    init_logger();
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    fill(&mut map, 1..=1000);
    let before = map.root_hash().unwrap();

    for i in 500..=600 {
        assert_eq!(map.remove(&key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(map.len(), 899);

    let remaining = leaves(&map);
    assert_eq!(remaining.len(), 899);
    for i in 1..=1000 {
        let expected = if (500..=600).contains(&i) {
            None
        } else {
            Some(value(i))
        };
        assert_eq!(map.get(&key(i)).unwrap(), expected, "key {}", i);
    }

    let root = map.root_hash().unwrap();
    assert_ne!(root, before);
    assert_eq!(root, reference_root(&remaining));
    assert_eq!(map.hash_async().unwrap(), root);
}

/// 测试：随机操作与 BTreeMap 模型一致，同步与并行 hash 一致
#[test]
fn test_random_operations_against_model() {
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    let mut model = BTreeMap::new();
    let mut rng = seeded(0x5eed);

    for round in 0..20 {
        for _ in 0..100 {
            let k = key(rng.gen_range(0..300));
            if rng.gen_bool(0.3) {
                assert_eq!(map.remove(&k).unwrap(), model.remove(&k));
            } else {
                let v = random_value(&mut rng);
                map.put(&k, &v).unwrap();
                model.insert(k, v);
            }
        }
        assert_eq!(map.len(), model.len() as u64);
        assert_eq!(contents(&map), model);

        let sync_root = map.root_hash().unwrap();
        assert_eq!(sync_root, reference_root(&leaves(&map)));
        if round % 3 == 0 {
            drop(map.copy().unwrap());
        }
    }
    assert_eq!(map.hash_async().unwrap(), map.root_hash().unwrap());
}

/// 测试：超出 slot 容量的记录被拒绝，map 不变
#[test]
fn test_oversized_record_rejected() {
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    fill(&mut map, 0..3);
    let root = map.root_hash().unwrap();

    let result = map.put(b"big", &vec![7u8; 1024]);
    assert!(matches!(result, Err(MapError::Slot(_))));
    assert_eq!(map.len(), 3);
    assert!(!map.contains_key(b"big"));
    assert_eq!(map.root_hash().unwrap(), root);
}

/// 测试：叶子数量上限
#[test]
fn test_max_leaves() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir).with_max_leaves(5);
    let mut map: virtual_map::VirtualMap = virtual_map::VirtualMap::open(config).unwrap();
    fill(&mut map, 0..5);

    assert!(matches!(map.put(&key(5), &value(5)), Err(MapError::Full(5))));
    // 更新已有 key 不受上限影响
    map.put(&key(0), b"updated").unwrap();
    map.remove(&key(1)).unwrap();
    map.put(&key(5), &value(5)).unwrap();
    assert_eq!(map.len(), 5);
}

/// 测试：hash 统计只覆盖脏路径
#[test]
fn test_incremental_hash_stats() {
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    fill(&mut map, 0..256);
    map.root_hash().unwrap();

    map.put(&key(3), b"touched").unwrap();
    map.root_hash().unwrap();
    let stats = map.last_hash_stats();
    assert_eq!(stats.leaves_hashed, 1);
    assert!(stats.internal_hashed <= 9);
}
