//! Virtual merkle map：面向大规模状态的持久化、可认证 key-value map
//!
//! key 被映射到一棵隐式完全二叉树的叶子上，整棵树的 root hash 认证全部
//! 内容。树本身不在内存中：叶子记录存放在分页的 slot 存储里，内部节点只
//! 保留 hash。
//!
//! # 组成
//!
//! - **path**：节点编号（root = 0，孩子为 2p+1 / 2p+2）与树形状计算
//! - **slot**：定长 slot 的分页文件存储，侵入式 free list
//! - **store**：按 path 存放节点 hash 的存储（内存 / kvdb / 写回缓存）
//! - **index**：写时复制的版本链，`copy` 产生不可变快照，已释放的版本
//!   合并进落盘的基础层
//! - **merkle**：自底向上、按 rank 分层的增量 hash 计算（同步或线程池）
//! - **reconnect**：教学方 / 学习方协议，只传输 hash 不一致的子树
//! - **map**：对外门面 [`VirtualMap`]
//!
//! # 示例
//!
//! ```no_run
//! use virtual_map::{VirtualMap, VirtualMapConfig};
//!
//! let mut map: VirtualMap = VirtualMap::open(VirtualMapConfig::new("./vmap-data"))?;
//! map.put(b"alice", b"100")?;
//! let snapshot = map.copy()?;
//! map.put(b"alice", b"90")?;
//! assert_eq!(snapshot.get(b"alice")?, Some(b"100".to_vec()));
//! println!("root = {:?}", map.root_hash()?);
//! # Ok::<(), virtual_map::MapError>(())
//! ```

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod index;
pub mod map;
pub mod merkle;
pub mod path;
pub mod reconnect;
pub mod slot;
pub mod store;

// backpressure.rs 导出
pub use backpressure::{BackpressureCounter, Interrupt};

// codec.rs 导出
pub use codec::{BincodeCodec, Codec, TypedMap};

// config.rs 导出
pub use config::{ReconnectConfig, VirtualMapConfig};

// error.rs 导出
pub use error::{MapError, Result};

// hash.rs 导出
pub use hash::{Blake3Hasher, HashOutput, Hasher, Keccak256Hasher, NULL_HASH};

// index 导出
pub use index::{LeafRecord, NodeIndex, Snapshot, VirtualNode};

// map.rs 导出
pub use map::{HashStoreFactory, LearnerSession, VirtualMap};

// merkle.rs 导出
pub use merkle::{HashStats, MerkleHasher};

// path.rs 导出
pub use path::{Path, ROOT_PATH};

// reconnect 导出
pub use reconnect::{memory_channel, Channel, LinkControl, ReconnectOutcome, ReconnectStats, Role};

// store 导出
pub use store::{CacheStats, CachedHashStore, HashStore, MemoryHashStore, StoreError};

// kvdb-backend feature 启用时导出 KvHashStore
#[cfg(feature = "kvdb-backend")]
pub use store::KvHashStore;
