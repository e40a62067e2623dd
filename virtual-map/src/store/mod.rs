//! Hash 存储抽象层
//!
//! 提供 `HashStore` trait 用于基础层节点 hash 的持久化存储和检索，
//! 以 path 为 key。实现：
//! - `MemoryHashStore`: 内存存储，用于测试
//! - `KvHashStore`: 基于 kvdb trait 的持久化存储（需要 `kvdb-backend` feature）
//! - `CachedHashStore`: 带 Write-Back 缓存的存储装饰器

mod cached;
mod error;
mod memory;
mod traits;

#[cfg(feature = "kvdb-backend")]
mod kvdb;


// Re-export 公开 API
pub use cached::{CacheStats, CachedHashStore};
pub use error::{Result, StoreError};
pub use memory::MemoryHashStore;
pub use traits::HashStore;

#[cfg(feature = "kvdb-backend")]
pub use kvdb::KvHashStore;
