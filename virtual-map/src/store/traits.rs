//! HashStore trait 定义

use super::error::Result;
use crate::hash::HashOutput;
use crate::path::Path;

/// 按 path 存取节点 hash 的存储
///
/// 只保存已合并进基础层（base layer）的 hash；尚未合并的版本把 hash
/// 留在各自的 delta 中。所有实现必须满足 `Send + Sync`，hashing 线程池
/// 会并发读取。
///
/// # 核心操作
///
/// - `get_hash`: 读取 path 上的 hash
/// - `put_hash`: 覆盖写入 path 上的 hash
/// - `remove_hash`: 删除空出来的 path
/// - `flush`: 刷新缓冲区到持久化存储
pub trait HashStore: Send + Sync {
    /// 获取 hash
    ///
    /// # 返回
    /// - `Ok(Some(hash))`: 找到
    /// - `Ok(None)`: 该 path 没有 hash
    /// - `Err(_)`: 底层存储错误
    fn get_hash(&self, path: Path) -> Result<Option<HashOutput>>;

    /// 写入 hash（覆盖旧值）
    fn put_hash(&mut self, path: Path, hash: &HashOutput) -> Result<()>;

    /// 删除 hash；不存在时为空操作
    fn remove_hash(&mut self, path: Path) -> Result<()>;

    /// 刷新缓冲区
    ///
    /// 对于内存存储，此操作为空操作。
    fn flush(&mut self) -> Result<()>;

    /// 重启后内容是否仍然可用
    ///
    /// 返回 false 的存储在 reopen 时需要全量重算 hash。
    fn is_persistent(&self) -> bool {
        false
    }

    /// 检查 path 上是否有 hash
    fn contains(&self, path: Path) -> Result<bool> {
        Ok(self.get_hash(path)?.is_some())
    }
}

impl<S: HashStore + ?Sized> HashStore for Box<S> {
    fn get_hash(&self, path: Path) -> Result<Option<HashOutput>> {
        (**self).get_hash(path)
    }

    fn put_hash(&mut self, path: Path, hash: &HashOutput) -> Result<()> {
        (**self).put_hash(path, hash)
    }

    fn remove_hash(&mut self, path: Path) -> Result<()> {
        (**self).remove_hash(path)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_persistent(&self) -> bool {
        (**self).is_persistent()
    }

    fn contains(&self, path: Path) -> Result<bool> {
        (**self).contains(path)
    }
}
