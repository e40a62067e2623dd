//! 叶子记录与虚拟节点
//!
//! 叶子记录是 slot 中存放的唯一记录类型：`(path, key, value)`。
//! 内部节点不落盘，只有它们的 hash 存在 hash store 中；重连时内部节点
//! 以 [`VirtualNode::Internal`] 的形式携带左右孩子的 hash 传输。

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::{digest_internal, digest_leaf, HashOutput, Hasher};
use crate::path::Path;

/// slot 中存放的叶子记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRecord {
    pub path: Path,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafRecord {
    pub fn new(path: Path, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { path, key, value }
    }

    /// 移动到新的 path（key 与 value 不变）
    pub fn relocated(&self, path: Path) -> Self {
        Self {
            path,
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }

    /// 叶子 hash
    pub fn digest<H: Hasher>(&self) -> HashOutput {
        digest_leaf::<H>(&self.key, &self.value)
    }

    /// 序列化为 slot payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode_config().serialize(self)?)
    }

    /// 从 slot payload 反序列化
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode_config().deserialize(bytes)?)
    }

    /// 序列化后的长度
    pub fn encoded_len(&self) -> Result<u64> {
        Ok(bincode_config().serialized_size(self)?)
    }
}

/// 树中任意一个节点的传输形式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualNode {
    Leaf {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Internal {
        left_hash: HashOutput,
        right_hash: HashOutput,
    },
}

impl VirtualNode {
    /// 节点 hash
    pub fn digest<H: Hasher>(&self) -> HashOutput {
        match self {
            VirtualNode::Leaf { key, value } => digest_leaf::<H>(key, value),
            VirtualNode::Internal {
                left_hash,
                right_hash,
            } => digest_internal::<H>(left_hash, right_hash),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, VirtualNode::Leaf { .. })
    }
}

impl From<&LeafRecord> for VirtualNode {
    fn from(record: &LeafRecord) -> Self {
        VirtualNode::Leaf {
            key: record.key.clone(),
            value: record.value.clone(),
        }
    }
}

/// 记录与消息共用的 bincode 配置：定长整数、小端
pub(crate) fn bincode_config() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}
