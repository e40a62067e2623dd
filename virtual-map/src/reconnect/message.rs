//! 重连消息
//!
//! 每条请求带一个 id 与应答期限，teacher 按请求到达的顺序应答。
//! 消息在传输层上是 bincode 编码的字节帧。

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::HashOutput;
use crate::index::{bincode_config, VirtualNode};
use crate::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    /// 握手：索取叶子数量与 root hash
    Start,
    /// 索取 path 上的 hash
    Hash(Path),
    /// 索取 path 上的节点；内部节点连同左右孩子的 hash 一起返回
    Node(Path),
    /// 学习方已收到全部数据
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// 发送方给出的应答期限（毫秒）
    pub deadline_ms: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    Start { leaf_count: u64, root_hash: HashOutput },
    Hash { path: Path, hash: HashOutput },
    Node { path: Path, node: VirtualNode },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub body: ResponseBody,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode_config().serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode_config().deserialize(bytes)?)
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode_config().serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode_config().deserialize(bytes)?)
    }
}
