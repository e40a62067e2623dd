//! Virtual map 顶层错误类型

use crate::slot::SlotError;
use crate::store::StoreError;

/// Virtual map 错误
///
/// 存储故障（slot / hash store）原样包装向上传播，map 不做重试。
/// 重连的结果（超时、hash 不一致、取消）不是错误，见 `ReconnectOutcome`。
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Slot 存储故障
    #[error("slot store fault: {0}")]
    Slot(#[from] SlotError),
    /// Hash 存储故障
    #[error("hash store fault: {0}")]
    Store(#[from] StoreError),
    /// 目录操作等通用 I/O 故障
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// 记录或消息编解码失败
    #[error("codec error: {0}")]
    Codec(String),
    /// 叶子数量达到上限
    #[error("virtual map is full ({0} leaves)")]
    Full(u64),
    /// 索引与磁盘内容不一致
    #[error("corrupt index: {0}")]
    Corrupt(String),
    /// 配置非法
    #[error("invalid configuration: {0}")]
    Config(String),
    /// 重连会话使用不当（重复开始、重复运行、未完成就提交）
    #[error("reconnect session error: {0}")]
    Reconnect(String),
    /// hashing 线程池无法创建
    #[error("hashing pool error: {0}")]
    Pool(String),
}

impl From<bincode::Error> for MapError {
    fn from(e: bincode::Error) -> Self {
        MapError::Codec(e.to_string())
    }
}

/// Virtual map Result 类型
pub type Result<T> = std::result::Result<T, MapError>;
