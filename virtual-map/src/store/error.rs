//! Hash 存储错误类型

use crate::path::Path;

/// Hash 存储错误类型
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// 序列化错误
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// 反序列化错误
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    /// 底层存储错误
    #[error("Storage error: {0}")]
    StorageError(String),
    /// 该 path 没有 hash
    #[error("Hash not found at path {0}")]
    NotFound(Path),
}

/// Hash 存储 Result 类型
pub type Result<T> = std::result::Result<T, StoreError>;
