//! Slot 存储错误类型

use std::path::PathBuf;

/// Slot 存储错误
///
/// 所有 I/O 失败都是致命的存储故障：直接向上传播给宿主，内部不重试。
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    /// 底层文件 I/O 失败
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 磁盘格式无法识别（magic 或 format version 不匹配）
    #[error("unsupported store format: magic {magic:?}, version {found} (expected {expected})")]
    FormatVersion {
        magic: [u8; 4],
        found: u32,
        expected: u32,
    },
    /// 磁盘上的 slot 几何参数与打开参数不一致
    #[error("slot geometry mismatch: on disk {on_disk:?}, requested {requested:?}")]
    Geometry {
        on_disk: (usize, u64),
        requested: (usize, u64),
    },
    /// 数据损坏（free list 成环、状态字节非法、segment 缺失等）
    #[error("corrupt slot store: {0}")]
    Corrupt(String),
    /// 记录超过 slot 容量
    #[error("record of {len} bytes exceeds slot capacity {capacity}")]
    RecordTooLarge { len: usize, capacity: usize },
    /// 元数据编解码失败
    #[error("metadata codec error: {0}")]
    Codec(String),
}

impl SlotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SlotError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Slot 存储 Result 类型
pub type Result<T> = std::result::Result<T, SlotError>;
