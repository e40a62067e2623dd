//! Virtual map 配置

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};
use crate::slot::MIN_SLOT_SIZE;

/// 默认 slot 尺寸（字节）
pub const DEFAULT_SLOT_SIZE: usize = 256;
/// 默认每个 segment 的 slot 数
pub const DEFAULT_SLOTS_PER_SEGMENT: u64 = 65_536;
/// 默认叶子上限：2^40
pub const DEFAULT_MAX_LEAVES: u64 = 1 << 40;

/// 重连配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 单个请求的应答期限
    pub request_timeout: Duration,
    /// 同时在途的请求上限（背压容量）
    pub max_in_flight: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_in_flight: 256,
        }
    }
}

/// Virtual map 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMapConfig {
    /// 数据目录
    pub data_dir: PathBuf,
    /// 单个 slot 的字节数（含 5 字节头）
    pub slot_size: usize,
    /// 每个 segment 文件的 slot 数
    pub slots_per_segment: u64,
    /// hashing 线程数
    pub hash_threads: usize,
    /// 允许保留在内存中的已冻结版本数，超出后合并最旧的已释放版本
    pub max_unflushed_versions: usize,
    /// 叶子数量上限
    pub max_leaves: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for VirtualMapConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./vmap-data"),
            slot_size: DEFAULT_SLOT_SIZE,
            slots_per_segment: DEFAULT_SLOTS_PER_SEGMENT,
            hash_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_unflushed_versions: 2,
            max_leaves: DEFAULT_MAX_LEAVES,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl VirtualMapConfig {
    /// 以默认参数在 `data_dir` 下创建配置
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    pub fn with_slots_per_segment(mut self, slots: u64) -> Self {
        self.slots_per_segment = slots;
        self
    }

    pub fn with_hash_threads(mut self, threads: usize) -> Self {
        self.hash_threads = threads;
        self
    }

    pub fn with_max_unflushed_versions(mut self, versions: usize) -> Self {
        self.max_unflushed_versions = versions;
        self
    }

    pub fn with_max_leaves(mut self, max_leaves: u64) -> Self {
        self.max_leaves = max_leaves;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect.request_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.reconnect.max_in_flight = max_in_flight;
        self
    }

    /// 校验参数
    pub fn validate(&self) -> Result<()> {
        if self.slot_size < MIN_SLOT_SIZE || self.slot_size > u32::MAX as usize {
            return Err(MapError::Config(format!(
                "slot_size {} out of range (min {})",
                self.slot_size, MIN_SLOT_SIZE
            )));
        }
        if self.slots_per_segment == 0 {
            return Err(MapError::Config("slots_per_segment must be positive".into()));
        }
        if self.hash_threads == 0 {
            return Err(MapError::Config("hash_threads must be positive".into()));
        }
        if self.max_leaves == 0 || self.max_leaves > (1 << 62) {
            return Err(MapError::Config(format!(
                "max_leaves {} out of range",
                self.max_leaves
            )));
        }
        if self.reconnect.max_in_flight == 0 {
            return Err(MapError::Config("max_in_flight must be positive".into()));
        }
        if self.reconnect.request_timeout.is_zero() {
            return Err(MapError::Config("request_timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VirtualMapConfig::default();
        config.validate().unwrap();
        assert_eq!(config.slot_size, 256);
        assert_eq!(config.max_unflushed_versions, 2);
        assert_eq!(config.reconnect.max_in_flight, 256);
    }

    #[test]
    fn test_builders() {
        let config = VirtualMapConfig::new("/tmp/x")
            .with_slot_size(128)
            .with_hash_threads(2)
            .with_max_in_flight(8)
            .with_request_timeout(Duration::from_millis(50));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.slot_size, 128);
        assert_eq!(config.hash_threads, 2);
        assert_eq!(config.reconnect.max_in_flight, 8);
        assert_eq!(config.reconnect.request_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(VirtualMapConfig::default().with_slot_size(4).validate().is_err());
        assert!(VirtualMapConfig::default().with_hash_threads(0).validate().is_err());
        assert!(VirtualMapConfig::default().with_max_in_flight(0).validate().is_err());
        assert!(VirtualMapConfig::default().with_max_leaves(0).validate().is_err());
        assert!(VirtualMapConfig::default()
            .with_slots_per_segment(0)
            .validate()
            .is_err());
    }
}
