//! vmap-main 的命令行参数

use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;
use virtual_map::VirtualMapConfig;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "vmap-main", about = "Virtual merkle map workload driver")]
pub struct Options {
    /// 数据目录（运行前清空）
    #[structopt(long = "db-dir", default_value = "./__vmap_benchmark")]
    pub db_dir: PathBuf,

    /// slot 尺寸（字节）
    #[structopt(long, default_value = "256")]
    pub slot_size: usize,

    /// 每个 segment 文件的 slot 数
    #[structopt(long = "segment-slots", default_value = "65536")]
    pub segment_slots: u64,

    /// hashing 线程数，0 表示按 CPU 核数
    #[structopt(long, default_value = "0")]
    pub hash_threads: usize,

    /// 重连时同时在途的请求上限
    #[structopt(long, default_value = "256")]
    pub max_in_flight: usize,

    #[structopt(long = "request-timeout-ms", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// 写入的 key 数
    #[structopt(short = "k", long, default_value = "100000")]
    pub keys: u64,

    /// 删除区间 [remove_from, remove_to)
    #[structopt(long, default_value = "0")]
    pub remove_from: u64,

    #[structopt(long, default_value = "0")]
    pub remove_to: u64,

    /// 跳过重连阶段
    #[structopt(long)]
    pub no_reconnect: bool,

    /// 数据目录保留到运行结束后
    #[structopt(long)]
    pub keep_data: bool,
}

impl Options {
    /// 给定子目录名的 map 配置
    pub fn map_config(&self, name: &str) -> VirtualMapConfig {
        let mut config = VirtualMapConfig::new(self.db_dir.join(name))
            .with_slot_size(self.slot_size)
            .with_slots_per_segment(self.segment_slots)
            .with_max_in_flight(self.max_in_flight)
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms));
        if self.hash_threads > 0 {
            config = config.with_hash_threads(self.hash_threads);
        }
        config
    }

    pub fn removal_range(&self) -> std::ops::Range<u64> {
        self.remove_from..self.remove_to.max(self.remove_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let options = Options::from_iter(vec![
            "vmap-main",
            "--db-dir",
            "/tmp/vmap",
            "--keys",
            "1000",
            "--remove-from",
            "500",
            "--remove-to",
            "600",
            "--hash-threads",
            "3",
            "--no-reconnect",
        ]);
        assert_eq!(options.keys, 1000);
        assert_eq!(options.removal_range(), 500..600);
        assert!(options.no_reconnect);

        let config = options.map_config("teacher");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/vmap/teacher"));
        assert_eq!(config.hash_threads, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let options = Options::from_iter(vec!["vmap-main"]);
        assert_eq!(options.slot_size, 256);
        assert_eq!(options.removal_range(), 0..0);
        assert!(!options.no_reconnect);
        let config = options.map_config("m");
        assert_eq!(config.reconnect.request_timeout, Duration::from_secs(10));
    }
}
