//! Virtual map 门面
//!
//! 数据目录布局：
//!
//! ```text
//! <data_dir>/CURRENT        当前代号（十进制文本）
//! <data_dir>/gen-000000/    slot 存储（segment 文件 + store.meta）
//! <data_dir>/gen-000001/    ...
//! ```
//!
//! 重连总是在下一代目录中建立暂存索引。成功时先把暂存索引落盘，再原子
//! 地改写 `CURRENT`，最后删除旧一代；失败时直接删除暂存目录。因此任何
//! 时刻崩溃，`CURRENT` 指向的都是一份完整的存储。
//!
//! 学习方会话（[`LearnerSession`]）独立于 map 运行，期间 map 照常读写；
//! 只有 [`VirtualMap::commit_reconnect`] 的切换需要独占 map。

use std::fs;
use std::io::Write;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::backpressure::Interrupt;
use crate::config::{ReconnectConfig, VirtualMapConfig};
use crate::error::{MapError, Result};
use crate::hash::{short_hex, Blake3Hasher, HashOutput, Hasher};
use crate::index::{IndexOptions, LeafIter, NodeIndex, Snapshot};
use crate::merkle::{HashStats, MerkleHasher};
use crate::reconnect::{Channel, Learner, ReconnectOutcome, ReconnectStats, Role, Teacher};
use crate::slot::SlotStore;
use crate::store::{HashStore, MemoryHashStore};

/// 当前代号文件
pub const CURRENT_FILE: &str = "CURRENT";

/// 为某一代存储创建 hash store
///
/// 参数为代号。同一时刻可能有两代同时打开（重连期间），工厂返回的
/// store 之间不能共享键空间。
pub type HashStoreFactory = Arc<dyn Fn(u64) -> Result<Box<dyn HashStore>> + Send + Sync>;

/// Virtual merkle map
pub struct VirtualMap<H: Hasher = Blake3Hasher> {
    config: VirtualMapConfig,
    hasher: Arc<MerkleHasher<H>>,
    hash_stores: HashStoreFactory,
    index: NodeIndex<H>,
    generation: u64,
    cancel: Interrupt,
    last_reconnect: ReconnectStats,
    /// 是否有未提交的学习方会话
    learning: Arc<AtomicBool>,
}

impl<H: Hasher> VirtualMap<H> {
    /// 打开 map，hash 保存在内存中（重新打开后全量重算）
    pub fn open(config: VirtualMapConfig) -> Result<Self> {
        let factory: HashStoreFactory = Arc::new(|_generation: u64| -> Result<Box<dyn HashStore>> {
            Ok(Box::new(MemoryHashStore::new()))
        });
        Self::open_with_hash_store(config, factory)
    }

    /// 打开 map，使用指定的 hash store
    pub fn open_with_hash_store(config: VirtualMapConfig, hash_stores: HashStoreFactory) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let generation = read_current(&config.data_dir)?.unwrap_or(0);
        remove_stale_generations(&config.data_dir, generation);

        let hasher = Arc::new(MerkleHasher::new(config.hash_threads)?);
        let index = open_index(&config, &hasher, &hash_stores, generation)?;
        if !config.data_dir.join(CURRENT_FILE).exists() {
            write_current(&config.data_dir, generation)?;
        }

        info!(
            "Opened virtual map at {} (generation {}, {} leaves, hasher {})",
            config.data_dir.display(),
            generation,
            index.leaf_count(),
            H::name()
        );
        Ok(Self {
            config,
            hasher,
            hash_stores,
            index,
            generation,
            cancel: Interrupt::new(),
            last_reconnect: ReconnectStats::default(),
            learning: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &VirtualMapConfig {
        &self.config
    }

    /// 当前存储的代号，每次成功的重连加一
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.index.view().get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.view().contains_key(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.index.put(key, value)
    }

    /// 删除，返回旧值
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.index.remove(key)
    }

    pub fn len(&self) -> u64 {
        self.index.leaf_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leaf_count(&self) -> u64 {
        self.index.leaf_count()
    }

    /// 按 path 顺序遍历 head 的 (key, value)
    pub fn iter(&self) -> LeafIter<'_, H> {
        self.index.view().iter()
    }

    /// 冻结当前状态并返回其快照，之后的修改不影响快照
    pub fn copy(&mut self) -> Result<Snapshot<H>> {
        self.index.copy()
    }

    /// head 的 root hash，在调用线程上计算
    pub fn root_hash(&self) -> Result<HashOutput> {
        self.index.root_hash(false)
    }

    /// head 的 root hash，在 hashing 线程池上计算
    pub fn hash_async(&self) -> Result<HashOutput> {
        self.index.root_hash(true)
    }

    pub fn last_hash_stats(&self) -> HashStats {
        self.index.last_hash_stats()
    }

    /// 尚未合并进基础层的冻结版本数
    pub fn unflushed_versions(&self) -> usize {
        self.index.unflushed_versions()
    }

    /// 合并所有已释放的冻结版本并刷盘，返回合并的版本数
    pub fn flush(&mut self) -> Result<usize> {
        self.index.flush()
    }

    /// 把当前状态（含 head）完整落盘
    pub fn sync(&mut self) -> Result<()> {
        self.index.persist()
    }

    /// 落盘并关闭
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        info!(
            "Closed virtual map at {} with {} leaves",
            self.config.data_dir.display(),
            self.len()
        );
        Ok(())
    }

    pub fn set_codec_versions(&self, key_version: u32, value_version: u32) {
        self.index.set_codec_versions(key_version, value_version);
    }

    pub fn codec_versions(&self) -> (u32, u32) {
        self.index.codec_versions()
    }

    /// 取消正在进行的学习方重连的句柄
    ///
    /// 标志在会话结束时清除。
    pub fn cancel_handle(&self) -> Interrupt {
        self.cancel.clone()
    }

    /// 最近一次重连的统计
    pub fn last_reconnect_stats(&self) -> ReconnectStats {
        self.last_reconnect
    }

    /// 以当前状态创建教学方，可移到其它线程上服务
    pub fn teacher(&mut self) -> Result<Teacher<H>> {
        let snapshot = self.copy()?;
        Ok(Teacher::new(snapshot, self.config.reconnect.request_timeout))
    }

    /// 在调用线程上进行一次重连
    ///
    /// 学习方只有在结果为 `Success` 时才会替换本地状态；其余结果下本地
    /// 状态保持不变。需要在重连期间继续读写时，改用
    /// [`begin_reconnect`](Self::begin_reconnect)。
    pub fn start_reconnect(&mut self, role: Role, channel: Channel) -> Result<ReconnectOutcome> {
        match role {
            Role::Teacher => {
                let mut teacher = self.teacher()?;
                let outcome = teacher.serve(channel);
                self.last_reconnect = teacher.stats();
                outcome
            }
            Role::Learner => {
                let mut session = self.begin_reconnect()?;
                match session.run(channel) {
                    Ok(_) => self.commit_reconnect(session),
                    Err(e) => {
                        self.last_reconnect = session.stats();
                        self.cancel.clear();
                        Err(e)
                    }
                }
            }
        }
    }

    /// 以当前状态为本地快照，在下一代目录中建立学习方会话
    ///
    /// 同一时刻只能有一个未提交的会话。
    pub fn begin_reconnect(&mut self) -> Result<LearnerSession<H>> {
        if self.learning.load(Ordering::SeqCst) {
            return Err(MapError::Reconnect(
                "a learner session is already in progress".to_string(),
            ));
        }
        let next = self.generation + 1;
        let dir = generation_dir(&self.config.data_dir, next);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let local = self.copy()?;
        let staging = open_index(&self.config, &self.hasher, &self.hash_stores, next)?;
        info!(
            "Reconnecting as learner into {} ({} local leaves)",
            dir.display(),
            local.len()
        );

        self.learning.store(true, Ordering::SeqCst);
        Ok(LearnerSession {
            staging: Some(staging),
            local,
            config: self.config.reconnect.clone(),
            cancel: self.cancel.clone(),
            dir,
            generation: next,
            outcome: None,
            stats: ReconnectStats::default(),
            learning: Arc::clone(&self.learning),
        })
    }

    /// 提交学习方会话
    ///
    /// `Success` 时把暂存索引落盘、改写 `CURRENT` 并切换过去，会话期间
    /// 在 map 上做的写入被教学方的状态取代；其余结果丢弃暂存目录，map
    /// 保持不变。未运行完的会话返回错误。
    pub fn commit_reconnect(&mut self, mut session: LearnerSession<H>) -> Result<ReconnectOutcome> {
        self.last_reconnect = session.stats;
        self.cancel.clear();
        let outcome = session.outcome.ok_or_else(|| {
            MapError::Reconnect("learner session has not completed".to_string())
        })?;
        if !outcome.is_success() {
            return Ok(outcome);
        }
        debug_assert_eq!(session.generation, self.generation + 1);

        let mut staging = session
            .staging
            .take()
            .ok_or_else(|| MapError::Reconnect("learner session already committed".to_string()))?;
        let (key_version, value_version) = self.index.codec_versions();
        staging.set_codec_versions(key_version, value_version);
        if let Err(e) = staging
            .persist()
            .and_then(|_| write_current(&self.config.data_dir, session.generation))
        {
            drop(staging);
            discard_generation(&session.dir);
            return Err(e);
        }

        let old = std::mem::replace(&mut self.index, staging);
        old.retire();
        drop(old);
        let old_dir = generation_dir(&self.config.data_dir, self.generation);
        self.generation = session.generation;
        drop(session);
        discard_generation(&old_dir);

        if let ReconnectOutcome::Success { root_hash } = outcome {
            info!(
                "Switched to generation {} with {} leaves, root {}",
                self.generation,
                self.len(),
                short_hex(&root_hash)
            );
        }
        Ok(outcome)
    }
}

impl<H: Hasher> Drop for VirtualMap<H> {
    fn drop(&mut self) {
        if self.index.has_unsynced_changes() {
            warn!(
                "Virtual map at {} dropped with unsynced changes, reopen restores the last sync",
                self.config.data_dir.display()
            );
        }
    }
}

/// 进行中的学习方会话
///
/// 会话拥有暂存索引和学习方开始时的本地快照，可以移到其它线程上运行。
/// 未提交就被 drop 的会话删除自己的暂存目录。
pub struct LearnerSession<H: Hasher = Blake3Hasher> {
    staging: Option<NodeIndex<H>>,
    local: Snapshot<H>,
    config: ReconnectConfig,
    cancel: Interrupt,
    dir: PathBuf,
    generation: u64,
    outcome: Option<ReconnectOutcome>,
    stats: ReconnectStats,
    learning: Arc<AtomicBool>,
}

impl<H: Hasher> LearnerSession<H> {
    /// 暂存索引的代号
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 运行结果；尚未运行或运行出错时为 `None`
    pub fn outcome(&self) -> Option<ReconnectOutcome> {
        self.outcome
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats
    }

    /// 与教学方完成一次重连，每个会话只能运行一次
    pub fn run(&mut self, channel: Channel) -> Result<ReconnectOutcome> {
        if self.outcome.is_some() {
            return Err(MapError::Reconnect(
                "learner session already ran".to_string(),
            ));
        }
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| MapError::Reconnect("learner session already committed".to_string()))?;
        let mut learner = Learner::new(
            staging,
            Some(&self.local),
            self.config.clone(),
            self.cancel.clone(),
        );
        let result = learner.run(channel);
        self.stats = learner.stats();
        let outcome = result?;
        self.outcome = Some(outcome);
        Ok(outcome)
    }
}

impl<H: Hasher> Drop for LearnerSession<H> {
    fn drop(&mut self) {
        if let Some(staging) = self.staging.take() {
            drop(staging);
            discard_generation(&self.dir);
        }
        self.learning.store(false, Ordering::SeqCst);
    }
}

fn open_index<H: Hasher>(
    config: &VirtualMapConfig,
    hasher: &Arc<MerkleHasher<H>>,
    hash_stores: &HashStoreFactory,
    generation: u64,
) -> Result<NodeIndex<H>> {
    let dir = generation_dir(&config.data_dir, generation);
    let slots = SlotStore::open(&dir, config.slot_size, config.slots_per_segment)?;
    let hashes = hash_stores(generation)?;
    NodeIndex::open(
        slots,
        hashes,
        Arc::clone(hasher),
        IndexOptions {
            max_unflushed_versions: config.max_unflushed_versions,
            max_leaves: config.max_leaves,
        },
    )
}

/// 某一代存储的目录
pub fn generation_dir(data_dir: &FsPath, generation: u64) -> PathBuf {
    data_dir.join(format!("gen-{:06}", generation))
}

fn read_current(data_dir: &FsPath) -> Result<Option<u64>> {
    let path = data_dir.join(CURRENT_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| MapError::Corrupt(format!("{} holds {:?}", path.display(), text)))
}

/// 原子地改写 CURRENT（临时文件 + fsync + rename）
fn write_current(data_dir: &FsPath, generation: u64) -> Result<()> {
    let tmp = data_dir.join(format!("{}.tmp", CURRENT_FILE));
    {
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{}", generation)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, data_dir.join(CURRENT_FILE))?;
    debug!("CURRENT now points at generation {}", generation);
    Ok(())
}

/// 删除非当前代的目录（上次重连中途退出的残留）
fn remove_stale_generations(data_dir: &FsPath, current: u64) {
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let current_dir = generation_dir(data_dir, current);
    for entry in entries.flatten() {
        let path = entry.path();
        let is_generation = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with("gen-"));
        if is_generation && path != current_dir {
            info!("Removing stale generation {}", path.display());
            discard_generation(&path);
        }
    }
}

fn discard_generation(dir: &FsPath) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("Failed to remove {}: {}", dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_current(dir.path()).unwrap(), None);
        write_current(dir.path(), 7).unwrap();
        assert_eq!(read_current(dir.path()).unwrap(), Some(7));
        write_current(dir.path(), 8).unwrap();
        assert_eq!(read_current(dir.path()).unwrap(), Some(8));
    }

    #[test]
    fn test_garbage_current_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CURRENT_FILE), "not a number").unwrap();
        assert!(matches!(
            read_current(dir.path()),
            Err(MapError::Corrupt(_))
        ));
    }

    #[test]
    fn test_stale_generations_removed() {
        let dir = tempfile::tempdir().unwrap();
        for generation in 0..3 {
            fs::create_dir_all(generation_dir(dir.path(), generation)).unwrap();
        }
        fs::create_dir_all(dir.path().join("unrelated")).unwrap();

        remove_stale_generations(dir.path(), 1);
        assert!(!generation_dir(dir.path(), 0).exists());
        assert!(generation_dir(dir.path(), 1).exists());
        assert!(!generation_dir(dir.path(), 2).exists());
        assert!(dir.path().join("unrelated").exists());
    }
}
