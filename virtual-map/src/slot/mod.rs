//! 分页 Slot 存储
//!
//! 定长 slot 平铺在若干 segment 文件（`segment-NNNNNN.dat`）中，通过全局
//! slot 编号（[`Location`]）寻址。每个 slot 的布局：
//!
//! ```text
//! [status: 1B][len: u32 LE][payload: len bytes][padding]
//! ```
//!
//! - `status = STATUS_USED`：payload 为一条记录
//! - `status = STATUS_FREE`：payload 为空
//!
//! 分配优先复用 free list 尾部（LIFO），其次推进高水位；free list 本身
//! 随 `store.meta` 一起落盘。分配器状态由一把 `parking_lot::Mutex` 保护，
//! 读写本身使用 positional I/O，不同 slot 之间的读写互不阻塞。
//!
//! # 持久性
//!
//! reopen 看到的总是最近一次 [`SlotStore::sync`] 时的状态：
//!
//! - 上次 sync 时在用的 slot 被释放后进入待回收列表，下一次元数据落盘
//!   之后才会被复用，在此之前其内容保持不变
//! - 上次 sync 之后分配的 slot 在 reopen 时按元数据判定为空闲，内容被忽略
//!
//! 因此只要调用方不原地覆盖已 sync 的 slot（[`SlotStore::is_fresh`] 为
//! false 的位置），两次 sync 之间的任意时刻退出都不会损坏上次 sync 的状态。

mod error;
mod metadata;


use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

pub use error::{Result, SlotError};
pub use metadata::{StoreMetadata, FORMAT_VERSION, META_FILE, STORE_MAGIC};

use crate::hash::HashOutput;
use crate::path::Path;

/// 全局 slot 编号
pub type Location = u64;

/// slot 头长度：status(1) + len(4)
pub const SLOT_HEADER_LEN: usize = 5;

const STATUS_USED: u8 = 0x01;
const STATUS_FREE: u8 = 0x02;

/// 最小 slot 尺寸：头 + 8 字节 payload
pub const MIN_SLOT_SIZE: usize = SLOT_HEADER_LEN + 8;

/// 树形状快照，随元数据一起持久化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    pub leaf_count: u64,
    pub first_leaf_path: Path,
    pub last_leaf_path: Path,
}

/// 分配器状态
struct Allocator {
    high_water: u64,
    /// 可立即复用的 slot，栈顶最先复用
    free: Vec<Location>,
    free_set: HashSet<Location>,
    /// 上次 sync 之后分配的 slot，可以原地覆盖或立即回收
    fresh: HashSet<Location>,
    /// 上次 sync 时在用、之后被释放的 slot，等下一次元数据落盘
    pending: Vec<Location>,
    pending_set: HashSet<Location>,
    meta: StoreMetadata,
}

impl Allocator {
    fn is_free(&self, loc: Location) -> bool {
        self.free_set.contains(&loc) || self.pending_set.contains(&loc)
    }

    fn free_len(&self) -> u64 {
        (self.free.len() + self.pending.len()) as u64
    }
}

/// 分页 Slot 存储
pub struct SlotStore {
    dir: PathBuf,
    slot_size: usize,
    slots_per_segment: u64,
    segments: RwLock<Vec<Arc<File>>>,
    alloc: Mutex<Allocator>,
}

impl SlotStore {
    /// 打开（或创建）存储目录
    ///
    /// 已有存储时校验 magic、format version 与 slot 几何参数，并按元数据
    /// 中的 free list 重建空闲集合。
    pub fn open(dir: impl AsRef<FsPath>, slot_size: usize, slots_per_segment: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if slot_size < MIN_SLOT_SIZE {
            return Err(SlotError::Corrupt(format!(
                "slot size {} below minimum {}",
                slot_size, MIN_SLOT_SIZE
            )));
        }
        if slots_per_segment == 0 {
            return Err(SlotError::Corrupt(
                "segments must hold at least one slot".to_string(),
            ));
        }
        fs::create_dir_all(&dir).map_err(|e| SlotError::io(&dir, e))?;

        let meta = match StoreMetadata::load(&dir)? {
            Some(meta) => {
                if meta.slot_size as usize != slot_size || meta.slots_per_segment != slots_per_segment {
                    return Err(SlotError::Geometry {
                        on_disk: (meta.slot_size as usize, meta.slots_per_segment),
                        requested: (slot_size, slots_per_segment),
                    });
                }
                meta
            }
            None => {
                let meta = StoreMetadata::new(slot_size, slots_per_segment);
                meta.store(&dir)?;
                meta
            }
        };

        let segment_count = ceil_div(meta.high_water, slots_per_segment);
        let mut segments = Vec::with_capacity(segment_count as usize);
        for index in 0..segment_count {
            let path = segment_path(&dir, index);
            if !path.exists() {
                return Err(SlotError::Corrupt(format!(
                    "missing segment file {}",
                    path.display()
                )));
            }
            segments.push(Arc::new(open_segment(&path)?));
        }

        let mut free_set = HashSet::with_capacity(meta.free_list.len());
        for &loc in &meta.free_list {
            if loc >= meta.high_water || !free_set.insert(loc) {
                return Err(SlotError::Corrupt(format!(
                    "free list broken at slot {}",
                    loc
                )));
            }
        }

        info!(
            "Opened slot store at {}: {} slots, {} free, {} segments",
            dir.display(),
            meta.high_water,
            meta.free_list.len(),
            segment_count
        );
        Ok(Self {
            dir,
            slot_size,
            slots_per_segment,
            segments: RwLock::new(segments),
            alloc: Mutex::new(Allocator {
                high_water: meta.high_water,
                free: meta.free_list.clone(),
                free_set,
                fresh: HashSet::new(),
                pending: Vec::new(),
                pending_set: HashSet::new(),
                meta,
            }),
        })
    }

    /// 存储目录
    pub fn dir(&self) -> &FsPath {
        &self.dir
    }

    /// 单个 slot 可容纳的最大 payload
    pub fn capacity(&self) -> usize {
        self.slot_size - SLOT_HEADER_LEN
    }

    /// 当前元数据（含未 sync 的修改）
    pub fn metadata(&self) -> StoreMetadata {
        let alloc = self.alloc.lock();
        snapshot_meta(&alloc)
    }

    /// 已分配且未释放的 slot 数
    pub fn used_count(&self) -> u64 {
        let alloc = self.alloc.lock();
        alloc.high_water - alloc.free_len()
    }

    /// 已释放的 slot 数（含等待下一次 sync 才能复用的部分）
    pub fn free_len(&self) -> u64 {
        self.alloc.lock().free_len()
    }

    /// `loc` 是否在上次 sync 之后才分配
    ///
    /// 只有这样的 slot 可以原地覆盖而不影响 reopen 看到的状态。
    pub fn is_fresh(&self, loc: Location) -> bool {
        self.alloc.lock().fresh.contains(&loc)
    }

    /// 分配一个 slot
    ///
    /// 新 slot 被标记为 USED、payload 为空。
    pub fn new_slot(&self) -> Result<Location> {
        let mut alloc = self.alloc.lock();
        let loc = match alloc.free.pop() {
            Some(loc) => {
                alloc.free_set.remove(&loc);
                loc
            }
            None => {
                let loc = alloc.high_water;
                self.ensure_segment(loc)?;
                alloc.high_water += 1;
                loc
            }
        };
        alloc.fresh.insert(loc);
        self.write_raw(loc, STATUS_USED, &[])?;
        Ok(loc)
    }

    /// 释放 slot
    ///
    /// 上次 sync 之后分配的 slot 立即回到 free list；其余的进入待回收
    /// 列表，磁盘内容保持不变，直到下一次 sync 写出新的元数据。
    /// 重复释放是调用方错误，由 debug 断言捕获。
    pub fn free(&self, loc: Location) -> Result<()> {
        let mut alloc = self.alloc.lock();
        debug_assert!(loc < alloc.high_water, "free of unallocated slot {}", loc);
        debug_assert!(!alloc.is_free(loc), "double free of slot {}", loc);

        if alloc.fresh.remove(&loc) {
            self.write_raw(loc, STATUS_FREE, &[])?;
            alloc.free.push(loc);
            alloc.free_set.insert(loc);
        } else {
            alloc.pending.push(loc);
            alloc.pending_set.insert(loc);
        }
        Ok(())
    }

    /// 读取 slot 中的记录
    pub fn read(&self, loc: Location) -> Result<Vec<u8>> {
        let (status, payload) = self.read_raw(loc)?;
        if status != STATUS_USED {
            return Err(SlotError::Corrupt(format!(
                "slot {} is not in use (status {:#04x})",
                loc, status
            )));
        }
        Ok(payload)
    }

    /// 覆盖写入 slot 中的记录
    pub fn write(&self, loc: Location, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity() {
            return Err(SlotError::RecordTooLarge {
                len: bytes.len(),
                capacity: self.capacity(),
            });
        }
        self.write_raw(loc, STATUS_USED, bytes)
    }

    /// 读-改-写：以可变缓冲区形式访问 slot 内容
    ///
    /// 闭包返回后缓冲区被写回；修改后的长度同样受 slot 容量限制。
    pub fn access<R>(&self, loc: Location, f: impl FnOnce(&mut Vec<u8>) -> R) -> Result<R> {
        let mut payload = self.read(loc)?;
        let result = f(&mut payload);
        self.write(loc, &payload)?;
        Ok(result)
    }

    /// 所有在用 slot 的位置（升序）
    pub fn used_locations(&self) -> Vec<Location> {
        let alloc = self.alloc.lock();
        (0..alloc.high_water)
            .filter(|loc| !alloc.is_free(*loc))
            .collect()
    }

    /// 记录树形状，下次 sync 时持久化
    pub fn set_tree_state(&self, state: TreeState) {
        let mut alloc = self.alloc.lock();
        alloc.meta.leaf_count = state.leaf_count;
        alloc.meta.first_leaf_path = state.first_leaf_path;
        alloc.meta.last_leaf_path = state.last_leaf_path;
    }

    /// 已持久化的树形状
    pub fn tree_state(&self) -> TreeState {
        let alloc = self.alloc.lock();
        TreeState {
            leaf_count: alloc.meta.leaf_count,
            first_leaf_path: alloc.meta.first_leaf_path,
            last_leaf_path: alloc.meta.last_leaf_path,
        }
    }

    /// 记录 key/value codec 版本
    pub fn set_codec_versions(&self, key_version: u32, value_version: u32) {
        let mut alloc = self.alloc.lock();
        alloc.meta.key_codec_version = key_version;
        alloc.meta.value_codec_version = value_version;
    }

    /// 记录 hash store 状态：是否与叶子一致，以及对应的 root hash
    pub fn set_hash_state(&self, persisted: bool, root_hash: HashOutput) {
        let mut alloc = self.alloc.lock();
        alloc.meta.hashes_persisted = persisted;
        alloc.meta.root_hash = root_hash;
    }

    /// 刷盘：所有 segment fsync，然后原子写入元数据
    ///
    /// 元数据落盘之后，待回收的 slot 才进入 free list。
    pub fn sync(&self) -> Result<()> {
        let mut alloc = self.alloc.lock();
        let segments: Vec<Arc<File>> = self.segments.read().clone();
        for (index, file) in segments.iter().enumerate() {
            file.sync_data()
                .map_err(|e| SlotError::io(segment_path(&self.dir, index as u64), e))?;
        }
        let meta = snapshot_meta(&alloc);
        meta.store(&self.dir)?;

        let released = std::mem::take(&mut alloc.pending);
        alloc.pending_set.clear();
        for loc in &released {
            self.write_raw(*loc, STATUS_FREE, &[])?;
        }
        alloc.free_set.extend(released.iter().copied());
        alloc.free.extend(released);
        alloc.fresh.clear();
        debug!(
            "Synced slot store {}: high_water={}, free={}, leaves={}",
            self.dir.display(),
            meta.high_water,
            meta.free_list.len(),
            meta.leaf_count
        );
        Ok(())
    }

    /// 刷盘并关闭
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    // ========================================================================
    // 内部实现
    // ========================================================================

    /// 确保 `loc` 所在的 segment 文件存在
    fn ensure_segment(&self, loc: Location) -> Result<()> {
        let index = loc / self.slots_per_segment;
        let mut segments = self.segments.write();
        while (segments.len() as u64) <= index {
            let path = segment_path(&self.dir, segments.len() as u64);
            debug!("Creating segment {}", path.display());
            segments.push(Arc::new(open_segment(&path)?));
        }
        Ok(())
    }

    fn locate(&self, loc: Location) -> Result<(Arc<File>, u64, u64)> {
        let index = loc / self.slots_per_segment;
        let offset = (loc % self.slots_per_segment) * self.slot_size as u64;
        let segments = self.segments.read();
        let file = segments
            .get(index as usize)
            .cloned()
            .ok_or_else(|| SlotError::Corrupt(format!("slot {} beyond last segment", loc)))?;
        Ok((file, index, offset))
    }

    fn read_raw(&self, loc: Location) -> Result<(u8, Vec<u8>)> {
        let (file, index, offset) = self.locate(loc)?;
        let mut header = [0u8; SLOT_HEADER_LEN];
        file.read_exact_at(&mut header, offset)
            .map_err(|e| SlotError::io(segment_path(&self.dir, index), e))?;

        let status = header[0];
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > self.capacity() {
            return Err(SlotError::Corrupt(format!(
                "slot {} declares {} bytes, capacity {}",
                loc,
                len,
                self.capacity()
            )));
        }

        let mut payload = vec![0u8; len];
        file.read_exact_at(&mut payload, offset + SLOT_HEADER_LEN as u64)
            .map_err(|e| SlotError::io(segment_path(&self.dir, index), e))?;
        Ok((status, payload))
    }

    fn write_raw(&self, loc: Location, status: u8, payload: &[u8]) -> Result<()> {
        let (file, index, offset) = self.locate(loc)?;
        let mut buf = Vec::with_capacity(SLOT_HEADER_LEN + payload.len());
        buf.push(status);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        file.write_all_at(&buf, offset)
            .map_err(|e| SlotError::io(segment_path(&self.dir, index), e))
    }
}

/// 分配器状态对应的元数据；free list 包含待回收的 slot
fn snapshot_meta(alloc: &Allocator) -> StoreMetadata {
    let mut meta = alloc.meta.clone();
    meta.high_water = alloc.high_water;
    meta.free_list = alloc.free.clone();
    meta.free_list.extend(alloc.pending.iter().copied());
    meta
}

fn segment_path(dir: &FsPath, index: u64) -> PathBuf {
    dir.join(format!("segment-{:06}.dat", index))
}

fn open_segment(path: &FsPath) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| SlotError::io(path, e))
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}
