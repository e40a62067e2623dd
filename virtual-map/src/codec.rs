//! 带版本号的 key / value 编解码
//!
//! map 本身只存字节。[`TypedMap`] 用一对 [`Codec`] 把类型化的 key / value
//! 编成字节，并把两个 codec 的版本号记录在存储元数据中；读取时把写入
//! 时的版本号交给 `decode`，由 codec 决定如何解读旧格式。

use std::marker::PhantomData;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MapError, Result};
use crate::hash::{Blake3Hasher, HashOutput, Hasher};
use crate::index::bincode_config;
use crate::map::VirtualMap;

/// 类型 `T` 的字节编解码
pub trait Codec<T> {
    /// 当前写入格式的版本号，必须非零
    const VERSION: u32;

    fn encode(value: &T) -> Result<Vec<u8>>;

    /// 按写入时的版本号解码
    fn decode(bytes: &[u8], version: u32) -> Result<T>;
}

/// bincode（fixint、小端）编码
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for BincodeCodec {
    const VERSION: u32 = 1;

    fn encode(value: &T) -> Result<Vec<u8>> {
        Ok(bincode_config().serialize(value)?)
    }

    fn decode(bytes: &[u8], version: u32) -> Result<T> {
        if version != <Self as Codec<T>>::VERSION {
            return Err(MapError::Codec(format!(
                "bincode codec cannot read version {}",
                version
            )));
        }
        Ok(bincode_config().deserialize(bytes)?)
    }
}

/// 类型化的 map
///
/// key 的编码必须是确定性的：相同的 key 总是编成相同的字节。
pub struct TypedMap<K, V, H = Blake3Hasher, KC = BincodeCodec, VC = BincodeCodec>
where
    H: Hasher,
    KC: Codec<K>,
    VC: Codec<V>,
{
    map: VirtualMap<H>,
    value_version: u32,
    _marker: PhantomData<fn() -> (K, V, KC, VC)>,
}

impl<K, V, H, KC, VC> TypedMap<K, V, H, KC, VC>
where
    H: Hasher,
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// 包装一个 map
    ///
    /// 空 map（或从未记录过版本的 map）记录当前 codec 版本。已有数据的
    /// map 要求 key codec 版本一致；value 可以是旧版本，此时只读。
    pub fn new(map: VirtualMap<H>) -> Result<Self> {
        let (stored_key, stored_value) = map.codec_versions();
        let fresh = map.is_empty() || (stored_key == 0 && stored_value == 0);
        if fresh {
            map.set_codec_versions(KC::VERSION, VC::VERSION);
            return Ok(Self {
                map,
                value_version: VC::VERSION,
                _marker: PhantomData,
            });
        }
        if stored_key != KC::VERSION {
            return Err(MapError::Codec(format!(
                "keys written with codec version {}, current is {}",
                stored_key,
                KC::VERSION
            )));
        }
        Ok(Self {
            map,
            value_version: stored_value,
            _marker: PhantomData,
        })
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = KC::encode(key)?;
        match self.map.get(&key)? {
            Some(bytes) => Ok(Some(VC::decode(&bytes, self.value_version)?)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.map.contains_key(&KC::encode(key)?))
    }

    pub fn put(&mut self, key: &K, value: &V) -> Result<()> {
        self.check_writable()?;
        let key = KC::encode(key)?;
        let value = VC::encode(value)?;
        self.map.put(&key, &value)
    }

    /// 删除，返回旧值
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        self.check_writable()?;
        let key = KC::encode(key)?;
        match self.map.remove(&key)? {
            Some(bytes) => Ok(Some(VC::decode(&bytes, self.value_version)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn root_hash(&self) -> Result<HashOutput> {
        self.map.root_hash()
    }

    /// 写入时的 (key, value) codec 版本
    pub fn codec_versions(&self) -> (u32, u32) {
        self.map.codec_versions()
    }

    pub fn inner(&self) -> &VirtualMap<H> {
        &self.map
    }

    pub fn inner_mut(&mut self) -> &mut VirtualMap<H> {
        &mut self.map
    }

    pub fn into_inner(self) -> VirtualMap<H> {
        self.map
    }

    fn check_writable(&self) -> Result<()> {
        if self.value_version != VC::VERSION {
            return Err(MapError::Codec(format!(
                "values written with codec version {}, current is {}; map is read-only",
                self.value_version,
                VC::VERSION
            )));
        }
        Ok(())
    }
}
