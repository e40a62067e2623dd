//! Hash 函数抽象层
//!
//! 提供模块化的 Hash 支持，便于在 blake3 和 keccak256 之间切换。
//! 整个网络必须约定同一种算法：teacher 与 learner 的 root hash 只有在
//! 双方使用同一个 `Hasher` 时才可比较。
//!
//! # Merkle 约定
//!
//! - 叶子：`digest_leaf = H(len(key) as u32 LE || key || value)`
//! - 内部节点：`digest_internal = H(left || right)`
//! - 缺失的子节点（树不是 2 的幂时 root 只有左孩子）用 [`NULL_HASH`] 代替
//! - 空树的 root hash 为 [`NULL_HASH`]

/// 32 字节哈希输出类型
pub type HashOutput = [u8; 32];

/// 空哈希常量：32 个零字节
///
/// 用于缺失子节点与空树，独立实现之间必须逐位一致。
pub const NULL_HASH: HashOutput = [0u8; 32];

/// Hash 函数 trait
///
/// 所有实现必须满足：
/// 1. 确定性：相同输入产生相同输出
/// 2. 抗碰撞：不同输入极难产生相同输出
/// 3. 输出固定 32 字节
///
/// 实现为无状态的类型标记，可在 hashing 线程池中自由共享。
pub trait Hasher: Send + Sync + 'static {
    /// 计算输入数据的哈希值
    fn hash(data: &[u8]) -> HashOutput;

    /// 计算多段输入拼接后的哈希值
    ///
    /// 默认实现先拼接再哈希，具体实现可覆盖以避免拷贝。
    fn hash_parts(parts: &[&[u8]]) -> HashOutput {
        Self::hash(&parts.concat())
    }

    /// 返回算法名称（用于日志和调试）
    fn name() -> &'static str;
}

/// Blake3 哈希实现
///
/// 特点：
/// - 速度：比 SHA-256 快约 10x，比 keccak256 快约 5x
/// - 安全性：256-bit 安全级别
/// - 硬件加速：支持 SIMD 并行计算
///
/// 默认算法。
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    fn hash(data: &[u8]) -> HashOutput {
        blake3::hash(data).into()
    }

    fn hash_parts(parts: &[&[u8]]) -> HashOutput {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    fn name() -> &'static str {
        "blake3"
    }
}

/// Keccak256 哈希实现
///
/// 以太坊生态标准，推荐用于需要与以太坊工具链兼容的场景。
pub struct Keccak256Hasher;

impl Hasher for Keccak256Hasher {
    fn hash(data: &[u8]) -> HashOutput {
        Self::hash_parts(&[data])
    }

    fn hash_parts(parts: &[&[u8]]) -> HashOutput {
        use tiny_keccak::{Hasher as TinyHasher, Keccak};

        let mut output = [0u8; 32];
        let mut hasher = Keccak::v256();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize(&mut output);
        output
    }

    fn name() -> &'static str {
        "keccak256"
    }
}

/// 叶子哈希：`H(len(key) as u32 LE || key || value)`
///
/// key 参与哈希，保证相同哈希意味着相同的 (key, value)。
#[inline]
pub fn digest_leaf<H: Hasher>(key: &[u8], value: &[u8]) -> HashOutput {
    let key_len = (key.len() as u32).to_le_bytes();
    H::hash_parts(&[&key_len[..], key, value])
}

/// 内部节点哈希：`H(left || right)`
#[inline]
pub fn digest_internal<H: Hasher>(left: &HashOutput, right: &HashOutput) -> HashOutput {
    H::hash_parts(&[&left[..], &right[..]])
}

/// 十六进制短格式（日志用）
pub fn short_hex(hash: &HashOutput) -> String {
    hash[..6].iter().map(|b| format!("{:02x}", b)).collect()
}
