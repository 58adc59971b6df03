/// Sudoku 编解码表
///
/// 把每个字节 (0..=255) 映射为若干组 4 字节提示，每组提示在全部 288 个
/// 网格中唯一确定一个目标网格。表由 (seed, 布局偏好, 自定义模式) 确定性
/// 导出，两端只要参数一致就能逐字节对齐。
use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use super::grid::{generate_all_grids, Grid};
use super::layout::{resolve_layout, ByteLayout};
use crate::common::{Error, Result};

/// Sudoku 编解码表
pub struct Table {
    /// encode_table[byte] = 该字节的所有 4 提示编码，发送时随机选一组
    pub encode_table: Vec<Vec<[u8; 4]>>,
    /// 排序后的 4 提示 → 原始字节
    pub decode_map: HashMap<u32, u8>,
    /// padding 池
    pub padding_pool: Vec<u8>,
    /// 字节布局
    pub layout: ByteLayout,
}

impl Table {
    /// 构建编解码表
    ///
    /// - `seed`: 预共享密钥字符串，驱动确定性洗牌
    /// - `mode`: "prefer_ascii" | "prefer_entropy" | ""
    /// - `custom_pattern`: 可选 XVP 模式（ASCII 偏好下被忽略）
    pub fn new(seed: &str, mode: &str, custom_pattern: &str) -> Result<Self> {
        if seed.is_empty() {
            return Err(Error::ConfigInvalid("table seed cannot be empty".to_string()));
        }
        let layout = resolve_layout(mode, custom_pattern)?;

        let all_grids = generate_all_grids();

        // SHA256(seed) 前 8 字节（big-endian）作为洗牌种子
        let hash = Sha256::digest(seed.as_bytes());
        let rng_seed = u64::from_be_bytes(hash[..8].try_into().unwrap());
        let mut rng = ChaCha8Rng::seed_from_u64(rng_seed);

        let mut shuffled: Vec<Grid> = all_grids.clone();
        shuffled.shuffle(&mut rng);

        let combinations = position_combinations();

        let mut encode_table: Vec<Vec<[u8; 4]>> = vec![Vec::new(); 256];
        let mut decode_map: HashMap<u32, u8> = HashMap::new();

        for byte_val in 0..256usize {
            let target = &shuffled[byte_val];

            for positions in &combinations {
                // 4 个提示必须在全部网格中唯一匹配目标网格
                if !hints_identify_uniquely(&all_grids, target, positions) {
                    continue;
                }

                let mut hints = [0u8; 4];
                for (i, &pos) in positions.iter().enumerate() {
                    // 格子值 1..=4 → 0..=3
                    hints[i] = layout.encode_hint(target[pos] - 1, pos as u8);
                }
                encode_table[byte_val].push(hints);
                decode_map.insert(pack_hints_to_key(hints), byte_val as u8);
            }
        }

        for (i, encodings) in encode_table.iter().enumerate() {
            if encodings.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "byte {} has no usable encoding",
                    i
                )));
            }
        }

        Ok(Table {
            encode_table,
            decode_map,
            padding_pool: layout.padding_pool.clone(),
            layout,
        })
    }

    /// 编码单个字节，从候选编码中随机选一组
    #[inline]
    pub fn encode_byte(&self, b: u8, rng: &mut impl rand::Rng) -> [u8; 4] {
        let encodings = &self.encode_table[b as usize];
        encodings[rng.gen_range(0..encodings.len())]
    }

    /// 解码 4 个提示字节；None 表示查表 miss（协议致命错误）
    #[inline]
    pub fn decode_hints(&self, hints: [u8; 4]) -> Option<u8> {
        self.decode_map.get(&pack_hints_to_key(hints)).copied()
    }

    /// 随机取一个 padding 字节
    #[inline]
    pub fn random_padding(&self, rng: &mut impl rand::Rng) -> u8 {
        self.padding_pool[rng.gen_range(0..self.padding_pool.len())]
    }
}

/// 轮换表集合
///
/// 同一个 seed 配多套布局模式；客户端每连接随机选一张表，
/// 服务端靠探测识别对端用的是哪一张。候选最多 255 张。
pub struct TableSet {
    candidates: Vec<Arc<Table>>,
}

impl TableSet {
    pub fn new(seed: &str, mode: &str, patterns: &[String]) -> Result<Self> {
        let patterns: Vec<&str> = if patterns.is_empty() {
            vec![""]
        } else {
            patterns.iter().map(|p| p.as_str()).collect()
        };
        if patterns.len() > 255 {
            return Err(Error::ConfigInvalid(format!(
                "too many table candidates: {}",
                patterns.len()
            )));
        }
        let mut candidates = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            candidates.push(Arc::new(Table::new(seed, mode, pattern)?));
        }
        Ok(TableSet { candidates })
    }

    pub fn candidates(&self) -> Vec<Arc<Table>> {
        self.candidates.clone()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

fn hints_identify_uniquely(all: &[Grid], target: &Grid, positions: &[usize; 4]) -> bool {
    let mut matches = 0;
    for g in all {
        if positions.iter().all(|&p| g[p] == target[p]) {
            matches += 1;
            if matches > 1 {
                return false;
            }
        }
    }
    matches == 1
}

/// C(16,4) = 1820 种位置组合，按字典序枚举
fn position_combinations() -> Vec<[usize; 4]> {
    let mut out = Vec::with_capacity(1820);
    for a in 0..13 {
        for b in (a + 1)..14 {
            for c in (b + 1)..15 {
                for d in (c + 1)..16 {
                    out.push([a, b, c, d]);
                }
            }
        }
    }
    out
}

/// 将 4 个提示排序后打包为 u32 键（发送顺序被随机打乱，解码侧先归一化）
pub fn pack_hints_to_key(mut hints: [u8; 4]) -> u32 {
    if hints[0] > hints[1] {
        hints.swap(0, 1);
    }
    if hints[2] > hints[3] {
        hints.swap(2, 3);
    }
    if hints[0] > hints[2] {
        hints.swap(0, 2);
    }
    if hints[1] > hints[3] {
        hints.swap(1, 3);
    }
    if hints[1] > hints[2] {
        hints.swap(1, 2);
    }
    (hints[0] as u32) << 24 | (hints[1] as u32) << 16 | (hints[2] as u32) << 8 | hints[3] as u32
}
