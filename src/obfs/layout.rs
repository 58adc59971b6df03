/// 字节布局模式
///
/// 定义如何把 (val, pos) 提示编码为单个字节，以及如何区分提示字节与
/// padding 字节。三种模式：
/// - ASCII：提示落在 0x40..=0x7F（bit 6 为 1，bit 7 为 0），padding 为可打印符号区
/// - Entropy：提示满足 (b & 0x90) == 0，低 Hamming weight
/// - Custom：8 字符 x/p/v 模式自定义位角色，padding 取高 Hamming weight 字节
use crate::common::{Error, Result};

#[derive(Debug, Clone)]
enum LayoutKind {
    Ascii,
    Entropy,
    Custom {
        x_mask: u8,
        p_bits: [u8; 2],
        v_bits: [u8; 4],
    },
}

/// 字节布局
#[derive(Debug, Clone)]
pub struct ByteLayout {
    pub name: &'static str,
    /// 提示字节判定：(b & hint_mask) == hint_value
    pub hint_mask: u8,
    pub hint_value: u8,
    /// padding 池
    pub padding_pool: Vec<u8>,
    pub is_ascii: bool,
    kind: LayoutKind,
}

impl ByteLayout {
    /// 判断字节是否为提示字节
    #[inline]
    pub fn is_hint(&self, b: u8) -> bool {
        (b & self.hint_mask) == self.hint_value
    }

    /// 将 (val: 0..=3, pos: 0..=15) 编码为一个提示字节
    #[inline]
    pub fn encode_hint(&self, val: u8, pos: u8) -> u8 {
        match &self.kind {
            LayoutKind::Ascii => 0x40 | ((val & 0x03) << 4) | (pos & 0x0F),
            LayoutKind::Entropy => ((val & 0x03) << 5) | (pos & 0x0F),
            LayoutKind::Custom {
                x_mask,
                p_bits,
                v_bits,
            } => custom_encode(*x_mask, p_bits, v_bits, val, pos, None),
        }
    }
}

/// ASCII 布局：提示为 01vvpppp，padding 取 0x20..=0x3F
pub fn new_ascii_layout() -> ByteLayout {
    ByteLayout {
        name: "ascii",
        hint_mask: 0x40,
        hint_value: 0x40,
        padding_pool: (0x20..=0x3F).collect(),
        is_ascii: true,
        kind: LayoutKind::Ascii,
    }
}

/// 低熵布局：提示满足 (b & 0x90) == 0，padding 满足补集
pub fn new_entropy_layout() -> ByteLayout {
    let mut padding = Vec::with_capacity(16);
    for i in 0..8u8 {
        padding.push(0x80 + i);
        padding.push(0x10 + i);
    }
    ByteLayout {
        name: "entropy",
        hint_mask: 0x90,
        hint_value: 0x00,
        padding_pool: padding,
        is_ascii: false,
        kind: LayoutKind::Entropy,
    }
}

/// 自定义 XVP 布局
///
/// pattern 必须为 8 字符，恰好 2 个 'x'、2 个 'p'、4 个 'v'（不区分大小写）。
/// - x 位：提示标记位，提示字节中恒为 1
/// - p 位：存放 val 的 2 bit
/// - v 位：存放 pos 的 4 bit
///
/// padding 池取「去掉一个 x 位」且 Hamming weight >= 5 的字节，
/// 抬高线上流量的整体 Hamming weight。
pub fn new_custom_layout(pattern: &str) -> Result<ByteLayout> {
    let cleaned: String = pattern.trim().to_lowercase().replace(' ', "");
    if cleaned.len() != 8 {
        return Err(Error::ConfigInvalid(format!(
            "custom table pattern must be 8 chars, got {}",
            cleaned.len()
        )));
    }

    let mut x_bits: Vec<u8> = Vec::new();
    let mut p_bits: Vec<u8> = Vec::new();
    let mut v_bits: Vec<u8> = Vec::new();

    for (i, c) in cleaned.chars().enumerate() {
        let bit = 7 - i as u8;
        match c {
            'x' => x_bits.push(bit),
            'p' => p_bits.push(bit),
            'v' => v_bits.push(bit),
            _ => {
                return Err(Error::ConfigInvalid(format!(
                    "invalid char {:?} in custom table pattern",
                    c
                )))
            }
        }
    }

    if x_bits.len() != 2 || p_bits.len() != 2 || v_bits.len() != 4 {
        return Err(Error::ConfigInvalid(
            "custom table pattern needs exactly 2 x, 2 p and 4 v".to_string(),
        ));
    }

    let x_mask: u8 = x_bits.iter().fold(0u8, |acc, &b| acc | (1 << b));
    let p_bits = [p_bits[0], p_bits[1]];
    let v_bits = [v_bits[0], v_bits[1], v_bits[2], v_bits[3]];

    // padding 池：每次丢掉一个 x 位，枚举 val/pos，保留 weight >= 5 的字节
    let mut padding = Vec::new();
    for drop in 0..2 {
        for val in 0..4u8 {
            for pos in 0..16u8 {
                let b = custom_encode(x_mask, &p_bits, &v_bits, val, pos, Some(drop));
                if b.count_ones() >= 5 && !padding.contains(&b) {
                    padding.push(b);
                }
            }
        }
    }
    if padding.is_empty() {
        return Err(Error::ConfigInvalid(
            "custom table pattern yields empty padding pool".to_string(),
        ));
    }

    Ok(ByteLayout {
        name: "custom",
        hint_mask: x_mask,
        hint_value: x_mask,
        padding_pool: padding,
        is_ascii: false,
        kind: LayoutKind::Custom {
            x_mask,
            p_bits,
            v_bits,
        },
    })
}

fn custom_encode(
    x_mask: u8,
    p_bits: &[u8; 2],
    v_bits: &[u8; 4],
    val: u8,
    pos: u8,
    drop_x: Option<usize>,
) -> u8 {
    let mut out = x_mask;
    if let Some(drop) = drop_x {
        let mut bits = [0u8; 2];
        let mut i = 0;
        for bit in (0..8).rev() {
            if x_mask & (1 << bit) != 0 {
                bits[i] = bit;
                i += 1;
            }
        }
        out &= !(1 << bits[drop]);
    }
    if val & 0x02 != 0 {
        out |= 1 << p_bits[0];
    }
    if val & 0x01 != 0 {
        out |= 1 << p_bits[1];
    }
    for (i, &vb) in v_bits.iter().enumerate() {
        if (pos >> (3 - i)) & 1 == 1 {
            out |= 1 << vb;
        }
    }
    out
}

/// 解析布局模式。ASCII 偏好优先于自定义模式。
pub fn resolve_layout(mode: &str, custom_pattern: &str) -> Result<ByteLayout> {
    match mode.to_lowercase().as_str() {
        "ascii" | "prefer_ascii" => Ok(new_ascii_layout()),
        "entropy" | "prefer_entropy" | "" => {
            if !custom_pattern.trim().is_empty() {
                new_custom_layout(custom_pattern)
            } else {
                Ok(new_entropy_layout())
            }
        }
        _ => Err(Error::ConfigInvalid(format!("invalid table mode: {}", mode))),
    }
}
