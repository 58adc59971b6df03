/// Ed25519 群上的密钥对与拆分密钥
///
/// 主密钥为标量 x，公钥为点 X = x·B。拆分操作把 x 写成 r + k（r 随机），
/// 任何一个拆分都能独立恢复出同一个公钥，公钥的 hex 字符串作为两端的
/// 共享种子。客户端配置里填主密钥或任一拆分密钥均可；服务端只持有公钥。
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;

use crate::common::{Error, Result};

pub struct KeyPair {
    pub private: Scalar,
    pub public: EdwardsPoint,
}

/// 生成新的主密钥对
pub fn generate_master_key() -> KeyPair {
    let private = Scalar::random(&mut OsRng);
    let public = EdwardsPoint::mul_base(&private);
    KeyPair { private, public }
}

/// 把私钥标量 x 拆分为 (r, x - r)，编码为 64 字节 hex
pub fn split_private_key(x: &Scalar) -> String {
    let r = Scalar::random(&mut OsRng);
    let k = x - r;
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&r.to_bytes());
    out.extend_from_slice(&k.to_bytes());
    hex::encode(out)
}

/// 解析私钥字符串（32 字节主密钥或 64 字节拆分密钥的 hex），
/// 返回其标量形式
pub fn parse_private_key(key: &str) -> Result<Scalar> {
    let bytes = hex::decode(key.trim())
        .map_err(|_| Error::ConfigInvalid("private key is not valid hex".to_string()))?;
    match bytes.len() {
        32 => {
            let arr: [u8; 32] = bytes.try_into().unwrap();
            Option::<Scalar>::from(Scalar::from_canonical_bytes(arr))
                .ok_or_else(|| Error::ConfigInvalid("non-canonical scalar".to_string()))
        }
        64 => {
            let r_arr: [u8; 32] = bytes[..32].try_into().unwrap();
            let k_arr: [u8; 32] = bytes[32..].try_into().unwrap();
            let r = Option::<Scalar>::from(Scalar::from_canonical_bytes(r_arr))
                .ok_or_else(|| Error::ConfigInvalid("non-canonical scalar r".to_string()))?;
            let k = Option::<Scalar>::from(Scalar::from_canonical_bytes(k_arr))
                .ok_or_else(|| Error::ConfigInvalid("non-canonical scalar k".to_string()))?;
            Ok(r + k)
        }
        n => Err(Error::ConfigInvalid(format!(
            "private key must be 32 or 64 bytes, got {}",
            n
        ))),
    }
}

/// 从私钥字符串恢复公钥
pub fn recover_public_key(key: &str) -> Result<EdwardsPoint> {
    let x = parse_private_key(key)?;
    Ok(EdwardsPoint::mul_base(&x))
}

pub fn encode_scalar(s: &Scalar) -> String {
    hex::encode(s.to_bytes())
}

pub fn encode_point(p: &EdwardsPoint) -> String {
    hex::encode(p.compress().to_bytes())
}

/// 规范化客户端密钥
///
/// 配置的 key 若能按私钥 blob 解析，则恢复公钥并以公钥 hex 作为共享种子
/// （表种子、AEAD 种子、握手哈希统一使用种子字符串）；否则原样返回。
/// 返回 (种子字符串, 是否发生了替换)。
pub fn normalize_seed(key: &str) -> (String, bool) {
    match recover_public_key(key) {
        Ok(point) => (encode_point(&point), true),
        Err(_) => (key.to_string(), false),
    }
}
