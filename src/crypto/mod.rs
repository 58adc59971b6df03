pub mod aead;
pub mod keys;

pub use aead::AeadStream;
pub use keys::{
    encode_point, encode_scalar, generate_master_key, normalize_seed, parse_private_key,
    recover_public_key, split_private_key, KeyPair,
};
