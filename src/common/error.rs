use thiserror::Error;

/// 隧道错误分类
///
/// 握手阶段的错误会被服务端包装为 `tunnel::fallback::SuspiciousConn`，
/// 携带已消费的原始字节用于回落重放。
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    ConfigInvalid(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid http mask: {0}")]
    MaskInvalid(String),

    #[error("codec miss: {0}")]
    CodecMiss(String),

    #[error("AEAD failure: {0}")]
    AeadFailure(String),

    #[error("timestamp skew/replay detected: server_time={server} client_time={client}")]
    HandshakeStale { server: i64, client: i64 },

    #[error("downlink mode mismatch: client={client} server={server}")]
    HandshakeModeMismatch { client: u8, server: u8 },

    #[error("handshake table selection failed: {0}")]
    HandshakeProbeFailed(String),

    #[error("invalid address: {0}")]
    AddressInvalid(String),

    #[error("invalid uot frame: {0}")]
    UoTInvalid(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
