/// 客户端拨号器
///
/// resolve(缓存并发 DNS) → TCP 连接 → 客户端握手 → 写入目标地址记录
/// 或 UoT 前导，向本地代理分发层交付双工流。
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::handshake::client_handshake;
use super::{uot, TunnelConfig};
use crate::common::{Address, Error, ProxyStream, Result};
use crate::dns::CachedResolver;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dialer {
    config: TunnelConfig,
    server_address: String,
    resolver: Arc<CachedResolver>,
}

impl Dialer {
    pub fn new(config: TunnelConfig, server_address: String) -> Self {
        Dialer {
            config,
            server_address,
            resolver: Arc::new(CachedResolver::default()),
        }
    }

    async fn dial_base(&self) -> Result<super::ClientTunnel> {
        let resolved = self.resolver.resolve(&self.server_address).await?;

        let raw = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&resolved))
            .await
            .map_err(|_| Error::Transport(format!("dial {} timed out", resolved)))?
            .map_err(|e| Error::Transport(format!("dial {} failed: {}", resolved, e)))?;
        raw.set_nodelay(true).ok();

        debug!(server = %resolved, "tunnel connected");
        client_handshake(raw, &self.config, &self.server_address).await
    }

    /// 建立隧道并请求连接到目标地址
    pub async fn dial(&self, dest: &Address) -> Result<ProxyStream> {
        let mut stream = self.dial_base().await?;
        let record = dest.encode_to_vec()?;
        stream.write_all(&record).await?;
        stream.flush().await?;
        Ok(Box::new(stream))
    }

    /// 建立 UoT 隧道（写入 {0xEE, 0x01} 前导）
    pub async fn dial_udp_over_tcp(&self) -> Result<ProxyStream> {
        let mut stream = self.dial_base().await?;
        uot::write_preface(&mut stream).await?;
        stream.flush().await?;
        Ok(Box::new(stream))
    }
}
