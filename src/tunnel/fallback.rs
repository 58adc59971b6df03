/// 可疑连接处置
///
/// 握手失败时，主动探测者必须观察到与诱饵服务完全一致的行为：
/// fallback 模式把已消费的原始字节原样重放给诱饵地址再双向拼接；
/// silent 模式直接关闭。录制的字节是密文/伪装头，不含任何明文。
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::handshake::HandshakeFailure;
use crate::common::Result;

/// 可疑流量处置策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspiciousAction {
    /// 重放已消费字节到诱饵地址并双向拼接
    Fallback,
    /// 立即关闭
    Silent,
}

impl SuspiciousAction {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "silent" => SuspiciousAction::Silent,
            _ => SuspiciousAction::Fallback,
        }
    }
}

/// 按策略处置一条握手失败的连接
pub async fn handle_suspicious(
    failure: Box<HandshakeFailure>,
    action: SuspiciousAction,
    fallback_addr: &str,
) {
    warn!(reason = %failure.reason, recorded = failure.recorded.len(), "suspicious connection");

    let Some(raw) = failure.raw else {
        return;
    };

    match action {
        SuspiciousAction::Silent => {
            // 直接 drop，对端看到的与冷端口 RST/FIN 无异
            drop(raw);
        }
        SuspiciousAction::Fallback => {
            if fallback_addr.is_empty() {
                drop(raw);
                return;
            }
            if let Err(e) = splice_to_decoy(raw, &failure.recorded, fallback_addr).await {
                debug!(error = %e, "fallback splice ended");
            }
        }
    }
}

async fn splice_to_decoy(mut raw: TcpStream, recorded: &[u8], fallback_addr: &str) -> Result<()> {
    let mut decoy = TcpStream::connect(fallback_addr).await?;
    decoy.write_all(recorded).await?;
    decoy.flush().await?;
    tokio::io::copy_bidirectional(&mut raw, &mut decoy).await?;
    Ok(())
}
