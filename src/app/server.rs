/// 服务端主循环
///
/// accept → 每连接一个任务 → 握手升级 → 路由（目标地址 | UoT）→ 转发。
/// 握手失败交给 suspicious_action 处置；握手成功后的错误只关闭连接。
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::common::{Address, Error, Result};
use crate::config::Config;
use crate::tunnel::fallback::{handle_suspicious, SuspiciousAction};
use crate::tunnel::handshake::{server_handshake, ServerHandshake};
use crate::tunnel::{uot, TunnelConfig};

const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct ServerContext {
    tunnel: TunnelConfig,
    action: SuspiciousAction,
    fallback_addr: String,
}

pub async fn run_server(cfg: Config) -> Result<()> {
    // 服务端配置的 key 本身就是共享种子（通常是 keygen 输出的公钥 hex），
    // 私钥恢复只发生在客户端，这里原样使用
    let tables = cfg.build_tables(&cfg.key)?;
    info!(
        tables = tables.len(),
        ascii = %cfg.ascii,
        aead = %cfg.aead,
        "encode tables ready"
    );

    let ctx = Arc::new(ServerContext {
        tunnel: cfg.tunnel_config(cfg.key.clone(), tables),
        action: SuspiciousAction::parse(&cfg.suspicious_action),
        fallback_addr: cfg.fallback_address.clone(),
    });
    ctx.tunnel.validate()?;

    let listener = TcpListener::bind(("0.0.0.0", cfg.local_port)).await?;
    info!(
        port = cfg.local_port,
        fallback = %cfg.fallback_address,
        "server listening"
    );

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        conn.set_nodelay(true).ok();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "connection accepted");
            handle_connection(conn, ctx).await;
        });
    }
}

async fn handle_connection(conn: TcpStream, ctx: Arc<ServerContext>) {
    let session = match server_handshake(conn, &ctx.tunnel).await {
        Ok(s) => s,
        Err(failure) => {
            handle_suspicious(failure, ctx.action, &ctx.fallback_addr).await;
            return;
        }
    };

    if let Err(e) = route_session(session, &ctx).await {
        debug!(error = %e, "session ended");
    }
}

/// 读取首个应用字节决定路由：0xEE 进入 UoT 会话，否则把该字节
/// 重新插回流中按目标地址记录解析
async fn route_session(mut session: ServerHandshake, ctx: &Arc<ServerContext>) -> Result<()> {
    let first = match session.stream.read_u8().await {
        Ok(b) => b,
        Err(e) => {
            let failure = Box::new(session.into_failure(Error::Io(e)));
            handle_suspicious(failure, ctx.action, &ctx.fallback_addr).await;
            return Ok(());
        }
    };

    if first == uot::UOT_MAGIC {
        session.recorder.stop();
        debug!("uot session started");
        return uot::run_server_session(session.stream).await;
    }

    // 地址记录解码失败仍按可疑流量处置（录制尚未停止）
    let addr_result = {
        let first_byte = [first];
        let mut chained = (&first_byte[..]).chain(&mut session.stream);
        Address::read_from(&mut chained).await
    };
    let addr = match addr_result {
        Ok(a) => a,
        Err(e) => {
            let failure = Box::new(session.into_failure(e));
            handle_suspicious(failure, ctx.action, &ctx.fallback_addr).await;
            return Ok(());
        }
    };

    session.recorder.stop();
    debug!(target = %addr, "connecting to target");

    let mut target = match tokio::time::timeout(
        TARGET_DIAL_TIMEOUT,
        TcpStream::connect(addr.to_string()),
    )
    .await
    {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            return Err(Error::Transport(format!("connect {} failed: {}", addr, e)));
        }
        Err(_) => {
            return Err(Error::Transport(format!("connect {} timed out", addr)));
        }
    };
    target.set_nodelay(true).ok();

    let (up, down) = tokio::io::copy_bidirectional(&mut session.stream, &mut target).await?;
    debug!(up = up, down = down, target = %addr, "relay finished");
    Ok(())
}
