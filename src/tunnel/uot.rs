/// UDP-over-TCP 数据报封装
///
/// 握手完成后客户端可写入 {0xEE, 0x01} 前导把连接转为数据报载体。
/// 帧格式（双向一致）：
///   [2B big-endian 地址长度][2B big-endian 载荷长度][地址记录][载荷]
/// 帧在隧道内按写入顺序交付；UDP 本身的乱序语义原样透传。
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::{Address, Error, Result};

/// UoT 会话魔数
pub const UOT_MAGIC: u8 = 0xEE;
/// 当前版本
pub const UOT_VERSION: u8 = 0x01;

/// 单帧地址/载荷上限
const MAX_UOT_PAYLOAD: usize = 64 * 1024;

/// 写入 UoT 前导（魔数 + 版本）
pub async fn write_preface<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(&[UOT_MAGIC, UOT_VERSION]).await?;
    Ok(())
}

/// 写入一个数据报帧
pub async fn write_datagram<W: AsyncWrite + Unpin>(
    w: &mut W,
    addr: &Address,
    payload: &[u8],
) -> Result<()> {
    let addr_bytes = addr.encode_to_vec()?;
    if payload.len() > u16::MAX as usize {
        return Err(Error::UoTInvalid(format!(
            "payload too large: {}",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + addr_bytes.len() + payload.len());
    frame.extend_from_slice(&(addr_bytes.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&addr_bytes);
    frame.extend_from_slice(payload);

    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// 读取一帧的原始地址字节与载荷（帧层校验，不做地址解码）
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;

    let addr_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let payload_len = u16::from_be_bytes([header[2], header[3]]) as usize;

    if addr_len == 0 || addr_len > MAX_UOT_PAYLOAD {
        return Err(Error::UoTInvalid(format!("invalid address length: {}", addr_len)));
    }
    if payload_len > MAX_UOT_PAYLOAD {
        return Err(Error::UoTInvalid(format!(
            "invalid payload length: {}",
            payload_len
        )));
    }

    let mut addr_bytes = vec![0u8; addr_len];
    r.read_exact(&mut addr_bytes).await?;
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;
    Ok((addr_bytes, payload))
}

/// 读取并解码一个数据报帧
pub async fn read_datagram<R: AsyncRead + Unpin>(r: &mut R) -> Result<(Address, Vec<u8>)> {
    let (addr_bytes, payload) = read_frame(r).await?;
    let (addr, _) = Address::decode(&addr_bytes)?;
    Ok((addr, payload))
}

async fn resolve_udp_target(addr: &Address) -> Option<SocketAddr> {
    match addr {
        Address::Ip(sa) => Some(*sa),
        Address::Domain(host, port) => tokio::net::lookup_host(format!("{}:{}", host, port))
            .await
            .ok()
            .and_then(|mut it| it.next()),
    }
}

/// 服务端 UoT 会话循环
///
/// 调用前提：隧道已升级完成且魔数字节已被消费；本函数读取版本字节。
/// 绑定一个本地 UDP socket，把隧道帧转发为数据报、把收到的数据报
/// 封帧写回。无法解析的目标地址按帧跳过；任一方向的 IO 错误结束
/// 会话并同时关闭两侧。
pub async fn run_server_session<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    stream: S,
) -> Result<()> {
    let mut stream = stream;
    let version = stream.read_u8().await?;
    if version != UOT_VERSION {
        return Err(Error::UoTInvalid(format!("unsupported version: {}", version)));
    }

    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    debug!(local = %socket.local_addr()?, "uot relay socket bound");

    let (mut tunnel_rd, mut tunnel_wr) = tokio::io::split(stream);

    // UDP → 隧道
    let udp_in = socket.clone();
    let writer_task = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_UOT_PAYLOAD];
        let err: Error = loop {
            let (n, from) = match udp_in.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => break Error::Io(e),
            };
            let addr = Address::Ip(from);
            if let Err(e) = write_datagram(&mut tunnel_wr, &addr, &buf[..n]).await {
                break e;
            }
        };
        debug!(error = %err, "uot downlink writer stopped");
    });

    // 隧道 → UDP
    let result: Result<()> = async {
        loop {
            let (addr_bytes, payload) = read_frame(&mut tunnel_rd).await?;
            let addr = match Address::decode(&addr_bytes) {
                Ok((a, _)) => a,
                Err(_) => continue, // 坏地址只跳过该帧
            };
            let Some(target) = resolve_udp_target(&addr).await else {
                continue;
            };
            socket.send_to(&payload, target).await?;
        }
    }
    .await;

    writer_task.abort();
    result
}
