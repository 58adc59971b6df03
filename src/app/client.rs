/// 客户端：本地混合代理
///
/// 单端口按首字节自动识别 SOCKS5 / SOCKS4 / HTTP，目标经路由决策后
/// 走隧道或直连。SOCKS5 UDP ASSOCIATE 通过 UoT 隧道承载。
/// PAC/GeoIP 规则引擎是外部协作方，这里只保留 Router 决策接口；
/// 内置 global 与 direct 两种决策。
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::common::{Address, Error, PreBufferedStream, ProxyStream, Result};
use crate::config::Config;
use crate::crypto;
use crate::tunnel::dialer::Dialer;
use crate::tunnel::uot;

const MAX_HTTP_HEAD: usize = 16 * 1024;

// ── 路由决策 ────────────────────────────────────────────────────────────

/// 连接级路由决策接口。PAC 规则引擎实现该 trait 后可直接接入。
pub trait Router: Send + Sync {
    fn should_proxy(&self, addr: &Address) -> bool;
}

/// 全部走隧道
pub struct GlobalRouter;

impl Router for GlobalRouter {
    fn should_proxy(&self, _addr: &Address) -> bool {
        true
    }
}

/// 全部直连
pub struct DirectRouter;

impl Router for DirectRouter {
    fn should_proxy(&self, _addr: &Address) -> bool {
        false
    }
}

pub fn router_for_mode(mode: &str) -> Arc<dyn Router> {
    match mode {
        "direct" => Arc::new(DirectRouter),
        "pac" => {
            // 规则数据源不在本体内；未接入规则引擎时退化为全局代理
            warn!("pac rules engine not attached, falling back to global routing");
            Arc::new(GlobalRouter)
        }
        _ => Arc::new(GlobalRouter),
    }
}

// ── 主循环 ──────────────────────────────────────────────────────────────

struct ClientContext {
    dialer: Dialer,
    router: Arc<dyn Router>,
}

pub async fn run_client(cfg: Config) -> Result<()> {
    // key 若为私钥 blob，恢复公钥 hex 作为共享种子
    let (seed, changed) = crypto::normalize_seed(&cfg.key);
    if changed {
        info!(public_key = %seed, "derived public key from configured private key");
    }

    let tables = cfg.build_tables(&seed)?;
    let tunnel_cfg = cfg.tunnel_config(seed, tables);
    tunnel_cfg.validate()?;

    let ctx = Arc::new(ClientContext {
        dialer: Dialer::new(tunnel_cfg, cfg.server_address.clone()),
        router: router_for_mode(&cfg.proxy_mode),
    });

    let listener = TcpListener::bind(("0.0.0.0", cfg.local_port)).await?;
    info!(
        port = cfg.local_port,
        server = %cfg.server_address,
        proxy_mode = %cfg.proxy_mode,
        "client mixed proxy listening"
    );

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_mixed_conn(conn, ctx).await {
                debug!(peer = %peer, error = %e, "local connection ended");
            }
        });
    }
}

/// 首字节分流：0x05 SOCKS5，0x04 SOCKS4，其余按 HTTP 处理
async fn handle_mixed_conn(mut conn: TcpStream, ctx: Arc<ClientContext>) -> Result<()> {
    let first = conn.read_u8().await?;
    let conn = PreBufferedStream::new(vec![first], conn);

    match first {
        0x05 => handle_socks5(conn, ctx).await,
        0x04 => handle_socks4(conn, ctx).await,
        _ => handle_http(conn, ctx).await,
    }
}

async fn dial_target(ctx: &ClientContext, addr: &Address) -> Result<ProxyStream> {
    if ctx.router.should_proxy(addr) {
        debug!(target = %addr, "routing via tunnel");
        ctx.dialer.dial(addr).await
    } else {
        debug!(target = %addr, "routing direct");
        let conn = TcpStream::connect(addr.to_string())
            .await
            .map_err(|e| Error::Transport(format!("direct dial {} failed: {}", addr, e)))?;
        Ok(Box::new(conn))
    }
}

async fn pipe(mut local: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin, mut remote: ProxyStream) -> Result<()> {
    tokio::io::copy_bidirectional(&mut local, &mut remote).await.ok();
    Ok(())
}

// ── SOCKS5 ──────────────────────────────────────────────────────────────

async fn handle_socks5(
    mut conn: PreBufferedStream<TcpStream>,
    ctx: Arc<ClientContext>,
) -> Result<()> {
    // 方法协商：VER NMETHODS METHODS...，固定回应 no-auth
    let _ver = conn.read_u8().await?;
    let n_methods = conn.read_u8().await? as usize;
    let mut methods = vec![0u8; n_methods];
    conn.read_exact(&mut methods).await?;
    conn.write_all(&[0x05, 0x00]).await?;

    // 请求：VER CMD RSV ATYP ADDR PORT
    let mut head = [0u8; 3];
    conn.read_exact(&mut head).await?;

    match head[1] {
        0x01 => {} // CONNECT
        0x03 => return handle_socks5_udp_associate(conn, ctx).await,
        _ => {
            // 不支持 BIND 等命令
            conn.write_all(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }
    }

    let addr = Address::read_from(&mut conn).await?;

    match dial_target(&ctx, &addr).await {
        Ok(remote) => {
            conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            pipe(conn, remote).await
        }
        Err(e) => {
            conn.write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            Err(e)
        }
    }
}

fn socks5_bound_reply(local: SocketAddr) -> Vec<u8> {
    let mut reply = vec![0x05, 0x00, 0x00];
    match local {
        SocketAddr::V4(v4) => {
            reply.push(0x01);
            reply.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            reply.push(0x04);
            reply.extend_from_slice(&v6.ip().octets());
        }
    }
    reply.extend_from_slice(&local.port().to_be_bytes());
    reply
}

/// 解析 SOCKS5 UDP 封包：RSV(2) FRAG(1) ATYP ADDR PORT PAYLOAD
fn decode_socks5_udp(pkt: &[u8]) -> Result<(Address, Vec<u8>)> {
    if pkt.len() < 4 {
        return Err(Error::AddressInvalid("udp packet too short".to_string()));
    }
    if pkt[2] != 0x00 {
        return Err(Error::AddressInvalid("udp fragmentation not supported".to_string()));
    }
    let (addr, n) = Address::decode(&pkt[3..])?;
    Ok((addr, pkt[3 + n..].to_vec()))
}

fn encode_socks5_udp(addr: &Address, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0x00, 0x00, 0x00];
    let addr_bytes = addr.encode_to_vec()?;
    out.extend_from_slice(&addr_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// SOCKS5 UDP ASSOCIATE：开本地 UDP 中继，经 UoT 隧道双向转译。
/// 第一个观察到的客户端源地址作为回包目的地。
async fn handle_socks5_udp_associate(
    mut ctrl: PreBufferedStream<TcpStream>,
    ctx: Arc<ClientContext>,
) -> Result<()> {
    // 丢弃请求中的地址字段（客户端常填 0.0.0.0:0）
    let _ = Address::read_from(&mut ctrl).await?;

    let udp = match UdpSocket::bind(("127.0.0.1", 0)).await {
        Ok(s) => s,
        Err(e) => {
            ctrl.write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Err(Error::Io(e));
        }
    };

    let uot_conn = match ctx.dialer.dial_udp_over_tcp().await {
        Ok(c) => c,
        Err(e) => {
            ctrl.write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Err(e);
        }
    };

    let local = udp.local_addr()?;
    ctrl.write_all(&socks5_bound_reply(local)).await?;
    debug!(relay = %local, "udp associate ready");

    let udp = Arc::new(udp);
    let client_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let (mut tun_rd, mut tun_wr) = tokio::io::split(uot_conn);

    // 本地 UDP → 隧道
    let udp_in = udp.clone();
    let client_in = client_addr.clone();
    let client_to_server = async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, from) = match udp_in.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => break Error::Io(e),
            };
            let Ok((dest, payload)) = decode_socks5_udp(&buf[..n]) else {
                continue;
            };
            {
                let mut guard = client_in.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(from);
                }
            }
            if let Err(e) = uot::write_datagram(&mut tun_wr, &dest, &payload).await {
                break e;
            }
        }
    };

    // 隧道 → 本地 UDP
    let udp_out = udp.clone();
    let client_out = client_addr.clone();
    let server_to_client = async move {
        loop {
            let (from, payload) = match uot::read_datagram(&mut tun_rd).await {
                Ok(v) => v,
                Err(e) => break e,
            };
            let Some(target) = *client_out.lock().unwrap() else {
                continue;
            };
            let Ok(wrapped) = encode_socks5_udp(&from, &payload) else {
                continue;
            };
            if let Err(e) = udp_out.send_to(&wrapped, target).await {
                break Error::Io(e);
            }
        }
    };

    // 控制连接关闭即结束会话
    let control = async move {
        let mut sink = [0u8; 512];
        loop {
            match ctrl.read(&mut sink).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        e = client_to_server => {
            debug!(error = %e, "udp uplink ended");
        }
        e = server_to_client => {
            debug!(error = %e, "udp downlink ended");
        }
        _ = control => {
            debug!("udp associate control closed");
        }
    }
    Ok(())
}

// ── SOCKS4 / SOCKS4a ────────────────────────────────────────────────────

async fn handle_socks4(
    mut conn: PreBufferedStream<TcpStream>,
    ctx: Arc<ClientContext>,
) -> Result<()> {
    // VN CD DSTPORT(2) DSTIP(4) USERID\0 [DOMAIN\0]
    let mut head = [0u8; 8];
    conn.read_exact(&mut head).await?;
    if head[0] != 0x04 || head[1] != 0x01 {
        return Err(Error::Transport("unsupported socks4 command".to_string()));
    }

    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = [head[4], head[5], head[6], head[7]];

    read_null_terminated(&mut conn).await?; // USERID

    // SOCKS4a：0.0.0.x (x != 0) 表示后随域名
    let addr = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let domain = read_null_terminated(&mut conn).await?;
        Address::Domain(domain, port)
    } else {
        Address::Ip(SocketAddr::from((ip, port)))
    };

    match dial_target(&ctx, &addr).await {
        Ok(remote) => {
            conn.write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).await?;
            pipe(conn, remote).await
        }
        Err(e) => {
            conn.write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]).await?;
            Err(e)
        }
    }
}

async fn read_null_terminated(
    conn: &mut PreBufferedStream<TcpStream>,
) -> Result<String> {
    let mut out = Vec::new();
    loop {
        let b = conn.read_u8().await?;
        if b == 0 {
            break;
        }
        if out.len() > 255 {
            return Err(Error::Transport("socks4 field too long".to_string()));
        }
        out.push(b);
    }
    String::from_utf8(out).map_err(|_| Error::Transport("non-utf8 socks4 field".to_string()))
}

// ── HTTP 代理 ───────────────────────────────────────────────────────────

async fn handle_http(
    mut conn: PreBufferedStream<TcpStream>,
    ctx: Arc<ClientContext>,
) -> Result<()> {
    let head = read_http_head(&mut conn).await?;
    let head_str = String::from_utf8_lossy(&head).to_string();

    let mut lines = head_str.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let uri = parts.next().unwrap_or_default().to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    if method.eq_ignore_ascii_case("CONNECT") {
        let addr = Address::parse(&uri)?;
        match dial_target(&ctx, &addr).await {
            Ok(remote) => {
                conn.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                return pipe(conn, remote).await;
            }
            Err(e) => {
                conn.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                return Err(e);
            }
        }
    }

    // 普通请求：绝对 URI 优先，否则取 Host 头；默认 80 端口
    let (target, origin_path) = parse_plain_target(&uri, &head_str)?;

    match dial_target(&ctx, &target).await {
        Ok(mut remote) => {
            // 重写请求行为 origin-form，其余头原样转发
            let rest = match head_str.find("\r\n") {
                Some(i) => &head_str[i + 2..],
                None => "",
            };
            let mut rewritten = format!("{} {} {}\r\n", method, origin_path, version);
            rewritten.push_str(rest);
            remote.write_all(rewritten.as_bytes()).await?;
            remote.flush().await?;
            pipe(conn, remote).await
        }
        Err(e) => {
            conn.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            Err(e)
        }
    }
}

/// 读取请求头直到空行；多读的字节不会出现（逐字节扫描）
async fn read_http_head(conn: &mut PreBufferedStream<TcpStream>) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    loop {
        let b = conn.read_u8().await?;
        head.push(b);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_HTTP_HEAD {
            return Err(Error::Transport("http request head too large".to_string()));
        }
    }
}

fn parse_plain_target(uri: &str, head: &str) -> Result<(Address, String)> {
    if let Some(rest) = uri.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let target = if authority.contains(':') {
            Address::parse(authority)?
        } else {
            Address::parse(&format!("{}:80", authority))?
        };
        return Ok((target, path.to_string()));
    }

    // origin-form：从 Host 头找目标
    for line in head.split("\r\n").skip(1) {
        if let Some(host) = line
            .strip_prefix("Host:")
            .or_else(|| line.strip_prefix("host:"))
        {
            let host = host.trim();
            let target = if host.contains(':') {
                Address::parse(host)?
            } else {
                Address::parse(&format!("{}:80", host))?
            };
            return Ok((target, uri.to_string()));
        }
    }
    Err(Error::Transport("missing host header".to_string()))
}
