/// 隧道端到端回环测试
///
/// 每个用例：
/// 1. 起一个 TCP echo 服务
/// 2. 起 sudoku-tunnel 服务端（指向任意目标的转发模式）
/// 3. 客户端 Dialer 经隧道连到 echo，校验数据往返
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sudoku_tunnel::common::Address;
use sudoku_tunnel::config::Config;
use sudoku_tunnel::tunnel::dialer::Dialer;

async fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = l.local_addr().unwrap().port();
    drop(l);
    port
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn server_config(port: u16, key: &str, ascii: &str, aead: &str, pure: bool) -> Config {
    Config {
        mode: "server".to_string(),
        local_port: port,
        key: key.to_string(),
        aead: aead.to_string(),
        ascii: ascii.to_string(),
        padding_min: 8,
        padding_max: 18,
        enable_pure_downlink: pure,
        suspicious_action: "silent".to_string(),
        handshake_timeout_seconds: 10,
        ..Config::default()
    }
}

async fn start_tunnel_server(cfg: Config) -> SocketAddr {
    let port = cfg.local_port;
    tokio::spawn(async move {
        sudoku_tunnel::app::run_server(cfg).await.ok();
    });

    // 等待监听就绪（表构建需要一点时间）
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    for _ in 0..600 {
        if TcpStream::connect(addr).await.is_ok() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("tunnel server did not come up on {}", addr);
}

fn client_dialer(server: SocketAddr, cfg: &Config, disable_mask: bool) -> Dialer {
    let mut client_cfg = cfg.clone();
    client_cfg.mode = "client".to_string();
    client_cfg.server_address = server.to_string();
    client_cfg.disable_http_mask = disable_mask;

    let tables = client_cfg.build_tables(&client_cfg.key).unwrap();
    let tunnel = client_cfg.tunnel_config(client_cfg.key.clone(), tables);
    Dialer::new(tunnel, client_cfg.server_address.clone())
}

async fn echo_roundtrip(dialer: &Dialer, echo: SocketAddr, payload: &[u8]) {
    let dest = Address::parse(&echo.to_string()).unwrap();
    let mut stream = dialer.dial(&dest).await.expect("tunnel dial failed");

    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();

    let mut out = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut out))
        .await
        .expect("echo read timeout")
        .expect("echo read failed");
    assert_eq!(out, payload);
}

// ── 用例 ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn ascii_pure_aes_echo() {
    let echo = start_echo_server().await;
    let port = free_port().await;
    let cfg = server_config(port, "api-packed-key", "prefer_ascii", "aes-128-gcm", true);
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg, false);
    echo_roundtrip(&dialer, echo, b"api packed downlink echo!").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn entropy_packed_chacha_echo() {
    let echo = start_echo_server().await;
    let port = free_port().await;
    let cfg = server_config(
        port,
        "packed-downlink-key",
        "prefer_entropy",
        "chacha20-poly1305",
        false,
    );
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg, false);
    echo_roundtrip(&dialer, echo, b"bandwidth optimized downlink").await;

    // 较大载荷覆盖 packed 写侧的块路径与分帧
    let big: Vec<u8> = (0..70_000).map(|i| (i % 253) as u8).collect();
    echo_roundtrip(&dialer, echo, &big).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mask_disabled_client_still_accepted() {
    // 服务端始终自动探测；不带伪装头的客户端同样可用
    let echo = start_echo_server().await;
    let port = free_port().await;
    let cfg = server_config(port, "no-mask-key", "prefer_entropy", "aes-128-gcm", true);
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg, true);
    echo_roundtrip(&dialer, echo, b"no http mask here").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn large_payload_both_directions() {
    let echo = start_echo_server().await;
    let port = free_port().await;
    let cfg = server_config(port, "large-payload-key", "prefer_ascii", "chacha20-poly1305", true);
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg, false);
    let payload: Vec<u8> = (0..128 * 1024).map(|i| (i * 31 % 256) as u8).collect();
    echo_roundtrip(&dialer, echo, &payload).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_connections_share_tables() {
    let echo = start_echo_server().await;
    let port = free_port().await;
    let cfg = server_config(port, "sequential-key", "prefer_entropy", "chacha20-poly1305", true);
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg, false);
    for i in 0..5u8 {
        echo_roundtrip(&dialer, echo, &[i; 600]).await;
    }
}
