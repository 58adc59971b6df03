/// UDP-over-TCP 端到端测试
///
/// 客户端开 UoT 隧道 → 服务端中继到本机 UDP echo → 原帧返回
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};

use sudoku_tunnel::common::Address;
use sudoku_tunnel::config::Config;
use sudoku_tunnel::tunnel::dialer::Dialer;
use sudoku_tunnel::tunnel::uot;

async fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = l.local_addr().unwrap().port();
    drop(l);
    port
}

async fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            if socket.send_to(&buf[..n], from).await.is_err() {
                break;
            }
        }
    });
    addr
}

fn server_config(port: u16) -> Config {
    Config {
        mode: "server".to_string(),
        local_port: port,
        key: "uot-test-key".to_string(),
        aead: "aes-128-gcm".to_string(),
        ascii: "prefer_entropy".to_string(),
        padding_min: 5,
        padding_max: 12,
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
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    for _ in 0..600 {
        if TcpStream::connect(addr).await.is_ok() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("tunnel server did not come up");
}

fn client_dialer(server: SocketAddr, cfg: &Config) -> Dialer {
    let mut client_cfg = cfg.clone();
    client_cfg.mode = "client".to_string();
    client_cfg.server_address = server.to_string();
    let tables = client_cfg.build_tables(&client_cfg.key).unwrap();
    let tunnel = client_cfg.tunnel_config(client_cfg.key.clone(), tables);
    Dialer::new(tunnel, client_cfg.server_address.clone())
}

#[tokio::test(flavor = "multi_thread")]
async fn uot_bidirectional_echo() {
    let udp_echo = start_udp_echo().await;
    let port = free_port().await;
    let cfg = server_config(port);
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg);
    let mut tunnel = dialer.dial_udp_over_tcp().await.expect("uot dial failed");

    let dest = Address::parse(&udp_echo.to_string()).unwrap();
    uot::write_datagram(&mut tunnel, &dest, b"api uot ping")
        .await
        .unwrap();

    let (from, payload) = tokio::time::timeout(Duration::from_secs(5), uot::read_datagram(&mut tunnel))
        .await
        .expect("uot echo timed out")
        .expect("uot read failed");

    assert_eq!(payload, b"api uot ping");
    assert_eq!(from.port(), udp_echo.port(), "reply must carry the echo source");
}

#[tokio::test(flavor = "multi_thread")]
async fn uot_multiple_datagrams_in_order() {
    let udp_echo = start_udp_echo().await;
    let port = free_port().await;
    let cfg = server_config(port);
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg);
    let mut tunnel = dialer.dial_udp_over_tcp().await.expect("uot dial failed");
    let dest = Address::parse(&udp_echo.to_string()).unwrap();

    // 逐个往返，避免对 UDP 乱序语义做额外假设
    for i in 0..8u8 {
        let msg = vec![i; 100 + i as usize];
        uot::write_datagram(&mut tunnel, &dest, &msg).await.unwrap();
        let (_, payload) =
            tokio::time::timeout(Duration::from_secs(5), uot::read_datagram(&mut tunnel))
                .await
                .expect("uot echo timed out")
                .expect("uot read failed");
        assert_eq!(payload, msg);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn uot_invalid_destination_is_skipped() {
    let udp_echo = start_udp_echo().await;
    let port = free_port().await;
    let cfg = server_config(port);
    let server = start_tunnel_server(cfg.clone()).await;

    let dialer = client_dialer(server, &cfg);
    let mut tunnel = dialer.dial_udp_over_tcp().await.expect("uot dial failed");

    // 无法解析的目标：该帧被跳过，会话保持存活
    let bad = Address::Domain("definitely-not-resolvable.invalid".to_string(), 9);
    uot::write_datagram(&mut tunnel, &bad, b"dropped").await.unwrap();

    let dest = Address::parse(&udp_echo.to_string()).unwrap();
    uot::write_datagram(&mut tunnel, &dest, b"still alive")
        .await
        .unwrap();

    let (_, payload) = tokio::time::timeout(Duration::from_secs(10), uot::read_datagram(&mut tunnel))
        .await
        .expect("session should survive a bad destination")
        .expect("uot read failed");
    assert_eq!(payload, b"still alive");
}
