/// 服务端可疑流量处置测试
///
/// 核心保证：主动探测者看到的行为必须与诱饵服务一致。
/// - fallback：诱饵按线上顺序收到探测者发出的每一个字节
/// - silent：连接关闭，诱饵零接触
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use sudoku_tunnel::config::Config;
use sudoku_tunnel::crypto::AeadStream;
use sudoku_tunnel::obfs::SudokuStream;
use sudoku_tunnel::tunnel::DOWNLINK_MODE_PURE;

async fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = l.local_addr().unwrap().port();
    drop(l);
    port
}

/// 诱饵：每个连接把收到的全部字节发回 channel
async fn start_decoy() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await
                    {
                        Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                        Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                    }
                }
                tx.send(collected).ok();
            });
        }
    });
    (addr, rx)
}

fn server_config(port: u16, fallback: &str, action: &str) -> Config {
    Config {
        mode: "server".to_string(),
        local_port: port,
        key: "fallback-test-key".to_string(),
        aead: "chacha20-poly1305".to_string(),
        ascii: "prefer_entropy".to_string(),
        padding_min: 5,
        padding_max: 15,
        fallback_address: fallback.to_string(),
        suspicious_action: action.to_string(),
        handshake_timeout_seconds: 3,
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

/// 取下一条非空的诱饵记录。
/// 就绪探测的空连接也会触发回落，但记录为空，过滤掉。
async fn recv_replayed(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let msg = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("decoy never contacted")
            .expect("decoy channel closed");
        if !msg.is_empty() {
            return msg;
        }
    }
}

/// 写侧旁录：记录经过的全部线上字节
struct TeeWriter<S> {
    inner: S,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TeeWriter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.sent.lock().unwrap().extend_from_slice(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TeeWriter<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn random_prefix_replayed_to_decoy_verbatim() {
    let (decoy, mut decoy_rx) = start_decoy().await;
    let port = free_port().await;
    let cfg = server_config(port, &decoy.to_string(), "fallback");
    let server = start_tunnel_server(cfg).await;

    // 64 个确定的"随机"字节；首字节避开 HTTP 方法前缀
    let prefix: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37).wrapping_add(0x81)).collect();
    assert_ne!(prefix[0], b'G');
    assert_ne!(prefix[0], b'P');
    assert_ne!(prefix[0], b'H');

    let mut probe_conn = TcpStream::connect(server).await.unwrap();
    probe_conn.write_all(&prefix).await.unwrap();
    probe_conn.flush().await.unwrap();

    let replayed = recv_replayed(&mut decoy_rx).await;
    assert_eq!(replayed, prefix, "decoy must see the probe bytes verbatim");
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_timestamp_falls_back_with_exact_replay() {
    let (decoy, mut decoy_rx) = start_decoy().await;
    let port = free_port().await;
    let cfg = server_config(port, &decoy.to_string(), "fallback");
    let server = start_tunnel_server(cfg.clone()).await;

    // 手工组客户端栈，伪造 120 秒前的时间戳
    let table = cfg.build_tables(&cfg.key).unwrap().remove(0);
    let raw = TcpStream::connect(server).await.unwrap();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let tee = TeeWriter {
        inner: raw,
        sent: sent.clone(),
    };
    let sudoku = SudokuStream::new(tee, table, cfg.padding_min, cfg.padding_max, None);
    let mut stream = AeadStream::new(sudoku, &cfg.key, &cfg.aead).unwrap();

    let mut prelude = [0u8; 16];
    let stale_ts = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        - 120) as u64;
    prelude[..8].copy_from_slice(&stale_ts.to_be_bytes());
    use sha2::Digest;
    let hash = sha2::Sha256::digest(cfg.key.as_bytes());
    prelude[8..16].copy_from_slice(&hash[..8]);

    stream.write_all(&prelude).await.unwrap();
    stream.write_all(&[DOWNLINK_MODE_PURE]).await.unwrap();
    stream.flush().await.unwrap();

    let replayed = recv_replayed(&mut decoy_rx).await;

    let wire = sent.lock().unwrap().clone();
    assert!(!replayed.is_empty());
    assert!(
        replayed.len() <= wire.len(),
        "decoy got more than the client sent"
    );
    assert_eq!(
        replayed,
        wire[..replayed.len()],
        "decoy bytes must be a wire-order prefix of the probe's bytes"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn downlink_mode_mismatch_triggers_fallback() {
    let (decoy, mut decoy_rx) = start_decoy().await;
    let port = free_port().await;
    // 服务端 pure
    let cfg = server_config(port, &decoy.to_string(), "fallback");
    let server = start_tunnel_server(cfg.clone()).await;

    // 客户端请求 packed 下行
    let mut client_cfg = cfg.clone();
    client_cfg.mode = "client".to_string();
    client_cfg.server_address = server.to_string();
    client_cfg.enable_pure_downlink = false;

    let tables = client_cfg.build_tables(&client_cfg.key).unwrap();
    let tunnel = client_cfg.tunnel_config(client_cfg.key.clone(), tables);
    let raw = TcpStream::connect(server).await.unwrap();
    let mut stream = sudoku_tunnel::tunnel::handshake::client_handshake(raw, &tunnel, "127.0.0.1")
        .await
        .unwrap();

    // 服务端拒绝并回落；客户端随后读到的要么是 EOF 要么是诱饵响应
    let replayed = recv_replayed(&mut decoy_rx).await;
    assert!(!replayed.is_empty(), "decoy must receive the recorded bytes");

    let mut out = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut out)).await;
    match read {
        Ok(Ok(_)) | Ok(Err(_)) => {}
        Err(_) => panic!("client connection should settle after mismatch"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_action_closes_without_decoy_contact() {
    let (decoy, mut decoy_rx) = start_decoy().await;
    let port = free_port().await;
    let cfg = server_config(port, &decoy.to_string(), "silent");
    let server = start_tunnel_server(cfg).await;

    let mut probe_conn = TcpStream::connect(server).await.unwrap();
    let garbage: Vec<u8> = (0..32u8).map(|i| i.wrapping_mul(73).wrapping_add(0xA1)).collect();
    probe_conn.write_all(&garbage).await.unwrap();

    // 连接应在握手期限内被关闭
    let mut out = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(8), probe_conn.read(&mut out))
        .await
        .expect("server should close the connection");
    match read {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("server wrote {} unexpected bytes", n),
    }

    // 诱饵必须零接触
    let contacted = tokio::time::timeout(Duration::from_secs(1), decoy_rx.recv()).await;
    assert!(contacted.is_err(), "decoy must not be contacted in silent mode");
}
