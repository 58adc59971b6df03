/// Sudoku 协议握手
///
/// 客户端：HTTP 伪装（可选）→ 组装混淆+加密栈 → 16 字节握手前导
/// （8B big-endian unix 秒 + 8B SHA256(seed) 前缀）→ 1 字节下行模式。
///
/// 服务端：自动探测并消费 HTTP 伪装 → 对候选表做只读探测选表 →
/// 把已消费字节重放进真实解码栈 → 校验时间戳新鲜度与下行模式。
/// 任何失败都携带按线上顺序记录的全部已消费字节，供回落重放。
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::{ClientTunnel, ObfsReader, ObfsWriter, ServerTunnel, TunnelConfig};
use crate::common::{Error, PreBufferedStream, Result};
use crate::crypto::AeadStream;
use crate::obfs::{httpmask, PackedStream, Recorder, SudokuStream, Table};

/// 探测读取窗口上限
const MAX_PROBE_BYTES: usize = 64 * 1024;
/// 探测每次补读的块大小
const PROBE_READ_CHUNK: usize = 4 * 1024;
/// 时间戳允许偏差（秒）
const MAX_TIMESTAMP_SKEW: i64 = 60;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// 构建 16 字节握手前导
pub fn build_handshake_payload(seed: &str) -> [u8; 16] {
    let mut payload = [0u8; 16];
    payload[..8].copy_from_slice(&(unix_now() as u64).to_be_bytes());
    let hash = Sha256::digest(seed.as_bytes());
    payload[8..16].copy_from_slice(&hash[..8]);
    payload
}

fn check_timestamp(prelude: &[u8; 16]) -> Result<()> {
    let ts = i64::from_be_bytes(prelude[..8].try_into().unwrap());
    let now = unix_now();
    if (now - ts).abs() > MAX_TIMESTAMP_SKEW {
        return Err(Error::HandshakeStale {
            server: now,
            client: ts,
        });
    }
    Ok(())
}

// ── 客户端 ──────────────────────────────────────────────────────────────

/// 每连接随机选一张候选表，返回 (表, 表下标)
fn pick_client_table(cfg: &TunnelConfig) -> (Arc<Table>, u8) {
    if cfg.tables.len() == 1 {
        return (cfg.tables[0].clone(), 0);
    }
    let idx = rand::thread_rng().gen_range(0..cfg.tables.len());
    (cfg.tables[idx].clone(), idx as u8)
}

/// 在已建立的 TCP 连接上执行客户端握手，返回可读写的隧道
///
/// `mask_host` 为伪装请求头里的 Host（通常是服务器对外地址）。
/// 调用方随后写入目标地址记录或 UoT 前导。
pub async fn client_handshake(
    mut raw: TcpStream,
    cfg: &TunnelConfig,
    mask_host: &str,
) -> Result<ClientTunnel> {
    cfg.validate()?;

    if !cfg.disable_http_mask {
        httpmask::write_random_request_header(&mut raw, mask_host).await?;
    }

    let (table, table_id) = pick_client_table(cfg);

    let (rh, wh) = raw.into_split();
    let reader = if cfg.enable_pure_downlink {
        ObfsReader::Sudoku(SudokuStream::new(
            rh,
            table.clone(),
            cfg.padding_min,
            cfg.padding_max,
            None,
        ))
    } else {
        ObfsReader::Packed(PackedStream::new(
            rh,
            table.clone(),
            cfg.padding_min,
            cfg.padding_max,
        ))
    };
    let writer = SudokuStream::new(wh, table, cfg.padding_min, cfg.padding_max, None);

    let mut stream = AeadStream::new(
        crate::common::DirectionalStream::new(reader, writer),
        &cfg.seed,
        &cfg.aead_method,
    )?;

    let mut prelude = build_handshake_payload(&cfg.seed);
    if cfg.tables.len() > 1 {
        // 多表时末字节携带表下标；服务端不读它而靠探测识别，
        // 保留只为线上格式与旧版本一致
        prelude[15] = table_id;
    }
    stream.write_all(&prelude).await?;
    stream.write_all(&[cfg.mode_byte()]).await?;
    stream.flush().await?;

    Ok(stream)
}

// ── 服务端 ──────────────────────────────────────────────────────────────

/// 握手失败：携带原始连接与已消费的线上字节
pub struct HandshakeFailure {
    pub raw: Option<TcpStream>,
    pub recorded: Vec<u8>,
    pub reason: Error,
}

/// 握手成功后的服务端会话
pub struct ServerHandshake {
    pub stream: ServerTunnel,
    pub recorder: Recorder,
    http_header: Vec<u8>,
    probe: Vec<u8>,
}

impl ServerHandshake {
    /// 自 accept 以来从线上消费的全部字节（伪装头 + 探测窗口 + 其后解码栈消费的）
    pub fn recorded_wire_bytes(&self) -> Vec<u8> {
        let recorded = self.recorder.snapshot();
        let overlap = self.probe.len().min(recorded.len());
        let mut out =
            Vec::with_capacity(self.http_header.len() + self.probe.len() + recorded.len() - overlap);
        out.extend_from_slice(&self.http_header);
        out.extend_from_slice(&self.probe);
        out.extend_from_slice(&recorded[overlap..]);
        out
    }

    /// 拆回原始 TCP 连接（握手提交后的失败路径用于回落）
    pub fn into_failure(self, reason: Error) -> HandshakeFailure {
        let recorded = self.recorded_wire_bytes();
        let dir = self.stream.into_inner();
        let (uplink, writer) = dir.into_parts();
        let rh = uplink.into_inner().into_inner();
        let wh = writer.into_inner();
        HandshakeFailure {
            raw: rh.reunite(wh).ok(),
            recorded,
            reason,
        }
    }
}

/// 带期限地从 socket 读一块数据追加到 acc；EOF 与超时都算失败
async fn read_chunk_deadline(
    raw: &mut TcpStream,
    deadline: Instant,
    acc: &mut Vec<u8>,
    chunk_size: usize,
) -> std::result::Result<usize, Error> {
    let mut chunk = vec![0u8; chunk_size];
    let n = match timeout_at(deadline, raw.read(&mut chunk)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(Error::Io(e)),
        Err(_) => {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake deadline exceeded",
            )))
        }
    };
    if n == 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed during handshake",
        )));
    }
    acc.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// 对候选表做一次只读探测：在 probe 字节的重放之上组装无状态解码栈，
/// 尝试解出 16 字节前导 + 1 字节模式
async fn probe_decode(probe: &[u8], cfg: &TunnelConfig, table: &Arc<Table>) -> Result<()> {
    let sudoku = SudokuStream::new(probe, table.clone(), cfg.padding_min, cfg.padding_max, None);
    let mut aead = AeadStream::new(sudoku, &cfg.seed, &cfg.aead_method)?;

    let mut prelude = [0u8; 16];
    aead.read_exact(&mut prelude).await?;
    check_timestamp(&prelude)?;

    let mode = aead.read_u8().await?;
    if mode != cfg.mode_byte() {
        return Err(Error::HandshakeModeMismatch {
            client: mode,
            server: cfg.mode_byte(),
        });
    }
    Ok(())
}

fn is_short_read(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof)
}

fn probe_failure(
    raw: TcpStream,
    http_header: &[u8],
    probe: Vec<u8>,
    reason: Error,
) -> Box<HandshakeFailure> {
    let mut recorded = Vec::with_capacity(http_header.len() + probe.len());
    recorded.extend_from_slice(http_header);
    recorded.extend_from_slice(&probe);
    Box::new(HandshakeFailure {
        raw: Some(raw),
        recorded,
        reason,
    })
}

/// 服务端握手
///
/// 成功返回已升级的隧道；失败返回 `HandshakeFailure`，由上层按
/// suspicious_action 处理（回落重放或静默关闭）。
pub async fn server_handshake(
    mut raw: TcpStream,
    cfg: &TunnelConfig,
) -> std::result::Result<ServerHandshake, Box<HandshakeFailure>> {
    if let Err(e) = cfg.validate() {
        return Err(Box::new(HandshakeFailure {
            raw: Some(raw),
            recorded: Vec::new(),
            reason: e,
        }));
    }

    let deadline = Instant::now() + cfg.handshake_timeout;

    // 1. HTTP 伪装探测与消费。前 4 字节决定是否走伪装分支；
    //    多读的字节归入探测窗口。
    let mut acc: Vec<u8> = Vec::with_capacity(1024);
    while acc.len() < 4 {
        if let Err(e) = read_chunk_deadline(&mut raw, deadline, &mut acc, 1024).await {
            return Err(Box::new(HandshakeFailure {
                raw: Some(raw),
                recorded: acc,
                reason: e,
            }));
        }
    }

    let mut http_header: Vec<u8> = Vec::new();
    let mut probe: Vec<u8>;

    if httpmask::looks_like_http_request_start(&acc[..4]) {
        loop {
            match httpmask::scan_header(&acc) {
                Ok(Some(end)) => {
                    http_header = acc[..end].to_vec();
                    probe = acc[end..].to_vec();
                    break;
                }
                Ok(None) => {
                    if let Err(e) = read_chunk_deadline(&mut raw, deadline, &mut acc, 1024).await {
                        return Err(Box::new(HandshakeFailure {
                            raw: Some(raw),
                            recorded: acc,
                            reason: e,
                        }));
                    }
                }
                Err(e) => {
                    return Err(Box::new(HandshakeFailure {
                        raw: Some(raw),
                        recorded: acc,
                        reason: e,
                    }));
                }
            }
        }
        debug!(header_len = http_header.len(), "consumed http mask");
    } else {
        probe = acc;
    }

    // 2. 只读探测选表。短读说明还需要更多字节；其余错误换下一个候选。
    //    探测不提交任何状态，成功后把整个窗口重放进真实解码栈。
    let selected: Arc<Table>;
    let mut last_err: Option<Error> = None;
    'probe: loop {
        let mut need_more = false;
        for table in &cfg.tables {
            match probe_decode(&probe, cfg, table).await {
                Ok(()) => {
                    selected = table.clone();
                    break 'probe;
                }
                Err(e) if is_short_read(&e) => need_more = true,
                Err(e) => last_err = Some(e),
            }
        }

        if !need_more {
            let reason = match last_err.take() {
                Some(e @ Error::HandshakeStale { .. })
                | Some(e @ Error::HandshakeModeMismatch { .. })
                    if cfg.tables.len() == 1 =>
                {
                    e
                }
                Some(e) => Error::HandshakeProbeFailed(e.to_string()),
                None => Error::HandshakeProbeFailed("no candidate matched".to_string()),
            };
            return Err(probe_failure(raw, &http_header, probe, reason));
        }
        if probe.len() >= MAX_PROBE_BYTES {
            return Err(probe_failure(
                raw,
                &http_header,
                probe,
                Error::HandshakeProbeFailed(format!(
                    "probe window exceeded {} bytes",
                    MAX_PROBE_BYTES
                )),
            ));
        }
        if let Err(e) = read_chunk_deadline(&mut raw, deadline, &mut probe, PROBE_READ_CHUNK).await {
            return Err(probe_failure(raw, &http_header, probe, e));
        }
    }

    debug!(
        probe_len = probe.len(),
        candidates = cfg.tables.len(),
        "probe selection committed"
    );

    // 3. 提交：探测窗口重放到真实解码栈前面，录制器挂上裸读路径
    let (rh, wh) = raw.into_split();
    let recorder = Recorder::new();
    let replay = PreBufferedStream::new(probe.clone(), rh);
    let uplink = SudokuStream::new(
        replay,
        selected.clone(),
        cfg.padding_min,
        cfg.padding_max,
        Some(recorder.clone()),
    );
    let writer = if cfg.enable_pure_downlink {
        ObfsWriter::Sudoku(SudokuStream::new(
            wh,
            selected.clone(),
            cfg.padding_min,
            cfg.padding_max,
            None,
        ))
    } else {
        ObfsWriter::Packed(PackedStream::new(
            wh,
            selected,
            cfg.padding_min,
            cfg.padding_max,
        ))
    };

    let stream = match AeadStream::new(
        crate::common::DirectionalStream::new(uplink, writer),
        &cfg.seed,
        &cfg.aead_method,
    ) {
        Ok(s) => s,
        Err(e) => {
            // 不可达：方法名已在 validate 中检查过
            return Err(Box::new(HandshakeFailure {
                raw: None,
                recorded: Vec::new(),
                reason: e,
            }));
        }
    };

    let mut session = ServerHandshake {
        stream,
        recorder,
        http_header,
        probe,
    };

    // 4. 通过真实栈重读前导与模式。字节必然已在重放窗口内，不触网。
    //    复核时间戳（探测与提交之间可能跨过 60 秒边界）。
    let mut prelude = [0u8; 16];
    if let Err(e) = session.stream.read_exact(&mut prelude).await {
        return Err(Box::new(session.into_failure(Error::Io(e))));
    }
    if let Err(e) = check_timestamp(&prelude) {
        return Err(Box::new(session.into_failure(e)));
    }
    let mode = match session.stream.read_u8().await {
        Ok(m) => m,
        Err(e) => return Err(Box::new(session.into_failure(Error::Io(e)))),
    };
    if mode != cfg.mode_byte() {
        return Err(Box::new(session.into_failure(Error::HandshakeModeMismatch {
            client: mode,
            server: cfg.mode_byte(),
        })));
    }

    Ok(session)
}
