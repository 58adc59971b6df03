/// HTTP 伪装层
///
/// 客户端在任何混淆字节之前写入一个随机化的 HTTP/1.1 请求头，
/// 让链路的起始流量看起来像普通 HTTP。服务端自动探测请求行，
/// 在自己的读取循环里累积字节并用 `scan_header` 找到头部边界；
/// 消费的字节保留给回落重放。
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

/// 请求头消费上限
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// 写入随机 HTTP/1.1 请求头（客户端）
///
/// 请求行为随机的 POST/GET + 随机路径；Host 为服务器对外地址；
/// 附带 UA 与 2..=6 条随机的 header 形状行。
pub async fn write_random_request_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    host: &str,
) -> std::io::Result<()> {
    let header = {
        let mut rng = rand::thread_rng();

        let method = if rng.gen_bool(0.5) { "POST" } else { "GET" };
        let path = random_path(&mut rng);
        let ua = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];

        let mut header = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\n",
            method, path, host, ua,
        );

        let extra = rng.gen_range(2..=6);
        for _ in 0..extra {
            let (name, value) = random_header_line(&mut rng);
            header.push_str(&name);
            header.push_str(": ");
            header.push_str(&value);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");
        header
    };

    writer.write_all(header.as_bytes()).await
}

/// 判断前 4 字节是否像 HTTP 请求行开头
pub fn looks_like_http_request_start(peek: &[u8]) -> bool {
    if peek.len() < 4 {
        return false;
    }
    peek.starts_with(b"GET ")
        || peek.starts_with(b"POST")
        || peek.starts_with(b"PUT ")
        || peek.starts_with(b"HEAD")
}

/// 在累积的字节里扫描 HTTP 请求头（服务端）
///
/// 返回 `Ok(Some(end))` 表示 `acc[..end]`（含结尾空行）是完整请求头，
/// `end` 之后的字节属于后续协议层；`Ok(None)` 表示还需要更多字节。
/// 方法非法或累积超过 16 KiB 上限返回错误。调用方持有 `acc`，
/// 失败时它就是要回放给诱饵的已消费字节。
pub fn scan_header(acc: &[u8]) -> Result<Option<usize>> {
    if let Some(end) = acc.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4) {
        if !valid_request_line(&acc[..end]) {
            return Err(Error::MaskInvalid("unrecognized http method".to_string()));
        }
        return Ok(Some(end));
    }
    if acc.len() > MAX_HEADER_BYTES {
        return Err(Error::MaskInvalid(format!(
            "header exceeds {} bytes",
            MAX_HEADER_BYTES
        )));
    }
    Ok(None)
}

/// 校验请求行方法是否合法
fn valid_request_line(line: &[u8]) -> bool {
    const METHODS: &[&[u8]] = &[
        b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ",
    ];
    METHODS.iter().any(|m| line.starts_with(m))
}

fn random_path(rng: &mut impl Rng) -> String {
    const SEGMENTS: &[&str] = &[
        "api", "cdn", "assets", "static", "media", "content", "data", "v1", "v2",
    ];
    let seg = SEGMENTS[rng.gen_range(0..SEGMENTS.len())];
    format!("/{}/{}", seg, random_token(rng))
}

fn random_token(rng: &mut impl Rng) -> String {
    let len = rng.gen_range(8..16);
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

fn random_header_line(rng: &mut impl Rng) -> (String, String) {
    match rng.gen_range(0..5) {
        0 => ("Accept".to_string(), "*/*".to_string()),
        1 => (
            "Accept-Language".to_string(),
            ["en-US,en;q=0.9", "zh-CN,zh;q=0.9", "ja-JP,ja;q=0.8"][rng.gen_range(0..3)].to_string(),
        ),
        2 => ("Connection".to_string(), "keep-alive".to_string()),
        3 => ("Cache-Control".to_string(), "no-cache".to_string()),
        _ => ("X-Request-Id".to_string(), random_token(rng)),
    }
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
];
