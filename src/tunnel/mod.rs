/// 隧道协议层
///
/// 在 TCP 连接上组装 混淆(obfs) + 加密(AEAD) 栈，完成握手并交付可
/// 双工读写的隧道句柄。上行（客户端→服务端）恒为 Sudoku 流编码；
/// 下行按协商结果用 Sudoku（pure）或 6bit 打包（packed）。
pub mod dialer;
pub mod fallback;
pub mod handshake;
pub mod uot;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::common::{DirectionalStream, Error, PreBufferedStream, Result};
use crate::crypto::AeadStream;
use crate::obfs::{PackedStream, SudokuStream, Table};

pub const DOWNLINK_MODE_PURE: u8 = 0x01;
pub const DOWNLINK_MODE_PACKED: u8 = 0x02;

/// 隧道协议参数（两端共享的那部分 + 服务端握手期限）
#[derive(Clone)]
pub struct TunnelConfig {
    /// 规范化后的共享种子（表种子 / AEAD 密钥 / 握手哈希共用）
    pub seed: String,
    pub aead_method: String,
    pub tables: Vec<Arc<Table>>,
    pub padding_min: u8,
    pub padding_max: u8,
    pub enable_pure_downlink: bool,
    pub disable_http_mask: bool,
    pub handshake_timeout: Duration,
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.seed.is_empty() {
            return Err(Error::ConfigInvalid("key cannot be empty".to_string()));
        }
        if self.tables.is_empty() {
            return Err(Error::ConfigInvalid("no table configured".to_string()));
        }
        if self.tables.len() > 255 {
            return Err(Error::ConfigInvalid(format!(
                "too many table candidates: {}",
                self.tables.len()
            )));
        }
        match self.aead_method.as_str() {
            "aes-128-gcm" | "chacha20-poly1305" | "none" => {}
            m => {
                return Err(Error::ConfigInvalid(format!(
                    "invalid AEAD method: {}",
                    m
                )))
            }
        }
        if self.padding_max < self.padding_min {
            return Err(Error::ConfigInvalid(format!(
                "padding_max ({}) must be >= padding_min ({})",
                self.padding_max, self.padding_min
            )));
        }
        if !self.enable_pure_downlink && self.aead_method == "none" {
            return Err(Error::ConfigInvalid(
                "bandwidth optimized downlink requires AEAD".to_string(),
            ));
        }
        Ok(())
    }

    pub fn mode_byte(&self) -> u8 {
        if self.enable_pure_downlink {
            DOWNLINK_MODE_PURE
        } else {
            DOWNLINK_MODE_PACKED
        }
    }
}

/// 下行读取侧（客户端）：pure 用 Sudoku 解码，packed 用 6bit 解包
pub enum ObfsReader<R> {
    Sudoku(SudokuStream<R>),
    Packed(PackedStream<R>),
}

impl<R: AsyncRead + Unpin> AsyncRead for ObfsReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ObfsReader::Sudoku(s) => Pin::new(s).poll_read(cx, buf),
            ObfsReader::Packed(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

/// 下行写入侧（服务端）：packed 写侧在 poll_shutdown 时自带 flush 语义
pub enum ObfsWriter<W> {
    Sudoku(SudokuStream<W>),
    Packed(PackedStream<W>),
}

impl<W> ObfsWriter<W> {
    pub fn into_inner(self) -> W {
        match self {
            ObfsWriter::Sudoku(s) => s.into_inner(),
            ObfsWriter::Packed(s) => s.into_inner(),
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ObfsWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ObfsWriter::Sudoku(s) => Pin::new(s).poll_write(cx, buf),
            ObfsWriter::Packed(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ObfsWriter::Sudoku(s) => Pin::new(s).poll_flush(cx),
            ObfsWriter::Packed(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ObfsWriter::Sudoku(s) => Pin::new(s).poll_shutdown(cx),
            ObfsWriter::Packed(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// 客户端隧道栈：AEAD over (下行解码 + 上行 Sudoku 编码)
pub type ClientTunnel =
    AeadStream<DirectionalStream<ObfsReader<OwnedReadHalf>, SudokuStream<OwnedWriteHalf>>>;

/// 服务端隧道栈：AEAD over (上行 Sudoku 解码[带重放前缀] + 下行编码)
pub type ServerTunnel = AeadStream<
    DirectionalStream<SudokuStream<PreBufferedStream<OwnedReadHalf>>, ObfsWriter<OwnedWriteHalf>>,
>;
