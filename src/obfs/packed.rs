/// 带宽优化的 6bit 打包编解码器（仅用于 packed 下行）
///
/// 任意密文按 MSB 优先切成 6bit 组，每组映射进与 Sudoku 提示相同的
/// 字节空间（保持线上分布特征），按整数间隔调度插入 padding。
/// 每次写入自我封闭：尾部不足 6bit 的残余组左移补零后发出，
/// 紧跟一个 flush 标记字节；读侧遇到标记清空位累加器。
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::table::Table;

const IO_BUFFER_SIZE: usize = 32 * 1024;

/// ASCII 模式 flush 标记：'?'（padding 区）
const FLUSH_MARKER_ASCII: u8 = 0x3F;
/// 低熵模式 flush 标记
const FLUSH_MARKER_ENTROPY: u8 = 0x80;

pub struct PackedStream<S> {
    inner: S,
    is_ascii: bool,
    rng: ChaCha8Rng,

    // padding 调度
    pad_interval: i32,
    pad_countdown: i32,
    pad_marker: u8,
    pad_pool: Vec<u8>,

    // 写状态
    write_buf: Vec<u8>,
    write_pos: usize,

    // 读状态
    raw_buf: Vec<u8>,
    read_bit_buf: u64,
    read_bits: u32,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> PackedStream<S> {
    pub fn new(inner: S, table: Arc<Table>, padding_min: u8, padding_max: u8) -> Self {
        let mut rng = ChaCha8Rng::from_rng(rand::rngs::OsRng)
            .unwrap_or_else(|_| ChaCha8Rng::seed_from_u64(0x5061636B6564));

        // 平均填充率换算为整数间隔，热路径避免浮点判断
        let avg_rate = (padding_min as f32 + padding_max as f32) / 200.0;
        let interval: i32 = if avg_rate > 0.0001 {
            (1.0 / avg_rate) as i32
        } else {
            10_000
        };

        let is_ascii = table.layout.is_ascii;
        let pad_marker = if is_ascii {
            FLUSH_MARKER_ASCII
        } else {
            FLUSH_MARKER_ENTROPY
        };

        // padding 池剔除标记字节，并且必须在打包分类规则下仍是 padding
        let mut pad_pool: Vec<u8> = table
            .padding_pool
            .iter()
            .copied()
            .filter(|&b| b != pad_marker && is_packed_padding(is_ascii, b))
            .collect();
        if pad_pool.is_empty() {
            pad_pool.push(pad_marker);
        }

        let pad_countdown = rng.gen_range(0..=interval);

        PackedStream {
            inner,
            is_ascii,
            rng,
            pad_interval: interval,
            pad_countdown,
            pad_marker,
            pad_pool,
            write_buf: Vec::with_capacity(IO_BUFFER_SIZE),
            write_pos: 0,
            raw_buf: vec![0u8; IO_BUFFER_SIZE],
            read_bit_buf: 0,
            read_bits: 0,
            pending: Vec::with_capacity(4096),
            pending_pos: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    #[inline]
    fn encode_group(&self, group: u8) -> u8 {
        if self.is_ascii {
            0x40 | group
        } else {
            // 0xx0xxxx：bit 5..4 上移一位到 bit 6..5，低 nibble 原位
            ((group & 0x30) << 1) | (group & 0x0F)
        }
    }

    #[inline]
    fn decode_group(&self, b: u8) -> u8 {
        if self.is_ascii {
            b & 0x3F
        } else {
            ((b >> 1) & 0x30) | (b & 0x0F)
        }
    }

    #[inline]
    fn push_padding(&mut self) {
        let pad = self.pad_pool[self.rng.gen_range(0..self.pad_pool.len())];
        self.write_buf.push(pad);
        self.pad_countdown = self.rng.gen_range(0..self.pad_interval) + 1;
    }

    /// 编码整个输入到 write_buf。每次调用自我封闭（残余位 + flush 标记）。
    fn encode_into_write_buf(&mut self, p: &[u8]) {
        let n = p.len();
        let mut i = 0;

        // 块处理：3 字节 → 4 组
        while i + 2 < n {
            if self.pad_countdown <= 0 {
                self.push_padding();
            }
            self.pad_countdown -= 4;

            let (b1, b2, b3) = (p[i], p[i + 1], p[i + 2]);
            let g1 = (b1 >> 2) & 0x3F;
            let g2 = ((b1 & 0x03) << 4) | ((b2 >> 4) & 0x0F);
            let g3 = ((b2 & 0x0F) << 2) | ((b3 >> 6) & 0x03);
            let g4 = b3 & 0x3F;

            let e1 = self.encode_group(g1);
            let e2 = self.encode_group(g2);
            let e3 = self.encode_group(g3);
            let e4 = self.encode_group(g4);
            self.write_buf.extend_from_slice(&[e1, e2, e3, e4]);

            i += 3;
        }

        // 尾部 1-2 字节走位累加器
        let mut bit_buf: u64 = 0;
        let mut bit_count: u32 = 0;
        while i < n {
            bit_buf = (bit_buf << 8) | p[i] as u64;
            bit_count += 8;
            i += 1;
            while bit_count >= 6 {
                bit_count -= 6;
                let group = ((bit_buf >> bit_count) & 0x3F) as u8;
                bit_buf &= (1 << bit_count) - 1;

                self.pad_countdown -= 1;
                if self.pad_countdown <= 0 {
                    self.push_padding();
                }
                let e = self.encode_group(group);
                self.write_buf.push(e);
            }
        }

        // 残余位左移补零，发出后跟 flush 标记让读侧重新对齐
        if bit_count > 0 {
            self.pad_countdown -= 1;
            if self.pad_countdown <= 0 {
                self.push_padding();
            }
            let group = ((bit_buf << (6 - bit_count)) & 0x3F) as u8;
            let e = self.encode_group(group);
            self.write_buf.push(e);
            self.write_buf.push(self.pad_marker);
        }
    }

    fn drain_write_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        while self.write_pos < self.write_buf.len() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..])
            {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "inner stream closed during packed write",
                    )))
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

#[inline]
fn is_packed_padding(is_ascii: bool, b: u8) -> bool {
    if is_ascii {
        b & 0x40 == 0
    } else {
        b & 0x90 != 0
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.write_buf.is_empty() {
            match this.drain_write_buf(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.encode_into_write_buf(buf);

        match this.drain_write_buf(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.drain_write_buf(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.drain_write_buf(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pending_pos < this.pending.len() {
                let n = std::cmp::min(buf.remaining(), this.pending.len() - this.pending_pos);
                buf.put_slice(&this.pending[this.pending_pos..this.pending_pos + n]);
                this.pending_pos += n;
                if this.pending_pos == this.pending.len() {
                    this.pending.clear();
                    this.pending_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut this.raw_buf);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled_len = read_buf.filled().len();
                    if filled_len == 0 {
                        // EOF：残余位作废
                        this.read_bit_buf = 0;
                        this.read_bits = 0;
                        return Poll::Ready(Ok(()));
                    }

                    let mut acc = this.read_bit_buf;
                    let mut bits = this.read_bits;
                    for i in 0..filled_len {
                        let b = this.raw_buf[i];
                        if is_packed_padding(this.is_ascii, b) {
                            if b == this.pad_marker {
                                acc = 0;
                                bits = 0;
                            }
                            continue;
                        }

                        let group = this.decode_group(b);
                        acc = (acc << 6) | group as u64;
                        bits += 6;
                        if bits >= 8 {
                            bits -= 8;
                            this.pending.push((acc >> bits) as u8);
                            acc &= (1 << bits) - 1;
                        }
                    }
                    this.read_bit_buf = acc;
                    this.read_bits = bits;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
