/// Sudoku 混淆流
///
/// 写入方向：每个明文字节 → 随机选一组 4 提示字节，随机打乱顺序，
/// 按 padding_rate 在提示前后随机插入 padding 字节。
/// 读取方向：按布局掩码过滤 padding，攒满 4 个提示查表还原；
/// 查表 miss 为协议致命错误（INVALID_SUDOKU_MAP_MISS）。
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::table::Table;

const IO_BUFFER_SIZE: usize = 32 * 1024;

/// 原始字节记录器（回落重放用）
///
/// 挂在解码流的裸读路径上的旁路：只复制从底层流实际消费的密文字节，
/// 不接触明文。句柄可克隆，服务端在握手提交后调用 `stop()` 释放缓冲。
#[derive(Clone, Default)]
pub struct Recorder {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            buf: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    fn record(&self, chunk: &[u8]) {
        if let Some(buf) = self.buf.lock().unwrap().as_mut() {
            buf.extend_from_slice(chunk);
        }
    }

    /// 停止记录并释放缓冲
    pub fn stop(&self) {
        *self.buf.lock().unwrap() = None;
    }

    /// 取出已记录的字节（停止后为空）
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone().unwrap_or_default()
    }
}

pub struct SudokuStream<S> {
    inner: S,
    table: Arc<Table>,
    rng: ChaCha8Rng,
    padding_rate: f32,
    recorder: Option<Recorder>,

    // 读状态
    raw_buf: Vec<u8>,
    hint_buf: [u8; 4],
    hint_len: usize,
    pending: Vec<u8>,
    pending_pos: usize,

    // 写状态
    write_buf: Vec<u8>,
    write_pos: usize,
}

impl<S> SudokuStream<S> {
    /// 新建混淆流。padding 率在 [min, max]/100 区间内抽取一次，
    /// 每个实例用操作系统熵独立播种，避免跨连接相关性。
    pub fn new(
        inner: S,
        table: Arc<Table>,
        padding_min: u8,
        padding_max: u8,
        recorder: Option<Recorder>,
    ) -> Self {
        let mut rng = ChaCha8Rng::from_rng(rand::rngs::OsRng).unwrap_or_else(|_| {
            // OS 熵不可用时退回固定种子，仅影响 padding 选择的随机性
            ChaCha8Rng::seed_from_u64(0x5375646F6B75)
        });
        let min = padding_min as f32 / 100.0;
        let span = (padding_max.saturating_sub(padding_min)) as f32 / 100.0;
        let padding_rate = min + rng.gen::<f32>() * span;

        SudokuStream {
            inner,
            table,
            rng,
            padding_rate,
            recorder,
            raw_buf: vec![0u8; IO_BUFFER_SIZE],
            hint_buf: [0; 4],
            hint_len: 0,
            pending: Vec::with_capacity(4096),
            pending_pos: 0,
            write_buf: Vec::with_capacity(IO_BUFFER_SIZE),
            write_pos: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    #[inline]
    fn should_pad(&mut self) -> bool {
        self.padding_rate > 0.0 && self.rng.gen::<f32>() < self.padding_rate
    }

    /// 将 buf 编码追加到 write_buf
    fn encode_into_write_buf(&mut self, buf: &[u8]) {
        for &b in buf {
            if self.should_pad() {
                let pad = self.table.random_padding(&mut self.rng);
                self.write_buf.push(pad);
            }

            let hints = self.table.encode_byte(b, &mut self.rng);
            let mut order = [0usize, 1, 2, 3];
            order.shuffle(&mut self.rng);

            for &idx in &order {
                if self.should_pad() {
                    let pad = self.table.random_padding(&mut self.rng);
                    self.write_buf.push(pad);
                }
                self.write_buf.push(hints[idx]);
            }
        }
        if self.should_pad() {
            let pad = self.table.random_padding(&mut self.rng);
            self.write_buf.push(pad);
        }
    }

    /// 把已编码字节推给底层流；Pending 时保留未写部分
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
                        "inner stream closed during obfuscated write",
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

impl<S: AsyncWrite + Unpin> AsyncWrite for SudokuStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // 上次未写完的编码字节必须先落盘，否则不接受新输入
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

        // 尽力写出；Pending 时数据已被本层接收，由后续 flush/write 推完
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

impl<S: AsyncRead + Unpin> AsyncRead for SudokuStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            // 先交付已解码的明文
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
                        return Poll::Ready(Ok(())); // EOF
                    }

                    if let Some(rec) = &this.recorder {
                        rec.record(&this.raw_buf[..filled_len]);
                    }

                    for i in 0..filled_len {
                        let b = this.raw_buf[i];
                        if !this.table.layout.is_hint(b) {
                            continue; // padding
                        }
                        this.hint_buf[this.hint_len] = b;
                        this.hint_len += 1;
                        if this.hint_len == 4 {
                            this.hint_len = 0;
                            match this.table.decode_hints(this.hint_buf) {
                                Some(val) => this.pending.push(val),
                                None => {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "INVALID_SUDOKU_MAP_MISS",
                                    )))
                                }
                            }
                        }
                    }
                    // 本批没解出任何字节（全是 padding / 提示不足 4）则继续读
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
