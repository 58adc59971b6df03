use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 代理流类型别名：任何实现了 AsyncRead + AsyncWrite + Send + Unpin 的类型
pub type ProxyStream = Box<dyn AsyncStream>;

/// 异步流 trait，组合 AsyncRead + AsyncWrite
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

/// 为所有满足约束的类型自动实现 AsyncStream
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// 前置回放流
///
/// 先吐出 `prefix` 中的字节，耗尽后才从底层流读取。
/// 服务端探测选表后用它把已消费的字节重新拼接到真实解码栈前面。
pub struct PreBufferedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> PreBufferedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        PreBufferedStream {
            inner,
            prefix,
            pos: 0,
        }
    }

    /// 剩余未回放的前置字节
    pub fn remaining_prefix(&self) -> &[u8] {
        &self.prefix[self.pos..]
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PreBufferedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = std::cmp::min(buf.remaining(), this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix.clear();
                this.prefix.shrink_to_fit();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PreBufferedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// 半双工组合流
///
/// 读走 `reader`，写走 `writer`。packed 下行模式需要同一条连接上
/// 组合两个不同方向的编解码器，这里把它们拼成一个双工句柄。
/// shutdown 先关闭写侧（packed 写侧会在自身 poll_shutdown 里 flush 标记字节）。
pub struct DirectionalStream<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> DirectionalStream<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        DirectionalStream { reader, writer }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for DirectionalStream<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for DirectionalStream<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prebuffered_replays_prefix_first() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"tail").await.unwrap();
        drop(server);

        let mut s = PreBufferedStream::new(b"head-".to_vec(), client);
        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"head-tail");
    }

    #[tokio::test]
    async fn prebuffered_partial_reads() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let mut s = PreBufferedStream::new(vec![1, 2, 3, 4, 5], client);
        let mut buf = [0u8; 2];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(s.remaining_prefix(), &[3, 4, 5]);
    }

    #[tokio::test]
    async fn directional_routes_both_ways() {
        let (a, mut a_peer) = tokio::io::duplex(64);
        let (b, mut b_peer) = tokio::io::duplex(64);

        let (read_half, _) = tokio::io::split(a);
        let (_, write_half) = tokio::io::split(b);
        let mut d = DirectionalStream::new(read_half, write_half);

        a_peer.write_all(b"in").await.unwrap();
        let mut buf = [0u8; 2];
        d.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"in");

        d.write_all(b"out").await.unwrap();
        let mut buf = [0u8; 3];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"out");
    }
}
