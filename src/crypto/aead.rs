/// AEAD 记录层
///
/// 在混淆流之上提供认证加密。帧格式：[2 字节 big-endian 密文长度][密文]，
/// 密文尾部含 16 字节认证 tag。nonce 为每方向独立的 96bit 计数器，从 0
/// 递增；关联数据为空。读方向攒满一整帧才解密，半帧不吐明文。
///
/// "none" 为纯透传（无帧化），仅供测试；请求 packed 下行时被拒绝。
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes128Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::{Error, Result};

const TAG_SIZE: usize = 16;
/// 单帧明文上限
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;
const NONCE_SIZE: usize = 12;

enum AeadCipher {
    Aes128Gcm(Box<Aes128Gcm>),
    ChaCha20(Box<ChaCha20Poly1305>),
    None,
}

impl AeadCipher {
    fn seal(&self, nonce_ctr: u64, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce_bytes = make_nonce(nonce_ctr);
        let nonce = GenericArray::from_slice(&nonce_bytes);
        let out = match self {
            AeadCipher::Aes128Gcm(c) => c.encrypt(nonce, plaintext),
            AeadCipher::ChaCha20(c) => c.encrypt(nonce, plaintext),
            AeadCipher::None => return Ok(plaintext.to_vec()),
        };
        out.map_err(|_| io::Error::other("AEAD encrypt failed"))
    }

    fn open(&self, nonce_ctr: u64, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce_bytes = make_nonce(nonce_ctr);
        let nonce = GenericArray::from_slice(&nonce_bytes);
        let out = match self {
            AeadCipher::Aes128Gcm(c) => c.decrypt(nonce, ciphertext),
            AeadCipher::ChaCha20(c) => c.decrypt(nonce, ciphertext),
            AeadCipher::None => return Ok(ciphertext.to_vec()),
        };
        out.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "AEAD decrypt failed"))
    }
}

enum ReadState {
    Length { buf: [u8; 2], offset: usize },
    Payload { buf: Vec<u8>, filled: usize },
}

pub struct AeadStream<S> {
    inner: S,
    cipher: AeadCipher,
    write_nonce: u64,
    read_nonce: u64,

    read_state: ReadState,
    read_pending: Vec<u8>,
    read_pos: usize,

    write_buf: Vec<u8>,
    write_pos: usize,
}

impl<S> AeadStream<S> {
    /// 以 SHA-256(seed) 派生密钥构建加密流。
    /// method: "aes-128-gcm" | "chacha20-poly1305" | "none"
    pub fn new(inner: S, seed: &str, method: &str) -> Result<Self> {
        let cipher = match method {
            "aes-128-gcm" => {
                let key = derive_key(seed, 16);
                AeadCipher::Aes128Gcm(Box::new(Aes128Gcm::new(GenericArray::from_slice(&key))))
            }
            "chacha20-poly1305" => {
                let key = derive_key(seed, 32);
                AeadCipher::ChaCha20(Box::new(ChaCha20Poly1305::new(GenericArray::from_slice(
                    &key,
                ))))
            }
            "none" => AeadCipher::None,
            _ => {
                return Err(Error::ConfigInvalid(format!(
                    "invalid AEAD method: {}, must be one of: aes-128-gcm, chacha20-poly1305, none",
                    method
                )))
            }
        };

        Ok(AeadStream {
            inner,
            cipher,
            write_nonce: 0,
            read_nonce: 0,
            read_state: ReadState::Length {
                buf: [0; 2],
                offset: 0,
            },
            read_pending: Vec::new(),
            read_pos: 0,
            write_buf: Vec::with_capacity(4096),
            write_pos: 0,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn is_passthrough(&self) -> bool {
        matches!(self.cipher, AeadCipher::None)
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
                        "inner stream closed during record write",
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

fn derive_key(seed: &str, len: usize) -> Vec<u8> {
    let hash = Sha256::digest(seed.as_bytes());
    hash[..len].to_vec()
}

fn make_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.is_passthrough() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

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

        let payload = &buf[..buf.len().min(MAX_PAYLOAD_SIZE)];
        let ciphertext = match this.cipher.seal(this.write_nonce, payload) {
            Ok(ct) => ct,
            Err(e) => return Poll::Ready(Err(e)),
        };
        this.write_nonce += 1;

        this.write_buf
            .extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        this.write_buf.extend_from_slice(&ciphertext);

        match this.drain_write_buf(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(payload.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.is_passthrough() {
            match this.drain_write_buf(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.is_passthrough() {
            match this.drain_write_buf(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.is_passthrough() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        if this.read_pos < this.read_pending.len() {
            let n = std::cmp::min(buf.remaining(), this.read_pending.len() - this.read_pos);
            buf.put_slice(&this.read_pending[this.read_pos..this.read_pos + n]);
            this.read_pos += n;
            if this.read_pos == this.read_pending.len() {
                this.read_pending.clear();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        loop {
            match &mut this.read_state {
                ReadState::Length { buf: len_buf, offset } => {
                    while *offset < 2 {
                        let mut tmp = [0u8; 2];
                        let mut rb = ReadBuf::new(&mut tmp[..2 - *offset]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let filled = rb.filled();
                                if filled.is_empty() {
                                    if *offset == 0 {
                                        return Poll::Ready(Ok(())); // 干净 EOF
                                    }
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::UnexpectedEof,
                                        "eof inside record header",
                                    )));
                                }
                                len_buf[*offset..*offset + filled.len()].copy_from_slice(filled);
                                *offset += filled.len();
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let frame_len = u16::from_be_bytes(*len_buf) as usize;
                    if frame_len == 0 || frame_len > MAX_PAYLOAD_SIZE + TAG_SIZE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid record length: {}", frame_len),
                        )));
                    }
                    this.read_state = ReadState::Payload {
                        buf: vec![0u8; frame_len],
                        filled: 0,
                    };
                }
                ReadState::Payload { buf: frame, filled } => {
                    while *filled < frame.len() {
                        let mut rb = ReadBuf::new(&mut frame[*filled..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let n = rb.filled().len();
                                if n == 0 {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::UnexpectedEof,
                                        "eof inside record body",
                                    )));
                                }
                                *filled += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let frame = std::mem::take(frame);
                    this.read_state = ReadState::Length {
                        buf: [0; 2],
                        offset: 0,
                    };

                    let plaintext = match this.cipher.open(this.read_nonce, &frame) {
                        Ok(pt) => pt,
                        Err(e) => return Poll::Ready(Err(e)),
                    };
                    this.read_nonce += 1;

                    let n = std::cmp::min(buf.remaining(), plaintext.len());
                    buf.put_slice(&plaintext[..n]);
                    if n < plaintext.len() {
                        this.read_pending.extend_from_slice(&plaintext[n..]);
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn roundtrip(method: &str, payload: &[u8]) {
        let (a, b) = tokio::io::duplex(512 * 1024);
        let mut writer = AeadStream::new(a, "test-seed", method).unwrap();
        let mut reader = AeadStream::new(b, "test-seed", method).unwrap();

        let data = payload.to_vec();
        let task = tokio::spawn(async move {
            writer.write_all(&data).await.unwrap();
            writer.flush().await.unwrap();
            writer
        });

        let mut out = vec![0u8; payload.len()];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(out, payload);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn roundtrip_aes() {
        roundtrip("aes-128-gcm", b"small").await;
        let big: Vec<u8> = (0..100_000).map(|i| (i % 256) as u8).collect();
        roundtrip("aes-128-gcm", &big).await;
    }

    #[tokio::test]
    async fn roundtrip_chacha() {
        let payload: Vec<u8> = (0..MAX_PAYLOAD_SIZE + 5).map(|i| (i % 256) as u8).collect();
        roundtrip("chacha20-poly1305", &payload).await;
    }

    #[tokio::test]
    async fn roundtrip_none_passthrough() {
        roundtrip("none", b"plaintext passthrough").await;
    }

    #[test]
    fn unknown_method_rejected() {
        let (a, _b) = tokio::io::duplex(64);
        assert!(AeadStream::new(a, "seed", "aes-256-gcm").is_err());
    }

    #[tokio::test]
    async fn wrong_key_fails_decrypt() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = AeadStream::new(a, "seed-one", "chacha20-poly1305").unwrap();
        let mut reader = AeadStream::new(b, "seed-two", "chacha20-poly1305").unwrap();

        writer.write_all(b"secret").await.unwrap();
        writer.flush().await.unwrap();

        let mut out = [0u8; 6];
        let err = reader.read_exact(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn tampered_record_fails() {
        let (a, mut mid_w) = tokio::io::duplex(4096);
        let mut writer = AeadStream::new(a, "seed", "aes-128-gcm").unwrap();
        writer.write_all(b"integrity").await.unwrap();
        writer.flush().await.unwrap();

        let mut wire = vec![0u8; 2 + 9 + TAG_SIZE];
        mid_w.read_exact(&mut wire).await.unwrap();
        wire[5] ^= 0xFF; // 翻转密文一位

        let (c, mut feeder) = tokio::io::duplex(4096);
        let mut reader = AeadStream::new(c, "seed", "aes-128-gcm").unwrap();
        feeder.write_all(&wire).await.unwrap();

        let mut out = [0u8; 9];
        let err = reader.read_exact(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn nonce_counters_are_independent_per_direction() {
        // 双向各自从 0 计数：两端互发多条记录都能解开
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = AeadStream::new(a, "bidi-seed", "aes-128-gcm").unwrap();
        let mut right = AeadStream::new(b, "bidi-seed", "aes-128-gcm").unwrap();

        for i in 0..5u8 {
            let msg = [i; 32];
            left.write_all(&msg).await.unwrap();
            left.flush().await.unwrap();
            let mut out = [0u8; 32];
            right.read_exact(&mut out).await.unwrap();
            assert_eq!(out, msg);

            right.write_all(&msg).await.unwrap();
            right.flush().await.unwrap();
            let mut out = [0u8; 32];
            left.read_exact(&mut out).await.unwrap();
            assert_eq!(out, msg);
        }
    }

    #[tokio::test]
    async fn oversized_record_length_rejected() {
        let (c, mut feeder) = tokio::io::duplex(4096);
        let mut reader = AeadStream::new(c, "seed", "aes-128-gcm").unwrap();
        feeder.write_all(&[0xFF, 0xFF]).await.unwrap();

        let mut out = [0u8; 1];
        let err = reader.read_exact(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
