//! aes-128-cfb: key = md5(port key), a random IV sent in clear ahead of the
//! ciphertext. There is no integrity check; the tunnel only hides payloads
//! from the broker and the network path.

use super::{BoxedReader, BoxedWriter, Outbox};
use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const IV_LEN: usize = 16;

fn derive_key(secret: &str) -> [u8; 16] {
    Md5::digest(secret.as_bytes()).into()
}

pub(super) fn aes_128_cfb_reader(key: &str, r: BoxedReader) -> io::Result<BoxedReader> {
    Ok(Box::new(AesReader {
        inner: r,
        key: derive_key(key),
        iv: [0; IV_LEN],
        iv_len: 0,
        cipher: None,
    }))
}

pub(super) fn aes_128_cfb_writer(key: &str, w: BoxedWriter) -> io::Result<BoxedWriter> {
    let iv: [u8; IV_LEN] = rand::random();
    let cipher = BufEncryptor::<Aes128>::new(&derive_key(key).into(), &iv.into());

    Ok(Box::new(AesWriter {
        inner: w,
        cipher,
        out: Outbox::with(iv.to_vec()),
    }))
}

/// Decrypts once the peer's IV has arrived.
struct AesReader {
    inner: BoxedReader,
    key: [u8; 16],
    iv: [u8; IV_LEN],
    iv_len: usize,
    cipher: Option<BufDecryptor<Aes128>>,
}

impl AsyncRead for AesReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.cipher.is_none() {
            let mut iv = ReadBuf::new(&mut this.iv[this.iv_len..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut iv))?;
            let n = iv.filled().len();
            if n == 0 {
                if this.iv_len == 0 {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read iv failed: want {} got {}", IV_LEN, this.iv_len),
                )));
            }

            this.iv_len += n;
            if this.iv_len == IV_LEN {
                this.cipher = Some(BufDecryptor::new(&this.key.into(), &this.iv.into()));
            }
        }

        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(cipher) = this.cipher.as_mut() {
            cipher.decrypt(&mut buf.filled_mut()[start..]);
        }
        Poll::Ready(Ok(()))
    }
}

struct AesWriter {
    inner: BoxedWriter,
    cipher: BufEncryptor<Aes128>,
    out: Outbox,
}

impl AsyncWrite for AesWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.out.poll_drain(cx, &mut this.inner))?;

        let queued = this.out.buffer();
        queued.extend_from_slice(buf);
        this.cipher.encrypt(queued);
        this.out.kick(cx, &mut this.inner)?;

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.out.poll_drain(cx, &mut this.inner))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.out.poll_drain(cx, &mut this.inner))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn iv_is_sent_first_in_clear() {
        let (a, mut b) = duplex(1024);
        let mut w = aes_128_cfb_writer("secret", Box::new(a)).unwrap();
        w.write_all(b"attack at dawn").await.unwrap();
        w.flush().await.unwrap();

        let mut wire = [0u8; IV_LEN + 14];
        b.read_exact(&mut wire).await.unwrap();

        let key = derive_key("secret");
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&wire[..IV_LEN]);
        let mut body = wire[IV_LEN..].to_vec();
        BufDecryptor::<Aes128>::new(&key.into(), &iv.into()).decrypt(&mut body);
        assert_eq!(body, b"attack at dawn");
    }

    #[tokio::test]
    async fn fresh_iv_per_writer() {
        let (a1, mut b1) = duplex(64);
        let (a2, mut b2) = duplex(64);
        let mut w1 = aes_128_cfb_writer("k", Box::new(a1)).unwrap();
        let mut w2 = aes_128_cfb_writer("k", Box::new(a2)).unwrap();
        w1.flush().await.unwrap();
        w2.flush().await.unwrap();

        let mut iv1 = [0u8; IV_LEN];
        let mut iv2 = [0u8; IV_LEN];
        b1.read_exact(&mut iv1).await.unwrap();
        b2.read_exact(&mut iv2).await.unwrap();
        assert_ne!(iv1, iv2);
    }

    #[tokio::test]
    async fn truncated_iv_is_an_error() {
        let wire = std::io::Cursor::new(vec![1u8, 2, 3]);
        let mut r = aes_128_cfb_reader("k", Box::new(wire)).unwrap();
        let mut buf = [0u8; 8];
        let err = r.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn wrong_key_garbles() {
        let (a, b) = duplex(1024);
        let mut w = aes_128_cfb_writer("right", Box::new(a)).unwrap();
        let mut r = aes_128_cfb_reader("wrong", Box::new(b)).unwrap();
        w.write_all(b"hello world").await.unwrap();
        w.flush().await.unwrap();

        let mut buf = [0u8; 11];
        r.read_exact(&mut buf).await.unwrap();
        assert_ne!(&buf, b"hello world");
    }
}
