//! Named stream transforms applied end-to-end between client and server.
//!
//! A tunnel end wraps its broker connection with a [`Cipher`] first and a
//! [`Compressor`] on top, so the wire carries `[iv][compressed(encrypted(data))]`.
//! Both ends must agree on the names; the broker never sees inside.

mod cipher;
mod s2;
mod zstandard;

use crate::error::{Error, Result};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Encryption method, keyed by the port key.
#[derive(Debug)]
pub struct Cipher {
    name: &'static str,
    new_reader: fn(&str, BoxedReader) -> io::Result<BoxedReader>,
    new_writer: fn(&str, BoxedWriter) -> io::Result<BoxedWriter>,
}

impl Cipher {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reader(&self, key: &str, r: BoxedReader) -> io::Result<BoxedReader> {
        (self.new_reader)(key, r)
    }

    pub fn writer(&self, key: &str, w: BoxedWriter) -> io::Result<BoxedWriter> {
        (self.new_writer)(key, w)
    }
}

/// Compression method.
#[derive(Debug)]
pub struct Compressor {
    name: &'static str,
    new_reader: fn(BoxedReader) -> io::Result<BoxedReader>,
    new_writer: fn(BoxedWriter) -> io::Result<BoxedWriter>,
}

impl Compressor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reader(&self, r: BoxedReader) -> io::Result<BoxedReader> {
        (self.new_reader)(r)
    }

    pub fn writer(&self, w: BoxedWriter) -> io::Result<BoxedWriter> {
        (self.new_writer)(w)
    }
}

static CIPHERS: [Cipher; 2] = [
    Cipher {
        name: "plain",
        new_reader: passthrough_keyed,
        new_writer: passthrough_keyed,
    },
    Cipher {
        name: "aes-128-cfb",
        new_reader: cipher::aes_128_cfb_reader,
        new_writer: cipher::aes_128_cfb_writer,
    },
];

static COMPRESSORS: [Compressor; 3] = [
    Compressor {
        name: "null",
        new_reader: passthrough,
        new_writer: passthrough,
    },
    Compressor {
        name: "s2",
        new_reader: s2::reader,
        new_writer: s2::writer,
    },
    Compressor {
        name: "zstd",
        new_reader: zstandard::reader,
        new_writer: zstandard::writer,
    },
];

fn passthrough<T>(stream: T) -> io::Result<T> {
    Ok(stream)
}

fn passthrough_keyed<T>(_key: &str, stream: T) -> io::Result<T> {
    Ok(stream)
}

/// Looks up an encryption method, ignoring ASCII case.
pub fn cipher(name: &str) -> Result<&'static Cipher> {
    CIPHERS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownCipher(name.to_string()))
}

/// Looks up a compression method, ignoring ASCII case.
pub fn compressor(name: &str) -> Result<&'static Compressor> {
    COMPRESSORS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownCompressor(name.to_string()))
}

pub fn cipher_names() -> impl Iterator<Item = &'static str> {
    CIPHERS.iter().map(|c| c.name)
}

pub fn compressor_names() -> impl Iterator<Item = &'static str> {
    COMPRESSORS.iter().map(|c| c.name)
}

/// Wraps one tunnel end: cipher over the raw halves, compression over that.
pub fn wrap<R, W>(
    r: R,
    w: W,
    key: &str,
    cipher: &Cipher,
    compressor: &Compressor,
) -> io::Result<(BoxedReader, BoxedWriter)>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = compressor.writer(cipher.writer(key, Box::new(w))?)?;
    let reader = compressor.reader(cipher.reader(key, Box::new(r))?)?;
    Ok((reader, writer))
}

/// Bytes produced by a transform writer that the inner writer has not taken yet.
#[derive(Default)]
struct Outbox {
    buf: Vec<u8>,
    pos: usize,
}

impl Outbox {
    fn with(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>, inner: &mut BoxedWriter) -> Poll<io::Result<()>> {
        while self.pos < self.buf.len() {
            let n = ready!(Pin::new(&mut *inner).poll_write(cx, &self.buf[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.buf.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Pushes queued bytes towards the peer without waiting on a slow inner writer.
    fn kick(&mut self, cx: &mut Context<'_>, inner: &mut BoxedWriter) -> io::Result<()> {
        match self.poll_drain(cx, inner) {
            Poll::Ready(Ok(())) => match Pin::new(inner).poll_flush(cx) {
                Poll::Ready(Err(e)) => Err(e),
                _ => Ok(()),
            },
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn roundtrip(cipher: &'static Cipher, compressor: &'static Compressor) {
        let (a, b) = duplex(64 * 1024);
        let (_, w) = tokio::io::split(a);
        let (r, _keep) = tokio::io::split(b);
        let (_, mut writer) = wrap(tokio::io::empty(), w, "port-key", cipher, compressor).unwrap();
        let (mut reader, _) = wrap(r, tokio::io::sink(), "port-key", cipher, compressor).unwrap();

        let sizes = [1usize, 0, 17, 4096, 0, 70_000, 3, 200_000];
        let mut expected = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            expected.extend((0..*size).map(|n| (n * 31 + i) as u8));
        }

        let data = expected.clone();
        let w = tokio::spawn(async move {
            let mut off = 0;
            for size in sizes {
                writer.write_all(&data[off..off + size]).await.unwrap();
                writer.flush().await.unwrap();
                off += size;
            }
            writer.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        w.await.unwrap();

        assert_eq!(
            got.len(),
            expected.len(),
            "{}/{}",
            cipher.name(),
            compressor.name()
        );
        assert!(got == expected, "{}/{}", cipher.name(), compressor.name());
    }

    #[tokio::test]
    async fn every_combination_roundtrips() {
        for c in cipher_names() {
            for z in compressor_names() {
                roundtrip(cipher(c).unwrap(), compressor(z).unwrap()).await;
            }
        }
    }

    #[tokio::test]
    async fn each_write_is_readable_before_the_next() {
        for c in cipher_names() {
            for z in compressor_names() {
                let (a, b) = duplex(64 * 1024);
                let (ar, aw) = tokio::io::split(a);
                let (br, bw) = tokio::io::split(b);
                let ci = cipher(c).unwrap();
                let co = compressor(z).unwrap();
                let (_, mut writer) = wrap(ar, aw, "k", ci, co).unwrap();
                let (mut reader, _w) = wrap(br, bw, "k", ci, co).unwrap();

                for msg in [&b"ping"[..], b"a", b"longer interactive line\n"] {
                    writer.write_all(msg).await.unwrap();
                    writer.flush().await.unwrap();

                    let mut buf = vec![0; msg.len()];
                    reader.read_exact(&mut buf).await.unwrap();
                    assert_eq!(buf, msg, "{}/{}", c, z);
                }
            }
        }
    }

    #[tokio::test]
    async fn aes_s2_hides_payload_and_adds_iv() {
        let (a, mut b) = duplex(4096);
        let (_, mut writer) = wrap(
            tokio::io::empty(),
            a,
            "pk1",
            cipher("aes-128-cfb").unwrap(),
            compressor("s2").unwrap(),
        )
        .unwrap();

        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        assert!(wire.len() >= b"hello".len() + 16);
        assert!(!wire.windows(5).any(|w| w == b"hello"));
    }

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(cipher("AES-128-CFB").unwrap().name(), "aes-128-cfb");
        assert_eq!(cipher("Plain").unwrap().name(), "plain");
        assert_eq!(compressor("ZSTD").unwrap().name(), "zstd");
        assert!(matches!(cipher("rc4"), Err(Error::UnknownCipher(_))));
        assert!(matches!(compressor("gzip"), Err(Error::UnknownCompressor(_))));
    }
}
