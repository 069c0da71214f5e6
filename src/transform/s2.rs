//! s2: Snappy framing format, one or more chunks per write.
//!
//! Only the Snappy subset is spoken. A native S2 stream (`S2sTwO` stream
//! identifier, S2 block extensions) is rejected by the reader, so both tunnel
//! ends must be this implementation or a Snappy-compatible one.

use super::{BoxedReader, BoxedWriter, Outbox};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";
const MAX_BLOCK_SIZE: usize = 65536;

const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_STREAM_IDENTIFIER: u8 = 0xff;

pub(super) fn reader(r: BoxedReader) -> io::Result<BoxedReader> {
    Ok(Box::new(S2Reader {
        inner: r,
        decoder: snap::raw::Decoder::new(),
        header: [0; 4],
        header_len: 0,
        body: Vec::new(),
        body_len: 0,
        in_body: false,
        seen_identifier: false,
        out: Vec::new(),
        out_pos: 0,
    }))
}

pub(super) fn writer(w: BoxedWriter) -> io::Result<BoxedWriter> {
    Ok(Box::new(S2Writer {
        inner: w,
        encoder: snap::raw::Encoder::new(),
        out: Outbox::with(STREAM_IDENTIFIER.to_vec()),
    }))
}

fn masked_crc(data: &[u8]) -> u32 {
    let c = crc32c::crc32c(data);
    ((c >> 15) | (c << 17)).wrapping_add(0xa282_ead8)
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

struct S2Writer {
    inner: BoxedWriter,
    encoder: snap::raw::Encoder,
    out: Outbox,
}

impl S2Writer {
    fn push_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let compressed = self
            .encoder
            .compress_vec(data)
            .map_err(|e| invalid(e.to_string()))?;

        // Keep incompressible data as is, same threshold as the reference encoder.
        let (kind, body) = if compressed.len() < data.len() - data.len() / 8 {
            (CHUNK_COMPRESSED, &compressed[..])
        } else {
            (CHUNK_UNCOMPRESSED, data)
        };

        let len = (body.len() + 4) as u32;
        let out = self.out.buffer();
        out.push(kind);
        out.extend_from_slice(&len.to_le_bytes()[..3]);
        out.extend_from_slice(&masked_crc(data).to_le_bytes());
        out.extend_from_slice(body);
        Ok(())
    }
}

impl AsyncWrite for S2Writer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.out.poll_drain(cx, &mut this.inner))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        for block in buf.chunks(MAX_BLOCK_SIZE) {
            this.push_chunk(block)?;
        }
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

struct S2Reader {
    inner: BoxedReader,
    decoder: snap::raw::Decoder,
    header: [u8; 4],
    header_len: usize,
    body: Vec<u8>,
    body_len: usize,
    in_body: bool,
    seen_identifier: bool,
    out: Vec<u8>,
    out_pos: usize,
}

/// Reads into `buf[*filled..]` until it is full or the stream ends.
fn poll_fill(
    inner: &mut BoxedReader,
    cx: &mut Context<'_>,
    buf: &mut [u8],
    filled: &mut usize,
) -> Poll<io::Result<usize>> {
    while *filled < buf.len() {
        let mut rb = ReadBuf::new(&mut buf[*filled..]);
        ready!(Pin::new(&mut *inner).poll_read(cx, &mut rb))?;
        let n = rb.filled().len();
        if n == 0 {
            break;
        }
        *filled += n;
    }
    Poll::Ready(Ok(*filled))
}

impl S2Reader {
    fn checked(data: &[u8], crc: u32) -> io::Result<()> {
        if masked_crc(data) != crc {
            return Err(invalid("s2: chunk checksum mismatch"));
        }
        Ok(())
    }

    fn process_chunk(&mut self) -> io::Result<()> {
        let kind = self.header[0];
        if kind == CHUNK_STREAM_IDENTIFIER {
            if self.body != STREAM_IDENTIFIER[4..] {
                return Err(invalid("s2: bad stream identifier"));
            }
            self.seen_identifier = true;
            return Ok(());
        }
        if !self.seen_identifier {
            return Err(invalid("s2: stream identifier missing"));
        }

        match kind {
            CHUNK_COMPRESSED | CHUNK_UNCOMPRESSED => {
                if self.body.len() < 4 {
                    return Err(invalid("s2: chunk too short"));
                }
                let crc = u32::from_le_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]);
                let data = &self.body[4..];

                self.out = if kind == CHUNK_COMPRESSED {
                    let len = snap::raw::decompress_len(data).map_err(|e| invalid(e.to_string()))?;
                    if len > MAX_BLOCK_SIZE {
                        return Err(invalid("s2: block too large"));
                    }
                    self.decoder
                        .decompress_vec(data)
                        .map_err(|e| invalid(e.to_string()))?
                } else {
                    if data.len() > MAX_BLOCK_SIZE {
                        return Err(invalid("s2: block too large"));
                    }
                    data.to_vec()
                };
                self.out_pos = 0;
                Self::checked(&self.out, crc)
            }
            0x02..=0x7f => Err(invalid(format!("s2: unskippable chunk {:#x}", kind))),
            // padding and skippable chunks
            _ => Ok(()),
        }
    }
}

impl AsyncRead for S2Reader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.out_pos < this.out.len() {
                let n = buf.remaining().min(this.out.len() - this.out_pos);
                buf.put_slice(&this.out[this.out_pos..this.out_pos + n]);
                this.out_pos += n;
                return Poll::Ready(Ok(()));
            }

            if !this.in_body {
                let n = ready!(poll_fill(&mut this.inner, cx, &mut this.header, &mut this.header_len))?;
                match n {
                    0 => return Poll::Ready(Ok(())),
                    4 => {}
                    _ => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "s2: truncated chunk header",
                        )))
                    }
                }

                let h = this.header;
                let len = u32::from_le_bytes([h[1], h[2], h[3], 0]) as usize;
                this.body.clear();
                this.body.resize(len, 0);
                this.body_len = 0;
                this.in_body = true;
            }

            let n = ready!(poll_fill(&mut this.inner, cx, &mut this.body, &mut this.body_len))?;
            if n < this.body.len() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "s2: truncated chunk",
                )));
            }
            this.in_body = false;
            this.header_len = 0;
            this.process_chunk()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn emits_snappy_framing() {
        let (a, mut b) = duplex(1 << 20);
        let mut w = writer(Box::new(a)).unwrap();
        w.write_all(&[b'a'; 1000]).await.unwrap();
        w.flush().await.unwrap();
        drop(w);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        assert_eq!(&wire[..10], STREAM_IDENTIFIER);
        assert_eq!(wire[10], CHUNK_COMPRESSED);
        assert!(wire.len() < 200);
    }

    #[tokio::test]
    async fn incompressible_data_is_stored() {
        let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        let (a, mut b) = duplex(1 << 20);
        let mut w = writer(Box::new(a)).unwrap();
        w.write_all(&data).await.unwrap();
        w.flush().await.unwrap();
        drop(w);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire[10], CHUNK_UNCOMPRESSED);
        assert_eq!(&wire[18..], &data[..]);
    }

    #[tokio::test]
    async fn skips_padding_and_rejects_corruption() {
        let mut wire = STREAM_IDENTIFIER.to_vec();
        wire.extend_from_slice(&[0xfe, 3, 0, 0, 0, 0, 0]);
        let crc = masked_crc(b"hi").to_le_bytes();
        wire.extend_from_slice(&[CHUNK_UNCOMPRESSED, 6, 0, 0]);
        wire.extend_from_slice(&crc);
        wire.extend_from_slice(b"hi");

        let mut r = reader(Box::new(std::io::Cursor::new(wire.clone()))).unwrap();
        let mut got = Vec::new();
        r.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hi");

        let last = wire.len() - 1;
        wire[last] ^= 1;
        let mut r = reader(Box::new(std::io::Cursor::new(wire))).unwrap();
        let err = r.read_to_end(&mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn requires_stream_identifier() {
        let crc = masked_crc(b"x").to_le_bytes();
        let mut wire = vec![CHUNK_UNCOMPRESSED, 5, 0, 0];
        wire.extend_from_slice(&crc);
        wire.push(b'x');

        let mut r = reader(Box::new(std::io::Cursor::new(wire))).unwrap();
        assert!(r.read_to_end(&mut Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn native_s2_stream_is_rejected() {
        let mut wire = b"\xff\x06\x00\x00S2sTwO".to_vec();
        let crc = masked_crc(b"x").to_le_bytes();
        wire.extend_from_slice(&[CHUNK_UNCOMPRESSED, 5, 0, 0]);
        wire.extend_from_slice(&crc);
        wire.push(b'x');

        let mut r = reader(Box::new(std::io::Cursor::new(wire))).unwrap();
        let err = r.read_to_end(&mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
