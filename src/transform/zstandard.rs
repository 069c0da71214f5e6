//! zstd: a single streaming frame, flushed after every write.

use super::{BoxedReader, BoxedWriter, Outbox};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

const COMPRESSION_LEVEL: i32 = 11;
const BUF_SIZE: usize = 32 * 1024;

pub(super) fn reader(r: BoxedReader) -> io::Result<BoxedReader> {
    Ok(Box::new(ZstdReader {
        inner: r,
        decoder: Decoder::new()?,
        input: vec![0; BUF_SIZE],
        in_pos: 0,
        in_len: 0,
        output: vec![0; BUF_SIZE],
        out_pos: 0,
        out_len: 0,
        pending: false,
    }))
}

pub(super) fn writer(w: BoxedWriter) -> io::Result<BoxedWriter> {
    Ok(Box::new(ZstdWriter {
        inner: w,
        encoder: Encoder::new(COMPRESSION_LEVEL)?,
        scratch: vec![0; BUF_SIZE],
        out: Outbox::default(),
        finished: false,
    }))
}

struct ZstdWriter {
    inner: BoxedWriter,
    encoder: Encoder<'static>,
    scratch: Vec<u8>,
    out: Outbox,
    finished: bool,
}

impl ZstdWriter {
    fn compress(&mut self, data: &[u8]) -> io::Result<()> {
        let mut input = InBuffer::around(data);
        while input.pos() < data.len() {
            let n = {
                let mut output = OutBuffer::around(&mut self.scratch[..]);
                self.encoder.run(&mut input, &mut output)?;
                output.pos()
            };
            self.out.buffer().extend_from_slice(&self.scratch[..n]);
        }

        loop {
            let (n, remaining) = {
                let mut output = OutBuffer::around(&mut self.scratch[..]);
                let remaining = self.encoder.flush(&mut output)?;
                (output.pos(), remaining)
            };
            self.out.buffer().extend_from_slice(&self.scratch[..n]);
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        loop {
            let (n, remaining) = {
                let mut output = OutBuffer::around(&mut self.scratch[..]);
                let remaining = self.encoder.finish(&mut output, true)?;
                (output.pos(), remaining)
            };
            self.out.buffer().extend_from_slice(&self.scratch[..n]);
            if remaining == 0 {
                self.finished = true;
                return Ok(());
            }
        }
    }
}

impl AsyncWrite for ZstdWriter {
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
        if this.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "zstd: write after shutdown",
            )));
        }

        this.compress(buf)?;
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
        if !this.finished {
            ready!(this.out.poll_drain(cx, &mut this.inner))?;
            this.finish()?;
        }
        ready!(this.out.poll_drain(cx, &mut this.inner))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

struct ZstdReader {
    inner: BoxedReader,
    decoder: Decoder<'static>,
    input: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    output: Vec<u8>,
    out_pos: usize,
    out_len: usize,
    // decoder may still hold output after filling the last buffer
    pending: bool,
}

impl AsyncRead for ZstdReader {
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
            if this.out_pos < this.out_len {
                let n = buf.remaining().min(this.out_len - this.out_pos);
                buf.put_slice(&this.output[this.out_pos..this.out_pos + n]);
                this.out_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.in_pos < this.in_len || this.pending {
                let (consumed, produced) = {
                    let mut input = InBuffer::around(&this.input[this.in_pos..this.in_len]);
                    let mut output = OutBuffer::around(&mut this.output[..]);
                    this.decoder.run(&mut input, &mut output)?;
                    (input.pos(), output.pos())
                };
                this.in_pos += consumed;
                this.out_pos = 0;
                this.out_len = produced;
                this.pending = produced == this.output.len();
                if consumed > 0 || produced > 0 {
                    continue;
                }
            }

            let mut rb = ReadBuf::new(&mut this.input[..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
            let n = rb.filled().len();
            if n == 0 {
                return Poll::Ready(Ok(()));
            }
            this.in_pos = 0;
            this.in_len = n;
        }
    }
}
