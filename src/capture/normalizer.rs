//! Line-ending canonicalization for device output.
//!
//! adb's shell transport rewrites `LF` as `CR LF` on some devices, which
//! corrupts log text and binary artifacts alike (`screencap -p` PNGs are the
//! usual victim). [`LineEndingNormalizer`] undoes that:
//!
//! - `CR LF` collapses to `LF`
//! - a lone `CR` becomes `LF`
//! - every other byte passes through untouched
//!
//! The transform is incremental. A `CR` that ends one chunk is held back until
//! the next chunk (or [`finish`](LineEndingNormalizer::finish)) decides what it
//! was, so the output is the same no matter how the input was split into
//! writes.
//!
//! [`NormalizingWriter`] wraps any [`std::io::Write`] or
//! [`tokio::io::AsyncWrite`] sink with the transform.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::AsyncWrite;

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

/// Stateful CR/CRLF to LF transform.
///
/// The only state is whether the previous chunk ended on an unresolved `CR`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LineEndingNormalizer {
    pending_cr: bool,
}

impl LineEndingNormalizer {
    /// Fresh transform with no carry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a trailing `CR` is waiting for the next chunk.
    pub fn has_pending_cr(&self) -> bool {
        self.pending_cr
    }

    /// Transform `input`, appending the result to `out`.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len() + 1);
        let mut i = 0;

        if self.pending_cr {
            let Some(&first) = input.first() else {
                return;
            };
            self.pending_cr = false;
            // Either way the held CR becomes one LF; a following LF is absorbed.
            out.push(LF);
            if first == LF {
                i = 1;
            }
        }

        while i < input.len() {
            let b = input[i];
            if b != CR {
                out.push(b);
                i += 1;
                continue;
            }
            match input.get(i + 1) {
                None => {
                    self.pending_cr = true;
                    i += 1;
                }
                Some(&LF) => {
                    out.push(LF);
                    i += 2;
                }
                Some(_) => {
                    out.push(LF);
                    i += 1;
                }
            }
        }
    }

    /// End of stream: resolve a held `CR` into `LF`.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.pending_cr {
            self.pending_cr = false;
            out.push(LF);
        }
    }

    /// One-shot transform of a complete buffer.
    pub fn normalize(input: &[u8]) -> Vec<u8> {
        let mut state = Self::new();
        let mut out = Vec::with_capacity(input.len());
        state.push(input, &mut out);
        state.finish(&mut out);
        out
    }
}

/// A sink wrapper that applies [`LineEndingNormalizer`] to everything written.
///
/// With [`std::io::Write`], `flush` resolves a held trailing `CR`, so only
/// flush at the end of the stream. With [`AsyncWrite`], `poll_flush` keeps
/// the held `CR` (`tokio::io::copy` flushes whenever its reader stalls) and
/// only `poll_shutdown` resolves it.
#[derive(Debug)]
pub struct NormalizingWriter<W> {
    inner: W,
    state: LineEndingNormalizer,
    pending: Vec<u8>,
    written: usize,
}

impl<W> NormalizingWriter<W> {
    /// Wrap `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            state: LineEndingNormalizer::new(),
            pending: Vec::new(),
            written: 0,
        }
    }

    /// Borrow the wrapped sink.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwrap without flushing. A held `CR` is dropped.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> io::Write for NormalizingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.clear();
        self.state.push(buf, &mut self.pending);
        self.inner.write_all(&self.pending)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.state.finish(&mut self.pending);
        self.inner.write_all(&self.pending)?;
        self.pending.clear();
        self.inner.flush()
    }
}

impl<W: AsyncWrite + Unpin> NormalizingWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let chunk = &self.pending[self.written..];
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, chunk))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for NormalizingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.state.push(buf, &mut this.pending);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.state.finish(&mut this.pending);
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
