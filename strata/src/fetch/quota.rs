//! Byte budget enforcement for layer content streams.

use crate::errors::StrataError;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// `AsyncRead` wrapper that fails once more than `limit` bytes pass through it.
///
/// The failure is an `io::Error` wrapping `StrataError::QuotaExceeded`. Since
/// the store that consumes the stream may flatten that error into its own, the
/// overrun is also recorded on a `QuotaProbe` the caller keeps.
#[derive(Debug)]
pub struct QuotaedReader<R> {
    inner: R,
    remaining: u64,
    exceeded: Arc<AtomicBool>,
}

/// Observes whether a `QuotaedReader` ran over its budget.
#[derive(Clone, Debug, Default)]
pub struct QuotaProbe(Arc<AtomicBool>);

impl QuotaProbe {
    pub fn exceeded(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl<R> QuotaedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            exceeded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn probe(&self) -> QuotaProbe {
        QuotaProbe(Arc::clone(&self.exceeded))
    }

    /// Bytes that may still be read before the quota trips.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for QuotaedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.exceeded.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::other(StrataError::QuotaExceeded)));
        }

        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                if read > this.remaining {
                    this.remaining = 0;
                    this.exceeded.store(true, Ordering::Release);
                    return Poll::Ready(Err(io::Error::other(StrataError::QuotaExceeded)));
                }
                this.remaining -= read;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
