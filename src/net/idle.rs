//! Idle timeout guard.
//!
//! # Responsibilities
//! - Close a connection that saw no read or write activity for a configured duration
//! - Stay disarmable after the fact: the guard wraps the raw socket, but the
//!   pipeline stage that owns it may be removed later (HTTP/2 negotiation)
//!
//! The guard is an I/O wrapper. Any completed read or write pushes the deadline
//! forward; a pending read past the deadline fails with `TimedOut`, which the
//! codec above turns into connection closure.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Shared switch between the idle-timeout stage and the stream it guards.
#[derive(Debug, Clone)]
pub struct IdleTimeoutHandle {
    armed: Arc<AtomicBool>,
    timeout: Duration,
}

impl IdleTimeoutHandle {
    pub fn new(timeout: Duration) -> Self {
        Self {
            armed: Arc::new(AtomicBool::new(true)),
            timeout,
        }
    }

    /// Configured idle duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stop enforcing the timeout. Irreversible.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// Stream wrapper enforcing an idle timeout.
#[derive(Debug)]
pub struct IdleTimeout<S> {
    inner: S,
    handle: IdleTimeoutHandle,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, handle: IdleTimeoutHandle) -> Self {
        let deadline = Box::pin(tokio::time::sleep(handle.timeout()));
        Self {
            inner,
            handle,
            deadline,
        }
    }

    fn touch(&mut self) {
        let next = Instant::now() + self.handle.timeout();
        self.deadline.as_mut().reset(next);
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if !self.handle.is_armed() {
            return Ok(());
        }
        if self.deadline.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle timeout elapsed",
            ));
        }
        Ok(())
    }
}

impl<S> AsyncRead for IdleTimeout<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_expired(cx) {
                Ok(()) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }
}

impl<S> AsyncWrite for IdleTimeout<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if result.is_ready() {
            this.touch();
        }
        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if result.is_ready() {
            this.touch();
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
