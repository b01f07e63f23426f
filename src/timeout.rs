//! Per-connection read, write and idle deadlines
//!
//! [`TimeoutIo`] wraps an accepted socket and tracks where the connection
//! is in its exchange:
//!
//! - `Receiving`: a request is arriving (or the first one is awaited). The
//!   read timeout is an absolute deadline from the start of the request;
//!   bytes trickling in do not extend it.
//! - `Idle`: a response has been written and the connection waits for the
//!   next request. The idle timeout applies; the first byte of the next
//!   request starts a fresh read deadline.
//! - `Handshake`: TLS negotiation, bounded by the caller. No read deadline.
//! - `Tunnel`: after a protocol upgrade. The idle timeout applies to
//!   silence in both directions and any traffic restarts it.
//!
//! A write or flush that makes no progress for longer than the write
//! timeout fails in every phase. Expired deadlines surface as `TimedOut`;
//! hyper then drops that connection and no other.

use crate::config::Timeouts;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Receiving,
    Idle,
    Tunnel,
}

/// Switches a [`TimeoutIo`] into tunnel mode from outside the I/O stack
#[derive(Debug, Clone, Default)]
pub struct TunnelSwitch(Arc<AtomicBool>);

impl TunnelSwitch {
    /// Called once the connection has been handed over to an upgrade
    pub fn engage(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_engaged(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pin_project! {
    /// Socket wrapper enforcing [`Timeouts`]
    pub struct TimeoutIo<T> {
        #[pin]
        inner: T,
        timeouts: Timeouts,
        phase: Phase,
        tunnel: TunnelSwitch,
        read_deadline: Option<Pin<Box<Sleep>>>,
        write_deadline: Option<Pin<Box<Sleep>>>,
    }
}

impl<T> TimeoutIo<T> {
    /// Plain HTTP connection: the first request is awaited right away
    pub fn new(inner: T, timeouts: Timeouts) -> Self {
        Self::with_phase(inner, timeouts, Phase::Receiving)
    }

    /// TLS connection: no read deadline until [`TimeoutIo::start_receiving`]
    pub fn for_handshake(inner: T, timeouts: Timeouts) -> Self {
        Self::with_phase(inner, timeouts, Phase::Handshake)
    }

    fn with_phase(inner: T, timeouts: Timeouts, phase: Phase) -> Self {
        Self {
            inner,
            timeouts,
            phase,
            tunnel: TunnelSwitch::default(),
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Handshake finished; the first request's read deadline starts now
    pub fn start_receiving(&mut self) {
        self.phase = Phase::Receiving;
        self.read_deadline = Some(Box::pin(sleep(self.timeouts.read)));
    }

    /// Handle that moves this connection into tunnel mode
    pub fn tunnel_switch(&self) -> TunnelSwitch {
        self.tunnel.clone()
    }
}

fn arm(limit: Duration) -> Option<Pin<Box<Sleep>>> {
    Some(Box::pin(sleep(limit)))
}

/// Poll `deadline`, arming it with `limit` first if unset
fn expired(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    limit: Duration,
    cx: &mut Context<'_>,
    what: &'static str,
) -> bool {
    let timer = deadline.get_or_insert_with(|| Box::pin(sleep(limit)));
    if timer.as_mut().poll(cx).is_ready() {
        *deadline = None;
        tracing::debug!(timeout_ms = limit.as_millis() as u64, "Connection {} timed out", what);
        true
    } else {
        false
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

impl<T: AsyncRead> AsyncRead for TimeoutIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if *this.phase != Phase::Tunnel && this.tunnel.is_engaged() {
            *this.phase = Phase::Tunnel;
            *this.read_deadline = None;
        }

        let (limit, what) = match this.phase {
            Phase::Handshake => return this.inner.poll_read(cx, buf),
            Phase::Receiving => (this.timeouts.read, "read"),
            Phase::Idle | Phase::Tunnel => (this.timeouts.idle, "idle"),
        };

        // Checked before reading so a trickling peer cannot outrun it
        if expired(this.read_deadline, limit, cx, what) {
            return Poll::Ready(Err(timed_out(what)));
        }

        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if buf.filled().len() > before {
                match this.phase {
                    Phase::Idle => {
                        *this.phase = Phase::Receiving;
                        *this.read_deadline = arm(this.timeouts.read);
                    }
                    Phase::Tunnel => *this.read_deadline = None,
                    Phase::Receiving | Phase::Handshake => {}
                }
            }
        }
        result
    }
}

impl<T: AsyncWrite> AsyncWrite for TimeoutIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                if matches!(result, Ok(n) if n > 0) {
                    match this.phase {
                        Phase::Receiving | Phase::Idle if !this.tunnel.is_engaged() => {
                            *this.phase = Phase::Idle;
                            *this.read_deadline = None;
                        }
                        Phase::Handshake => {}
                        // Traffic in either direction keeps a tunnel alive
                        _ => *this.read_deadline = None,
                    }
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(this.write_deadline, this.timeouts.write, cx, "write") {
                    Poll::Ready(Err(timed_out("write")))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();

        match this.inner.poll_flush(cx) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(this.write_deadline, this.timeouts.write, cx, "write") {
                    Poll::Ready(Err(timed_out("write")))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
