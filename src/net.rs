//! Stoppable TCP accept loop.
//!
//! A plain `TcpListener::accept` has no cancellation point, so shutdown
//! would leak a thread parked in the kernel. This wraps a non-blocking mio
//! listener in a poll loop with a waker token; `StopHandle::stop` wakes the
//! poll and the loop returns `ConnectionClosed` instead of another
//! connection.

use std::net::{SocketAddr, TcpStream};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::RemotingError;
use crate::trace::debug;

const ACCEPT: Token = Token(0);
const WAKE: Token = Token(1);

pub struct StopListener {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
}

/// Clonable stop signal, safe to use from any thread.
#[derive(Clone)]
pub struct StopHandle {
    waker: Arc<Waker>,
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Idempotent. The accept loop observes the stop on its next wakeup.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.waker.wake();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl StopListener {
    /// Bind and register with a fresh poll instance.
    ///
    /// # Errors
    ///
    /// `Io` if the bind or poll registration fails.
    pub fn bind(addr: SocketAddr) -> Result<(Self, StopHandle), RemotingError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, ACCEPT, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let stopped = Arc::new(AtomicBool::new(false));
        let this = Self {
            poll,
            events: Events::with_capacity(16),
            listener,
            local_addr,
            stopped: Arc::clone(&stopped),
        };
        Ok((this, StopHandle { waker, stopped }))
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until a connection arrives or the handle stops the loop.
    ///
    /// Accepted streams are converted back to blocking mode; the session
    /// pumps expect blocking I/O.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once stopped; `Io` on poll or accept failure.
    pub fn accept(&mut self) -> Result<(TcpStream, SocketAddr), RemotingError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                debug!(addr = %self.local_addr, "accept loop stopped");
                return Err(RemotingError::ConnectionClosed);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    // mio streams are non-blocking by construction; hand a
                    // blocking std stream to the caller.
                    let raw = stream.into_raw_fd();
                    // SAFETY: raw was just obtained from into_raw_fd and is
                    // owned by no other handle.
                    let std_stream = unsafe { TcpStream::from_raw_fd(raw) };
                    std_stream.set_nonblocking(false)?;
                    return Ok((std_stream, peer));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.poll.poll(&mut self.events, None)?;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
