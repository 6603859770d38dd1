//! Error taxonomy for the transport.
//!
//! Every error surfaced by the call API is one of these kinds. The variants
//! are deliberately coarse: retry policy belongs to the caller, so the only
//! distinction that matters here is scope: [`RemotingError::Protocol`] is
//! fatal to its session, everything else is local to one packet or future.

use std::sync::Arc;

use thiserror::Error;

/// Transport-level error.
///
/// `Clone` so a single failure (e.g. a broken connection) can be fanned out
/// to every outstanding packet's completion hook.
#[derive(Debug, Clone, Error)]
pub enum RemotingError {
    /// Malformed or oversize frame. Fatal: the session closes immediately,
    /// since the stream position is unrecoverable once framing is corrupt.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload marshal/unmarshal failure. Local to one packet; the session
    /// stays open.
    #[error("codec error: {0}")]
    Codec(String),

    /// A future was not resolved within its deadline.
    #[error("wait response timeout")]
    Timeout,

    /// The owning client/context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Bounded-queue admission rejected the work: a full write queue, or a
    /// pending-request table over capacity evicting its oldest entry.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Operation attempted on a closed session, or the peer went away.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for RemotingError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl RemotingError {
    /// Whether this error forces the owning session closed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Io(_) | Self::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_is_fatal_codec_is_not() {
        assert!(RemotingError::Protocol("bad length".into()).is_fatal());
        assert!(!RemotingError::Codec("bad json".into()).is_fatal());
        assert!(!RemotingError::Timeout.is_fatal());
        assert!(!RemotingError::QueueFull("write".into()).is_fatal());
    }

    #[test]
    fn io_errors_clone() {
        let e: RemotingError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let e2 = e.clone();
        assert!(matches!(e2, RemotingError::Io(_)));
    }
}
