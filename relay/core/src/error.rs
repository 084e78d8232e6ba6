use std::io;

use thiserror::Error;

use crate::types::StopReason;

/**
    Errors produced by the relay protocol engines.

    Frame-level errors (`ShortRead`, `MessageTooLarge`, `IncompleteRequest`) abort
    the message being processed but leave the session usable. Authentication,
    checksum and transport errors are terminal for the connection.
*/
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    // ── Connection ────────────────────────────────────────────────────
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connection refused")]
    ConnectRefused,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("read timed out")]
    ReadTimeout,

    // ── Framing ───────────────────────────────────────────────────────
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("incomplete request: expected {expected} bytes, got {actual}")]
    IncompleteRequest { expected: usize, actual: usize },

    // ── Authentication / integrity ────────────────────────────────────
    #[error("login rejected by server")]
    AuthRejected,
    #[error("unknown user")]
    UnknownUser,
    #[error("checksum error (wrong password?)")]
    ChecksumError,

    // ── Routing / flow control ────────────────────────────────────────
    #[error("no eligible card for caid {caid:04X} provider {provider_id:06X}")]
    NoEligibleCard { caid: u16, provider_id: u32 },
    #[error("requests stopped by server ({0})")]
    Stopped(StopReason),

    // ── Configuration / transport ─────────────────────────────────────
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl RelayError {
    /**
        Returns `true` when the connection can not be used any further
        and the caller has to reconnect.
    */
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthRejected
                | Self::UnknownUser
                | Self::ChecksumError
                | Self::PeerClosed
                | Self::Io(_)
        )
    }

    /**
        Map an I/O error raised while reading `expected` bytes.

        A premature end of stream becomes `ShortRead`. A read timeout before
        the first byte becomes `ReadTimeout`; once `actual` bytes are consumed
        the stream is out of step and the timeout is a transport error.
    */
    pub fn from_read(err: io::Error, expected: usize, actual: usize) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::ShortRead { expected, actual },
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut if actual == 0 => {
                Self::ReadTimeout
            }
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Self::Io(format!("read timed out after {actual} of {expected} bytes"))
            }
            _ => Self::Io(err.to_string()),
        }
    }

    /**
        Escalate an error raised after part of a frame was consumed.

        The bytes already read can not be pushed back, so a timeout at this
        point leaves the stream (and any stream cipher) out of step.
    */
    pub fn mid_frame(self) -> Self {
        match self {
            Self::ReadTimeout => Self::Io("read timed out inside a frame".into()),
            other => other,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectRefused,
            io::ErrorKind::TimedOut => Self::ConnectTimeout,
            _ => Self::Io(e.to_string()),
        }
    }
}

/**
    Type alias for results that may return a [`RelayError`].
*/
pub type RelayResult<T> = std::result::Result<T, RelayError>;
