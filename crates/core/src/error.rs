//! Failure propagation for request processing
//!
//! A failure anywhere inside request logic must reach the request boundary
//! and nothing in between may swallow it. Request-processing functions
//! return [`RequestResult`] and propagate [`Abort`] with `?`; the boundary
//! (the worker loop) performs the unwind bookkeeping — cleanup stack,
//! transactional rollback, context reset — on every exit path.

use thiserror::Error;

/// Result type alias for request-processing calls
pub type RequestResult<T> = std::result::Result<T, Abort>;

/// Classification of a request failure
///
/// The classification decides what the request boundary does after the
/// unwind:
///
/// | Kind | Boundary behavior |
/// |------------|----------------------------------------------------|
/// | `Fatal` | close the connection without a well-formed response |
/// | `Client` | structured error response, worker keeps serving |
/// | `Disconnect` | no response attempted, context reset silently |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Unrecoverable condition: the context state cannot be trusted to
    /// produce a response
    Fatal,
    /// Client-caused condition (malformed input); safe to report and
    /// continue serving other connections
    Client,
    /// Peer closed the connection; nothing left to respond to
    Disconnect,
}

impl FailureKind {
    /// HTTP-style status line the boundary uses for an error response.
    ///
    /// `Disconnect` never produces a response; its status exists only so the
    /// failure slot can always be formatted.
    pub fn status_line(self) -> &'static str {
        match self {
            FailureKind::Fatal => "500 Internal Server Error",
            FailureKind::Client => "400 Bad Request",
            FailureKind::Disconnect => "499 Client Closed Request",
        }
    }
}

/// A failure aborting the in-flight request
///
/// Raising an `Abort` short-circuits all remaining request logic; it is never
/// silently swallowed — it always reaches the request boundary, which decides
/// the user-visible outcome from the [`FailureKind`]. Local recovery is
/// possible only by request logic catching a narrower condition and not
/// re-raising.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Abort {
    /// Unrecoverable failure; the connection is closed without a response
    #[error("fatal: {0}")]
    Fatal(String),

    /// Malformed or invalid client input
    #[error("bad request: {0}")]
    Client(String),

    /// The peer went away mid-request
    #[error("client disconnected")]
    Disconnect,
}

impl Abort {
    /// The classification of this failure
    pub fn kind(&self) -> FailureKind {
        match self {
            Abort::Fatal(_) => FailureKind::Fatal,
            Abort::Client(_) => FailureKind::Client,
            Abort::Disconnect => FailureKind::Disconnect,
        }
    }

    /// Construct an abort of the given kind with a formatted message.
    ///
    /// `Disconnect` carries no message; one passed here is dropped.
    pub fn with_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        match kind {
            FailureKind::Fatal => Abort::Fatal(message.into()),
            FailureKind::Client => Abort::Client(message.into()),
            FailureKind::Disconnect => Abort::Disconnect,
        }
    }
}

impl From<std::io::Error> for Abort {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Abort::Disconnect,
            _ => Abort::Fatal(format!("I/O error: {}", e)),
        }
    }
}
