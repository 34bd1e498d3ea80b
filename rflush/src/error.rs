//! Error types for rflush.

use std::io;

use fabric::{WcOpcode, WcStatus};
use thiserror::Error;

use crate::connection::ConnState;

/// Result type alias for rflush operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable integer codes for front ends.
pub mod codes {
    pub const UNKNOWN: i32 = -100000;
    pub const PROVIDER: i32 = -100002;
    pub const NOMEM: i32 = -100003;
    pub const INVAL: i32 = -100004;
    /// An empty poll reported as an error by front ends that want one.
    pub const NO_COMPLETION: i32 = -100005;
    pub const UNEXPECTED_EVENT: i32 = -100006;
    pub const PROTOCOL: i32 = -100007;
    pub const BUSY: i32 = -100008;
    pub const CLOSED: i32 = -100009;
    pub const TIMEOUT: i32 = -100010;
}

/// Error type for rflush operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was rejected before touching the fabric.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A fabric control call failed.
    #[error("{op} failed: {source}")]
    Provider {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// A malformed, oversized or mismatched protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A connection event that the current state does not accept.
    #[error("unexpected event {event} in state {state}")]
    UnexpectedEvent { state: ConnState, event: String },
    /// A requested size exceeds a fixed limit, or no slot is free.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// A work completion carried a failure status.
    #[error("{opcode:?} completed with status: {status}")]
    CompletionFailed { status: WcStatus, opcode: WcOpcode },
    /// The connection is closed or failed.
    #[error("connection closed")]
    ConnectionClosed,
    /// Another thread is already waiting on the completion queue.
    #[error("completion queue already has a waiter")]
    Busy,
    /// A bounded wait expired.
    #[error("timed out")]
    Timeout,
}

impl Error {
    /// Adapter for `map_err` on fabric calls.
    pub(crate) fn provider(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Provider { op, source }
    }

    /// The OS errno of a provider failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Provider { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true if the connection that produced this error is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CompletionFailed { .. } | Error::UnexpectedEvent { .. } | Error::ConnectionClosed
        )
    }

    /// Stable integer code, see [`codes`].
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => codes::INVAL,
            Error::Provider { source, .. } => match source.raw_os_error() {
                Some(libc::ENOMEM) => codes::NOMEM,
                Some(libc::EINVAL) => codes::INVAL,
                _ => codes::PROVIDER,
            },
            Error::Protocol(_) => codes::PROTOCOL,
            Error::UnexpectedEvent { .. } => codes::UNEXPECTED_EVENT,
            Error::ResourceExhausted(_) => codes::NOMEM,
            Error::CompletionFailed { .. } => codes::PROVIDER,
            Error::ConnectionClosed => codes::CLOSED,
            Error::Busy => codes::BUSY,
            Error::Timeout => codes::TIMEOUT,
        }
    }
}
