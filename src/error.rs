// ABOUTME: SSDB client error types for comprehensive error handling across all client operations
// ABOUTME: Provides a structured, closed error taxonomy with automatic conversion from I/O failures

use std::io;
use thiserror::Error;

/// Comprehensive error type for SSDB client operations.
///
/// Every failure mode the client can produce is represented here as a closed
/// set of variants. None of these are retried by the
/// library beyond the single reconnect attempt `ConnectionPool::lease`
/// performs on a stale connection.
#[derive(Debug, Error)]
pub enum SsdbError {
    /// The frame parser's buffer would have to grow past the 16 MiB hard
    /// limit to hold the data appended to it.
    #[error("buffer would exceed the 16 MiB limit")]
    OutOfMemory,

    /// A frame could not be parsed: a non-digit length header, an oversize
    /// header, an odd-length map body, or an unrecognized status.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// I/O error during a socket read or write.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// The server closed the socket (a read returned zero bytes), or an
    /// empty frame was returned where a status was expected.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The `auth` handshake failed: either the server rejected the
    /// password, or the socket failed during the handshake.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// `max_connections` has already been reached; no further connections
    /// can be created.
    #[error("connection pool exhausted (max_connections reached)")]
    PoolExhausted,

    /// After the pool's single reconnect-on-stale attempt, the idle probe
    /// still observed unexpected data on the socket.
    #[error("connection not ready after reconnect")]
    ConnectionNotReady,

    /// A fork was detected but `fork_mutex` could not be acquired within
    /// the configured timeout.
    #[error("timed out waiting for fork_mutex; child may be deadlocked")]
    ChildDeadlock,

    /// The server replied with a status other than `ok` or `not_found`.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// The command name is not present in any of the seven response
    /// classes.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A command argument could not be coerced to wire bytes (not text,
    /// integer, or raw bytes).
    #[error("cannot encode argument as bytes: {0}")]
    EncodingError(String),
}

/// A specialized `Result` type for SSDB operations.
pub type SsdbResult<T> = std::result::Result<T, SsdbError>;
