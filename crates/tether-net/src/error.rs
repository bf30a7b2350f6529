//! Connection engine errors.

use std::io;

/// Errors reported by [`Client`](crate::Client) operations.
///
/// Transport failures are surfaced once and never retried; the caller
/// decides whether to [`connect`](crate::Client::connect) again.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The endpoint cannot change while a connection is live.
    #[error("cannot change the endpoint while connected")]
    Connected,

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// The configured port is not a decimal `u16`.
    #[error("invalid port `{0}`")]
    InvalidPort(String),

    /// Host/port resolution failed or produced no addresses.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: String,
        #[source]
        source: io::Error,
    },

    /// Every resolved candidate refused the connection.
    #[error("unable to connect to {host}:{port} after {attempts} candidate(s): {source}")]
    Unreachable {
        host: String,
        port: String,
        attempts: usize,
        /// Error from the last candidate tried.
        #[source]
        source: io::Error,
    },

    /// The connected socket could not be configured or duplicated.
    #[error("failed to prepare socket: {0}")]
    Socket(#[source] io::Error),

    /// The receive thread could not be started.
    #[error("failed to spawn receive thread: {0}")]
    Spawn(#[source] io::Error),

    /// The payload does not fit in a frame.
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    /// The transport failed mid-send; the connection has been torn down.
    #[error("send failed after {sent} payload bytes: {source}")]
    Send {
        /// Payload bytes accepted by the transport before the failure.
        sent: usize,
        #[source]
        source: io::Error,
    },
}

impl ClientError {
    /// Payload bytes that reached the transport before this error.
    pub fn bytes_sent(&self) -> usize {
        match self {
            ClientError::Send { sent, .. } => *sent,
            _ => 0,
        }
    }
}
