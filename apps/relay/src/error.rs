//! Relay error taxonomy.
//!
//! Failures surface at the connection boundary: an error in one client's
//! upstream tears that client down and nothing else. Anything that would be
//! fatal is only allowed to happen before workers start serving.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket-level failures on either side of the relay.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The HTTP client went away; unwinds the whole connection.
    #[error("client disconnected")]
    ClientGone,

    /// Upstream stopped answering within its budget.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error(transparent)]
    Rtsp(#[from] streamrelay_rtsp::RtspError),

    /// Upstream HTTP server misbehaved (proxy path).
    #[error("bad upstream response: {0}")]
    UpstreamProtocol(String),

    /// Startup-only: configuration that cannot be served.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Client-disconnect detection for write paths: both halves of a dead
    /// TCP connection show up as one of these.
    pub fn is_client_gone(&self) -> bool {
        match self {
            RelayError::ClientGone => true,
            RelayError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
