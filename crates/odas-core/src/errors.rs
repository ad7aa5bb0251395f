use std::net::SocketAddr;

/// Errors surfaced by the relay.
///
/// Only startup paths return these to the caller. Once running, per-frame,
/// per-connection and per-subscriber failures are contained where they occur.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("replay error: {0}")]
    Replay(String),
}

impl RelayError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Replay(_) => "replay",
        }
    }
}
