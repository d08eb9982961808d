use std::fmt;
use thiserror::Error;

/// Why a session was closed before any tunnel was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoClientAddress,
    UnauthorizedIp,
    NoHostHeader,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoClientAddress => write!(f, "no client address"),
            RejectReason::UnauthorizedIp => write!(f, "unauthorized ip"),
            RejectReason::NoHostHeader => write!(f, "no host header"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rejected: {0}")]
    Rejected(RejectReason),

    #[error("Dial to {target} failed: {reason}")]
    DialFailed { target: String, reason: String },

    #[error("Relay error: {0}")]
    RelayIo(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
