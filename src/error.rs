use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

/// Failure taxonomy for the whole node.
///
/// Socket and protocol failures terminate the one connection they occurred
/// on; transfer and trust failures leave the connection usable and are
/// reported to the caller or operator instead.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("unknown host: {0}")]
    HostUnknown(String),

    #[error("connect to {addr} failed: {source}")]
    ConnectFailed { addr: String, source: io::Error },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("trust rejected: {0}")]
    Trust(String),
}

impl NetError {
    /// Whether the connection that produced this error stays usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NetError::Transfer(_) | NetError::Trust(_))
    }
}

impl From<rsa::Error> for NetError {
    fn from(e: rsa::Error) -> Self {
        NetError::Crypto(e.to_string())
    }
}
