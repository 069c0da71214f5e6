use std::io;
use thiserror::Error;

/// Errors produced by the broker, server and client engines.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer closed the connection on a frame boundary.
    #[error("connection closed by peer")]
    Closed,
    #[error("framing error: {0}")]
    Framing(String),
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("master key mismatch")]
    MasterKeyMismatch,
    #[error("encrypt method {0} not found")]
    UnknownCipher(String),
    #[error("compress method {0} not found")]
    UnknownCompressor(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("timeout {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the remote end went away without a protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
