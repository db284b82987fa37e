//! Network error types

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue full")]
    SendQueueFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("TCP relay handshake failed: {0}")]
    TcpHandshake(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Envelope encryption and authentication failures
///
/// A packet that fails to open is dropped; none of these are fatal to the
/// session on their own.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Authentication failed")]
    AuthFailure,

    #[error("Invalid key length: {0} bytes")]
    BadKey(usize),

    #[error("Envelope truncated")]
    Truncated,
}
