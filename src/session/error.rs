//! Session error types

use thiserror::Error;

use crate::network::{CryptoError, NetworkError};

/// Errors from driving a session through an invalid sequence of calls or
/// from failing to set up its sockets
///
/// Failures after a call started are reported as a `Failed` state with an
/// [`ErrorCode`](super::ErrorCode) instead.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("No remote endpoints set")]
    NoEndpoints,

    #[error("Invalid session key: {0}")]
    Key(#[from] CryptoError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
