//! Audio error types

use thiserror::Error;

/// Errors reported by an audio source or sink
///
/// Any of these ends the session with `ErrorCode::AudioIO`.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not available: {0}")]
    DeviceUnavailable(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Encoder error: {0}")]
    EncoderError(String),

    #[error("Decoder error: {0}")]
    DecoderError(String),
}
