//! Audio collaborators
//!
//! The session never opens devices or runs codecs itself. It pulls encoded
//! frames from an [`AudioSource`] at the frame cadence and pushes jitter
//! buffer output into an [`AudioSink`]. Platform capture/playback and the
//! codec live behind these traits.

mod error;

pub use error::AudioError;

use std::time::Duration;

use crate::network::JitterBufferResult;

/// Produces encoded outgoing audio frames
pub trait AudioSource: Send + 'static {
    /// Next encoded frame, or `None` when there is nothing to send this tick
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, AudioError>;

    /// Encoder bitrate changed (bits per second)
    fn set_bitrate(&mut self, _bitrate: u32) {}
}

/// Consumes incoming audio as released by the jitter buffer
pub trait AudioSink: Send + 'static {
    /// Called once per frame duration with the next playout decision
    fn write_frame(&mut self, frame: JitterBufferResult) -> Result<(), AudioError>;
}

/// Source emitting fixed-size placeholder frames
///
/// Stands in for an encoder when exercising the transport.
#[derive(Debug, Clone)]
pub struct SilenceSource {
    frame_len: usize,
    frames: u64,
}

impl SilenceSource {
    /// Frames sized for `bitrate` at `frame_duration`
    pub fn new(bitrate: u32, frame_duration: Duration) -> Self {
        Self {
            frame_len: frame_len(bitrate, frame_duration),
            frames: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

fn frame_len(bitrate: u32, frame_duration: Duration) -> usize {
    let bytes = bitrate as f64 / 8.0 * frame_duration.as_secs_f64();
    (bytes.round() as usize).max(1)
}

impl AudioSource for SilenceSource {
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, AudioError> {
        self.frames += 1;
        // Counter in the first bytes keeps frames distinguishable
        let mut frame = vec![0u8; self.frame_len];
        let counter = self.frames.to_le_bytes();
        let n = counter.len().min(frame.len());
        frame[..n].copy_from_slice(&counter[..n]);
        Ok(Some(frame))
    }
}

/// Sink that discards audio and counts what it was given
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink {
    pub frames: u64,
    pub lost: u64,
    pub recovered: u64,
}

impl AudioSink for NullSink {
    fn write_frame(&mut self, frame: JitterBufferResult) -> Result<(), AudioError> {
        match frame {
            JitterBufferResult::Frame { from_ec, .. } => {
                self.frames += 1;
                if from_ec {
                    self.recovered += 1;
                }
            }
            JitterBufferResult::Lost { .. } => self.lost += 1,
            JitterBufferResult::Buffering => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_frame_size_follows_bitrate() {
        let mut source = SilenceSource::new(16000, Duration::from_millis(60));
        let frame = source.read_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 120);
        let next = source.read_frame().unwrap().unwrap();
        assert_ne!(frame, next);
        assert_eq!(source.frames(), 2);
    }

    #[test]
    fn test_null_sink_counts() {
        let mut sink = NullSink::default();
        sink.write_frame(JitterBufferResult::Frame {
            timestamp: 0,
            payload: vec![1],
            from_ec: true,
            hint: crate::network::PlaybackHint::Normal,
        })
        .unwrap();
        sink.write_frame(JitterBufferResult::Lost { timestamp: 60 })
            .unwrap();
        sink.write_frame(JitterBufferResult::Buffering).unwrap();
        assert_eq!(sink.frames, 1);
        assert_eq!(sink.recovered, 1);
        assert_eq!(sink.lost, 1);
    }
}
