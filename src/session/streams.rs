//! Streams of a session
//!
//! A session always has the signaling stream and at most one audio and one
//! video stream. Each media stream owns its sequence space, a sender whose
//! ack/loss hooks depend on the media kind, and a receiver (jitter buffer
//! for audio, fragment reassembler for video).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::network::{JitterBuffer, SequenceTracker};
use crate::protocol::{
    Fragment, StreamData, StreamDescriptor, StreamKind, STREAM_ID_AUDIO, STREAM_ID_SIGNALING,
    STREAM_ID_VIDEO,
};

/// Largest video fragment payload
pub const VIDEO_FRAGMENT_SIZE: usize = 1024;

/// Partial video frames kept while waiting for missing fragments
const MAX_PARTIAL_FRAMES: usize = 8;

// ============================================================================
// Senders
// ============================================================================

/// Audio-specific send state
#[derive(Debug, Default)]
pub struct AudioSender {
    /// Most recent encoded frames, newest first, for redundant copies
    recent_frames: VecDeque<Vec<u8>>,
    pub packets_acked: u64,
    pub packets_lost: u64,
}

impl AudioSender {
    /// Remember a sent frame; returns up to `count` earlier frames, newest
    /// first
    pub fn push_frame(&mut self, frame: &[u8], count: usize) -> Vec<Vec<u8>> {
        let ec: Vec<Vec<u8>> = self.recent_frames.iter().take(count).cloned().collect();
        self.recent_frames.push_front(frame.to_vec());
        self.recent_frames.truncate(count.max(1));
        ec
    }
}

/// Video-specific send state
#[derive(Debug, Default)]
pub struct VideoSender {
    /// Sequence numbers carrying keyframe fragments not yet acknowledged
    keyframe_seqs: Vec<u32>,
    /// A keyframe fragment was lost; the source should send a new one
    pub keyframe_needed: bool,
    pub fragments_acked: u64,
    pub fragments_lost: u64,
}

/// Per-kind send hooks, dispatched with one `match`
#[derive(Debug)]
pub enum PacketSender {
    Audio(AudioSender),
    Video(VideoSender),
}

impl PacketSender {
    pub fn for_kind(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Audio => PacketSender::Audio(AudioSender::default()),
            StreamKind::Video => PacketSender::Video(VideoSender::default()),
        }
    }

    pub fn on_sent(&mut self, seq: u32, keyframe: bool) {
        if let PacketSender::Video(video) = self {
            if keyframe {
                video.keyframe_seqs.push(seq);
            }
        }
    }

    pub fn on_acked(&mut self, seq: u32) {
        match self {
            PacketSender::Audio(audio) => audio.packets_acked += 1,
            PacketSender::Video(video) => {
                video.fragments_acked += 1;
                video.keyframe_seqs.retain(|&s| s != seq);
            }
        }
    }

    pub fn on_lost(&mut self, seq: u32) {
        match self {
            PacketSender::Audio(audio) => audio.packets_lost += 1,
            PacketSender::Video(video) => {
                video.fragments_lost += 1;
                let before = video.keyframe_seqs.len();
                video.keyframe_seqs.retain(|&s| s != seq);
                if before != video.keyframe_seqs.len() {
                    debug!("Keyframe fragment {} lost", seq);
                    video.keyframe_needed = true;
                }
            }
        }
    }
}

// ============================================================================
// Receivers
// ============================================================================

/// A complete received video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub pts: u32,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct PartialFrame {
    keyframe: bool,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Reassembles fragmented video frames keyed by pts
#[derive(Debug, Default)]
pub struct VideoReassembler {
    partial: BTreeMap<u32, PartialFrame>,
    last_emitted: Option<u32>,
    pub frames_completed: u64,
    pub frames_dropped: u64,
}

impl VideoReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stream-data payload; returns a frame once it is complete
    pub fn push(&mut self, data: StreamData) -> Option<VideoFrame> {
        if let Some(last) = self.last_emitted {
            if !crate::network::seqgt(data.pts, last) {
                trace!("Dropping video fragment for old pts {}", data.pts);
                return None;
            }
        }

        let Some(Fragment { index, count }) = data.fragment else {
            return Some(self.emit(data.pts, data.keyframe, data.payload));
        };
        if count == 0 || index >= count {
            debug!("Bad fragment {}/{} for pts {}", index, count, data.pts);
            return None;
        }

        let entry = self.partial.entry(data.pts).or_insert_with(|| PartialFrame {
            keyframe: false,
            parts: vec![None; count as usize],
            received: 0,
        });
        if entry.parts.len() != count as usize {
            debug!("Fragment count changed for pts {}", data.pts);
            return None;
        }
        entry.keyframe |= data.keyframe;
        let slot = &mut entry.parts[index as usize];
        if slot.is_none() {
            *slot = Some(data.payload);
            entry.received += 1;
        }

        if entry.received == entry.parts.len() {
            let frame = self.partial.remove(&data.pts)?;
            let bytes: Vec<u8> = frame.parts.into_iter().flatten().flatten().collect();
            return Some(self.emit(data.pts, frame.keyframe, bytes));
        }

        while self.partial.len() > MAX_PARTIAL_FRAMES {
            if let Some((&oldest, _)) = self.partial.iter().next() {
                self.partial.remove(&oldest);
                self.frames_dropped += 1;
            }
        }
        None
    }

    fn emit(&mut self, pts: u32, keyframe: bool, data: Vec<u8>) -> VideoFrame {
        self.last_emitted = Some(pts);
        // Anything older can no longer be shown
        let stale: Vec<u32> = self
            .partial
            .keys()
            .copied()
            .filter(|&p| !crate::network::seqgt(p, pts))
            .collect();
        for p in stale {
            self.partial.remove(&p);
            self.frames_dropped += 1;
        }
        self.frames_completed += 1;
        VideoFrame {
            pts,
            keyframe,
            data,
        }
    }
}

/// Split a video frame into stream-data payloads
pub fn fragment_video_frame(pts: u32, keyframe: bool, frame: &[u8]) -> Vec<StreamData> {
    if frame.len() <= VIDEO_FRAGMENT_SIZE {
        return vec![StreamData {
            pts,
            keyframe,
            fragment: None,
            payload: frame.to_vec(),
        }];
    }
    let chunks: Vec<&[u8]> = frame.chunks(VIDEO_FRAGMENT_SIZE).collect();
    if chunks.len() > u8::MAX as usize {
        debug!("Video frame of {} bytes is too large, dropping", frame.len());
        return Vec::new();
    }
    let count = chunks.len() as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| StreamData {
            pts,
            keyframe,
            fragment: Some(Fragment {
                index: index as u8,
                count,
            }),
            payload: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug)]
pub enum StreamReceiver {
    /// Shared with the render task
    Audio(Arc<Mutex<JitterBuffer>>),
    Video(VideoReassembler),
}

/// What the peer told us about its side of a stream
#[derive(Debug, Clone, Default)]
pub struct RemoteStreamState {
    pub enabled: bool,
    pub paused: bool,
    pub extra_ec: bool,
    pub codec: u32,
    pub frame_duration_ms: u16,
    pub width: u16,
    pub height: u16,
    pub csd: Vec<Vec<u8>>,
}

/// One audio or video stream
#[derive(Debug)]
pub struct MediaStream {
    pub id: u8,
    pub kind: StreamKind,
    pub tracker: SequenceTracker,
    pub codec: u32,
    pub frame_duration_ms: u16,
    pub enabled: bool,
    pub paused: bool,
    pub next_pts: u32,
    pub sender: PacketSender,
    pub receiver: StreamReceiver,
    pub remote: RemoteStreamState,
    pub received_first_packet: bool,
}

impl MediaStream {
    pub fn audio(codec: u32, frame_duration_ms: u16, jitter: Arc<Mutex<JitterBuffer>>) -> Self {
        Self {
            id: STREAM_ID_AUDIO,
            kind: StreamKind::Audio,
            tracker: SequenceTracker::new(),
            codec,
            frame_duration_ms,
            enabled: true,
            paused: false,
            next_pts: 0,
            sender: PacketSender::for_kind(StreamKind::Audio),
            receiver: StreamReceiver::Audio(jitter),
            remote: RemoteStreamState::default(),
            received_first_packet: false,
        }
    }

    pub fn video(codec: u32) -> Self {
        Self {
            id: STREAM_ID_VIDEO,
            kind: StreamKind::Video,
            tracker: SequenceTracker::new(),
            codec,
            frame_duration_ms: 0,
            enabled: true,
            paused: false,
            next_pts: 0,
            sender: PacketSender::for_kind(StreamKind::Video),
            receiver: StreamReceiver::Video(VideoReassembler::new()),
            remote: RemoteStreamState::default(),
            received_first_packet: false,
        }
    }

    /// Advertised in our init-ack
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            id: self.id,
            kind: self.kind,
            codec: self.codec,
            frame_duration_ms: self.frame_duration_ms,
            enabled: self.enabled,
        }
    }

    /// Apply the peer's init-ack entry for this stream
    pub fn apply_remote(&mut self, descriptor: &StreamDescriptor) {
        self.remote.enabled = descriptor.enabled;
        self.remote.codec = descriptor.codec;
        self.remote.frame_duration_ms = descriptor.frame_duration_ms;
    }
}

/// Fixed-shape stream set of a session
#[derive(Debug)]
pub struct StreamSet {
    pub signaling: SequenceTracker,
    pub audio: Option<MediaStream>,
    pub video: Option<MediaStream>,
}

impl StreamSet {
    pub fn new(audio: Option<MediaStream>, video: Option<MediaStream>) -> Self {
        Self {
            signaling: SequenceTracker::new(),
            audio,
            video,
        }
    }

    pub fn media(&self, id: u8) -> Option<&MediaStream> {
        match id {
            STREAM_ID_AUDIO => self.audio.as_ref(),
            STREAM_ID_VIDEO => self.video.as_ref(),
            _ => None,
        }
    }

    pub fn media_mut(&mut self, id: u8) -> Option<&mut MediaStream> {
        match id {
            STREAM_ID_AUDIO => self.audio.as_mut(),
            STREAM_ID_VIDEO => self.video.as_mut(),
            _ => None,
        }
    }

    /// Sequence space of stream `id`
    pub fn tracker_mut(&mut self, id: u8) -> Option<&mut SequenceTracker> {
        match id {
            STREAM_ID_SIGNALING => Some(&mut self.signaling),
            _ => self.media_mut(id).map(|s| &mut s.tracker),
        }
    }

    pub fn tracker(&self, id: u8) -> Option<&SequenceTracker> {
        match id {
            STREAM_ID_SIGNALING => Some(&self.signaling),
            _ => self.media(id).map(|s| &s.tracker),
        }
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .map(MediaStream::descriptor)
            .collect()
    }

    /// Largest unacked span across sequence spaces
    pub fn max_unacked_span(&self) -> u32 {
        [Some(&self.signaling), self.audio.as_ref().map(|s| &s.tracker)]
            .into_iter()
            .flatten()
            .chain(self.video.as_ref().map(|s| &s.tracker))
            .map(SequenceTracker::unacked_span)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_and_reassemble() {
        let frame: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let pieces = fragment_video_frame(90, true, &frame);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.payload.len() <= VIDEO_FRAGMENT_SIZE));

        let mut reassembler = VideoReassembler::new();
        // Out of order arrival
        assert!(reassembler.push(pieces[2].clone()).is_none());
        assert!(reassembler.push(pieces[0].clone()).is_none());
        // Duplicate is ignored
        assert!(reassembler.push(pieces[0].clone()).is_none());
        let out = reassembler.push(pieces[1].clone()).unwrap();
        assert_eq!(out.pts, 90);
        assert!(out.keyframe);
        assert_eq!(out.data, frame);
    }

    #[test]
    fn test_small_frame_not_fragmented() {
        let pieces = fragment_video_frame(1, false, &[1, 2, 3]);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].fragment.is_none());
        let mut reassembler = VideoReassembler::new();
        assert_eq!(reassembler.push(pieces[0].clone()).unwrap().data, vec![1, 2, 3]);
    }

    #[test]
    fn test_incomplete_older_frame_dropped() {
        let mut reassembler = VideoReassembler::new();
        let old = fragment_video_frame(10, false, &[0u8; 2048]);
        reassembler.push(old[0].clone());
        let newer = fragment_video_frame(20, false, &[1u8; 10]);
        assert!(reassembler.push(newer[0].clone()).is_some());
        assert_eq!(reassembler.frames_dropped, 1);
        // Late fragment of the superseded frame
        assert!(reassembler.push(old[1].clone()).is_none());
    }

    #[test]
    fn test_video_sender_flags_lost_keyframe() {
        let mut sender = PacketSender::for_kind(StreamKind::Video);
        sender.on_sent(1, true);
        sender.on_sent(2, false);
        sender.on_lost(2);
        let PacketSender::Video(video) = &sender else {
            panic!("expected video sender");
        };
        assert!(!video.keyframe_needed);
        sender.on_lost(1);
        let PacketSender::Video(video) = &sender else {
            panic!("expected video sender");
        };
        assert!(video.keyframe_needed);
    }

    #[test]
    fn test_audio_ec_history() {
        let mut audio = AudioSender::default();
        assert!(audio.push_frame(&[1], 2).is_empty());
        assert_eq!(audio.push_frame(&[2], 2), vec![vec![1]]);
        assert_eq!(audio.push_frame(&[3], 2), vec![vec![2], vec![1]]);
        assert_eq!(audio.push_frame(&[4], 2), vec![vec![3], vec![2]]);
    }

    #[test]
    fn test_stream_set_lookup() {
        let jitter = Arc::new(Mutex::new(JitterBuffer::default()));
        let mut set = StreamSet::new(Some(MediaStream::audio(1, 60, jitter)), None);
        assert!(set.tracker_mut(STREAM_ID_SIGNALING).is_some());
        assert!(set.tracker_mut(STREAM_ID_AUDIO).is_some());
        assert!(set.tracker_mut(STREAM_ID_VIDEO).is_none());
        assert_eq!(set.descriptors().len(), 1);
    }
}
