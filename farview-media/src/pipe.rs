//! The pipe abstraction: composable nodes with a synchronous submission
//! contract.
//!
//! Every pipe consumes one payload kind and forwards its output to the pipe
//! below it (the leaf is a renderer or segment sink). Control operations
//! (`setup`, `tick`, `poll_request_idr`, `cleanup`) cascade through each
//! pipe to its base. `setup` is the only operation allowed to block
//! meaningfully; `submit` must return promptly and pipes buffer submissions
//! that arrive before they are configured.

use std::collections::VecDeque;

use bytes::Bytes;
use farview_protocol::codec::CodecId;
use farview_protocol::media::{AudioPacket, AudioParams, VideoUnit};

use crate::error::PipelineError;
use crate::frame::{FrameHandle, RgbaFrame, Yuv420Frame};

/// Limit for submissions parked while a pipe is still configuring.
pub const PENDING_LIMIT: usize = 64;

/// What a pipe consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    EncodedVideo,
    EncodedAudio,
    Frame,
    Rgba,
    Yuv420,
    Segment,
    Pcm,
}

/// A block of decoded PCM, interleaved f32.
#[derive(Debug, Clone)]
pub struct PcmBlock {
    pub samples: Vec<f32>,
    pub channels: u8,
    pub sample_rate: u32,
    pub timestamp_us: u64,
}

/// Kind of emitted ISO-BMFF segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// `ftyp + moov`; implies a (re)configuration downstream.
    Init,
    /// `moof + mdat` for a single frame.
    Media,
}

/// A fragmented-MP4 segment flowing toward a source-buffer sink.
#[derive(Debug, Clone)]
pub struct Segment {
    pub kind: SegmentKind,
    pub data: Bytes,
    /// Codec tag the segment was muxed for; sinks open a fresh source
    /// buffer whenever an init segment arrives.
    pub codec_tag: String,
}

/// Tagged payload moved between pipes.
#[derive(Debug)]
pub enum Payload {
    EncodedVideo(VideoUnit),
    EncodedAudio(AudioPacket),
    Frame(FrameHandle),
    Rgba(RgbaFrame),
    Yuv420(Yuv420Frame),
    Segment(Segment),
    Pcm(PcmBlock),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::EncodedVideo(_) => PayloadKind::EncodedVideo,
            Payload::EncodedAudio(_) => PayloadKind::EncodedAudio,
            Payload::Frame(_) => PayloadKind::Frame,
            Payload::Rgba(_) => PayloadKind::Rgba,
            Payload::Yuv420(_) => PayloadKind::Yuv420,
            Payload::Segment(_) => PayloadKind::Segment,
            Payload::Pcm(_) => PayloadKind::Pcm,
        }
    }
}

/// Stream parameters handed to `setup`.
#[derive(Debug, Clone)]
pub struct SetupConfig {
    pub codec: CodecId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Draw frames as they arrive instead of deferring to the next tick.
    pub low_latency: bool,
    pub audio: Option<AudioParams>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            codec: CodecId::H264Baseline,
            width: 1280,
            height: 720,
            fps: 60,
            low_latency: true,
            audio: None,
        }
    }
}

/// Per-codec capability answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Yes,
    No,
    /// The backend cannot answer statically and commits only after setup.
    Maybe,
}

/// Codec support mask attached to a pipe's static info.
#[derive(Debug, Clone, Default)]
pub struct CodecSupport {
    entries: Vec<(CodecId, Support)>,
}

impl CodecSupport {
    pub fn from_fn(f: impl Fn(CodecId) -> Support) -> Self {
        Self {
            entries: farview_protocol::codec::ALL_CODECS
                .into_iter()
                .map(|c| (c, f(c)))
                .collect(),
        }
    }

    pub fn all(support: Support) -> Self {
        Self::from_fn(|_| support)
    }

    pub fn get(&self, codec: CodecId) -> Support {
        self.entries
            .iter()
            .find(|(c, _)| *c == codec)
            .map(|(_, s)| *s)
            .unwrap_or(Support::No)
    }

    pub fn set(&mut self, codec: CodecId, support: Support) {
        match self.entries.iter_mut().find(|(c, _)| *c == codec) {
            Some((_, s)) => *s = support,
            None => self.entries.push((codec, support)),
        }
    }
}

/// Static capability answer for one pipe.
#[derive(Debug, Clone)]
pub struct PipeInfo {
    pub environment_supported: bool,
    /// `None` means the pipe is codec-agnostic (pass-through).
    pub video_codecs: Option<CodecSupport>,
}

impl PipeInfo {
    pub fn unsupported() -> Self {
        Self {
            environment_supported: false,
            video_codecs: None,
        }
    }

    pub fn pass_through() -> Self {
        Self {
            environment_supported: true,
            video_codecs: None,
        }
    }
}

/// A composable pipeline node.
pub trait MediaPipe: Send {
    /// Configure the pipe and everything below it. The only operation
    /// allowed to block meaningfully.
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError>;

    /// Feed one payload. Must return promptly; asynchronous work may be
    /// enqueued but not awaited.
    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError>;

    /// External clock input: display refresh or source-buffer update-end.
    /// Cascades to the base.
    fn tick(&mut self);

    /// Whether any pipe in the chain wants a fresh IDR. The request is
    /// latched by the raising pipe until the next keyframe arrives.
    fn poll_request_idr(&mut self) -> bool;

    /// Tear down resources, then cascade to the base. Submissions after
    /// cleanup are dropped silently.
    fn cleanup(&mut self);
}

/// Bounded queue for submissions that arrive while a pipe is still
/// configuring; rejects on overflow.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<Payload>,
}

impl PendingQueue {
    pub fn push(&mut self, payload: Payload) -> Result<(), PipelineError> {
        if self.queue.len() >= PENDING_LIMIT {
            return Err(PipelineError::Resource(format!(
                "pending queue full ({PENDING_LIMIT} units)"
            )));
        }
        self.queue.push_back(payload);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Payload> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
