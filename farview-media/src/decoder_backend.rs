//! The decoder seam: platform decoders behind a trait.
//!
//! The decode pipe never talks to a concrete decoder; it negotiates through
//! `DecoderBackend` so the same probe/queue/IDR logic drives whatever
//! hardware decoder the embedder supplies, or a scripted mock in tests.

use bytes::Bytes;
use farview_protocol::codec::CodecId;

use crate::error::PipelineError;
use crate::frame::{FrameHandle, Yuv420Frame};
use crate::pipe::Support;

/// Decoder configuration negotiated during setup.
///
/// `description` is the raw AVCC or HVCC record (not an ISO box), present
/// only for the out-of-band codec variants.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub codec: CodecId,
    /// Mime-like codec string; rewritten from the SPS once parameter sets
    /// have been observed.
    pub tag: String,
    pub description: Option<Bytes>,
    pub prefer_hardware: bool,
    pub optimize_for_latency: bool,
    pub width: u32,
    pub height: u32,
}

impl DecoderConfig {
    /// In-band profile: parameter sets travel inside the bitstream.
    pub fn in_band(codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            codec,
            tag: codec.in_band_tag().to_string(),
            description: None,
            prefer_hardware: false,
            optimize_for_latency: false,
            width,
            height,
        }
    }

    /// Out-of-band profile: a configuration record is attached before
    /// decoding starts.
    pub fn out_of_band(codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            tag: codec.out_of_band_tag().to_string(),
            ..Self::in_band(codec, width, height)
        }
    }
}

/// One submission to a decoder: a complete access unit, either Annex-B
/// (in-band profile) or length-prefixed (out-of-band profile).
#[derive(Debug)]
pub struct EncodedChunk<'a> {
    pub data: &'a [u8],
    pub key: bool,
    pub timestamp_us: u64,
    pub duration_us: u64,
}

/// Output of a decoder backend.
#[derive(Debug)]
pub enum DecodedFrame {
    /// Platform frame with explicit close semantics.
    Handle(FrameHandle),
    /// Planar YUV produced by software decoders.
    Yuv420(Yuv420Frame),
}

/// A single decoder instance bound to one configuration.
pub trait DecoderBackend: Send {
    /// Apply (or re-apply) a configuration. Probing during setup calls this
    /// with successively weaker configurations until one is accepted.
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), PipelineError>;

    /// Decode one chunk; may yield zero or more frames.
    fn decode(&mut self, chunk: EncodedChunk<'_>) -> Result<Vec<DecodedFrame>, PipelineError>;

    /// Discard queued work; the next submission must be a keyframe.
    fn reset(&mut self);

    /// Chunks submitted but not yet decoded.
    fn queue_len(&self) -> usize;

    fn is_hardware(&self) -> bool {
        false
    }

    fn close(&mut self);
}

/// Creates decoder instances and answers static capability queries.
pub trait DecoderFactory: Send + Sync {
    /// Stable identity string used by policy deny-lists.
    fn identity(&self) -> &str;

    fn supported(&self, codec: CodecId) -> Support;

    fn create(&self) -> Box<dyn DecoderBackend>;
}
