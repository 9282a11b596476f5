//! Scripted decoder backends and capture sinks for tests.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use farview_protocol::codec::CodecId;
use farview_protocol::media::{FrameType, VideoUnit};

use crate::decoder_backend::{
    DecodedFrame, DecoderBackend, DecoderConfig, DecoderFactory, EncodedChunk,
};
use crate::error::PipelineError;
use crate::pipe::{MediaPipe, Payload, PayloadKind, Segment, SetupConfig, Support};
use crate::scratch_pool::ScratchPool;

/// Shared observable state of a [`MockDecoderFactory`]'s backends.
#[derive(Debug, Default)]
pub struct MockDecoderState {
    pub configures: Vec<DecoderConfig>,
    pub resets: u32,
    pub closes: u32,
    /// (chunk length, keyframe, timestamp) per decoded chunk.
    pub decoded: Vec<(usize, bool, u64)>,
    /// Scripted queue occupancy reported by `queue_len`.
    pub queue_len: usize,
    /// When set, every decode fails with a resource error.
    pub fail_decode: bool,
}

/// Decoder factory whose backends follow a script.
pub struct MockDecoderFactory {
    pub state: Arc<Mutex<MockDecoderState>>,
    pub accept_in_band: bool,
    pub accept_out_of_band: bool,
    /// Probe configurations with `prefer_hardware` are rejected when false,
    /// pushing the pipe down the probe ladder.
    pub accept_hardware_probe: bool,
    pub support: fn(CodecId) -> Support,
    pub identity: &'static str,
    pub pool: ScratchPool,
}

impl Default for MockDecoderFactory {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            accept_in_band: true,
            accept_out_of_band: true,
            accept_hardware_probe: true,
            support: |_| Support::Yes,
            identity: "mock-decoder",
            pool: ScratchPool::new(),
        }
    }
}

impl MockDecoderFactory {
    /// A factory that only accepts the out-of-band profile, forcing the
    /// decode pipe to attach a translator.
    pub fn out_of_band_only() -> Self {
        Self {
            accept_in_band: false,
            ..Self::default()
        }
    }
}

impl DecoderFactory for MockDecoderFactory {
    fn identity(&self) -> &str {
        self.identity
    }

    fn supported(&self, codec: CodecId) -> Support {
        (self.support)(codec)
    }

    fn create(&self) -> Box<dyn DecoderBackend> {
        Box::new(MockDecoderBackend {
            state: Arc::clone(&self.state),
            accept_in_band: self.accept_in_band,
            accept_out_of_band: self.accept_out_of_band,
            accept_hardware_probe: self.accept_hardware_probe,
            config: None,
            pool: self.pool.clone(),
        })
    }
}

struct MockDecoderBackend {
    state: Arc<Mutex<MockDecoderState>>,
    accept_in_band: bool,
    accept_out_of_band: bool,
    accept_hardware_probe: bool,
    config: Option<DecoderConfig>,
    pool: ScratchPool,
}

impl MockDecoderBackend {
    fn is_out_of_band(config: &DecoderConfig) -> bool {
        config.tag.starts_with("avc1") || config.tag.starts_with("hvc1")
    }
}

impl DecoderBackend for MockDecoderBackend {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), PipelineError> {
        let profile_ok = if Self::is_out_of_band(config) {
            self.accept_out_of_band
        } else {
            self.accept_in_band
        };
        let accepted = profile_ok && (self.accept_hardware_probe || !config.prefer_hardware);

        self.state.lock().unwrap().configures.push(config.clone());
        if !accepted {
            return Err(PipelineError::Configuration(format!(
                "mock rejects {}",
                config.tag
            )));
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn decode(&mut self, chunk: EncodedChunk<'_>) -> Result<Vec<DecodedFrame>, PipelineError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_decode {
            return Err(PipelineError::Resource("mock decode failure".into()));
        }
        state
            .decoded
            .push((chunk.data.len(), chunk.key, chunk.timestamp_us));
        drop(state);

        let config = self
            .config
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("decode before configure".into()))?;
        let frame = crate::frame::FrameHandle::new_rgba(
            &self.pool,
            config.width,
            config.height,
            chunk.timestamp_us,
            |_| {},
        );
        Ok(vec![DecodedFrame::Handle(frame)])
    }

    fn reset(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.resets += 1;
        state.queue_len = 0;
    }

    fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue_len
    }

    fn is_hardware(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}

/// Leaf pipe recording everything it receives.
#[derive(Default)]
pub struct CollectSink {
    pub seen: Arc<Mutex<CollectedPayloads>>,
}

#[derive(Debug, Default)]
pub struct CollectedPayloads {
    pub kinds: Vec<PayloadKind>,
    /// (width, height, timestamp) of platform frames.
    pub frames: Vec<(u32, u32, u64)>,
    pub segments: Vec<Segment>,
    pub yuv_timestamps: Vec<u64>,
    pub ticks: u32,
    pub setups: u32,
    pub cleanups: u32,
}

impl CollectSink {
    pub fn new() -> (Self, Arc<Mutex<CollectedPayloads>>) {
        let sink = Self::default();
        let seen = Arc::clone(&sink.seen);
        (sink, seen)
    }
}

impl MediaPipe for CollectSink {
    fn setup(&mut self, _config: &SetupConfig) -> Result<(), PipelineError> {
        self.seen.lock().unwrap().setups += 1;
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        let mut seen = self.seen.lock().unwrap();
        seen.kinds.push(payload.kind());
        match payload {
            Payload::Frame(mut frame) => {
                seen.frames.push((
                    frame.display_width(),
                    frame.display_height(),
                    frame.timestamp_us(),
                ));
                frame.close();
            }
            Payload::Yuv420(frame) => seen.yuv_timestamps.push(frame.timestamp_us),
            Payload::Segment(segment) => seen.segments.push(segment),
            _ => {}
        }
        Ok(())
    }

    fn tick(&mut self) {
        self.seen.lock().unwrap().ticks += 1;
    }

    fn poll_request_idr(&mut self) -> bool {
        false
    }

    fn cleanup(&mut self) {
        self.seen.lock().unwrap().cleanups += 1;
    }
}

/// Build an Annex-B unit from raw NAL payloads with 4-byte start codes.
pub fn annex_b_unit(frame_type: FrameType, nals: &[&[u8]], timestamp_us: u64) -> VideoUnit {
    let mut data = Vec::new();
    for nal in nals {
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(nal);
    }
    VideoUnit {
        frame_type,
        data: Bytes::from(data),
        timestamp_us,
        duration_us: 16_667,
    }
}

/// Keyframe carrying SPS + PPS + IDR, the normal H.264 stream opener.
pub fn h264_key_unit(timestamp_us: u64) -> VideoUnit {
    annex_b_unit(
        FrameType::Key,
        &[
            &[0x67, 0x42, 0xE0, 0x1E, 0xAC],
            &[0x68, 0xCE, 0x3C, 0x80],
            &[0x65, 0x88, 0x84, 0x00],
        ],
        timestamp_us,
    )
}

/// Delta unit with a single non-IDR slice.
pub fn h264_delta_unit(timestamp_us: u64) -> VideoUnit {
    annex_b_unit(FrameType::Delta, &[&[0x41, 0x9A, 0x00]], timestamp_us)
}

/// HEVC keyframe; `with_vps` controls whether the VPS is present.
pub fn hevc_key_unit(timestamp_us: u64, with_vps: bool) -> VideoUnit {
    let vps: &[u8] = &[32 << 1, 0x01, 0x0C];
    let sps: &[u8] = &[
        33 << 1,
        0x01,
        0x60,
        0x00,
        0x00,
        0x00,
        0x90,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x5D,
    ];
    let pps: &[u8] = &[34 << 1, 0x01, 0xC0];
    let idr: &[u8] = &[19 << 1, 0x01, 0x26];
    let nals: Vec<&[u8]> = if with_vps {
        vec![vps, sps, pps, idr]
    } else {
        vec![sps, pps, idr]
    };
    annex_b_unit(FrameType::Key, &nals, timestamp_us)
}
