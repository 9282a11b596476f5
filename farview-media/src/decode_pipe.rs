//! Decoder pipe wrapping a platform decoder backend.
//!
//! Maintains a single decoder instance bound to the current description,
//! coalesces reconfiguration with IDR arrival, and surfaces queue pressure
//! as an IDR request. Setup probes configurations from most to least
//! demanding; when the in-band profile is refused outright, the pipe falls
//! back to the out-of-band variant and attaches a stream translator.

use std::sync::Arc;

use farview_protocol::codec::CodecFamily;
use farview_protocol::media::VideoUnit;

use crate::decoder_backend::{DecodedFrame, DecoderBackend, DecoderConfig, DecoderFactory, EncodedChunk};
use crate::error::PipelineError;
use crate::pipe::{MediaPipe, Payload, PendingQueue, SetupConfig};
use crate::stats::PipelineStats;
use crate::translator::StreamTranslator;

/// Estimated decode backlog above which an IDR is requested.
const MAX_QUEUE_DELAY_MS: u64 = 200;

/// Queue occupancy below which backlog is never treated as pressure.
const MIN_QUEUE_FOR_IDR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeState {
    Unconfigured,
    Configured,
    Errored,
    Cleaned,
}

pub struct DecodePipe {
    base: Box<dyn MediaPipe>,
    factory: Arc<dyn DecoderFactory>,
    backend: Option<Box<dyn DecoderBackend>>,
    translator: Option<StreamTranslator>,
    state: PipeState,
    pending: PendingQueue,
    fps: u32,
    /// Delta units are dropped until the next keyframe.
    awaiting_key: bool,
    /// An IDR request is outstanding; cleared by the next keyframe.
    idr_latched: bool,
    /// Request raised but not yet observed via `poll_request_idr`.
    idr_pending: bool,
    stats: Arc<PipelineStats>,
}

impl DecodePipe {
    pub fn new(
        base: Box<dyn MediaPipe>,
        factory: Arc<dyn DecoderFactory>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            base,
            factory,
            backend: None,
            translator: None,
            state: PipeState::Unconfigured,
            pending: PendingQueue::default(),
            fps: 60,
            awaiting_key: true,
            idr_latched: false,
            idr_pending: false,
            stats,
        }
    }

    /// Probe one configuration from most to least demanding.
    fn probe(backend: &mut dyn DecoderBackend, config: &DecoderConfig) -> bool {
        let attempts = [
            DecoderConfig {
                prefer_hardware: true,
                optimize_for_latency: true,
                ..config.clone()
            },
            DecoderConfig {
                optimize_for_latency: true,
                ..config.clone()
            },
            config.clone(),
        ];
        for attempt in attempts {
            match backend.configure(&attempt) {
                Ok(()) => {
                    tracing::debug!(
                        codec = %attempt.tag,
                        prefer_hardware = attempt.prefer_hardware,
                        optimize_for_latency = attempt.optimize_for_latency,
                        "decoder configuration accepted"
                    );
                    return true;
                }
                Err(error) => {
                    tracing::debug!(codec = %attempt.tag, %error, "decoder probe rejected");
                }
            }
        }
        false
    }

    fn process_unit(&mut self, unit: VideoUnit) -> Result<(), PipelineError> {
        PipelineStats::bump(&self.stats.units_submitted);

        if unit.is_key() {
            self.awaiting_key = false;
            self.idr_latched = false;
            self.idr_pending = false;
        }

        let backend = self
            .backend
            .as_mut()
            .expect("configured pipe always holds a backend");

        let frames = if let Some(translator) = self.translator.as_mut() {
            let out = translator.submit_unit(&unit)?;
            let Some(chunk) = out.chunk else {
                PipelineStats::bump(&self.stats.frames_dropped);
                return Ok(());
            };

            if let Some(config) = out.configure {
                backend.reset();
                if let Err(error) = backend.configure(&config) {
                    tracing::error!(%error, codec = %config.tag, "reconfigure failed");
                    self.state = PipeState::Errored;
                    return Err(error);
                }
                self.idr_latched = false;
                self.idr_pending = false;
                PipelineStats::bump(&self.stats.reconfigures);
            }

            if !translator.has_description() {
                // A keyframe came through without its parameter sets and no
                // description was ever negotiated; the decoder cannot take
                // the chunk. Ask for a fresh IDR and move on.
                PipelineStats::bump(&self.stats.frames_dropped);
                if unit.is_key() && !self.idr_latched {
                    self.idr_latched = true;
                    self.idr_pending = true;
                    self.awaiting_key = true;
                    PipelineStats::bump(&self.stats.idr_requests);
                }
                return Ok(());
            }

            if chunk.is_empty() {
                return Ok(());
            }
            backend.decode(EncodedChunk {
                data: &chunk,
                key: unit.is_key(),
                timestamp_us: unit.timestamp_us,
                duration_us: unit.duration_us,
            })
        } else {
            if self.awaiting_key && !unit.is_key() {
                PipelineStats::bump(&self.stats.frames_dropped);
                return Ok(());
            }
            backend.decode(EncodedChunk {
                data: &unit.data,
                key: unit.is_key(),
                timestamp_us: unit.timestamp_us,
                duration_us: unit.duration_us,
            })
        };

        let frames = match frames {
            Ok(frames) => frames,
            Err(error) => {
                tracing::error!(%error, "decode failed; pipe latched errored");
                self.state = PipeState::Errored;
                return Err(error);
            }
        };

        for frame in frames {
            PipelineStats::bump(&self.stats.frames_decoded);
            let payload = match frame {
                DecodedFrame::Handle(handle) => Payload::Frame(handle),
                DecodedFrame::Yuv420(yuv) => Payload::Yuv420(yuv),
            };
            self.base.submit(payload)?;
        }
        Ok(())
    }
}

impl MediaPipe for DecodePipe {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.base.setup(config)?;
        self.fps = config.fps.max(1);

        let mut backend = self.factory.create();
        let in_band = DecoderConfig::in_band(config.codec, config.width, config.height);

        if Self::probe(backend.as_mut(), &in_band) {
            self.translator = None;
        } else if config.codec.family() != CodecFamily::Av1 {
            let out_of_band =
                DecoderConfig::out_of_band(config.codec, config.width, config.height);
            if Self::probe(backend.as_mut(), &out_of_band) {
                tracing::info!(
                    codec = %out_of_band.tag,
                    "in-band profile refused; translating to length-prefixed stream"
                );
                self.translator = Some(StreamTranslator::new(out_of_band));
            } else {
                self.state = PipeState::Errored;
                return Err(PipelineError::Configuration(format!(
                    "decoder refused every configuration for {}",
                    config.codec.in_band_tag()
                )));
            }
        } else {
            self.state = PipeState::Errored;
            return Err(PipelineError::Configuration(format!(
                "decoder refused every configuration for {}",
                config.codec.in_band_tag()
            )));
        }

        self.backend = Some(backend);
        self.state = PipeState::Configured;
        tracing::info!(
            codec = config.codec.in_band_tag(),
            width = config.width,
            height = config.height,
            translated = self.translator.is_some(),
            "decode pipe configured"
        );

        // Units that arrived while configuring drain in order.
        while let Some(payload) = self.pending.pop() {
            if let Payload::EncodedVideo(unit) = payload {
                self.process_unit(unit)?;
            }
        }
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        match self.state {
            PipeState::Cleaned => return Ok(()),
            PipeState::Errored => {
                PipelineStats::bump(&self.stats.frames_dropped);
                return Ok(());
            }
            PipeState::Unconfigured => return self.pending.push(payload),
            PipeState::Configured => {}
        }

        let Payload::EncodedVideo(unit) = payload else {
            return self.base.submit(payload);
        };

        // Anything still parked drains first so ordering holds.
        while let Some(parked) = self.pending.pop() {
            if let Payload::EncodedVideo(parked_unit) = parked {
                self.process_unit(parked_unit)?;
            }
        }
        self.process_unit(unit)
    }

    fn tick(&mut self) {
        self.base.tick();
    }

    fn poll_request_idr(&mut self) -> bool {
        if self.state == PipeState::Configured && !self.idr_latched {
            let backend = self
                .backend
                .as_ref()
                .expect("configured pipe always holds a backend");
            let queue_len = backend.queue_len();
            let delay_ms = queue_len as u64 * 1000 / self.fps as u64;
            if delay_ms > MAX_QUEUE_DELAY_MS && queue_len > MIN_QUEUE_FOR_IDR {
                tracing::warn!(
                    queue_len,
                    delay_ms,
                    "decode queue backlog; resetting decoder and requesting IDR"
                );
                self.backend
                    .as_mut()
                    .expect("configured pipe always holds a backend")
                    .reset();
                self.idr_latched = true;
                self.idr_pending = true;
                self.awaiting_key = true;
                PipelineStats::bump(&self.stats.idr_requests);
            }
        }

        let mine = std::mem::take(&mut self.idr_pending);
        self.base.poll_request_idr() || mine
    }

    fn cleanup(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        if let Some(translator) = self.translator.as_mut() {
            translator.close();
        }
        self.pending.clear();
        self.state = PipeState::Cleaned;
        self.base.cleanup();
    }
}
