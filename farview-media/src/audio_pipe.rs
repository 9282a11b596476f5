//! Audio pipes: depacketize + decode, and the PCM sink.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::PipelineError;
use crate::opus_decoder::MultistreamDecoder;
use crate::pipe::{MediaPipe, Payload, PcmBlock, SetupConfig};
use crate::stats::PipelineStats;

/// Decodes Opus packets into interleaved PCM blocks.
///
/// An empty packet payload marks a transport-detected loss and runs
/// concealment instead of a normal decode.
pub struct AudioDecodePipe {
    base: Box<dyn MediaPipe>,
    decoder: Option<MultistreamDecoder>,
    output: Vec<f32>,
    errored: bool,
    cleaned: bool,
    stats: Arc<PipelineStats>,
}

impl AudioDecodePipe {
    pub fn new(base: Box<dyn MediaPipe>, stats: Arc<PipelineStats>) -> Self {
        Self {
            base,
            decoder: None,
            output: Vec::new(),
            errored: false,
            cleaned: false,
            stats,
        }
    }
}

impl MediaPipe for AudioDecodePipe {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.base.setup(config)?;
        let params = config.audio.as_ref().ok_or(PipelineError::Unsupported(
            "audio pipe requires audio parameters",
        ))?;
        let decoder = MultistreamDecoder::new(params)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        self.output = vec![0.0; params.samples_per_frame * params.channels as usize];
        self.decoder = Some(decoder);
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        if self.cleaned || self.errored {
            return Ok(());
        }
        let Payload::EncodedAudio(packet) = payload else {
            return self.base.submit(payload);
        };
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(PipelineError::Configuration(
                "audio pipe used before setup".into(),
            ));
        };

        let params = decoder.params().clone();
        let frame_size = params.samples_per_frame;
        let input = if packet.data.is_empty() {
            None
        } else {
            Some(&packet.data[..])
        };

        let samples = match decoder.decode(input, &mut self.output, frame_size, false) {
            Ok(samples) => samples,
            Err(error) => {
                if error.code == crate::opus_decoder::status::INVALID_PACKET {
                    // Malformed packets are a transport problem; skip them.
                    tracing::warn!(%error, "dropping malformed audio packet");
                    return Ok(());
                }
                tracing::error!(%error, "audio decoder latched errored");
                self.errored = true;
                return Err(PipelineError::Resource(error.to_string()));
            }
        };

        PipelineStats::bump(&self.stats.frames_decoded);
        let channels = params.channels as usize;
        self.base.submit(Payload::Pcm(PcmBlock {
            samples: self.output[..samples * channels].to_vec(),
            channels: params.channels,
            sample_rate: params.sample_rate,
            timestamp_us: packet.timestamp_us,
        }))
    }

    fn tick(&mut self) {
        self.base.tick();
    }

    fn poll_request_idr(&mut self) -> bool {
        self.base.poll_request_idr()
    }

    fn cleanup(&mut self) {
        self.decoder = None;
        self.cleaned = true;
        self.base.cleanup();
    }
}

/// Leaf pipe delivering PCM blocks to the embedder's audio output.
pub struct PcmSink {
    output: mpsc::UnboundedSender<PcmBlock>,
    cleaned: bool,
}

impl PcmSink {
    pub fn new(output: mpsc::UnboundedSender<PcmBlock>) -> Self {
        Self {
            output,
            cleaned: false,
        }
    }
}

impl MediaPipe for PcmSink {
    fn setup(&mut self, _config: &SetupConfig) -> Result<(), PipelineError> {
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        let Payload::Pcm(block) = payload else {
            return Err(PipelineError::Bitstream(format!(
                "pcm sink expects pcm blocks, got {:?}",
                payload.kind()
            )));
        };
        if !self.cleaned {
            let _ = self.output.send(block);
        }
        Ok(())
    }

    fn tick(&mut self) {}

    fn poll_request_idr(&mut self) -> bool {
        false
    }

    fn cleanup(&mut self) {
        self.cleaned = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use farview_protocol::media::{AudioPacket, AudioParams};

    fn setup_chain() -> (AudioDecodePipe, mpsc::UnboundedReceiver<PcmBlock>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = PcmSink::new(tx);
        let mut pipe = AudioDecodePipe::new(Box::new(sink), Arc::new(PipelineStats::new()));
        pipe.setup(&SetupConfig {
            audio: Some(AudioParams::stereo()),
            ..SetupConfig::default()
        })
        .unwrap();
        (pipe, rx)
    }

    fn encoded_frame() -> Bytes {
        let mut encoder =
            opus::Encoder::new(48_000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let silence = vec![0.0f32; 960 * 2];
        Bytes::from(encoder.encode_vec_float(&silence, 4000).unwrap())
    }

    #[test]
    fn decodes_packets_to_pcm_blocks() {
        let (mut pipe, mut rx) = setup_chain();
        pipe.submit(Payload::EncodedAudio(AudioPacket {
            data: encoded_frame(),
            timestamp_us: 20_000,
        }))
        .unwrap();

        let block = rx.try_recv().unwrap();
        assert_eq!(block.channels, 2);
        assert_eq!(block.sample_rate, 48_000);
        assert_eq!(block.samples.len(), 960 * 2);
        assert_eq!(block.timestamp_us, 20_000);
    }

    #[test]
    fn empty_packet_runs_concealment() {
        let (mut pipe, mut rx) = setup_chain();
        pipe.submit(Payload::EncodedAudio(AudioPacket {
            data: Bytes::new(),
            timestamp_us: 40_000,
        }))
        .unwrap();

        let block = rx.try_recv().unwrap();
        assert_eq!(block.samples.len(), 960 * 2);
    }

    #[test]
    fn missing_audio_params_fail_setup() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pipe =
            AudioDecodePipe::new(Box::new(PcmSink::new(tx)), Arc::new(PipelineStats::new()));
        let err = pipe.setup(&SetupConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Unsupported(_)));
    }

    #[test]
    fn malformed_packet_is_skipped_without_latching() {
        let (mut pipe, mut rx) = setup_chain();
        pipe.submit(Payload::EncodedAudio(AudioPacket {
            data: Bytes::from_static(&[0xFF, 0xFF]),
            timestamp_us: 0,
        }))
        .unwrap();
        assert!(rx.try_recv().is_err());

        // Still decoding afterwards.
        pipe.submit(Payload::EncodedAudio(AudioPacket {
            data: encoded_frame(),
            timestamp_us: 1,
        }))
        .unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
