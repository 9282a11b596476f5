//! H.264 software fallback decoding via OpenH264.
//!
//! The decoder is built off-thread so pipeline setup never stalls on
//! library initialization; units submitted in the meantime are parked and
//! drained in order once the decoder is ready. Output is planar YUV handed
//! to the pipe below (a GPU renderer or the scalar converter).

use bytes::Bytes;
use farview_protocol::codec::{CodecFamily, CodecId};
use openh264::decoder::{Decoder, DecoderConfig};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::PipelineError;
use crate::frame::Yuv420Frame;
use crate::pipe::{
    CodecSupport, MediaPipe, Payload, PendingQueue, PipeInfo, SetupConfig, Support,
};
use crate::stats::PipelineStats;

/// Static capability answer for the software decoder.
pub fn software_decoder_info() -> PipeInfo {
    PipeInfo {
        environment_supported: true,
        video_codecs: Some(CodecSupport::from_fn(|codec| match codec {
            CodecId::H264Baseline => Support::Yes,
            // OpenH264 has no 4:4:4 predictive support.
            _ => Support::No,
        })),
    }
}

enum DecoderSlot {
    Empty,
    Loading(oneshot::Receiver<Result<Decoder, String>>),
    Ready(Decoder),
    Failed,
}

pub struct SoftwareDecodePipe {
    base: Box<dyn MediaPipe>,
    slot: DecoderSlot,
    pending: PendingQueue,
    cleaned: bool,
    stats: Arc<PipelineStats>,
}

impl SoftwareDecodePipe {
    pub fn new(base: Box<dyn MediaPipe>, stats: Arc<PipelineStats>) -> Self {
        Self {
            base,
            slot: DecoderSlot::Empty,
            pending: PendingQueue::default(),
            cleaned: false,
            stats,
        }
    }

    /// Whether the decoder module finished loading.
    pub fn is_ready(&mut self) -> bool {
        self.poll_slot();
        matches!(self.slot, DecoderSlot::Ready(_))
    }

    /// Advance the loading state without blocking.
    fn poll_slot(&mut self) {
        if let DecoderSlot::Loading(rx) = &mut self.slot {
            match rx.try_recv() {
                Ok(Ok(decoder)) => {
                    tracing::info!("software decoder ready");
                    self.slot = DecoderSlot::Ready(decoder);
                }
                Ok(Err(error)) => {
                    tracing::error!(%error, "software decoder failed to load");
                    self.slot = DecoderSlot::Failed;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    tracing::error!("software decoder loader went away");
                    self.slot = DecoderSlot::Failed;
                }
            }
        }
    }

    fn drain_pending(&mut self) -> Result<(), PipelineError> {
        while let Some(payload) = self.pending.pop() {
            if let Payload::EncodedVideo(unit) = payload {
                self.decode_unit(&unit.data, unit.timestamp_us)?;
            }
        }
        Ok(())
    }

    fn decode_unit(&mut self, data: &[u8], timestamp_us: u64) -> Result<(), PipelineError> {
        let DecoderSlot::Ready(decoder) = &mut self.slot else {
            return Ok(());
        };
        PipelineStats::bump(&self.stats.units_submitted);

        match decoder.decode(data) {
            Ok(Some(yuv)) => {
                let (width, height) = yuv.dimensions();
                let (y_stride, u_stride, _) = yuv.strides();
                let frame = Yuv420Frame {
                    y: Bytes::copy_from_slice(yuv.y()),
                    u: Bytes::copy_from_slice(yuv.u()),
                    v: Bytes::copy_from_slice(yuv.v()),
                    y_stride,
                    uv_stride: u_stride,
                    width: width as u32,
                    height: height as u32,
                    timestamp_us,
                };
                PipelineStats::bump(&self.stats.frames_decoded);
                self.base.submit(Payload::Yuv420(frame))
            }
            Ok(None) => Ok(()), // parameter sets, no picture yet
            Err(error) => {
                // Reference misses around losses are routine; skip the frame.
                tracing::warn!(%error, "software decode failed, skipping unit");
                PipelineStats::bump(&self.stats.frames_dropped);
                Ok(())
            }
        }
    }
}

impl MediaPipe for SoftwareDecodePipe {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.base.setup(config)?;
        if config.codec.family() != CodecFamily::H264 {
            return Err(PipelineError::Unsupported(
                "software decoder only handles H.264",
            ));
        }

        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let api = OpenH264API::from_source();
            let result = Decoder::with_api_config(api, DecoderConfig::new())
                .map_err(|e| e.to_string());
            let _ = tx.send(result);
        });
        self.slot = DecoderSlot::Loading(rx);
        tracing::info!(
            codec = config.codec.in_band_tag(),
            "software decoder loading"
        );
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        if self.cleaned {
            return Ok(());
        }
        let Payload::EncodedVideo(unit) = payload else {
            return self.base.submit(payload);
        };

        self.poll_slot();
        match &mut self.slot {
            DecoderSlot::Ready(_) => {
                self.drain_pending()?;
                self.decode_unit(&unit.data, unit.timestamp_us)
            }
            DecoderSlot::Loading(_) | DecoderSlot::Empty => {
                self.pending.push(Payload::EncodedVideo(unit))
            }
            DecoderSlot::Failed => {
                PipelineStats::bump(&self.stats.frames_dropped);
                Ok(())
            }
        }
    }

    fn tick(&mut self) {
        self.poll_slot();
        if matches!(self.slot, DecoderSlot::Ready(_)) {
            if let Err(error) = self.drain_pending() {
                tracing::warn!(%error, "draining parked units failed");
            }
        }
        self.base.tick();
    }

    fn poll_request_idr(&mut self) -> bool {
        self.base.poll_request_idr()
    }

    fn cleanup(&mut self) {
        self.slot = DecoderSlot::Empty;
        self.pending.clear();
        self.cleaned = true;
        self.base.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectSink;
    use farview_protocol::media::{FrameType, VideoUnit};
    use openh264::encoder::{Encoder, EncoderConfig};
    use openh264::formats::YUVBuffer;
    use std::time::Duration;

    /// Encode one solid frame, returning the full Annex-B bitstream
    /// (SPS + PPS + IDR for the first frame).
    fn encode_frame(width: usize, height: usize) -> Vec<u8> {
        let api = OpenH264API::from_source();
        let mut encoder = Encoder::with_api_config(api, EncoderConfig::new()).unwrap();
        let yuv = YUVBuffer::new(width, height);
        encoder.encode(&yuv).unwrap().to_vec()
    }

    async fn wait_until_ready(pipe: &mut SoftwareDecodePipe) {
        for _ in 0..200 {
            if pipe.is_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("software decoder never became ready");
    }

    #[tokio::test]
    async fn decodes_encoded_keyframe_at_source_resolution() {
        let (sink, seen) = CollectSink::new();
        let mut pipe =
            SoftwareDecodePipe::new(Box::new(sink), Arc::new(PipelineStats::new()));
        pipe.setup(&SetupConfig::default()).unwrap();
        wait_until_ready(&mut pipe).await;

        let bitstream = encode_frame(64, 64);
        pipe.submit(Payload::EncodedVideo(VideoUnit {
            frame_type: FrameType::Key,
            data: Bytes::from(bitstream),
            timestamp_us: 42,
            duration_us: 16_667,
        }))
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.yuv_timestamps, vec![42]);
    }

    #[tokio::test]
    async fn units_buffered_until_decoder_ready_then_drained_in_order() {
        let (sink, seen) = CollectSink::new();
        let mut pipe =
            SoftwareDecodePipe::new(Box::new(sink), Arc::new(PipelineStats::new()));
        pipe.setup(&SetupConfig::default()).unwrap();

        // Submit immediately; the loader may still be busy, in which case
        // these are parked rather than dropped.
        let bitstream = encode_frame(32, 32);
        pipe.submit(Payload::EncodedVideo(VideoUnit {
            frame_type: FrameType::Key,
            data: Bytes::from(bitstream),
            timestamp_us: 1,
            duration_us: 16_667,
        }))
        .unwrap();

        wait_until_ready(&mut pipe).await;
        pipe.tick(); // drains anything parked

        let seen = seen.lock().unwrap();
        assert_eq!(seen.yuv_timestamps, vec![1]);
    }

    #[tokio::test]
    async fn non_h264_codec_is_refused() {
        let (sink, _) = CollectSink::new();
        let mut pipe =
            SoftwareDecodePipe::new(Box::new(sink), Arc::new(PipelineStats::new()));
        let err = pipe
            .setup(&SetupConfig {
                codec: CodecId::Av1Main8,
                ..SetupConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Unsupported(_)));
    }

    #[test]
    fn capability_table_is_h264_only() {
        let info = software_decoder_info();
        let codecs = info.video_codecs.unwrap();
        assert_eq!(codecs.get(CodecId::H264Baseline), Support::Yes);
        assert_eq!(codecs.get(CodecId::H264High444), Support::No);
        assert_eq!(codecs.get(CodecId::HevcMain), Support::No);
        assert_eq!(codecs.get(CodecId::Av1Main8), Support::No);
    }
}
