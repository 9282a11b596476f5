//! Leaf sinks delivering decoded pixels to the embedder.
//!
//! Frames leave the pipeline over an unbounded channel, the embedder's
//! render loop being the consumer. In low-latency mode every submission is
//! delivered immediately; otherwise the sink holds the latest frame and
//! releases it on the next tick (the vsync-style callback), closing the
//! superseded frame first.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::PipelineError;
use crate::frame::{FrameHandle, RgbaFrame};
use crate::pipe::{MediaPipe, Payload, SetupConfig};
use crate::stats::PipelineStats;

/// What the embedder receives from a display chain.
#[derive(Debug)]
pub enum SinkEvent {
    /// A platform frame; the receiver owns it and must close it.
    Frame(FrameHandle),
    /// A tightly packed RGBA buffer for a pixel-put target.
    Rgba(RgbaFrame),
    /// Frame dimensions changed; resize the target surface.
    Resize { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrawMode {
    Immediate,
    Deferred,
}

/// Sink for decoded platform frames.
pub struct FrameSink {
    output: mpsc::UnboundedSender<SinkEvent>,
    mode: DrawMode,
    held: Option<FrameHandle>,
    target_size: Option<(u32, u32)>,
    cleaned: bool,
    stats: Arc<PipelineStats>,
}

impl FrameSink {
    pub fn new(output: mpsc::UnboundedSender<SinkEvent>, stats: Arc<PipelineStats>) -> Self {
        Self {
            output,
            mode: DrawMode::Immediate,
            held: None,
            target_size: None,
            cleaned: false,
            stats,
        }
    }

    fn track_size(&mut self, width: u32, height: u32) {
        if self.target_size != Some((width, height)) {
            self.target_size = Some((width, height));
            tracing::debug!(width, height, "sink target resized");
            let _ = self.output.send(SinkEvent::Resize { width, height });
        }
    }
}

impl MediaPipe for FrameSink {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.mode = if config.low_latency {
            DrawMode::Immediate
        } else {
            DrawMode::Deferred
        };
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        let Payload::Frame(frame) = payload else {
            return Err(PipelineError::Bitstream(format!(
                "frame sink expects platform frames, got {:?}",
                payload.kind()
            )));
        };
        if self.cleaned {
            drop(frame);
            return Ok(());
        }

        self.track_size(frame.display_width(), frame.display_height());

        match self.mode {
            DrawMode::Immediate => {
                let _ = self.output.send(SinkEvent::Frame(frame));
                PipelineStats::bump(&self.stats.frames_presented);
            }
            DrawMode::Deferred => {
                // Close the superseded frame before storing the new one.
                if let Some(mut previous) = self.held.take() {
                    previous.close();
                }
                self.held = Some(frame);
            }
        }
        Ok(())
    }

    fn tick(&mut self) {
        if let Some(frame) = self.held.take() {
            let _ = self.output.send(SinkEvent::Frame(frame));
            PipelineStats::bump(&self.stats.frames_presented);
        }
    }

    fn poll_request_idr(&mut self) -> bool {
        false
    }

    fn cleanup(&mut self) {
        if let Some(mut frame) = self.held.take() {
            frame.close();
        }
        self.cleaned = true;
    }
}

/// Sink for RGBA pixel buffers.
pub struct RgbaSink {
    output: mpsc::UnboundedSender<SinkEvent>,
    mode: DrawMode,
    held: Option<RgbaFrame>,
    target_size: Option<(u32, u32)>,
    cleaned: bool,
    stats: Arc<PipelineStats>,
}

impl RgbaSink {
    pub fn new(output: mpsc::UnboundedSender<SinkEvent>, stats: Arc<PipelineStats>) -> Self {
        Self {
            output,
            mode: DrawMode::Immediate,
            held: None,
            target_size: None,
            cleaned: false,
            stats,
        }
    }
}

impl MediaPipe for RgbaSink {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.mode = if config.low_latency {
            DrawMode::Immediate
        } else {
            DrawMode::Deferred
        };
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        let Payload::Rgba(frame) = payload else {
            return Err(PipelineError::Bitstream(format!(
                "rgba sink expects pixel buffers, got {:?}",
                payload.kind()
            )));
        };
        if self.cleaned {
            return Ok(());
        }

        if self.target_size != Some((frame.width, frame.height)) {
            self.target_size = Some((frame.width, frame.height));
            let _ = self.output.send(SinkEvent::Resize {
                width: frame.width,
                height: frame.height,
            });
        }

        match self.mode {
            DrawMode::Immediate => {
                let _ = self.output.send(SinkEvent::Rgba(frame));
                PipelineStats::bump(&self.stats.frames_presented);
            }
            DrawMode::Deferred => {
                self.held = Some(frame);
            }
        }
        Ok(())
    }

    fn tick(&mut self) {
        if let Some(frame) = self.held.take() {
            let _ = self.output.send(SinkEvent::Rgba(frame));
            PipelineStats::bump(&self.stats.frames_presented);
        }
    }

    fn poll_request_idr(&mut self) -> bool {
        false
    }

    fn cleanup(&mut self) {
        self.held = None;
        self.cleaned = true;
    }
}
