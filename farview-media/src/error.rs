//! Pipeline error taxonomy.

use thiserror::Error;

/// Errors raised by pipes and the pipeline builder.
///
/// `Unsupported` is recoverable at build time (the builder moves on to the
/// next candidate chain). The remaining kinds latch the raising pipe into an
/// errored state: it logs once, drops further submissions, and the failure
/// surfaces to the embedder as a notification. The pipeline does not attempt
/// to reconstruct itself.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The environment cannot offer a required primitive.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Setup could not negotiate a decoder or source buffer.
    #[error("configuration failed: {0}")]
    Configuration(String),

    /// A keyframe arrived without parameter sets and no description is
    /// cached, or the bitstream could not be sliced into NAL units.
    #[error("bitstream: {0}")]
    Bitstream(String),

    /// A decoder, source buffer, or codec call failed at runtime.
    #[error("resource: {0}")]
    Resource(String),
}

impl PipelineError {
    /// Whether the builder may recover by trying another chain.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::Unsupported(_))
    }
}
