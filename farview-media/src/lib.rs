//! Client-side media pipeline: encoded unit → decode → color convert → sink.
//!
//! The pipeline is a chain of [`pipe::MediaPipe`] values, each forwarding to
//! the pipe below it (the leaf is a renderer or segment sink). A chain is
//! assembled by [`pipeline_builder::build_pipeline`] from a fixed
//! preference-ordered candidate table, keeping only chains every link of
//! which is supported in the current environment.

pub mod annex_b;
pub mod audio_pipe;
pub mod byte_buffer;
pub mod color_convert;
pub mod decode_pipe;
pub mod decoder_backend;
pub mod error;
pub mod fmp4;
pub mod frame;
pub mod frame_sink;
#[cfg(feature = "gpu")]
pub mod gpu_renderer;
pub mod media_source;
pub mod opus_decoder;
pub mod pipe;
pub mod pipeline_builder;
pub mod scratch_pool;
#[cfg(feature = "software-decoder")]
pub mod software_decoder;
pub mod stats;
pub mod testing;
pub mod translator;
pub mod worker_pipe;
