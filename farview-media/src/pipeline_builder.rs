//! Automatic pipeline construction.
//!
//! A fixed preference-ordered table lists every candidate chain. The
//! builder queries each link's static capability info, intersects codec
//! support with the requested set, and instantiates the first chain whose
//! every link is supported — renderer first, then each stage bound to the
//! pipe below it. Ties break positionally: earlier in the table wins.

use std::sync::Arc;

use farview_protocol::codec::CodecId;
use tokio::sync::mpsc;

use crate::color_convert::ColorConvertPipe;
use crate::decode_pipe::DecodePipe;
use crate::decoder_backend::DecoderFactory;
use crate::error::PipelineError;
use crate::fmp4::Fmp4Pipe;
use crate::frame_sink::{FrameSink, RgbaSink, SinkEvent};
#[cfg(feature = "gpu")]
use crate::gpu_renderer::{GpuContext, GpuYuvSink, RenderTargetFactory};
use crate::media_source::{MediaSourceSink, SourceBufferFactory};
use crate::pipe::{CodecSupport, MediaPipe, PayloadKind, PipeInfo, Support};
#[cfg(feature = "software-decoder")]
use crate::software_decoder::{software_decoder_info, SoftwareDecodePipe};
use crate::stats::PipelineStats;
use crate::worker_pipe::WorkerPipe;

/// What the assembled chain ultimately produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Decoded pixels presented on a surface.
    Surface,
    /// Fragmented-MP4 segments handed to a source buffer.
    Segments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    HardwareDecode,
    SoftwareDecode,
    ColorConvert,
    Fmp4Remux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    Frame,
    Gpu,
    Rgba,
    MediaSource,
}

/// One candidate chain, entry stage first, renderer last.
#[derive(Debug)]
pub struct ChainSpec {
    pub name: &'static str,
    pub outputs: &'static [OutputKind],
    pub stages: &'static [StageKind],
    pub renderer: RendererKind,
}

/// Preference-ordered candidate table; immutable process-wide data.
pub const CHAINS: &[ChainSpec] = &[
    ChainSpec {
        name: "hardware-frame",
        outputs: &[OutputKind::Surface],
        stages: &[StageKind::HardwareDecode],
        renderer: RendererKind::Frame,
    },
    ChainSpec {
        name: "software-gpu",
        outputs: &[OutputKind::Surface],
        stages: &[StageKind::SoftwareDecode],
        renderer: RendererKind::Gpu,
    },
    ChainSpec {
        name: "software-rgba",
        outputs: &[OutputKind::Surface],
        stages: &[StageKind::SoftwareDecode, StageKind::ColorConvert],
        renderer: RendererKind::Rgba,
    },
    ChainSpec {
        name: "media-source",
        outputs: &[OutputKind::Surface, OutputKind::Segments],
        stages: &[StageKind::Fmp4Remux],
        renderer: RendererKind::MediaSource,
    },
];

/// Decoder identities for which specific codecs are refused despite
/// positive capability reports. An explicit policy knob, not a silent deny.
#[derive(Debug, Clone)]
pub struct DenyList {
    entries: Vec<(String, CodecId)>,
}

/// Decoders with broken high-4:4:4 support despite advertising it.
const DEFAULT_HIGH444_DENY: [&str; 2] = ["legacy-dxva", "broadwell-vaapi"];

impl Default for DenyList {
    fn default() -> Self {
        Self {
            entries: DEFAULT_HIGH444_DENY
                .iter()
                .map(|id| (id.to_string(), CodecId::H264High444))
                .collect(),
        }
    }
}

impl DenyList {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn deny(&mut self, identity: &str, codec: CodecId) {
        self.entries.push((identity.to_string(), codec));
    }

    pub fn is_denied(&self, identity: &str, codec: CodecId) -> bool {
        self.entries
            .iter()
            .any(|(id, c)| id == identity && *c == codec)
    }
}

/// Host facilities the builder probes against.
#[derive(Default)]
pub struct Environment {
    /// Platform decoder supplied by the embedder, if any.
    pub decoder_factory: Option<Arc<dyn DecoderFactory>>,
    /// Media-source buffers for the remux fallback.
    pub source_buffers: Option<Arc<dyn SourceBufferFactory>>,
    /// Delivery channel for frame/rgba sinks.
    pub frame_output: Option<mpsc::UnboundedSender<SinkEvent>>,
    #[cfg(feature = "gpu")]
    pub gpu: Option<GpuContext>,
    #[cfg(feature = "gpu")]
    pub render_targets: Option<Arc<dyn RenderTargetFactory>>,
    pub deny_list: DenyList,
}

/// What the caller wants built. Stream parameters (dimensions, frame rate,
/// latency mode) travel separately in the `SetupConfig` passed to `setup`.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub output: OutputKind,
    /// Codec preference set; empty means everything.
    pub codecs: Vec<CodecId>,
    /// Restrict candidates to chains ending in this renderer.
    pub force_renderer: Option<RendererKind>,
    /// Move the whole chain onto a background task.
    pub offload: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            output: OutputKind::Surface,
            codecs: Vec::new(),
            force_renderer: None,
            offload: false,
        }
    }
}

/// A constructed (not yet set-up) chain.
pub struct BuiltPipeline {
    pub pipe: Box<dyn MediaPipe>,
    pub chain: &'static str,
    /// Codecs every link in the chain accepted (`Maybe` included; those
    /// commit only after setup).
    pub codecs: Vec<CodecId>,
    pub stats: Arc<PipelineStats>,
}

fn stage_kinds(stage: StageKind) -> (PayloadKind, PayloadKind) {
    match stage {
        StageKind::HardwareDecode => (PayloadKind::EncodedVideo, PayloadKind::Frame),
        StageKind::SoftwareDecode => (PayloadKind::EncodedVideo, PayloadKind::Yuv420),
        StageKind::ColorConvert => (PayloadKind::Yuv420, PayloadKind::Rgba),
        StageKind::Fmp4Remux => (PayloadKind::EncodedVideo, PayloadKind::Segment),
    }
}

fn renderer_input(renderer: RendererKind) -> PayloadKind {
    match renderer {
        RendererKind::Frame => PayloadKind::Frame,
        RendererKind::Gpu => PayloadKind::Yuv420,
        RendererKind::Rgba => PayloadKind::Rgba,
        RendererKind::MediaSource => PayloadKind::Segment,
    }
}

/// Verify the chain's payload kinds line up end to end.
fn kinds_compose(chain: &ChainSpec) -> bool {
    let mut upstream = PayloadKind::EncodedVideo;
    for &stage in chain.stages {
        let (input, output) = stage_kinds(stage);
        if input != upstream {
            return false;
        }
        upstream = output;
    }
    renderer_input(chain.renderer) == upstream
}

fn stage_info(stage: StageKind, env: &Environment) -> PipeInfo {
    match stage {
        StageKind::HardwareDecode => match &env.decoder_factory {
            Some(factory) => PipeInfo {
                environment_supported: true,
                video_codecs: Some(CodecSupport::from_fn(|codec| {
                    if env.deny_list.is_denied(factory.identity(), codec) {
                        Support::No
                    } else {
                        factory.supported(codec)
                    }
                })),
            },
            None => PipeInfo::unsupported(),
        },
        StageKind::SoftwareDecode => {
            #[cfg(feature = "software-decoder")]
            {
                software_decoder_info()
            }
            #[cfg(not(feature = "software-decoder"))]
            {
                PipeInfo::unsupported()
            }
        }
        StageKind::ColorConvert => PipeInfo::pass_through(),
        StageKind::Fmp4Remux => PipeInfo {
            environment_supported: env.source_buffers.is_some(),
            video_codecs: Some(CodecSupport::from_fn(|codec| {
                use farview_protocol::codec::CodecFamily;
                match codec.family() {
                    CodecFamily::H264 => Support::Yes,
                    // Whether the source buffer accepts hvc1 depends on the
                    // host; only setup can tell.
                    CodecFamily::Hevc => Support::Maybe,
                    CodecFamily::Av1 => Support::No,
                }
            })),
        },
    }
}

fn renderer_info(renderer: RendererKind, env: &Environment) -> PipeInfo {
    let supported = match renderer {
        RendererKind::Frame | RendererKind::Rgba => env.frame_output.is_some(),
        RendererKind::Gpu => {
            #[cfg(feature = "gpu")]
            {
                env.gpu.is_some() && env.render_targets.is_some()
            }
            #[cfg(not(feature = "gpu"))]
            {
                false
            }
        }
        RendererKind::MediaSource => env.source_buffers.is_some(),
    };
    PipeInfo {
        environment_supported: supported,
        video_codecs: None,
    }
}

fn build_renderer(
    renderer: RendererKind,
    env: &Environment,
    stats: &Arc<PipelineStats>,
) -> Result<Box<dyn MediaPipe>, PipelineError> {
    match renderer {
        RendererKind::Frame => {
            let output = env
                .frame_output
                .clone()
                .ok_or(PipelineError::Unsupported("no frame output channel"))?;
            Ok(Box::new(FrameSink::new(output, Arc::clone(stats))))
        }
        RendererKind::Rgba => {
            let output = env
                .frame_output
                .clone()
                .ok_or(PipelineError::Unsupported("no frame output channel"))?;
            Ok(Box::new(RgbaSink::new(output, Arc::clone(stats))))
        }
        RendererKind::Gpu => {
            #[cfg(feature = "gpu")]
            {
                let context = env
                    .gpu
                    .as_ref()
                    .ok_or(PipelineError::Unsupported("no gpu context"))?;
                let targets = env
                    .render_targets
                    .as_ref()
                    .ok_or(PipelineError::Unsupported("no render target factory"))?;
                let target = targets.create()?;
                Ok(Box::new(GpuYuvSink::new(context, target, Arc::clone(stats))))
            }
            #[cfg(not(feature = "gpu"))]
            {
                Err(PipelineError::Unsupported("gpu renderer not compiled in"))
            }
        }
        RendererKind::MediaSource => {
            let factory = env
                .source_buffers
                .clone()
                .ok_or(PipelineError::Unsupported("no source buffer factory"))?;
            Ok(Box::new(MediaSourceSink::new(factory)))
        }
    }
}

fn build_stage(
    stage: StageKind,
    base: Box<dyn MediaPipe>,
    env: &Environment,
    stats: &Arc<PipelineStats>,
) -> Result<Box<dyn MediaPipe>, PipelineError> {
    match stage {
        StageKind::HardwareDecode => {
            let factory = env
                .decoder_factory
                .clone()
                .ok_or(PipelineError::Unsupported("no decoder factory"))?;
            Ok(Box::new(DecodePipe::new(base, factory, Arc::clone(stats))))
        }
        StageKind::SoftwareDecode => {
            #[cfg(feature = "software-decoder")]
            {
                Ok(Box::new(SoftwareDecodePipe::new(base, Arc::clone(stats))))
            }
            #[cfg(not(feature = "software-decoder"))]
            {
                let _ = base;
                Err(PipelineError::Unsupported(
                    "software decoder not compiled in",
                ))
            }
        }
        StageKind::ColorConvert => Ok(Box::new(ColorConvertPipe::new(base))),
        StageKind::Fmp4Remux => Ok(Box::new(Fmp4Pipe::new(base, Arc::clone(stats)))),
    }
}

fn build_chain(
    chain: &ChainSpec,
    env: &Environment,
    stats: &Arc<PipelineStats>,
) -> Result<Box<dyn MediaPipe>, PipelineError> {
    let mut pipe = build_renderer(chain.renderer, env, stats)?;
    for &stage in chain.stages.iter().rev() {
        pipe = build_stage(stage, pipe, env, stats)?;
    }
    Ok(pipe)
}

/// Select and construct the first fully supported chain.
///
/// Deterministic: fixed capability answers and codec preferences always
/// produce the same chain. Setup is the caller's next step.
pub fn build_pipeline(
    env: &Environment,
    request: &BuildRequest,
) -> Result<BuiltPipeline, PipelineError> {
    let preference: Vec<CodecId> = if request.codecs.is_empty() {
        farview_protocol::codec::ALL_CODECS.to_vec()
    } else {
        request.codecs.clone()
    };

    for chain in CHAINS {
        if !chain.outputs.contains(&request.output) {
            continue;
        }
        if let Some(forced) = request.force_renderer {
            if chain.renderer != forced {
                continue;
            }
        }
        if !kinds_compose(chain) {
            tracing::error!(chain = chain.name, "candidate chain kinds do not compose");
            continue;
        }

        let mut codecs = preference.clone();
        let mut supported = true;
        for &stage in chain.stages {
            let info = stage_info(stage, env);
            if !info.environment_supported {
                supported = false;
                break;
            }
            if let Some(mask) = info.video_codecs {
                codecs.retain(|&codec| mask.get(codec) != Support::No);
            }
        }
        if !supported {
            tracing::debug!(chain = chain.name, "chain unsupported in this environment");
            continue;
        }
        if !renderer_info(chain.renderer, env).environment_supported {
            tracing::debug!(chain = chain.name, "renderer unsupported in this environment");
            continue;
        }
        if codecs.is_empty() {
            tracing::debug!(chain = chain.name, "no requested codec survives the chain");
            continue;
        }

        // Instantiate bottom-up: renderer first, then stages in reverse.
        let stats = Arc::new(PipelineStats::new());
        let pipe = match build_chain(chain, env, &stats) {
            Ok(pipe) => pipe,
            Err(error) => {
                tracing::warn!(chain = chain.name, %error, "chain construction failed");
                continue;
            }
        };

        let pipe = if request.offload {
            Box::new(WorkerPipe::spawn(pipe))
        } else {
            pipe
        };

        tracing::info!(
            chain = chain.name,
            codecs = ?codecs.iter().map(|c| c.in_band_tag()).collect::<Vec<_>>(),
            offload = request.offload,
            "pipeline selected"
        );
        return Ok(BuiltPipeline {
            pipe,
            chain: chain.name,
            codecs,
            stats,
        });
    }

    Err(PipelineError::Unsupported(
        "no candidate chain is supported in this environment",
    ))
}
