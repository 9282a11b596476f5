//! End-to-end decode chains against scripted decoder backends.

use std::sync::Arc;

use farview_media::frame_sink::SinkEvent;
use farview_media::pipe::{MediaPipe, Payload, SetupConfig};
use farview_media::pipeline_builder::{build_pipeline, BuildRequest, Environment};
use farview_media::stats::PipelineStats;
use farview_media::testing::{
    h264_delta_unit, h264_key_unit, hevc_key_unit, MockDecoderFactory,
};
use farview_protocol::codec::CodecId;
use tokio::sync::mpsc;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn surface_env(
    factory: MockDecoderFactory,
) -> (Environment, mpsc::UnboundedReceiver<SinkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let env = Environment {
        decoder_factory: Some(Arc::new(factory)),
        frame_output: Some(tx),
        ..Environment::default()
    };
    (env, rx)
}

fn drain_frames(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Vec<(u32, u32, u64)> {
    let mut frames = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SinkEvent::Frame(mut frame) = event {
            frames.push((
                frame.display_width(),
                frame.display_height(),
                frame.timestamp_us(),
            ));
            frame.close();
        }
    }
    frames
}

#[test]
fn twenty_frame_h264_sequence_decodes_at_source_resolution() {
    init_test_tracing();

    // Only the out-of-band profile is accepted, forcing the translator path.
    let (env, mut rx) = surface_env(MockDecoderFactory::out_of_band_only());
    let built = build_pipeline(
        &env,
        &BuildRequest {
            codecs: vec![CodecId::H264Baseline],
            ..BuildRequest::default()
        },
    )
    .unwrap();
    assert_eq!(built.chain, "hardware-frame");
    let stats = Arc::clone(&built.stats);

    let mut pipe = built.pipe;
    pipe.setup(&SetupConfig {
        codec: CodecId::H264Baseline,
        width: 1920,
        height: 1080,
        fps: 60,
        low_latency: true,
        audio: None,
    })
    .unwrap();

    pipe.submit(Payload::EncodedVideo(h264_key_unit(0))).unwrap();
    for i in 1..20u64 {
        pipe.submit(Payload::EncodedVideo(h264_delta_unit(i * 16_667)))
            .unwrap();
    }

    let frames = drain_frames(&mut rx);
    assert_eq!(frames.len(), 20);
    for (width, height, _) in &frames {
        assert_eq!((*width, *height), (1920, 1080));
    }
    // Decode order survives the chain.
    let timestamps: Vec<u64> = frames.iter().map(|f| f.2).collect();
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);

    assert_eq!(PipelineStats::get(&stats.frames_decoded), 20);
    assert_eq!(PipelineStats::get(&stats.frames_presented), 20);

    pipe.cleanup();
}

#[test]
fn hevc_keyframe_without_vps_recovers_after_idr_request() {
    init_test_tracing();

    let (env, mut rx) = surface_env(MockDecoderFactory::out_of_band_only());
    let built = build_pipeline(
        &env,
        &BuildRequest {
            codecs: vec![CodecId::HevcMain],
            ..BuildRequest::default()
        },
    )
    .unwrap();

    let mut pipe = built.pipe;
    pipe.setup(&SetupConfig {
        codec: CodecId::HevcMain,
        ..SetupConfig::default()
    })
    .unwrap();

    // Keyframe missing its VPS: no description can be synthesized, the
    // unit is dropped, and exactly one IDR request is raised.
    pipe.submit(Payload::EncodedVideo(hevc_key_unit(0, false)))
        .unwrap();
    assert!(drain_frames(&mut rx).is_empty());
    assert!(pipe.poll_request_idr());
    assert!(!pipe.poll_request_idr(), "request is latched, not repeated");

    // The next keyframe carries VPS/SPS/PPS and decodes.
    pipe.submit(Payload::EncodedVideo(hevc_key_unit(33_334, true)))
        .unwrap();
    let frames = drain_frames(&mut rx);
    assert_eq!(frames.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn offloaded_chain_still_delivers_frames_in_order() {
    init_test_tracing();

    let (env, mut rx) = surface_env(MockDecoderFactory::default());
    let built = build_pipeline(
        &env,
        &BuildRequest {
            codecs: vec![CodecId::H264Baseline],
            offload: true,
            ..BuildRequest::default()
        },
    )
    .unwrap();

    let mut pipe = built.pipe;
    pipe.setup(&SetupConfig::default()).unwrap();
    pipe.submit(Payload::EncodedVideo(h264_key_unit(0))).unwrap();
    for i in 1..10u64 {
        pipe.submit(Payload::EncodedVideo(h264_delta_unit(i * 16_667)))
            .unwrap();
    }

    // The offloaded chain drains asynchronously.
    let mut frames = Vec::new();
    for _ in 0..100 {
        frames.extend(drain_frames(&mut rx));
        if frames.len() >= 10 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(frames.len(), 10);
    let timestamps: Vec<u64> = frames.iter().map(|f| f.2).collect();
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted, "ordering preserved across the boundary");

    pipe.cleanup();
}
