//! Fragmented-MP4 emitter: the legacy fallback when no raw decoder exists.
//!
//! The emitter synthesizes an init segment (`ftyp + moov`) from the first
//! keyframe's parameter sets and one `moof + mdat` pair per unit, suitable
//! for appending to a media-source buffer. Timestamps use a microsecond
//! timescale, rebased so the first keyframe lands at zero, and are forced
//! strictly monotonic.

use std::sync::Arc;

use bytes::Bytes;
use farview_protocol::codec::{CodecFamily, CodecId};
use farview_protocol::media::VideoUnit;

use crate::byte_buffer::ByteWriter;
use crate::decoder_backend::DecoderConfig;
use crate::error::PipelineError;
use crate::pipe::{MediaPipe, Payload, Segment, SegmentKind, SetupConfig};
use crate::stats::PipelineStats;
use crate::translator::StreamTranslator;

/// Microseconds; keeps `tfdt` arithmetic lossless.
const TIMESCALE: u32 = 1_000_000;

/// Consecutive delta drops before a fresh IDR is requested.
const DROPS_BEFORE_IDR_REQUEST: u32 = 60;

const TRACK_ID: u32 = 1;

/// Writes init and media segments for a single video track.
pub struct Fmp4Writer {
    codec: CodecId,
    width: u32,
    height: u32,
    fps: u32,
    sequence_number: u32,
    base_time: Option<u64>,
    last_time: Option<u64>,
    shift: u64,
}

impl Fmp4Writer {
    pub fn new(codec: CodecId, width: u32, height: u32, fps: u32) -> Self {
        Self {
            codec,
            width,
            height,
            fps: fps.max(1),
            sequence_number: 1,
            base_time: None,
            last_time: None,
            shift: 0,
        }
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// `ftyp + moov` embedding the configuration record. Restarts sequence
    /// numbering and the timestamp rebase, as the segment opens a fresh
    /// source buffer downstream.
    pub fn init_segment(&mut self, description: &[u8]) -> Bytes {
        self.sequence_number = 1;
        self.base_time = None;
        self.last_time = None;
        self.shift = 0;

        let mut w = ByteWriter::with_capacity(1024 + description.len());

        let ftyp = w.open_box(b"ftyp");
        w.put_slice(b"isom");
        w.put_u32(0x200);
        for brand in [b"isom", b"iso6", b"avc1", b"mp41"] {
            w.put_slice(brand);
        }
        w.close_box(ftyp);

        let moov = w.open_box(b"moov");
        self.write_mvhd(&mut w);
        self.write_trak(&mut w, description);
        self.write_mvex(&mut w);
        w.close_box(moov);

        w.take()
    }

    /// One `moof + mdat` pair carrying a single length-prefixed sample.
    pub fn media_segment(
        &mut self,
        chunk: &[u8],
        key: bool,
        timestamp_us: u64,
        duration_us: u64,
    ) -> Bytes {
        let decode_time = self.rebase(timestamp_us);
        let duration = if duration_us > 0 {
            duration_us
        } else {
            (TIMESCALE as u64) / self.fps as u64
        };

        let mut w = ByteWriter::with_capacity(160 + chunk.len());

        let moof = w.open_box(b"moof");

        let mfhd = w.open_full_box(b"mfhd", 0, 0);
        w.put_u32(self.sequence_number);
        w.close_box(mfhd);

        let traf = w.open_box(b"traf");

        // default-base-is-moof
        let tfhd = w.open_full_box(b"tfhd", 0, 0x020000);
        w.put_u32(TRACK_ID);
        w.close_box(tfhd);

        let tfdt = w.open_full_box(b"tfdt", 1, 0);
        w.put_u64(decode_time);
        w.close_box(tfdt);

        // data-offset + per-sample duration, size, flags
        let trun = w.open_full_box(b"trun", 0, 0x000701);
        w.put_u32(1); // sample_count
        let data_offset_pos = w.placeholder_u32();
        w.put_u32(duration as u32);
        w.put_u32(chunk.len() as u32);
        w.put_u32(if key { 0x0200_0000 } else { 0x0101_0000 });
        w.close_box(trun);

        w.close_box(traf);
        w.close_box(moof);

        let mdat_start = w.len();
        let mdat = w.open_box(b"mdat");
        w.put_slice(chunk);
        w.close_box(mdat);

        w.patch_u32(data_offset_pos, (mdat_start + 8) as u32);

        self.sequence_number += 1;
        w.take()
    }

    /// Shift timestamps so the first sample decodes at zero and enforce
    /// strict monotonicity: a sample that fails to advance is nudged one
    /// frame interval past its predecessor, and the nudge carries forward.
    fn rebase(&mut self, timestamp_us: u64) -> u64 {
        let base = *self.base_time.get_or_insert(timestamp_us);
        let relative = timestamp_us.saturating_sub(base);
        let step = (TIMESCALE as u64) / self.fps as u64;

        let mut decode_time = relative + self.shift;
        if let Some(last) = self.last_time {
            if decode_time <= last {
                decode_time = last + step;
                self.shift += step;
            }
        }
        self.last_time = Some(decode_time);
        decode_time
    }

    fn write_mvhd(&self, w: &mut ByteWriter) {
        let mvhd = w.open_full_box(b"mvhd", 0, 0);
        w.put_u32(0); // creation time
        w.put_u32(0); // modification time
        w.put_u32(TIMESCALE);
        w.put_u32(0); // duration unknown (live)
        w.put_u32(0x0001_0000); // rate 1.0
        w.put_u16(0x0100); // volume 1.0
        w.put_zeros(10);
        self.write_matrix(w);
        w.put_zeros(24); // pre_defined
        w.put_u32(TRACK_ID + 1); // next_track_id
        w.close_box(mvhd);
    }

    fn write_matrix(&self, w: &mut ByteWriter) {
        for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            w.put_u32(value);
        }
    }

    fn write_trak(&self, w: &mut ByteWriter, description: &[u8]) {
        let trak = w.open_box(b"trak");

        // track enabled + in movie
        let tkhd = w.open_full_box(b"tkhd", 0, 0x000003);
        w.put_u32(0);
        w.put_u32(0);
        w.put_u32(TRACK_ID);
        w.put_u32(0); // reserved
        w.put_u32(0); // duration
        w.put_zeros(8);
        w.put_u16(0); // layer
        w.put_u16(0); // alternate group
        w.put_u16(0); // volume (video)
        w.put_u16(0);
        self.write_matrix(w);
        w.put_u32(self.width << 16);
        w.put_u32(self.height << 16);
        w.close_box(tkhd);

        let mdia = w.open_box(b"mdia");

        let mdhd = w.open_full_box(b"mdhd", 0, 0);
        w.put_u32(0);
        w.put_u32(0);
        w.put_u32(TIMESCALE);
        w.put_u32(0);
        w.put_u16(0x55C4); // language "und"
        w.put_u16(0);
        w.close_box(mdhd);

        let hdlr = w.open_full_box(b"hdlr", 0, 0);
        w.put_u32(0);
        w.put_slice(b"vide");
        w.put_zeros(12);
        w.put_str("VideoHandler\0");
        w.close_box(hdlr);

        let minf = w.open_box(b"minf");

        let vmhd = w.open_full_box(b"vmhd", 0, 1);
        w.put_u16(0); // graphics mode
        w.put_zeros(6); // opcolor
        w.close_box(vmhd);

        let dinf = w.open_box(b"dinf");
        let dref = w.open_full_box(b"dref", 0, 0);
        w.put_u32(1);
        let url = w.open_full_box(b"url ", 0, 1); // self-contained
        w.close_box(url);
        w.close_box(dref);
        w.close_box(dinf);

        self.write_stbl(w, description);

        w.close_box(minf);
        w.close_box(mdia);
        w.close_box(trak);
    }

    fn write_stbl(&self, w: &mut ByteWriter, description: &[u8]) {
        let stbl = w.open_box(b"stbl");

        let stsd = w.open_full_box(b"stsd", 0, 0);
        w.put_u32(1);
        self.write_sample_entry(w, description);
        w.close_box(stsd);

        for fourcc in [b"stts", b"stsc"] {
            let empty = w.open_full_box(fourcc, 0, 0);
            w.put_u32(0);
            w.close_box(empty);
        }
        let stsz = w.open_full_box(b"stsz", 0, 0);
        w.put_u32(0); // sample_size
        w.put_u32(0); // sample_count
        w.close_box(stsz);
        let stco = w.open_full_box(b"stco", 0, 0);
        w.put_u32(0);
        w.close_box(stco);

        w.close_box(stbl);
    }

    fn write_mvex(&self, w: &mut ByteWriter) {
        let mvex = w.open_box(b"mvex");
        let trex = w.open_full_box(b"trex", 0, 0);
        w.put_u32(TRACK_ID);
        w.put_u32(1); // default_sample_description_index
        w.put_u32(0); // default_sample_duration
        w.put_u32(0); // default_sample_size
        w.put_u32(0); // default_sample_flags
        w.close_box(trex);
        w.close_box(mvex);
    }

    fn write_sample_entry(&self, w: &mut ByteWriter, description: &[u8]) {
        let (entry, config_box): (&[u8; 4], &[u8; 4]) = match self.codec.family() {
            CodecFamily::Hevc => (b"hvc1", b"hvcC"),
            _ => (b"avc1", b"avcC"),
        };

        let sample = w.open_box(entry);
        w.put_zeros(6); // reserved
        w.put_u16(1); // data_reference_index
        w.put_u16(0); // pre_defined
        w.put_u16(0); // reserved
        w.put_zeros(12); // pre_defined
        w.put_u16(self.width as u16);
        w.put_u16(self.height as u16);
        w.put_u32(0x0048_0000); // 72 dpi horizontal
        w.put_u32(0x0048_0000); // 72 dpi vertical
        w.put_u32(0);
        w.put_u16(1); // frame_count

        let mut compressor = [0u8; 32];
        let name = b"farview";
        compressor[0] = name.len() as u8;
        compressor[1..1 + name.len()].copy_from_slice(name);
        w.put_slice(&compressor);

        w.put_u16(0x0018); // depth
        w.put_u16(0xFFFF); // pre_defined = -1

        let config = w.open_box(config_box);
        w.put_slice(description);
        w.close_box(config);

        w.close_box(sample);
    }
}

/// Pipe that remuxes encoded units into fragmented-MP4 segments.
///
/// Owns a translator for chunking and description synthesis; emits an init
/// segment whenever the translator reconfigures and one media segment per
/// decodable unit. Delta units arriving while a keyframe is owed are
/// dropped, and a run of drops raises an IDR request.
pub struct Fmp4Pipe {
    base: Box<dyn MediaPipe>,
    translator: Option<StreamTranslator>,
    writer: Option<Fmp4Writer>,
    awaiting_key: bool,
    consecutive_drops: u32,
    /// True between raising an IDR request and the next keyframe; suppresses
    /// repeat requests while one is outstanding.
    idr_latched: bool,
    /// Request raised but not yet observed via `poll_request_idr`.
    idr_pending: bool,
    cleaned: bool,
    stats: Arc<PipelineStats>,
}

impl Fmp4Pipe {
    pub fn new(base: Box<dyn MediaPipe>, stats: Arc<PipelineStats>) -> Self {
        Self {
            base,
            translator: None,
            writer: None,
            awaiting_key: true,
            consecutive_drops: 0,
            idr_latched: false,
            idr_pending: false,
            cleaned: false,
            stats,
        }
    }

    fn drop_unit(&mut self) {
        self.consecutive_drops += 1;
        if self.consecutive_drops >= DROPS_BEFORE_IDR_REQUEST && !self.idr_latched {
            tracing::warn!(
                drops = self.consecutive_drops,
                "dropped too many delta units awaiting a keyframe; requesting IDR"
            );
            self.idr_latched = true;
            self.idr_pending = true;
        }
    }
}

impl MediaPipe for Fmp4Pipe {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.base.setup(config)?;
        let decoder_config =
            DecoderConfig::out_of_band(config.codec, config.width, config.height);
        self.translator = Some(StreamTranslator::new(decoder_config));
        self.writer = Some(Fmp4Writer::new(
            config.codec,
            config.width,
            config.height,
            config.fps,
        ));
        tracing::info!(
            codec = config.codec.out_of_band_tag(),
            width = config.width,
            height = config.height,
            "fmp4 remux pipe configured"
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
        let (Some(translator), Some(writer)) = (self.translator.as_mut(), self.writer.as_mut())
        else {
            return Err(PipelineError::Configuration(
                "fmp4 pipe used before setup".into(),
            ));
        };

        if unit.is_key() {
            self.awaiting_key = false;
            self.consecutive_drops = 0;
            self.idr_latched = false;
            self.idr_pending = false;
        } else if self.awaiting_key {
            self.drop_unit();
            return Ok(());
        }

        let out = translator.submit_unit(&unit)?;
        let Some(chunk) = out.chunk else {
            self.drop_unit();
            return Ok(());
        };

        if let Some(config) = out.configure {
            let description = config
                .description
                .as_ref()
                .expect("reconfigure always carries a description");
            let init = writer.init_segment(description);
            self.base.submit(Payload::Segment(Segment {
                kind: SegmentKind::Init,
                data: init,
                codec_tag: config.tag.clone(),
            }))?;
            PipelineStats::bump(&self.stats.segments_emitted);
        }

        if chunk.is_empty() {
            // Parameter sets only; nothing to put in an mdat.
            return Ok(());
        }

        let tag = translator.config().tag.clone();
        let media = writer.media_segment(
            &chunk,
            unit.is_key(),
            unit.timestamp_us,
            unit.duration_us,
        );
        self.base.submit(Payload::Segment(Segment {
            kind: SegmentKind::Media,
            data: media,
            codec_tag: tag,
        }))?;
        PipelineStats::bump(&self.stats.segments_emitted);
        Ok(())
    }

    fn tick(&mut self) {
        self.base.tick();
    }

    fn poll_request_idr(&mut self) -> bool {
        let mine = std::mem::take(&mut self.idr_pending);
        self.base.poll_request_idr() || mine
    }

    fn cleanup(&mut self) {
        if let Some(translator) = self.translator.as_mut() {
            translator.close();
        }
        self.cleaned = true;
        self.base.cleanup();
    }
}
