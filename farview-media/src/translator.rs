//! Annex-B → length-prefixed stream translator.
//!
//! Hardware decoders configured for the out-of-band profile expect
//! length-prefixed NAL units plus an AVCC/HVCC configuration record, while
//! the transport delivers Annex-B with in-band parameter sets. The
//! translator rewrites each unit, captures SPS/PPS (and VPS for H.265) from
//! keyframes, and synthesizes a fresh record whenever a complete set has
//! been observed — at which point the decoder must be reconfigured before
//! the accompanying chunk is submitted.

use bytes::Bytes;
use farview_protocol::codec::{avc1_tag, CodecFamily};
use farview_protocol::media::VideoUnit;

use crate::annex_b::{h264, hevc, nal_type, NalUnits};
use crate::byte_buffer::ByteWriter;
use crate::decoder_backend::DecoderConfig;
use crate::error::PipelineError;

/// Result of translating one unit.
#[derive(Debug)]
pub struct TranslateOutput {
    /// Present when a complete parameter set was consumed: the decoder must
    /// be reset and reconfigured with this before submitting the chunk.
    pub configure: Option<DecoderConfig>,
    /// Length-prefixed chunk, `None` when the unit was skipped (delta before
    /// any description exists). A parameter-set-only unit yields an empty
    /// chunk alongside `configure`.
    pub chunk: Option<Bytes>,
}

/// Keyframe-synchronous translator state.
///
/// `has_description` latches after the first successful reconfigure and
/// never reverts; pending parameter sets are cleared on consumption.
pub struct StreamTranslator {
    config: DecoderConfig,
    has_description: bool,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    vps: Option<Bytes>,
    chunk: ByteWriter,
    closed: bool,
}

impl StreamTranslator {
    pub fn new(config: DecoderConfig) -> Self {
        debug_assert!(
            config.codec.family() != CodecFamily::Av1,
            "AV1 streams are not translated"
        );
        Self {
            config,
            has_description: false,
            sps: None,
            pps: None,
            vps: None,
            chunk: ByteWriter::new(),
            closed: false,
        }
    }

    pub fn has_description(&self) -> bool {
        self.has_description
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Refuse further state mutation; called from pipe cleanup.
    pub fn close(&mut self) {
        self.closed = true;
        self.sps = None;
        self.pps = None;
        self.vps = None;
    }

    /// Translate one encoded unit.
    pub fn submit_unit(&mut self, unit: &VideoUnit) -> Result<TranslateOutput, PipelineError> {
        if self.closed {
            return Err(PipelineError::Resource("translator is closed".into()));
        }

        // Delta units are useless until the decoder holds a description.
        if !unit.is_key() && !self.has_description {
            return Ok(TranslateOutput {
                configure: None,
                chunk: None,
            });
        }

        let family = self.config.codec.family();
        self.chunk.clear();

        for nal in NalUnits::new(&unit.data) {
            match (family, nal_type(family, nal)) {
                (CodecFamily::H264, Some(h264::SPS)) => {
                    self.sps = Some(Bytes::copy_from_slice(nal));
                }
                (CodecFamily::H264, Some(h264::PPS)) => {
                    self.pps = Some(Bytes::copy_from_slice(nal));
                }
                (CodecFamily::Hevc, Some(hevc::VPS)) => {
                    self.vps = Some(Bytes::copy_from_slice(nal));
                }
                (CodecFamily::Hevc, Some(hevc::SPS)) => {
                    self.sps = Some(Bytes::copy_from_slice(nal));
                }
                (CodecFamily::Hevc, Some(hevc::PPS)) => {
                    self.pps = Some(Bytes::copy_from_slice(nal));
                }
                _ => {
                    self.chunk.put_u32(nal.len() as u32);
                    self.chunk.put_slice(nal);
                }
            }
        }

        let configure = if self.sets_complete(family) {
            Some(self.consume_parameter_sets(family)?)
        } else {
            None
        };

        if configure.is_none() && unit.is_key() && !self.has_description {
            tracing::error!(
                codec = %self.config.tag,
                timestamp_us = unit.timestamp_us,
                "keyframe without parameter sets and no cached description; \
                 forwarding chunk anyway"
            );
        }

        Ok(TranslateOutput {
            configure,
            chunk: Some(self.chunk.take()),
        })
    }

    fn sets_complete(&self, family: CodecFamily) -> bool {
        match family {
            CodecFamily::H264 => self.sps.is_some() && self.pps.is_some(),
            CodecFamily::Hevc => {
                self.vps.is_some() && self.sps.is_some() && self.pps.is_some()
            }
            CodecFamily::Av1 => false,
        }
    }

    /// Build a fresh description from the buffered sets and clear them.
    fn consume_parameter_sets(
        &mut self,
        family: CodecFamily,
    ) -> Result<DecoderConfig, PipelineError> {
        let description = match family {
            CodecFamily::H264 => {
                let sps = self.sps.take().expect("checked by sets_complete");
                let pps = self.pps.take().expect("checked by sets_complete");
                if sps.len() < 4 {
                    return Err(PipelineError::Bitstream(format!(
                        "SPS too short for profile bytes: {} bytes",
                        sps.len()
                    )));
                }
                // profile_idc, constraint flags, level_idc follow the NAL
                // header byte.
                self.config.tag = avc1_tag(sps[1], sps[2], sps[3]);
                build_avcc(&sps, &pps)
            }
            CodecFamily::Hevc => {
                let vps = self.vps.take().expect("checked by sets_complete");
                let sps = self.sps.take().expect("checked by sets_complete");
                let pps = self.pps.take().expect("checked by sets_complete");
                if sps.len() < 2 {
                    return Err(PipelineError::Bitstream(format!(
                        "HEVC SPS too short: {} bytes",
                        sps.len()
                    )));
                }
                build_hvcc(&vps, &sps, &pps)
            }
            CodecFamily::Av1 => unreachable!("AV1 streams are not translated"),
        };

        self.config.description = Some(description);
        self.has_description = true;

        tracing::debug!(
            codec = %self.config.tag,
            description_len = self.config.description.as_ref().map_or(0, |d| d.len()),
            "synthesized decoder description"
        );

        Ok(self.config.clone())
    }
}

/// AVCDecoderConfigurationRecord:
/// `01 | profile | compat | level | FF | E1 | u16(len) sps | 01 | u16(len) pps`.
fn build_avcc(sps: &[u8], pps: &[u8]) -> Bytes {
    let mut w = ByteWriter::with_capacity(11 + sps.len() + pps.len());
    w.put_u8(0x01);
    w.put_u8(sps[1]);
    w.put_u8(sps[2]);
    w.put_u8(sps[3]);
    w.put_u8(0xFF); // reserved | 4-byte NAL lengths
    w.put_u8(0xE1); // reserved | one SPS
    w.put_u16(sps.len() as u16);
    w.put_slice(sps);
    w.put_u8(0x01); // one PPS
    w.put_u16(pps.len() as u16);
    w.put_slice(pps);
    w.take()
}

/// Minimal HEVCDecoderConfigurationRecord: 23-byte header followed by the
/// VPS, SPS and PPS arrays, each holding exactly one set.
///
/// The profile byte and `general_level_idc` are copied straight out of the
/// SPS header region rather than parsed from profile_tier_level.
fn build_hvcc(vps: &[u8], sps: &[u8], pps: &[u8]) -> Bytes {
    let mut w = ByteWriter::with_capacity(23 + 9 + vps.len() + sps.len() + pps.len() + 6);
    w.put_u8(0x01); // configurationVersion
    w.put_u8((sps[1] >> 1) & 0x3F); // profile_space / tier / profile_idc
    w.put_u32(0x6000_0000); // general_profile_compatibility_flags
    w.put_slice(&[0xB0, 0x00, 0x00, 0x00, 0x00, 0x00]); // constraint flags
    w.put_u8(sps.get(12).copied().unwrap_or(0)); // general_level_idc
    w.put_u16(0xF000); // min_spatial_segmentation_idc
    w.put_u8(0xFC); // parallelismType
    w.put_u8(0xFD); // chroma_format_idc = 1 (4:2:0)
    w.put_u8(0xF8); // bit_depth_luma_minus8
    w.put_u8(0xF8); // bit_depth_chroma_minus8
    w.put_u16(0x0000); // avgFrameRate
    w.put_u8(0x0F); // one temporal layer, nested, lengthSizeMinusOne = 3
    w.put_u8(0x03); // numOfArrays
    for (nal_unit_type, set) in [(hevc::VPS, vps), (hevc::SPS, sps), (hevc::PPS, pps)] {
        w.put_u8(nal_unit_type);
        w.put_u16(0x0001); // one set per array
        w.put_u16(set.len() as u16);
        w.put_slice(set);
    }
    w.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use farview_protocol::codec::CodecId;
    use farview_protocol::media::FrameType;

    const SPS: [u8; 5] = [0x67, 0x42, 0xE0, 0x1E, 0xAC];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];
    const IDR: [u8; 3] = [0x65, 0x11, 0x22];

    fn annex_b(nals: &[&[u8]], long_codes: bool) -> Bytes {
        let mut data = Vec::new();
        for nal in nals {
            if long_codes {
                data.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                data.extend_from_slice(&[0, 0, 1]);
            }
            data.extend_from_slice(nal);
        }
        Bytes::from(data)
    }

    fn key_unit(data: Bytes) -> VideoUnit {
        VideoUnit {
            frame_type: FrameType::Key,
            data,
            timestamp_us: 0,
            duration_us: 16_667,
        }
    }

    fn delta_unit(data: Bytes) -> VideoUnit {
        VideoUnit {
            frame_type: FrameType::Delta,
            data,
            timestamp_us: 16_667,
            duration_us: 16_667,
        }
    }

    fn h264_translator() -> StreamTranslator {
        StreamTranslator::new(DecoderConfig::out_of_band(CodecId::H264Baseline, 1280, 720))
    }

    #[test]
    fn keyframe_yields_length_prefixed_idr_and_description() {
        for long_codes in [false, true] {
            let mut translator = h264_translator();
            let unit = key_unit(annex_b(&[&SPS, &PPS, &IDR], long_codes));
            let out = translator.submit_unit(&unit).unwrap();

            let chunk = out.chunk.unwrap();
            let mut expected = (IDR.len() as u32).to_be_bytes().to_vec();
            expected.extend_from_slice(&IDR);
            assert_eq!(&chunk[..], &expected[..]);

            let config = out.configure.expect("parameter sets must reconfigure");
            assert!(config.description.is_some());
            assert!(translator.has_description());
        }
    }

    #[test]
    fn avcc_layout() {
        let mut translator = h264_translator();
        let unit = key_unit(annex_b(&[&SPS, &PPS, &IDR], true));
        let out = translator.submit_unit(&unit).unwrap();
        let desc = out.configure.unwrap().description.unwrap();

        let mut expected = vec![0x01, 0x42, 0xE0, 0x1E, 0xFF, 0xE1, 0x00, SPS.len() as u8];
        expected.extend_from_slice(&SPS);
        expected.extend_from_slice(&[0x01, 0x00, PPS.len() as u8]);
        expected.extend_from_slice(&PPS);
        assert_eq!(&desc[..], &expected[..]);
    }

    #[test]
    fn description_latch_persists() {
        let mut translator = h264_translator();

        // Delta before any reconfigure: skipped entirely.
        let out = translator
            .submit_unit(&delta_unit(annex_b(&[&[0x41, 0x99]], true)))
            .unwrap();
        assert!(out.chunk.is_none());

        translator
            .submit_unit(&key_unit(annex_b(&[&SPS, &PPS, &IDR], true)))
            .unwrap();

        // Keyframe lacking parameter sets still emits a non-empty chunk.
        let out = translator
            .submit_unit(&key_unit(annex_b(&[&IDR], true)))
            .unwrap();
        assert!(out.configure.is_none());
        let chunk = out.chunk.unwrap();
        assert!(!chunk.is_empty());
        assert!(translator.has_description());
    }

    #[test]
    fn codec_tag_derived_from_sps() {
        let mut translator = h264_translator();
        let sps = [0x67, 0x64, 0x00, 0x32, 0xAC];
        let out = translator
            .submit_unit(&key_unit(annex_b(&[&sps, &PPS, &IDR], true)))
            .unwrap();
        assert_eq!(out.configure.unwrap().tag, "avc1.640032");
    }

    #[test]
    fn parameter_set_only_unit_emits_empty_chunk_with_configure() {
        let mut translator = h264_translator();
        let out = translator
            .submit_unit(&key_unit(annex_b(&[&SPS, &PPS], true)))
            .unwrap();
        assert!(out.configure.is_some());
        assert_eq!(out.chunk.unwrap().len(), 0);
    }

    #[test]
    fn hvcc_array_ordering() {
        let mut translator =
            StreamTranslator::new(DecoderConfig::out_of_band(CodecId::HevcMain, 1920, 1080));
        let vps = [32 << 1, 0x01, 0xAA];
        let sps = [
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
        let pps = [34 << 1, 0x01, 0xC0];
        let idr = [19 << 1, 0x01, 0x44];
        let out = translator
            .submit_unit(&key_unit(annex_b(&[&vps, &sps, &pps, &idr], true)))
            .unwrap();

        let desc = out.configure.unwrap().description.unwrap();
        assert_eq!(desc[0], 0x01);
        assert_eq!(desc[12], 0x5D, "general_level_idc copied from sps[12]");
        assert_eq!(desc[22], 3, "three parameter-set arrays");

        // Walk the arrays: VPS, SPS, PPS in order, each with count = 1.
        let mut pos = 23;
        for (expected_type, expected_set) in
            [(32u8, &vps[..]), (33, &sps[..]), (34, &pps[..])]
        {
            assert_eq!(desc[pos], expected_type);
            assert_eq!(u16::from_be_bytes([desc[pos + 1], desc[pos + 2]]), 1);
            let len = u16::from_be_bytes([desc[pos + 3], desc[pos + 4]]) as usize;
            assert_eq!(&desc[pos + 5..pos + 5 + len], expected_set);
            pos += 5 + len;
        }
        assert_eq!(pos, desc.len());

        // The chunk holds only the length-prefixed IDR.
        let chunk = out.chunk.unwrap();
        assert_eq!(&chunk[..4], &(idr.len() as u32).to_be_bytes());
        assert_eq!(&chunk[4..], &idr);
    }

    #[test]
    fn hevc_keyframe_missing_vps_does_not_configure() {
        let mut translator =
            StreamTranslator::new(DecoderConfig::out_of_band(CodecId::HevcMain, 1920, 1080));
        let sps = [33 << 1, 0x01, 0x60];
        let pps = [34 << 1, 0x01, 0xC0];
        let idr = [19 << 1, 0x01, 0x44];
        let out = translator
            .submit_unit(&key_unit(annex_b(&[&sps, &pps, &idr], true)))
            .unwrap();
        assert!(out.configure.is_none());
        assert!(!translator.has_description());
        // The chunk is still forwarded in case downstream tolerates it.
        assert!(!out.chunk.unwrap().is_empty());
    }

    #[test]
    fn closed_translator_refuses_mutation() {
        let mut translator = h264_translator();
        translator.close();
        let err = translator
            .submit_unit(&key_unit(annex_b(&[&SPS, &PPS, &IDR], true)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Resource(_)));
    }
}
