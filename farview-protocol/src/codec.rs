//! Video codec identities and their negotiated tag strings.
//!
//! Each codec is addressed by a mime-like tag. The in-band variant
//! (`avc3`/`hev1`) carries parameter sets inside the bitstream; the
//! out-of-band variant (`avc1`/`hvc1`) requires a configuration record
//! delivered separately. AV1 uses the same tag for both.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codec family, controlling bitstream handling and NAL layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
}

/// A concrete codec profile the pipeline can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    /// H.264 constrained baseline.
    H264Baseline,
    /// H.264 high 8-bit 4:4:4 predictive.
    H264High444,
    /// H.265 main.
    HevcMain,
    /// H.265 main 10.
    HevcMain10,
    /// H.265 range extensions, 8-bit 4:4:4.
    HevcRext8_444,
    /// H.265 range extensions, 10-bit 4:4:4.
    HevcRext10_444,
    /// AV1 main profile, 8-bit.
    Av1Main8,
    /// AV1 main profile, 10-bit.
    Av1Main10,
    /// AV1 high profile, 8-bit 4:4:4.
    Av1High8_444,
    /// AV1 high profile, 10-bit 4:4:4.
    Av1High10_444,
}

/// All codecs, in default preference order (most capable last so that
/// preference sets can be built by filtering).
pub const ALL_CODECS: [CodecId; 10] = [
    CodecId::H264Baseline,
    CodecId::H264High444,
    CodecId::HevcMain,
    CodecId::HevcMain10,
    CodecId::HevcRext8_444,
    CodecId::HevcRext10_444,
    CodecId::Av1Main8,
    CodecId::Av1Main10,
    CodecId::Av1High8_444,
    CodecId::Av1High10_444,
];

impl CodecId {
    pub fn family(self) -> CodecFamily {
        match self {
            CodecId::H264Baseline | CodecId::H264High444 => CodecFamily::H264,
            CodecId::HevcMain
            | CodecId::HevcMain10
            | CodecId::HevcRext8_444
            | CodecId::HevcRext10_444 => CodecFamily::Hevc,
            CodecId::Av1Main8
            | CodecId::Av1Main10
            | CodecId::Av1High8_444
            | CodecId::Av1High10_444 => CodecFamily::Av1,
        }
    }

    /// Tag used when parameter sets travel inside the bitstream.
    pub fn in_band_tag(self) -> &'static str {
        match self {
            CodecId::H264Baseline => "avc3.42E01E",
            CodecId::H264High444 => "avc3.640032",
            CodecId::HevcMain => "hev1.1.6.L93.B0",
            CodecId::HevcMain10 => "hev1.2.4.L120.90",
            CodecId::HevcRext8_444 => "hev1.6.6.L93.90",
            CodecId::HevcRext10_444 => "hev1.6.10.L120.90",
            CodecId::Av1Main8 => "av01.0.04M.08",
            CodecId::Av1Main10 => "av01.0.04M.10",
            CodecId::Av1High8_444 => "av01.0.08M.08",
            CodecId::Av1High10_444 => "av01.0.08M.10",
        }
    }

    /// Tag used when a configuration record is delivered out of band.
    /// Identical to the in-band tag for AV1.
    pub fn out_of_band_tag(self) -> &'static str {
        match self {
            CodecId::H264Baseline => "avc1.42E01E",
            CodecId::H264High444 => "avc1.640032",
            CodecId::HevcMain => "hvc1.1.6.L93.B0",
            CodecId::HevcMain10 => "hvc1.2.4.L120.90",
            CodecId::HevcRext8_444 => "hvc1.6.6.L93.90",
            CodecId::HevcRext10_444 => "hvc1.6.10.L120.90",
            other => other.in_band_tag(),
        }
    }

    /// Whether the out-of-band variant differs from the in-band one.
    pub fn has_out_of_band_variant(self) -> bool {
        !matches!(self.family(), CodecFamily::Av1)
    }
}

/// Derive the `avc1.PPCCLL` tag from the profile bytes of an H.264 SPS
/// (profile_idc, constraint flags, level_idc — the three bytes following
/// the NAL header).
pub fn avc1_tag(profile_idc: u8, constraint_flags: u8, level_idc: u8) -> String {
    format!("avc1.{profile_idc:02x}{constraint_flags:02x}{level_idc:02x}")
}

#[derive(Debug, Error)]
pub enum CodecParseError {
    #[error("unknown codec tag: {0}")]
    UnknownTag(String),
}

/// Resolve a tag string (either variant) back to its codec identity.
pub fn parse_tag(tag: &str) -> Result<CodecId, CodecParseError> {
    ALL_CODECS
        .into_iter()
        .find(|c| c.in_band_tag() == tag || c.out_of_band_tag() == tag)
        .ok_or_else(|| CodecParseError::UnknownTag(tag.to_string()))
}
