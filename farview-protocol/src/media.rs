//! Encoded media units and control messages exchanged with the transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Whether an encoded video unit can be decoded without prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Self-contained IDR; for H.264/H.265 the unit also carries the
    /// preceding parameter sets.
    Key,
    /// Depends on earlier frames.
    Delta,
}

/// One encoded video unit in Annex-B form: a sequence of NAL units each
/// preceded by a `00 00 01` or `00 00 00 01` start code. Units arrive in
/// decode order; timestamps are monotonic up to occasional resets after
/// stream reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUnit {
    pub frame_type: FrameType,
    pub data: Bytes,
    pub timestamp_us: u64,
    pub duration_us: u64,
}

impl VideoUnit {
    pub fn is_key(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

/// One encoded Opus packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPacket {
    pub data: Bytes,
    pub timestamp_us: u64,
}

/// Opus multistream setup parameters.
///
/// `mapping[i]` selects the decoded channel feeding output channel `i`;
/// the value 255 produces silence on that channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u8,
    pub streams: u8,
    pub coupled_streams: u8,
    pub mapping: Vec<u8>,
    pub samples_per_frame: usize,
}

impl AudioParams {
    /// Plain stereo: one coupled stream, identity mapping.
    pub fn stereo() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            streams: 1,
            coupled_streams: 1,
            mapping: vec![0, 1],
            samples_per_frame: 960,
        }
    }
}

/// Control messages the pipeline raises toward the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Ask the encoder for a fresh IDR; raised on decode backlog or after
    /// dropping too many delta units.
    RequestKeyframe { stream_id: u8 },
}

/// Serialize a `ControlMessage` to compact binary via postcard.
pub fn encode_control(msg: &ControlMessage) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(msg)
}

/// Deserialize a `ControlMessage` from postcard bytes.
pub fn decode_control(data: &[u8]) -> Result<ControlMessage, postcard::Error> {
    postcard::from_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_unit_roundtrip() {
        let unit = VideoUnit {
            frame_type: FrameType::Key,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xAA]),
            timestamp_us: 16_667,
            duration_us: 16_667,
        };
        let encoded = postcard::to_allocvec(&unit).unwrap();
        let decoded: VideoUnit = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(unit, decoded);
        assert!(decoded.is_key());
    }

    #[test]
    fn control_roundtrip() {
        let msg = ControlMessage::RequestKeyframe { stream_id: 1 };
        let encoded = encode_control(&msg).unwrap();
        assert_eq!(decode_control(&encoded).unwrap(), msg);
    }

    #[test]
    fn stereo_params() {
        let params = AudioParams::stereo();
        assert_eq!(params.mapping.len(), params.channels as usize);
        assert_eq!(params.samples_per_frame, 960);
    }
}
