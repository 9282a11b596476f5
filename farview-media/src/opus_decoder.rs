//! Opus multistream decoding.
//!
//! A multistream packet is a chain of self-delimited Opus packets, one per
//! stream, the last in regular framing. Each stream feeds one or two
//! decoded channels; the channel mapping routes decoded channels to output
//! channels, with 255 producing silence. Passing `None` as the packet runs
//! packet-loss concealment on every stream.

use farview_protocol::media::AudioParams;
use thiserror::Error;

/// libopus status codes surfaced to the embedder.
pub mod status {
    pub const OK: i32 = 0;
    pub const BAD_ARG: i32 = -1;
    pub const BUFFER_TOO_SMALL: i32 = -2;
    pub const INTERNAL: i32 = -3;
    pub const INVALID_PACKET: i32 = -4;
    pub const UNIMPLEMENTED: i32 = -5;
    pub const INVALID_STATE: i32 = -6;
    pub const ALLOC_FAIL: i32 = -7;
}

#[derive(Debug, Error)]
#[error("opus: {message} (code {code})")]
pub struct AudioError {
    pub code: i32,
    pub message: String,
}

impl AudioError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_packet(message: impl Into<String>) -> Self {
        Self::new(status::INVALID_PACKET, message)
    }
}

impl From<opus::Error> for AudioError {
    fn from(error: opus::Error) -> Self {
        let code = match error.code() {
            opus::ErrorCode::BadArg => status::BAD_ARG,
            opus::ErrorCode::BufferTooSmall => status::BUFFER_TOO_SMALL,
            opus::ErrorCode::InternalError => status::INTERNAL,
            opus::ErrorCode::InvalidPacket => status::INVALID_PACKET,
            opus::ErrorCode::Unimplemented => status::UNIMPLEMENTED,
            opus::ErrorCode::InvalidState => status::INVALID_STATE,
            opus::ErrorCode::AllocFail => status::ALLOC_FAIL,
            _ => status::INTERNAL,
        };
        Self::new(code, error.to_string())
    }
}

/// Per-stream decoders plus the channel mapping.
pub struct MultistreamDecoder {
    params: AudioParams,
    decoders: Vec<opus::Decoder>,
    /// Interleaved per-stream decode scratch, reused across calls.
    scratch: Vec<Vec<f32>>,
}

impl MultistreamDecoder {
    pub fn new(params: &AudioParams) -> Result<Self, AudioError> {
        if params.streams == 0 || params.coupled_streams > params.streams {
            return Err(AudioError::new(
                status::BAD_ARG,
                format!(
                    "invalid stream layout: {} streams, {} coupled",
                    params.streams, params.coupled_streams
                ),
            ));
        }
        if params.mapping.len() != params.channels as usize {
            return Err(AudioError::new(
                status::BAD_ARG,
                format!(
                    "mapping has {} entries for {} channels",
                    params.mapping.len(),
                    params.channels
                ),
            ));
        }
        let decoded_channels =
            params.coupled_streams as usize * 2 + (params.streams - params.coupled_streams) as usize;
        for &m in &params.mapping {
            if m != 255 && m as usize >= decoded_channels {
                return Err(AudioError::new(
                    status::BAD_ARG,
                    format!("mapping entry {m} exceeds {decoded_channels} decoded channels"),
                ));
            }
        }

        let mut decoders = Vec::with_capacity(params.streams as usize);
        for stream in 0..params.streams {
            let channels = if stream < params.coupled_streams {
                opus::Channels::Stereo
            } else {
                opus::Channels::Mono
            };
            decoders.push(opus::Decoder::new(params.sample_rate, channels)?);
        }

        tracing::info!(
            sample_rate = params.sample_rate,
            channels = params.channels,
            streams = params.streams,
            coupled = params.coupled_streams,
            "opus multistream decoder created"
        );

        Ok(Self {
            params: params.clone(),
            scratch: vec![Vec::new(); decoders.len()],
            decoders,
        })
    }

    pub fn params(&self) -> &AudioParams {
        &self.params
    }

    /// Decode one multistream packet (or conceal a loss with `None`) into
    /// interleaved f32 output. Returns samples decoded per channel.
    pub fn decode(
        &mut self,
        packet: Option<&[u8]>,
        output: &mut [f32],
        frame_size: usize,
        fec: bool,
    ) -> Result<usize, AudioError> {
        let channels = self.params.channels as usize;
        if output.len() < frame_size * channels {
            return Err(AudioError::new(
                status::BUFFER_TOO_SMALL,
                format!(
                    "output holds {} samples, need {}",
                    output.len(),
                    frame_size * channels
                ),
            ));
        }

        let streams = self.decoders.len();
        let mut samples = frame_size;

        match packet {
            None => {
                // Loss: concealment on every stream.
                for (stream, decoder) in self.decoders.iter_mut().enumerate() {
                    let stream_channels = stream_channel_count(&self.params, stream);
                    let scratch = &mut self.scratch[stream];
                    scratch.resize(frame_size * stream_channels, 0.0);
                    let decoded = decoder.decode_float(&[], scratch, fec)?;
                    samples = samples.min(decoded);
                }
            }
            Some(data) => {
                let mut offset = 0;
                for stream in 0..streams {
                    let last = stream == streams - 1;
                    let (regular, consumed) = if last {
                        (data[offset..].to_vec(), data.len() - offset)
                    } else {
                        self_delimited_to_regular(&data[offset..])?
                    };
                    offset += consumed;

                    let stream_channels = stream_channel_count(&self.params, stream);
                    let scratch = &mut self.scratch[stream];
                    scratch.resize(frame_size * stream_channels, 0.0);
                    let decoded = self.decoders[stream].decode_float(&regular, scratch, fec)?;
                    samples = samples.min(decoded);
                }
            }
        }

        // Route decoded channels through the mapping.
        for t in 0..samples {
            for (out_channel, &m) in self.params.mapping.iter().enumerate() {
                output[t * channels + out_channel] = if m == 255 {
                    0.0
                } else {
                    let (stream, channel, stream_channels) =
                        locate_decoded_channel(&self.params, m);
                    self.scratch[stream][t * stream_channels + channel]
                };
            }
        }

        Ok(samples)
    }
}

fn stream_channel_count(params: &AudioParams, stream: usize) -> usize {
    if stream < params.coupled_streams as usize {
        2
    } else {
        1
    }
}

/// Decoded channel index → (stream, channel within stream, stream width).
fn locate_decoded_channel(params: &AudioParams, index: u8) -> (usize, usize, usize) {
    let coupled = params.coupled_streams as usize;
    let index = index as usize;
    if index < coupled * 2 {
        (index / 2, index % 2, 2)
    } else {
        (coupled + (index - coupled * 2), 0, 1)
    }
}

/// Opus frame-length field: one byte below 252, two bytes otherwise.
fn read_length(data: &[u8], pos: &mut usize) -> Result<usize, AudioError> {
    let first = *data
        .get(*pos)
        .ok_or_else(|| AudioError::invalid_packet("truncated length"))? as usize;
    *pos += 1;
    if first < 252 {
        return Ok(first);
    }
    let second = *data
        .get(*pos)
        .ok_or_else(|| AudioError::invalid_packet("truncated length"))? as usize;
    *pos += 1;
    Ok(second * 4 + first)
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], AudioError> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| AudioError::invalid_packet("truncated frame data"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Convert the self-delimited packet at the head of `data` into regular
/// framing, returning the rebuilt packet and the bytes consumed.
///
/// Self-delimited framing (RFC 6716 Appendix B) adds one explicit length
/// for the frame whose size is normally implicit.
fn self_delimited_to_regular(data: &[u8]) -> Result<(Vec<u8>, usize), AudioError> {
    let toc = *data
        .first()
        .ok_or_else(|| AudioError::invalid_packet("empty stream packet"))?;
    let code = toc & 0x03;
    let mut pos = 1;
    let mut regular = vec![toc];

    match code {
        // One frame; its length becomes implicit again.
        0 => {
            let len = read_length(data, &mut pos)?;
            regular.extend_from_slice(take(data, &mut pos, len)?);
        }
        // Two equal frames; the single length covers both.
        1 => {
            let len = read_length(data, &mut pos)?;
            regular.extend_from_slice(take(data, &mut pos, len * 2)?);
        }
        // Two frames; the first length stays explicit, the second becomes
        // implicit.
        2 => {
            let len1_start = pos;
            let len1 = read_length(data, &mut pos)?;
            let len1_bytes = data[len1_start..pos].to_vec();
            let len2 = read_length(data, &mut pos)?;
            regular.extend_from_slice(&len1_bytes);
            regular.extend_from_slice(take(data, &mut pos, len1 + len2)?);
        }
        // Arbitrary frame count.
        _ => {
            let count_byte = *data
                .get(pos)
                .ok_or_else(|| AudioError::invalid_packet("truncated frame count"))?;
            pos += 1;
            regular.push(count_byte);

            let vbr = count_byte & 0x80 != 0;
            let has_padding = count_byte & 0x40 != 0;
            let frame_count = (count_byte & 0x3F) as usize;
            if frame_count == 0 {
                return Err(AudioError::invalid_packet("zero frames in packet"));
            }

            let mut padding = 0usize;
            if has_padding {
                loop {
                    let byte = *data
                        .get(pos)
                        .ok_or_else(|| AudioError::invalid_packet("truncated padding"))?;
                    pos += 1;
                    regular.push(byte);
                    if byte == 255 {
                        padding += 254;
                    } else {
                        padding += byte as usize;
                        break;
                    }
                }
            }

            if vbr {
                // Self-delimited VBR carries all lengths; regular framing
                // drops the last one.
                let mut lengths = Vec::with_capacity(frame_count);
                for frame in 0..frame_count {
                    let start = pos;
                    let len = read_length(data, &mut pos)?;
                    if frame + 1 < frame_count {
                        regular.extend_from_slice(&data[start..pos]);
                    }
                    lengths.push(len);
                }
                for len in lengths {
                    regular.extend_from_slice(take(data, &mut pos, len)?);
                }
            } else {
                let len = read_length(data, &mut pos)?;
                regular.extend_from_slice(take(data, &mut pos, len * frame_count)?);
            }

            regular.extend_from_slice(take(data, &mut pos, padding)?);
        }
    }

    Ok((regular, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_delimited_code0() {
        let packet = [0x00, 3, 0xA, 0xB, 0xC, 0xFF];
        let (regular, consumed) = self_delimited_to_regular(&packet).unwrap();
        assert_eq!(regular, vec![0x00, 0xA, 0xB, 0xC]);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn self_delimited_code1() {
        let packet = [0x01, 2, 0xA, 0xB, 0xC, 0xD];
        let (regular, consumed) = self_delimited_to_regular(&packet).unwrap();
        assert_eq!(regular, vec![0x01, 0xA, 0xB, 0xC, 0xD]);
        assert_eq!(consumed, 6);
    }

    #[test]
    fn self_delimited_code2_keeps_first_length() {
        let packet = [0x02, 2, 3, 0xA, 0xB, 0xC, 0xD, 0xE];
        let (regular, consumed) = self_delimited_to_regular(&packet).unwrap();
        assert_eq!(regular, vec![0x02, 2, 0xA, 0xB, 0xC, 0xD, 0xE]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn self_delimited_code3_vbr_drops_last_length() {
        // Two VBR frames of 1 and 2 bytes.
        let packet = [0x03, 0x82, 1, 2, 0xA, 0xB, 0xC];
        let (regular, consumed) = self_delimited_to_regular(&packet).unwrap();
        assert_eq!(regular, vec![0x03, 0x82, 1, 0xA, 0xB, 0xC]);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn truncated_packet_is_invalid() {
        let err = self_delimited_to_regular(&[0x00, 10, 0xA]).unwrap_err();
        assert_eq!(err.code, status::INVALID_PACKET);
    }

    fn sine(samples: usize, channels: usize, amplitude: f32) -> Vec<f32> {
        (0..samples)
            .flat_map(|i| {
                let t = i as f32 / 48_000.0;
                let value = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * amplitude;
                std::iter::repeat(value).take(channels)
            })
            .collect()
    }

    fn rms(samples: &[f32], channels: usize, channel: usize) -> f32 {
        let values: Vec<f32> = samples
            .iter()
            .skip(channel)
            .step_by(channels)
            .copied()
            .collect();
        (values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32).sqrt()
    }

    #[test]
    fn stereo_roundtrip_preserves_level() {
        let params = AudioParams::stereo();
        let mut encoder =
            opus::Encoder::new(48_000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        encoder
            .set_bitrate(opus::Bitrate::Bits(128_000))
            .unwrap();
        let mut decoder = MultistreamDecoder::new(&params).unwrap();

        let frame = sine(960, 2, 0.5);
        let mut output = vec![0.0f32; 960 * 2];
        let mut decoded_samples = 0;

        // Encode several frames so codec state converges before measuring.
        for _ in 0..10 {
            let packet = encoder.encode_vec_float(&frame, 4000).unwrap();
            decoded_samples = decoder
                .decode(Some(&packet[..]), &mut output, 960, false)
                .unwrap();
        }

        assert!(decoded_samples >= 960);
        let input_rms = rms(&frame, 2, 0);
        for channel in 0..2 {
            let output_rms = rms(&output[..decoded_samples * 2], 2, channel);
            let deviation = (output_rms - input_rms).abs() / input_rms;
            assert!(
                deviation < 0.1,
                "channel {channel} rms {output_rms} vs input {input_rms}"
            );
        }
    }

    #[test]
    fn mono_source_fans_out_and_255_is_silence() {
        let params = AudioParams {
            sample_rate: 48_000,
            channels: 3,
            streams: 1,
            coupled_streams: 0,
            mapping: vec![0, 0, 255],
            samples_per_frame: 960,
        };
        let mut encoder =
            opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Audio).unwrap();
        let mut decoder = MultistreamDecoder::new(&params).unwrap();

        let frame = sine(960, 1, 0.5);
        let mut output = vec![1.0f32; 960 * 3];
        let mut samples = 0;
        for _ in 0..3 {
            let packet = encoder.encode_vec_float(&frame, 4000).unwrap();
            samples = decoder
                .decode(Some(&packet[..]), &mut output, 960, false)
                .unwrap();
        }
        assert!(samples > 0);
        for t in 0..samples {
            assert_eq!(output[t * 3], output[t * 3 + 1], "both channels share stream 0");
            assert_eq!(output[t * 3 + 2], 0.0, "mapping 255 is silence");
        }
    }

    #[test]
    fn loss_concealment_fills_a_frame() {
        let params = AudioParams::stereo();
        let mut decoder = MultistreamDecoder::new(&params).unwrap();
        let mut output = vec![0.0f32; 960 * 2];
        let samples = decoder.decode(None, &mut output, 960, false).unwrap();
        assert_eq!(samples, 960);
    }

    #[test]
    fn small_output_buffer_is_rejected() {
        let params = AudioParams::stereo();
        let mut decoder = MultistreamDecoder::new(&params).unwrap();
        let mut output = vec![0.0f32; 100];
        let err = decoder.decode(None, &mut output, 960, false).unwrap_err();
        assert_eq!(err.code, status::BUFFER_TOO_SMALL);
    }

    #[test]
    fn bad_layout_is_rejected() {
        let mut params = AudioParams::stereo();
        params.coupled_streams = 2; // more coupled than streams
        assert_eq!(
            MultistreamDecoder::new(&params).unwrap_err().code,
            status::BAD_ARG
        );

        let mut params = AudioParams::stereo();
        params.mapping = vec![0, 9]; // beyond decoded channels
        assert_eq!(
            MultistreamDecoder::new(&params).unwrap_err().code,
            status::BAD_ARG
        );
    }

    #[test]
    fn garbage_packet_reports_invalid_packet() {
        let params = AudioParams::stereo();
        let mut decoder = MultistreamDecoder::new(&params).unwrap();
        let mut output = vec![0.0f32; 960 * 2];
        // A TOC promising far more data than present.
        let err = decoder
            .decode(Some(&[0xFF, 0xFF][..]), &mut output, 960, false)
            .unwrap_err();
        assert_eq!(err.code, status::INVALID_PACKET);
    }
}
