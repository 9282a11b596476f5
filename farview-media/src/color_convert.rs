//! Scalar BT.601 YUV → RGBA conversion for paths without a GPU renderer.

use bytes::Bytes;

use crate::error::PipelineError;
use crate::frame::{RgbaFrame, Yuv420Frame};
use crate::pipe::{MediaPipe, Payload, SetupConfig};

/// Convert a planar 4:2:0 frame to tightly packed RGBA.
///
/// Fixed-point BT.601 with saturation to `[0, 255]`:
/// `R = Y + 1.402 V'`, `G = Y - 0.344 U' - 0.714 V'`, `B = Y + 1.772 U'`
/// with the chroma planes centered on 128.
pub fn yuv420_to_rgba(frame: &Yuv420Frame) -> RgbaFrame {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let mut rgba = vec![0u8; width * height * 4];

    for row in 0..height {
        let y_row = row * frame.y_stride;
        let uv_row = (row / 2) * frame.uv_stride;
        let out_row = row * width * 4;

        for col in 0..width {
            let y = *frame.y.get(y_row + col).unwrap_or(&0) as i32;
            let u = *frame.u.get(uv_row + col / 2).unwrap_or(&128) as i32 - 128;
            let v = *frame.v.get(uv_row + col / 2).unwrap_or(&128) as i32 - 128;

            // Coefficients scaled by 256: 1.402 -> 359, 0.344 -> 88,
            // 0.714 -> 183, 1.772 -> 454.
            let r = (y + ((359 * v) >> 8)).clamp(0, 255) as u8;
            let g = (y - ((88 * u + 183 * v) >> 8)).clamp(0, 255) as u8;
            let b = (y + ((454 * u) >> 8)).clamp(0, 255) as u8;

            let out = out_row + col * 4;
            rgba[out] = r;
            rgba[out + 1] = g;
            rgba[out + 2] = b;
            rgba[out + 3] = 255;
        }
    }

    RgbaFrame {
        data: Bytes::from(rgba),
        width: frame.width,
        height: frame.height,
        timestamp_us: frame.timestamp_us,
    }
}

/// Pipe converting YUV frames to RGBA for a pixel-buffer sink.
pub struct ColorConvertPipe {
    base: Box<dyn MediaPipe>,
    cleaned: bool,
}

impl ColorConvertPipe {
    pub fn new(base: Box<dyn MediaPipe>) -> Self {
        Self {
            base,
            cleaned: false,
        }
    }
}

impl MediaPipe for ColorConvertPipe {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.base.setup(config)
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        if self.cleaned {
            return Ok(());
        }
        match payload {
            Payload::Yuv420(frame) => self.base.submit(Payload::Rgba(yuv420_to_rgba(&frame))),
            other => self.base.submit(other),
        }
    }

    fn tick(&mut self) {
        self.base.tick();
    }

    fn poll_request_idr(&mut self) -> bool {
        self.base.poll_request_idr()
    }

    fn cleanup(&mut self) {
        self.cleaned = true;
        self.base.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_is_mid_gray() {
        let frame = Yuv420Frame::solid(2, 2, 128, 128, 128);
        let rgba = yuv420_to_rgba(&frame);
        assert_eq!(rgba.data.len(), 16);
        for pixel in rgba.data.chunks(4) {
            for channel in &pixel[..3] {
                assert!(
                    channel.abs_diff(128) <= 1,
                    "expected mid-gray, got {pixel:?}"
                );
            }
            assert_eq!(pixel[3], 255);
        }
    }

    #[test]
    fn saturation_clamps() {
        // Bright luma + strong red chroma must not wrap.
        let frame = Yuv420Frame::solid(2, 2, 255, 0, 255);
        let rgba = yuv420_to_rgba(&frame);
        assert_eq!(rgba.data[0], 255, "red clamps high");
        // Dark luma + strong negative chroma must not underflow.
        let frame = Yuv420Frame::solid(2, 2, 0, 0, 0);
        let rgba = yuv420_to_rgba(&frame);
        assert_eq!(rgba.data[2], 0, "blue clamps low");
    }

    #[test]
    fn respects_plane_strides() {
        // 2x2 frame with padded strides: luma stride 4, chroma stride 3.
        let y = Bytes::from_static(&[10, 20, 0, 0, 30, 40, 0, 0]);
        let u = Bytes::from_static(&[128, 0, 0]);
        let v = Bytes::from_static(&[128, 0, 0]);
        let frame = Yuv420Frame {
            y,
            u,
            v,
            y_stride: 4,
            uv_stride: 3,
            width: 2,
            height: 2,
            timestamp_us: 0,
        };
        let rgba = yuv420_to_rgba(&frame);
        // Luma carries straight through at neutral chroma.
        assert_eq!(rgba.data[0], 10);
        assert_eq!(rgba.data[4], 20);
        assert_eq!(rgba.data[8], 30);
        assert_eq!(rgba.data[12], 40);
    }

    #[test]
    fn primary_colors_roundtrip_coarsely() {
        // Pure red in BT.601: Y=76, U=84, V=255.
        let frame = Yuv420Frame::solid(2, 2, 76, 84, 255);
        let rgba = yuv420_to_rgba(&frame);
        assert!(rgba.data[0] > 230, "red channel high: {}", rgba.data[0]);
        assert!(rgba.data[1] < 40, "green channel low: {}", rgba.data[1]);
        assert!(rgba.data[2] < 40, "blue channel low: {}", rgba.data[2]);
    }
}
