//! Decoded frame types.
//!
//! `FrameHandle` is the platform-frame analogue: pooled pixel storage with
//! display dimensions and an explicit close. Ownership rule: a decoded frame
//! is owned by whichever pipe currently references it, and the previous frame
//! must be closed before a replacement is stored.

use bytes::Bytes;

use crate::scratch_pool::{ScratchBuffer, ScratchPool};

/// A decoded platform frame with explicit lifetime control.
///
/// Closing returns the pixel storage to the pool; dropping an unclosed
/// handle closes it.
#[derive(Debug)]
pub struct FrameHandle {
    storage: Option<ScratchBuffer>,
    display_width: u32,
    display_height: u32,
    timestamp_us: u64,
}

impl FrameHandle {
    /// Lease storage for a tightly packed RGBA frame and hand it to `fill`.
    pub fn new_rgba(
        pool: &ScratchPool,
        display_width: u32,
        display_height: u32,
        timestamp_us: u64,
        fill: impl FnOnce(&mut [u8]),
    ) -> Self {
        let mut storage = pool.lease(display_width as usize * display_height as usize * 4);
        fill(storage.as_mut_slice());
        Self {
            storage: Some(storage),
            display_width,
            display_height,
            timestamp_us,
        }
    }

    pub fn display_width(&self) -> u32 {
        self.display_width
    }

    pub fn display_height(&self) -> u32 {
        self.display_height
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// RGBA pixel data, or `None` once closed.
    pub fn data(&self) -> Option<&[u8]> {
        self.storage.as_ref().map(|s| s.as_slice())
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_none()
    }

    /// Release the pixel storage back to the pool. Idempotent.
    pub fn close(&mut self) {
        self.storage = None;
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Tightly packed 8-bit RGBA.
#[derive(Debug, Clone)]
pub struct RgbaFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: u64,
}

/// Planar 4:2:0 YUV; planes may be padded by stride.
#[derive(Debug, Clone)]
pub struct Yuv420Frame {
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
    pub y_stride: usize,
    pub uv_stride: usize,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: u64,
}

impl Yuv420Frame {
    /// A solid frame at the given YUV levels, tightly packed.
    pub fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let luma = vec![y; width as usize * height as usize];
        let chroma_len = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
        Self {
            y: Bytes::from(luma),
            u: Bytes::from(vec![u; chroma_len]),
            v: Bytes::from(vec![v; chroma_len]),
            y_stride: width as usize,
            uv_stride: width.div_ceil(2) as usize,
            width,
            height,
            timestamp_us: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_releases_storage_to_pool() {
        let pool = ScratchPool::new();
        let mut frame = FrameHandle::new_rgba(&pool, 2, 2, 0, |data| data.fill(0x80));
        assert_eq!(frame.data().unwrap().len(), 16);
        assert!(!frame.is_closed());
        frame.close();
        assert!(frame.is_closed());
        assert!(frame.data().is_none());
        assert_eq!(pool.retained(), 1);
        // idempotent
        frame.close();
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn drop_closes_implicitly() {
        let pool = ScratchPool::new();
        {
            let _frame = FrameHandle::new_rgba(&pool, 4, 4, 0, |_| {});
        }
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn solid_yuv_dimensions() {
        let frame = Yuv420Frame::solid(3, 3, 128, 128, 128);
        assert_eq!(frame.y.len(), 9);
        assert_eq!(frame.u.len(), 4);
        assert_eq!(frame.uv_stride, 2);
    }
}
