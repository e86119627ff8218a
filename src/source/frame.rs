use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Decoded picture straight out of a frame source
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Position in the source, starting at 0
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Plane data, laid out as described by `format`
    pub data: Bytes,
}

impl RawFrame {
    /// Number of bytes `data` must hold for this frame's geometry, `None`
    /// if that does not fit in memory at all.
    pub fn expected_len(&self) -> Option<usize> {
        self.format.frame_len(self.width, self.height)
    }
}

/// Pixel layouts the sources produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB
    Rgb24,
    /// Planar Y, U, V with chroma halved both ways
    Yuv420,
    /// Planar Y, U, V with chroma halved horizontally
    Yuv422,
    /// Planar Y, U, V at full resolution
    Yuv444,
    /// Luma only
    Gray8,
}

impl PixelFormat {
    /// Chroma plane dimensions for planar YUV layouts.
    pub fn chroma_dims(self, width: u32, height: u32) -> (usize, usize) {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Yuv420 => (w.div_ceil(2), h.div_ceil(2)),
            PixelFormat::Yuv422 => (w.div_ceil(2), h),
            PixelFormat::Yuv444 => (w, h),
            PixelFormat::Rgb24 | PixelFormat::Gray8 => (0, 0),
        }
    }

    /// Bytes of one frame, or `None` on arithmetic overflow.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let luma = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Rgb24 => luma.checked_mul(3),
            PixelFormat::Gray8 => Some(luma),
            _ => {
                let (cw, ch) = self.chroma_dims(width, height);
                cw.checked_mul(ch)?.checked_mul(2)?.checked_add(luma)
            }
        }
    }
}

/// An encoded frame as it travels from the emitter to the reorder buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Session sequence number, assigned by the emitter
    pub id: u64,

    /// Encoded image
    pub payload: Bytes,

    /// Source frames per second, constant for the session
    pub rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_sizes_round_chroma_up() {
        assert_eq!(PixelFormat::Yuv420.frame_len(4, 2), Some(8 + 2 * 2));
        assert_eq!(PixelFormat::Yuv420.frame_len(3, 3), Some(9 + 2 * 4));
        assert_eq!(PixelFormat::Yuv422.frame_len(3, 2), Some(6 + 2 * 4));
        assert_eq!(PixelFormat::Yuv444.frame_len(2, 2), Some(12));
        assert_eq!(PixelFormat::Gray8.frame_len(5, 5), Some(25));
        assert_eq!(PixelFormat::Rgb24.frame_len(2, 3), Some(18));
    }

    #[test]
    fn oversized_geometry_does_not_overflow() {
        for format in [PixelFormat::Yuv420, PixelFormat::Yuv444, PixelFormat::Rgb24] {
            assert_eq!(format.frame_len(u32::MAX, u32::MAX), None, "{format:?}");
        }
    }
}
