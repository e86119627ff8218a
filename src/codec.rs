//! Frame encoder (raw → JPEG) and the matching decoder used on the playback side

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use zune_jpeg::errors::DecodeErrors;
use zune_jpeg::JpegDecoder;

use crate::error::EncodeError;
use crate::source::frame::{PixelFormat, RawFrame};

pub const DEFAULT_QUALITY: u8 = 75;

/// Deterministic JPEG compression at a fixed quality
#[derive(Debug, Clone, Copy)]
pub struct JpegEncoder {
    quality: u8,
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &RawFrame) -> Result<Bytes, EncodeError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(EncodeError::EmptyFrame { index: frame.index });
        }
        let expected = frame.expected_len().ok_or(EncodeError::TooLarge {
            index: frame.index,
            width: frame.width,
            height: frame.height,
        })?;
        if frame.data.len() != expected {
            return Err(EncodeError::SizeMismatch {
                index: frame.index,
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.data.len(),
            });
        }

        let (pixels, color) = match frame.format {
            PixelFormat::Rgb24 => (frame.data.to_vec(), ExtendedColorType::Rgb8),
            PixelFormat::Gray8 => (frame.data.to_vec(), ExtendedColorType::L8),
            planar => (yuv_to_rgb(frame, planar), ExtendedColorType::Rgb8),
        };

        let mut out = Vec::with_capacity(expected / 8);
        ImageJpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(&pixels, frame.width, frame.height, color)
            .map_err(|source| EncodeError::Codec {
                index: frame.index,
                source,
            })?;
        Ok(Bytes::from(out))
    }
}

/// BT.601 limited-range planar YUV to packed RGB.
fn yuv_to_rgb(frame: &RawFrame, format: PixelFormat) -> Vec<u8> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let (cw, ch) = format.chroma_dims(frame.width, frame.height);
    let (x_shift, y_shift) = match format {
        PixelFormat::Yuv420 => (1, 1),
        PixelFormat::Yuv422 => (1, 0),
        _ => (0, 0),
    };

    let data = &frame.data[..];
    let (y_plane, chroma) = data.split_at(w * h);
    let (u_plane, v_plane) = chroma.split_at(cw * ch);

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let chroma_row = (row >> y_shift) * cw;
        for col in 0..w {
            let c = y_plane[row * w + col] as i32 - 16;
            let ci = chroma_row + (col >> x_shift);
            let d = u_plane[ci] as i32 - 128;
            let e = v_plane[ci] as i32 - 128;

            rgb.push(clamp_u8((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c + 516 * d + 128) >> 8));
        }
    }
    rgb
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Pixels recovered from a JPEG payload
pub struct DecodedImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

pub fn decode_jpeg(data: &[u8]) -> Result<DecodedImage, DecodeErrors> {
    let mut decoder = JpegDecoder::new(data);
    let pixels = decoder.decode()?;
    let (width, height) = decoder.dimensions().unwrap_or_default();
    Ok(DecodedImage {
        width,
        height,
        pixels,
    })
}
