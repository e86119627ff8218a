//! YUV4MPEG2 frame source
//!
//! Uncompressed 8-bit planar video with a one-line text header, e.g.
//! `YUV4MPEG2 W640 H360 F30000:1001 Ip A1:1 C420jpeg`, followed by frames that
//! each start with a `FRAME` line. Frames are handed out as zero-copy slices of
//! the input buffer.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::InvalidStream;
use crate::source::frame::{PixelFormat, RawFrame};
use crate::source::{validate_rate, FrameSource};

const MAGIC: &str = "YUV4MPEG2";
const FRAME_TAG: &[u8] = b"FRAME";

pub struct Y4mSource {
    data: Bytes,
    pos: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    rate: f64,
    frame_len: usize,
    index: u64,
    exhausted: bool,
}

impl Y4mSource {
    /// Parse the stream header and position the reader on the first frame.
    pub fn open(data: Bytes) -> Result<Self, InvalidStream> {
        let header_end = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| InvalidStream::new("missing YUV4MPEG2 header line"))?;
        let header = std::str::from_utf8(&data[..header_end])
            .map_err(|_| InvalidStream::new("header is not ASCII"))?;

        let mut tokens = header.split(' ').filter(|t| !t.is_empty());
        if tokens.next() != Some(MAGIC) {
            return Err(InvalidStream::new("not a YUV4MPEG2 stream"));
        }

        let mut width = None;
        let mut height = None;
        let mut rate = None;
        let mut format = PixelFormat::Yuv420;

        for token in tokens {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('W') => width = Some(parse_dimension("width", value)?),
                Some('H') => height = Some(parse_dimension("height", value)?),
                Some('F') => rate = Some(parse_ratio(value)?),
                Some('C') => format = parse_colorspace(value)?,
                // interlacing, aspect ratio and extensions don't affect decoding
                _ => {}
            }
        }

        let width = width.ok_or_else(|| InvalidStream::new("header lacks W"))?;
        let height = height.ok_or_else(|| InvalidStream::new("header lacks H"))?;
        let rate = validate_rate(rate.ok_or_else(|| InvalidStream::new("header lacks F"))?)?;
        let frame_len = format
            .frame_len(width, height)
            .ok_or_else(|| InvalidStream::new(format!("frame size {width}x{height} overflows")))?;

        debug!(width, height, rate, ?format, "Opened YUV4MPEG2 stream");

        Ok(Self {
            frame_len,
            data,
            pos: header_end + 1,
            width,
            height,
            format,
            rate,
            index: 0,
            exhausted: false,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    fn finish(&mut self) -> Option<RawFrame> {
        self.exhausted = true;
        None
    }
}

impl FrameSource for Y4mSource {
    fn rate(&self) -> f64 {
        self.rate
    }

    fn next_frame(&mut self) -> Option<RawFrame> {
        if self.exhausted || self.pos >= self.data.len() {
            return self.finish();
        }

        let rest = &self.data[self.pos..];
        let Some(line_len) = rest.iter().position(|&b| b == b'\n') else {
            warn!(index = self.index, "Unterminated FRAME header, ending stream");
            return self.finish();
        };
        if !rest[..line_len].starts_with(FRAME_TAG) {
            warn!(index = self.index, "Corrupt FRAME header, ending stream");
            return self.finish();
        }

        let start = self.pos + line_len + 1;
        let end = match start.checked_add(self.frame_len) {
            Some(end) if end <= self.data.len() => end,
            _ => {
                warn!(
                    index = self.index,
                    missing = self.frame_len - (self.data.len() - start).min(self.frame_len),
                    "Truncated final frame, ending stream"
                );
                return self.finish();
            }
        };

        let frame = RawFrame {
            index: self.index,
            width: self.width,
            height: self.height,
            format: self.format,
            data: self.data.slice(start..end),
        };
        self.pos = end;
        self.index += 1;
        Some(frame)
    }
}

fn parse_dimension(name: &str, value: &str) -> Result<u32, InvalidStream> {
    match value.parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(InvalidStream::new(format!("invalid {name} `{value}`"))),
    }
}

fn parse_ratio(value: &str) -> Result<f64, InvalidStream> {
    let invalid = || InvalidStream::new(format!("invalid frame rate `{value}`"));
    let (num, den) = value.split_once(':').ok_or_else(invalid)?;
    let num: u64 = num.parse().map_err(|_| invalid())?;
    let den: u64 = den.parse().map_err(|_| invalid())?;
    if den == 0 {
        return Err(invalid());
    }
    Ok(num as f64 / den as f64)
}

fn parse_colorspace(value: &str) -> Result<PixelFormat, InvalidStream> {
    match value {
        "420jpeg" | "420paldv" | "420mpeg2" | "420" => Ok(PixelFormat::Yuv420),
        "422" => Ok(PixelFormat::Yuv422),
        "444" => Ok(PixelFormat::Yuv444),
        "mono" => Ok(PixelFormat::Gray8),
        other => Err(InvalidStream::new(format!(
            "unsupported colour space `{other}`"
        ))),
    }
}

/// Serialises frames into a YUV4MPEG2 stream. Used to produce test patterns.
pub struct Y4mWriter {
    buf: BytesMut,
    frame_len: usize,
}

impl Y4mWriter {
    pub fn new(width: u32, height: u32, rate_num: u32, rate_den: u32, format: PixelFormat) -> Self {
        let colorspace = match format {
            PixelFormat::Yuv420 => "420jpeg",
            PixelFormat::Yuv422 => "422",
            PixelFormat::Yuv444 => "444",
            // RGB has no Y4M representation; callers get luma-only output
            PixelFormat::Gray8 | PixelFormat::Rgb24 => "mono",
        };
        let format = if format == PixelFormat::Rgb24 {
            PixelFormat::Gray8
        } else {
            format
        };

        let mut buf = BytesMut::new();
        buf.put_slice(
            format!("{MAGIC} W{width} H{height} F{rate_num}:{rate_den} Ip A1:1 C{colorspace}\n")
                .as_bytes(),
        );
        Self {
            buf,
            // no real frame can match a geometry this large
            frame_len: format.frame_len(width, height).unwrap_or(usize::MAX),
        }
    }

    /// Bytes every frame passed to [`push_frame`](Self::push_frame) must hold.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn push_frame(&mut self, planes: &[u8]) -> &mut Self {
        debug_assert_eq!(planes.len(), self.frame_len);
        self.buf.put_slice(FRAME_TAG);
        self.buf.put_u8(b'\n');
        self.buf.put_slice(planes);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A moving-gradient 4:2:0 test pattern with `frames` frames.
pub fn test_pattern(width: u32, height: u32, rate: u32, frames: usize) -> Bytes {
    let mut writer = Y4mWriter::new(width, height, rate, 1, PixelFormat::Yuv420);
    let luma = width as usize * height as usize;
    let mut planes = vec![128u8; writer.frame_len()];
    for n in 0..frames {
        for (i, px) in planes[..luma].iter_mut().enumerate() {
            let x = i % width as usize;
            *px = ((x + n * 4) % 220 + 16) as u8;
        }
        writer.push_frame(&planes);
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_header_and_frames() {
        let data = test_pattern(8, 4, 25, 3);
        let mut source = Y4mSource::open(data).unwrap();
        assert_eq!(source.rate(), 25.0);
        assert_eq!((source.width(), source.height()), (8, 4));
        assert_eq!(source.format(), PixelFormat::Yuv420);

        let frames: Vec<_> = std::iter::from_fn(|| source.next_frame()).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].index, 2);
        assert!(frames.iter().all(|f| Some(f.data.len()) == f.expected_len()));
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn fractional_rate() {
        let data = Bytes::from_static(b"YUV4MPEG2 W2 H2 F30000:1001 Cmono\nFRAME\n\x10\x10\x10\x10");
        let source = Y4mSource::open(data).unwrap();
        assert!((source.rate() - 29.97).abs() < 0.01);
        assert_eq!(source.format(), PixelFormat::Gray8);
    }

    #[test]
    fn rejects_bad_headers() {
        for header in [
            &b"RIFF W2 H2 F30:1\n"[..],
            b"YUV4MPEG2 W2 H2 F0:1\n",
            b"YUV4MPEG2 W2 H2 F30:0\n",
            b"YUV4MPEG2 W2 F30:1\n",
            b"YUV4MPEG2 W0 H2 F30:1\n",
            b"YUV4MPEG2 W2 H2 F30:1 C420p10\n",
            b"YUV4MPEG2 W2 H2 F30:1",
        ] {
            assert!(
                Y4mSource::open(Bytes::copy_from_slice(header)).is_err(),
                "{}",
                String::from_utf8_lossy(header)
            );
        }
    }

    #[test]
    fn huge_dimensions_are_invalid() {
        let data = Bytes::from_static(b"YUV4MPEG2 W4294967295 H4294967295 F30:1 C444\nFRAME\n\x00");
        let err = Y4mSource::open(data).err().unwrap();
        assert!(err.reason.contains("overflows"), "{err}");

        // fits in usize but not in the data: ends the stream cleanly
        let data = Bytes::from_static(b"YUV4MPEG2 W4294967295 H2 F30:1 Cmono\nFRAME\n\x00");
        let mut source = Y4mSource::open(data).unwrap();
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn truncated_frame_ends_stream() {
        let mut data = test_pattern(4, 4, 30, 2).to_vec();
        data.truncate(data.len() - 3);
        let mut source = Y4mSource::open(Bytes::from(data)).unwrap();
        assert!(source.next_frame().is_some());
        assert!(source.next_frame().is_none());
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn frame_params_are_ignored() {
        let data =
            Bytes::from_static(b"YUV4MPEG2 W1 H1 F1:1 Cmono\nFRAME Ixyz\n\x20FRAME\n\x30");
        let mut source = Y4mSource::open(data).unwrap();
        assert_eq!(source.next_frame().unwrap().data.as_ref(), b"\x20");
        assert_eq!(source.next_frame().unwrap().data.as_ref(), b"\x30");
    }
}
