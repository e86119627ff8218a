//! Headless sink: decodes every frame and reports the achieved frame rate

use std::time::Instant;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, instrument};

use crate::codec::decode_jpeg;
use crate::display::FrameSink;
use crate::source::frame::Frame;

/// How often the sink logs its throughput, in frames
const REPORT_EVERY: u64 = 100;

pub struct DecodingSink {
    frames: u64,
    last_id: Option<u64>,
    window_start: Instant,
    dimensions: Option<(usize, usize)>,
}

impl Default for DecodingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodingSink {
    pub fn new() -> Self {
        Self {
            frames: 0,
            last_id: None,
            window_start: Instant::now(),
            dimensions: None,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_id(&self) -> Option<u64> {
        self.last_id
    }
}

impl FrameSink for DecodingSink {
    #[instrument(skip_all, fields(id = frame.id))]
    fn render(&mut self, frame: &Frame) -> Result<()> {
        let image = decode_jpeg(&frame.payload).map_err(|e| eyre!("frame {}: {e}", frame.id))?;

        if self.dimensions != Some((image.width, image.height)) {
            info!(width = image.width, height = image.height, "Playback resolution");
            self.dimensions = Some((image.width, image.height));
        }
        if let Some(last) = self.last_id {
            if frame.id > last + 1 {
                debug!(from = last, to = frame.id, "Playback jumped over lost frames");
            }
        }

        self.frames += 1;
        self.last_id = Some(frame.id);

        if self.frames % REPORT_EVERY == 0 {
            let elapsed = self.window_start.elapsed().as_secs_f64();
            info!(
                frames = self.frames,
                fps = REPORT_EVERY as f64 / elapsed.max(f64::EPSILON),
                advertised = frame.rate,
                "Playback progress"
            );
            self.window_start = Instant::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JpegEncoder;
    use crate::source::frame::{PixelFormat, RawFrame};
    use bytes::Bytes;

    #[test]
    fn decodes_and_counts() {
        let raw = RawFrame {
            index: 0,
            width: 8,
            height: 8,
            format: PixelFormat::Gray8,
            data: Bytes::from(vec![200; 64]),
        };
        let payload = JpegEncoder::default().encode(&raw).unwrap();

        let mut sink = DecodingSink::new();
        for id in [0, 1, 3] {
            sink.render(&Frame {
                id,
                payload: payload.clone(),
                rate: 30.0,
            })
            .unwrap();
        }
        assert_eq!(sink.frames(), 3);
        assert_eq!(sink.last_id(), Some(3));
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let mut sink = DecodingSink::new();
        let frame = Frame {
            id: 4,
            payload: Bytes::from_static(b"not a jpeg"),
            rate: 30.0,
        };
        assert!(sink.render(&frame).is_err());
        assert_eq!(sink.frames(), 0);
    }
}
