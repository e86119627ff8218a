//! GStreamer-backed frame source for arbitrary containers (mp4, mkv, webm, ...)

use bytes::{Bytes, BytesMut};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::error::InvalidStream;
use crate::source::frame::{PixelFormat, RawFrame};
use crate::source::{validate_rate, FrameSource};

const PIPELINE: &str = "appsrc name=src is-live=false ! \
     decodebin ! \
     videoconvert ! \
     video/x-raw,format=RGB ! \
     appsink name=sink sync=false max-buffers=4 drop=false";

/// Decodes an in-memory container into packed RGB frames
pub struct GstSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    rate: f64,
    index: u64,
}

impl GstSource {
    pub fn open(data: Bytes) -> Result<Self, InvalidStream> {
        let fail = |what: &str, e: &dyn std::fmt::Display| InvalidStream::new(format!("{what}: {e}"));

        gst::init().map_err(|e| fail("failed to initialize GStreamer", &e))?;

        let pipeline = gst::parse::launch(PIPELINE)
            .map_err(|e| fail("failed to build pipeline", &e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| InvalidStream::new("pipeline description is not a pipeline"))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| InvalidStream::new("missing appsrc element"))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| InvalidStream::new("missing appsink element"))?;

        // The whole object is already in memory, hand it over in one buffer
        appsrc
            .push_buffer(gst::Buffer::from_slice(data))
            .map_err(|e| fail("appsrc refused buffer", &e))?;
        appsrc
            .end_of_stream()
            .map_err(|e| fail("appsrc refused end of stream", &e))?;

        pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| fail("failed to preroll", &e))?;

        // Preroll gives us the negotiated caps before any frame is consumed
        let preroll = appsink
            .pull_preroll()
            .map_err(|e| fail("stream could not be decoded", &e))?;
        let caps = preroll
            .caps()
            .ok_or_else(|| InvalidStream::new("decoded stream has no caps"))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| fail("failed to parse video info", &e))?;

        let fps = video_info.fps();
        if fps.denom() == 0 {
            return Err(InvalidStream::new("stream reports no frame rate"));
        }
        let rate = validate_rate(fps.numer() as f64 / fps.denom() as f64)?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| fail("failed to start pipeline", &e))?;

        info!(
            width = video_info.width(),
            height = video_info.height(),
            rate,
            "Opened GStreamer source"
        );

        Ok(Self {
            pipeline,
            appsink,
            rate,
            index: 0,
        })
    }

    fn pack_rgb(sample: &gst::Sample) -> Option<(u32, u32, Bytes)> {
        let caps = sample.caps()?;
        let info = gst_video::VideoInfo::from_caps(caps).ok()?;
        let buffer = sample.buffer()?;
        let map = buffer.map_readable().ok()?;

        let (width, height) = (info.width(), info.height());
        let row = width as usize * 3;
        let stride = info.stride()[0] as usize;
        let data = if stride == row {
            Bytes::copy_from_slice(&map.as_slice()[..row * height as usize])
        } else {
            // videoconvert pads rows to 4-byte boundaries
            let mut packed = BytesMut::with_capacity(row * height as usize);
            for line in map.as_slice().chunks(stride).take(height as usize) {
                packed.extend_from_slice(&line[..row]);
            }
            packed.freeze()
        };
        Some((width, height, data))
    }
}

impl FrameSource for GstSource {
    fn rate(&self) -> f64 {
        self.rate
    }

    fn next_frame(&mut self) -> Option<RawFrame> {
        let sample = match self.appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) => {
                if !self.appsink.is_eos() {
                    warn!(index = self.index, "GStreamer pipeline stopped early");
                }
                return None;
            }
        };

        let Some((width, height, data)) = Self::pack_rgb(&sample) else {
            warn!(index = self.index, "Unreadable sample, ending stream");
            return None;
        };

        let frame = RawFrame {
            index: self.index,
            width,
            height,
            format: PixelFormat::Rgb24,
            data,
        };
        self.index += 1;
        Some(frame)
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        debug!("Stopping GStreamer source");
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
