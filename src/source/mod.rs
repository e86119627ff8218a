//! Frame sources: decode a video byte stream into raw frames plus its rate

pub mod frame;
#[cfg(feature = "gstreamer-source")]
pub mod gst;
pub mod provider;
pub mod y4m;

pub use frame::{Frame, PixelFormat, RawFrame};
pub use provider::{FsSourceProvider, SourceLocator, SourceProvider};
pub use y4m::Y4mSource;

#[cfg(feature = "gstreamer-source")]
pub use gst::GstSource;

/// Lazy, finite, single-pass sequence of raw frames.
///
/// Implementors validate the stream and read the rate when they are opened;
/// a second pass needs a freshly opened source.
pub trait FrameSource {
    /// Frames per second, always > 0.
    fn rate(&self) -> f64;

    /// Next decoded frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Option<RawFrame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn rate(&self) -> f64 {
        (**self).rate()
    }

    fn next_frame(&mut self) -> Option<RawFrame> {
        (**self).next_frame()
    }
}

/// Rejects rates a pacing loop cannot work with.
pub(crate) fn validate_rate(rate: f64) -> Result<f64, crate::error::InvalidStream> {
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(crate::error::InvalidStream::new(format!(
            "non-positive frame rate {rate}"
        )))
    }
}
