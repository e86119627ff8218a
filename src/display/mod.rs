pub mod sink;

pub use sink::DecodingSink;

use color_eyre::Result;

use crate::source::frame::Frame;

/// Where played-out frames go. Stands in for an actual renderer.
pub trait FrameSink: Send {
    fn render(&mut self, frame: &Frame) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Frame) -> Result<()> + Send,
{
    fn render(&mut self, frame: &Frame) -> Result<()> {
        self(frame)
    }
}
