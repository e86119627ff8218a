pub mod emitter;
pub mod ingest;
pub mod playback;
pub mod reorder;

pub use emitter::{PacedEmitter, SessionReport};
pub use ingest::{IngestLoop, IngestReport};
pub use playback::{Playback, PlaybackReport};
pub use reorder::{Admission, PlaybackState, Pull, ReorderBuffer, ReorderStats, SharedReorder};
