//! Error taxonomy shared by the producer and consumer sides

use thiserror::Error;

/// The video stream could not be decoded or advertised an unusable rate.
/// Fatal: the session aborts before any frame is emitted.
#[derive(Debug, Error)]
#[error("invalid stream: {reason}")]
pub struct InvalidStream {
    pub reason: String,
}

impl InvalidStream {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The source provider could not hand out the video bytes.
#[derive(Debug, Error)]
#[error("source unavailable: {locator}: {reason}")]
pub struct SourceUnavailable {
    pub locator: String,
    pub reason: String,
}

/// A single raw frame could not be compressed. The emitter skips it.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame {index}: expected {expected} bytes for {width}x{height}, got {actual}")]
    SizeMismatch {
        index: u64,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("frame {index}: {width}x{height} is too large to address")]
    TooLarge { index: u64, width: u32, height: u32 },
    #[error("frame {index}: empty dimensions")]
    EmptyFrame { index: u64 },
    #[error("frame {index}: {source}")]
    Codec {
        index: u64,
        #[source]
        source: image::ImageError,
    },
}

/// A publish attempt was refused by the transport.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport unreachable")]
    Unreachable,
    #[error("transport rejected message: {0}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
    #[error("a subscription is already active")]
    AlreadySubscribed,
}

/// A message arrived that cannot be turned back into a frame.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("missing attribute `{0}`")]
    MissingAttribute(&'static str),
    #[error("attribute `{name}` has invalid value `{value}`")]
    InvalidAttribute { name: &'static str, value: String },
    #[error("payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
}

/// Failures that end a whole session. Everything per-frame is recovered locally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidStream(#[from] InvalidStream),
    #[error(transparent)]
    SourceUnavailable(#[from] SourceUnavailable),
    #[error("transport unreachable after {consecutive_failures} consecutive lost frames")]
    TransportUnreachable { consecutive_failures: u32 },
    #[error("subscription failed: {0}")]
    Subscribe(#[source] PublishError),
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
