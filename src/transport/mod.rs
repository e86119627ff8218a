//! Channel transport boundary
//!
//! Delivery is at-least-once with no ordering guarantee, even for messages
//! sharing an ordering key. Callers must expect duplicates and reordering.

pub mod memory;
pub mod wire;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::PublishError;

pub use memory::MemoryTransport;
pub use wire::{PayloadEncoding, WireEvent};

/// Identifier the transport assigns to an accepted publish
pub type MessageId = u64;

/// A tagged byte message as it crosses the transport
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub ordering_key: String,
    pub attributes: BTreeMap<String, String>,
    pub data: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolves once the transport has accepted (acknowledged) the message.
    async fn publish(&self, message: WireMessage) -> Result<MessageId, PublishError>;

    /// Starts pushing deliveries into `sink`. Delivery stops when the returned
    /// handle is cancelled or dropped, or when `sink`'s receiver goes away.
    ///
    /// Must be called from within a tokio runtime.
    fn subscribe(&self, sink: flume::Sender<Delivery>) -> Result<SubscriptionHandle, PublishError>;
}

/// Settles a single delivery with the transport
pub trait Acker: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

/// A received message that must be acked or nacked.
///
/// Dropping an unsettled delivery nacks it so the transport can redeliver.
pub struct Delivery {
    pub message: WireMessage,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(message: WireMessage, acker: Box<dyn Acker>) -> Self {
        Self {
            message,
            acker: Some(acker),
        }
    }

    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// Keeps a subscription alive; cancelling or dropping it stops delivery
pub struct SubscriptionHandle {
    token: CancellationToken,
    _guard: DropGuard,
}

impl SubscriptionHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(self) {
        self.token.cancel();
    }
}
