//! In-process transport with injectable link conditions
//!
//! Models a pub/sub topic with a single subscription: messages published
//! before anyone subscribes are retained, nacked deliveries are redelivered,
//! and the link can drop, duplicate and reorder messages or refuse publishes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::PublishError;
use crate::transport::{Acker, Delivery, MessageId, SubscriptionHandle, Transport, WireMessage};
use crate::TransportConfig;

/// How long reordered messages may sit in the hold area once the topic is idle
const HOLD_LINGER: Duration = Duration::from_millis(10);
/// Deliveries after which a repeatedly nacked message is dead-lettered
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    conditions: TransportConfig,
    state: Mutex<State>,
    notify: Notify,
    reachable: AtomicBool,
    fail_next: AtomicU32,
    next_id: AtomicU64,
}

struct Queued {
    message: WireMessage,
    /// Times this message has already been handed out
    attempts: u32,
}

struct State {
    ready: VecDeque<Queued>,
    /// Messages waiting to be released in random order
    held: Vec<WireMessage>,
    rng: StdRng,
    subscribed: bool,
    dead_lettered: u64,
}

impl State {
    fn release_over(&mut self, window: usize) {
        while self.held.len() > window {
            let i = self.rng.gen_range(0..self.held.len());
            let message = self.held.swap_remove(i);
            self.ready.push_back(Queued {
                message,
                attempts: 0,
            });
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryTransport {
    pub fn new(conditions: TransportConfig) -> Self {
        let rng = match conditions.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Arc::new(Inner {
                conditions,
                state: Mutex::new(State {
                    ready: VecDeque::new(),
                    held: Vec::new(),
                    rng,
                    subscribed: false,
                    dead_lettered: 0,
                }),
                notify: Notify::new(),
                reachable: AtomicBool::new(true),
                fail_next: AtomicU32::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// A perfect link: no loss, duplication or reordering.
    pub fn reliable() -> Self {
        Self::new(TransportConfig::default())
    }

    /// While unreachable every publish fails with [`PublishError::Unreachable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes the next `count` publishes fail with [`PublishError::Rejected`].
    pub fn fail_next(&self, count: u32) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Messages accepted but not yet handed to a subscriber.
    pub fn pending(&self) -> usize {
        let state = self.inner.state();
        state.ready.len() + state.held.len()
    }

    /// Number of publishes the transport acknowledged, including dropped ones.
    pub fn accepted(&self) -> u64 {
        self.inner.next_id.load(Ordering::SeqCst)
    }

    /// Messages dropped after [`MAX_DELIVERY_ATTEMPTS`] nacked deliveries.
    pub fn dead_lettered(&self) -> u64 {
        self.inner.state().dead_lettered
    }

    /// Releases every held message immediately.
    pub fn flush(&self) {
        self.inner.state().release_over(0);
        self.inner.notify.notify_one();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: WireMessage) -> Result<MessageId, PublishError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable);
        }
        if self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PublishError::Rejected("injected failure".into()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let conditions = &self.inner.conditions;
        {
            let mut state = self.inner.state();
            if conditions.drop_rate > 0.0 && state.rng.gen::<f64>() < conditions.drop_rate {
                trace!(id, "Link dropped message");
                return Ok(id);
            }
            let duplicate =
                conditions.duplicate_rate > 0.0 && state.rng.gen::<f64>() < conditions.duplicate_rate;
            if duplicate {
                trace!(id, "Link duplicated message");
                state.held.push(message.clone());
            }
            state.held.push(message);
            state.release_over(conditions.reorder_window);
        }
        self.inner.notify.notify_one();
        Ok(id)
    }

    fn subscribe(&self, sink: flume::Sender<Delivery>) -> Result<SubscriptionHandle, PublishError> {
        {
            let mut state = self.inner.state();
            if state.subscribed {
                return Err(PublishError::AlreadySubscribed);
            }
            state.subscribed = true;
        }

        let token = CancellationToken::new();
        tokio::spawn(deliver(self.inner.clone(), sink, token.clone()));
        debug!("Subscription opened");
        Ok(SubscriptionHandle::new(token))
    }
}

/// Clears the subscribed flag however the delivery task ends
struct Unsubscribe(Arc<Inner>);

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.0.state().subscribed = false;
        debug!("Subscription closed");
    }
}

async fn deliver(inner: Arc<Inner>, sink: flume::Sender<Delivery>, token: CancellationToken) {
    let _unsubscribe = Unsubscribe(inner.clone());

    loop {
        let (next, has_held) = {
            let mut state = inner.state();
            (state.ready.pop_front(), !state.held.is_empty())
        };

        match next {
            Some(Queued { message, attempts }) => {
                let acker = MemoryAcker {
                    inner: Arc::downgrade(&inner),
                    message: message.clone(),
                    attempts: attempts + 1,
                };
                let delivery = Delivery::new(message, Box::new(acker));
                // An unsent delivery is nacked on drop and goes back to the topic
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = sink.send_async(delivery) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(HOLD_LINGER), if has_held => {
                        inner.state().release_over(0);
                    }
                }
            }
        }
    }
}

struct MemoryAcker {
    inner: Weak<Inner>,
    message: WireMessage,
    attempts: u32,
}

impl Acker for MemoryAcker {
    fn ack(self: Box<Self>) {}

    fn nack(self: Box<Self>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut state = inner.state();
            if self.attempts >= MAX_DELIVERY_ATTEMPTS {
                state.dead_lettered += 1;
                debug!(attempts = self.attempts, "Dead-lettered message");
                return;
            }
            state.ready.push_back(Queued {
                message: self.message,
                attempts: self.attempts,
            });
        }
        inner.notify.notify_one();
    }
}
