//! Per-itinerary event fan-out.
//!
//! The bus decouples producers (the change engine, background enrichment)
//! from consumers (live stream connections). Publishing never blocks on a
//! slow consumer: each subscriber owns a bounded queue, and on overflow the
//! oldest queued event for that subscriber is evicted and the subscriber is
//! marked degraded. A publish with zero subscribers is not an error - the
//! event is dropped and counted, and polling clients catch up on their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use thiserror::Error;
use tracing::debug;

use crate::core::{ItineraryId, StreamEvent, SubjectId};
use crate::daemon::metrics;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscriber limit reached for {id} ({max_subscribers})")]
    SubscriberLimitReached {
        id: ItineraryId,
        max_subscribers: usize,
    },

    #[error("bus lock poisoned")]
    LockPoisoned,
}

struct SubscriberSlot {
    sender: Sender<StreamEvent>,
    /// Publisher-side handle used to evict the oldest event on overflow;
    /// crossbeam channels are MPMC so this is just another receiver.
    evictor: Receiver<StreamEvent>,
    degraded: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<ItineraryId, HashMap<u64, SubscriberSlot>>,
    next_subscriber_id: u64,
}

impl BusState {
    fn active_count(&self) -> usize {
        self.subscribers.values().map(HashMap::len).sum()
    }
}

/// Registry of live output channels, keyed by itinerary.
///
/// Injected into both the mutation path and the connection path; never a
/// global.
pub struct EventBus {
    state: Mutex<BusState>,
    max_subscribers_per_itinerary: usize,
    queue_capacity: usize,
    dropped_no_subscribers: AtomicU64,
}

impl EventBus {
    pub fn new(max_subscribers_per_itinerary: usize, queue_capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            max_subscribers_per_itinerary,
            queue_capacity: queue_capacity.max(1),
            dropped_no_subscribers: AtomicU64::new(0),
        }
    }

    /// Register a live output channel for an itinerary. The returned
    /// subscription unregisters itself on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        id: &ItineraryId,
        subject: SubjectId,
    ) -> Result<Subscription, BusError> {
        let mut state = self.lock_state()?;
        let subscriber_id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.wrapping_add(1);

        let slots = state.subscribers.entry(id.clone()).or_default();
        if slots.len() >= self.max_subscribers_per_itinerary {
            return Err(BusError::SubscriberLimitReached {
                id: id.clone(),
                max_subscribers: self.max_subscribers_per_itinerary,
            });
        }

        let (sender, receiver) = crossbeam::channel::bounded(self.queue_capacity);
        let degraded = Arc::new(AtomicBool::new(false));
        slots.insert(
            subscriber_id,
            SubscriberSlot {
                sender,
                evictor: receiver.clone(),
                degraded: Arc::clone(&degraded),
            },
        );
        let active = state.active_count();
        drop(state);
        metrics::set_active_subscriptions(active);
        debug!(itinerary = %id, subscriber = subscriber_id, %subject, "subscription registered");

        Ok(Subscription {
            bus: Arc::downgrade(self),
            itinerary: id.clone(),
            subscriber_id,
            subject,
            receiver,
            degraded,
        })
    }

    /// Fan an event out to every live subscriber for the itinerary.
    ///
    /// Delivery per subscriber is in publish order. Overflowing subscribers
    /// lose their oldest queued event, not the publisher's time.
    pub fn publish(&self, id: &ItineraryId, event: StreamEvent) {
        let state = match self.lock_state() {
            Ok(state) => state,
            Err(_) => return,
        };
        let Some(slots) = state.subscribers.get(id).filter(|s| !s.is_empty()) else {
            drop(state);
            self.dropped_no_subscribers.fetch_add(1, Ordering::Relaxed);
            metrics::events_dropped_no_subscribers();
            debug!(itinerary = %id, "no subscribers, event dropped");
            return;
        };

        for slot in slots.values() {
            let mut pending = event.clone();
            loop {
                match slot.sender.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        // Evict the oldest queued event and retry once per
                        // eviction; the queue can only be refilled by us.
                        if slot.evictor.try_recv().is_ok() {
                            slot.degraded.store(true, Ordering::Release);
                            metrics::subscriber_lagged();
                        }
                        pending = back;
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }
    }

    /// Events dropped because nobody was listening. Observable, not an
    /// error condition.
    pub fn dropped_no_subscribers(&self) -> u64 {
        self.dropped_no_subscribers.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, id: &ItineraryId) -> usize {
        self.lock_state()
            .map(|s| s.subscribers.get(id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn unsubscribe(&self, id: &ItineraryId, subscriber_id: u64) {
        let Ok(mut state) = self.lock_state() else {
            return;
        };
        if let Some(slots) = state.subscribers.get_mut(id) {
            slots.remove(&subscriber_id);
            if slots.is_empty() {
                state.subscribers.remove(id);
            }
        }
        let active = state.active_count();
        drop(state);
        metrics::set_active_subscriptions(active);
        debug!(itinerary = %id, subscriber = subscriber_id, "subscription unregistered");
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, BusState>, BusError> {
        self.state.lock().map_err(|_| BusError::LockPoisoned)
    }
}

/// Ephemeral binding of one output channel to an itinerary and subject.
/// Never persisted; dropping it deterministically unregisters the channel.
pub struct Subscription {
    bus: Weak<EventBus>,
    itinerary: ItineraryId,
    subscriber_id: u64,
    subject: SubjectId,
    receiver: Receiver<StreamEvent>,
    degraded: Arc<AtomicBool>,
}

impl Subscription {
    pub fn itinerary(&self) -> &ItineraryId {
        &self.itinerary
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    /// True once this subscriber has lost at least one event to overflow.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn try_recv(&self) -> Result<StreamEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StreamEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.itinerary, self.subscriber_id);
        }
    }
}
