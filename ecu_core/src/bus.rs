//! Publish/subscribe message bus — the spine every component plugs into.
//!
//! Producers enqueue [`CanMessage`]s; [`MessageBus::process`] drains the
//! ring in FIFO order and delivers each message first to the optional
//! global broadcast handler (parameter routing / external forwarding),
//! then to every matching subscriber in registration order.
//!
//! Handlers may publish (nested publishes enqueue behind current work —
//! never delivered immediately) and may subscribe. All failures are
//! reported through return values and counters; nothing here is fatal.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ecu_common::consts::{BUS_QUEUE_SIZE, MAX_SUBSCRIBERS};
use ecu_common::msg::CanMessage;
use heapless::Deque;
use tracing::debug;

/// A subscription callback. Shared so delivery can run without holding
/// the subscriber-table borrow (handlers are free to subscribe/publish).
pub type SharedHandler = Rc<RefCell<dyn FnMut(&CanMessage)>>;

/// Wrap a closure as a bus handler.
pub fn handler<F: FnMut(&CanMessage) + 'static>(f: F) -> SharedHandler {
    Rc::new(RefCell::new(f))
}

struct Subscriber {
    msg_id: u32,
    handler: SharedHandler,
}

/// Bus statistics. All counters saturate rather than wrap.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    /// Messages delivered by `process()`.
    pub messages_processed: u32,
    /// Messages published in the current one-second window.
    pub messages_published: u32,
    /// Messages published during the previous full second.
    pub messages_per_second: u32,
    /// Publishes dropped because the ring was full.
    pub queue_overflows: u32,
    /// Subscriptions rejected because the table was full.
    pub subscribe_failures: u32,
}

/// The message bus. Cloned handles (`Rc<MessageBus>`) are shared with every
/// component; interior mutability keeps `publish` callable from handlers
/// running inside `process`.
pub struct MessageBus {
    subscribers: RefCell<heapless::Vec<Subscriber, MAX_SUBSCRIBERS>>,
    queue: RefCell<Deque<CanMessage, BUS_QUEUE_SIZE>>,
    global_broadcast: RefCell<Option<SharedHandler>>,
    stats: RefCell<BusStats>,
    processing: Cell<bool>,
    now_us: Cell<u64>,
    last_stats_reset_ms: Cell<u64>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: RefCell::new(heapless::Vec::new()),
            queue: RefCell::new(Deque::new()),
            global_broadcast: RefCell::new(None),
            stats: RefCell::new(BusStats::default()),
            processing: Cell::new(false),
            now_us: Cell::new(0),
            last_stats_reset_ms: Cell::new(0),
        }
    }

    /// Advance the bus clock. Published messages are stamped with this time.
    pub fn set_time(&self, now_us: u64) {
        self.now_us.set(now_us);
    }

    /// Current bus time [µs].
    pub fn now_us(&self) -> u64 {
        self.now_us.get()
    }

    /// Current bus time [ms].
    pub fn now_ms(&self) -> u32 {
        (self.now_us.get() / 1000) as u32
    }

    // ─── Subscription ───────────────────────────────────────────────

    /// Append a subscription. Multiple handlers per id are allowed;
    /// registration order is delivery order. Fails when the table is full.
    pub fn subscribe(&self, msg_id: u32, handler: SharedHandler) -> bool {
        let full = self
            .subscribers
            .borrow_mut()
            .push(Subscriber { msg_id, handler })
            .is_err();
        if full {
            self.stats.borrow_mut().subscribe_failures += 1;
            debug!(msg_id, "subscribe failed: table full");
            return false;
        }
        true
    }

    /// Install the single global broadcast slot (sees every message before
    /// the per-id subscribers).
    pub fn set_global_broadcast_handler(&self, handler: SharedHandler) {
        *self.global_broadcast.borrow_mut() = Some(handler);
    }

    /// Clear the global broadcast slot.
    pub fn clear_global_broadcast_handler(&self) {
        *self.global_broadcast.borrow_mut() = None;
    }

    /// Drop every subscription (test support).
    pub fn reset_subscribers(&self) {
        self.subscribers.borrow_mut().clear();
        *self.global_broadcast.borrow_mut() = None;
    }

    // ─── Publishing ─────────────────────────────────────────────────

    /// Enqueue a message. Fails for payloads over 8 bytes and on queue
    /// overflow (the newest message is dropped and counted).
    pub fn publish(&self, msg_id: u32, data: &[u8]) -> bool {
        if data.len() > 8 {
            return false;
        }
        let mut msg = CanMessage::new(msg_id, data);
        msg.timestamp_us = self.now_us.get();
        self.enqueue(msg)
    }

    /// Publish a pre-built message (external gateways hand frames through).
    pub fn publish_message(&self, mut msg: CanMessage) -> bool {
        if msg.len > 8 {
            return false;
        }
        msg.timestamp_us = self.now_us.get();
        self.enqueue(msg)
    }

    pub fn publish_float(&self, msg_id: u32, value: f32) -> bool {
        self.publish(msg_id, &value.to_le_bytes())
    }

    pub fn publish_u32(&self, msg_id: u32, value: u32) -> bool {
        self.publish(msg_id, &value.to_le_bytes())
    }

    pub fn publish_u16(&self, msg_id: u32, value: u16) -> bool {
        self.publish(msg_id, &value.to_le_bytes())
    }

    pub fn publish_u8(&self, msg_id: u32, value: u8) -> bool {
        self.publish(msg_id, &[value])
    }

    fn enqueue(&self, msg: CanMessage) -> bool {
        let mut stats = self.stats.borrow_mut();
        if self.queue.borrow_mut().push_back(msg).is_err() {
            stats.queue_overflows += 1;
            return false;
        }
        stats.messages_published += 1;
        true
    }

    // ─── Processing ─────────────────────────────────────────────────

    /// Drain the queue, delivering each message to the global broadcast
    /// handler first, then to matching subscribers in registration order.
    ///
    /// Publishes from handlers land behind current work and are drained in
    /// the same call. A nested `process` (from inside a handler) is a no-op.
    pub fn process(&self) {
        if self.processing.replace(true) {
            return;
        }

        loop {
            let msg = self.queue.borrow_mut().pop_front();
            let Some(msg) = msg else { break };

            let global = self.global_broadcast.borrow().clone();
            if let Some(h) = global {
                (h.borrow_mut())(&msg);
            }

            // Snapshot matching handlers so delivery runs without the
            // table borrow; handlers may subscribe mid-delivery.
            let mut matching: heapless::Vec<SharedHandler, MAX_SUBSCRIBERS> = heapless::Vec::new();
            for s in self.subscribers.borrow().iter() {
                if s.msg_id == msg.id {
                    let _ = matching.push(s.handler.clone());
                }
            }
            for h in matching {
                (h.borrow_mut())(&msg);
            }

            self.stats.borrow_mut().messages_processed += 1;
        }

        // Roll the per-second publish counter.
        let now_ms = self.now_ms() as u64;
        if now_ms.saturating_sub(self.last_stats_reset_ms.get()) >= 1000 {
            let mut stats = self.stats.borrow_mut();
            stats.messages_per_second = stats.messages_published;
            stats.messages_published = 0;
            self.last_stats_reset_ms.set(now_ms);
        }

        self.processing.set(false);
    }

    // ─── Introspection ──────────────────────────────────────────────

    /// Messages currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// True when the next publish would overflow.
    pub fn is_queue_full(&self) -> bool {
        self.queue.borrow().is_full()
    }

    /// Registered subscription count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    /// Snapshot of the statistics counters.
    pub fn stats(&self) -> BusStats {
        *self.stats.borrow()
    }

    /// Zero the statistics counters.
    pub fn reset_statistics(&self) {
        *self.stats.borrow_mut() = BusStats::default();
        self.last_stats_reset_ms.set(self.now_ms() as u64);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
