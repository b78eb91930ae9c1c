//! Request tracker: per-channel correlation for parameter traffic.
//!
//! Gateways rewrite outbound requests with an id from the rotating
//! 1..=255 counter and record (id, channel) → (param id, issue time).
//! Responses remove the entry; `cleanup_timeouts` evicts the rest. The
//! table is bounded — on overflow the oldest entry is dropped.

use std::cell::RefCell;
use std::rc::Rc;

use ecu_common::consts::MAX_PENDING_REQUESTS;

/// Shared tracker handle — the CAN and serial gateways correlate through
/// the same instance, isolated by channel.
pub type SharedRequestTracker = Rc<RefCell<RequestTracker>>;

#[derive(Debug, Clone, Copy)]
struct TrackedRequest {
    request_id: u8,
    channel: u8,
    param_id: u32,
    issued_at_ms: u32,
}

/// Bounded pending-request table.
pub struct RequestTracker {
    pending: heapless::Vec<TrackedRequest, MAX_PENDING_REQUESTS>,
    next_id: u8,
    timeout_count: u32,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: heapless::Vec::new(),
            next_id: 0,
            timeout_count: 0,
        }
    }

    pub fn shared() -> SharedRequestTracker {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Next id from the rotating 1..=255 counter (0 is never issued).
    pub fn next_request_id(&mut self) -> u8 {
        self.next_id = if self.next_id == 255 { 1 } else { self.next_id + 1 };
        self.next_id
    }

    /// Track a new outbound request. On a full table the oldest entry is
    /// evicted. Returns the assigned request id.
    pub fn add_request(&mut self, channel: u8, param_id: u32, now_ms: u32) -> u8 {
        let request_id = self.next_request_id();
        if self.pending.is_full() {
            let oldest = self
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.issued_at_ms)
                .map(|(i, _)| i);
            if let Some(index) = oldest {
                self.pending.remove(index);
            }
        }
        let _ = self.pending.push(TrackedRequest {
            request_id,
            channel,
            param_id,
            issued_at_ms: now_ms,
        });
        request_id
    }

    /// Remove a pending request on response arrival. Returns the tracked
    /// parameter id when the (id, channel) pair was pending.
    pub fn remove_request(&mut self, request_id: u8, channel: u8) -> Option<u32> {
        let index = self
            .pending
            .iter()
            .position(|r| r.request_id == request_id && r.channel == channel)?;
        let entry = self.pending.remove(index);
        Some(entry.param_id)
    }

    /// True when (id, channel) is pending.
    pub fn is_pending(&self, request_id: u8, channel: u8) -> bool {
        self.pending
            .iter()
            .any(|r| r.request_id == request_id && r.channel == channel)
    }

    /// Parameter id of a pending request.
    pub fn pending_param_id(&self, request_id: u8, channel: u8) -> Option<u32> {
        self.pending
            .iter()
            .find(|r| r.request_id == request_id && r.channel == channel)
            .map(|r| r.param_id)
    }

    /// Evict entries older than `timeout_ms`. Returns how many expired.
    pub fn cleanup_timeouts(&mut self, timeout_ms: u32, now_ms: u32) -> usize {
        let before = self.pending.len();
        let mut i = 0;
        while i < self.pending.len() {
            if now_ms.saturating_sub(self.pending[i].issued_at_ms) > timeout_ms {
                self.pending.remove(i);
            } else {
                i += 1;
            }
        }
        let expired = before - self.pending.len();
        self.timeout_count += expired as u32;
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    /// Zero the timeout statistic (pending entries are state, not stats).
    pub fn reset_statistics(&mut self) {
        self.timeout_count = 0;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ecu_common::param::Channel;

    const USB: u8 = Channel::SerialUsb as u8;
    const SER1: u8 = Channel::Serial1 as u8;
    const CAN: u8 = Channel::CanBus as u8;

    #[test]
    fn starts_empty() {
        let tracker = RequestTracker::new();
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.timeout_count(), 0);
    }

    #[test]
    fn ids_start_at_one_and_increment() {
        let mut tracker = RequestTracker::new();
        assert_eq!(tracker.next_request_id(), 1);
        assert_eq!(tracker.next_request_id(), 2);
        assert_eq!(tracker.next_request_id(), 3);
    }

    #[test]
    fn id_counter_wraps_skipping_zero() {
        let mut tracker = RequestTracker::new();
        for _ in 0..255 {
            tracker.next_request_id();
        }
        assert_eq!(tracker.next_request_id(), 1);
    }

    #[test]
    fn add_and_remove_round_trip() {
        let mut tracker = RequestTracker::new();
        let id = tracker.add_request(USB, 0x1000, 100);
        assert_eq!(id, 1);
        assert_eq!(tracker.pending_count(), 1);
        assert!(tracker.is_pending(id, USB));
        assert_eq!(tracker.pending_param_id(id, USB), Some(0x1000));

        assert_eq!(tracker.remove_request(id, USB), Some(0x1000));
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.is_pending(id, USB));
    }

    #[test]
    fn multiple_requests_tracked_independently() {
        let mut tracker = RequestTracker::new();
        let a = tracker.add_request(USB, 0x1000, 10);
        let b = tracker.add_request(SER1, 0x2000, 20);
        let c = tracker.add_request(CAN, 0x3000, 30);
        assert_eq!((a, b, c), (1, 2, 3));

        tracker.remove_request(b, SER1);
        assert!(tracker.is_pending(a, USB));
        assert!(!tracker.is_pending(b, SER1));
        assert!(tracker.is_pending(c, CAN));
    }

    #[test]
    fn channel_isolates_requests() {
        let mut tracker = RequestTracker::new();
        let a = tracker.add_request(USB, 0x1000, 10);
        // Same request id never repeats while pending, but removal is
        // keyed by (id, channel): the wrong channel matches nothing.
        assert_eq!(tracker.remove_request(a, SER1), None);
        assert!(tracker.is_pending(a, USB));
    }

    #[test]
    fn ids_unique_among_pending_on_same_channel() {
        let mut tracker = RequestTracker::new();
        let mut ids = Vec::new();
        for i in 0..MAX_PENDING_REQUESTS {
            ids.push(tracker.add_request(USB, 0x1000 + i as u32, i as u32));
        }
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut tracker = RequestTracker::new();
        for i in 0..MAX_PENDING_REQUESTS {
            tracker.add_request(USB, 0x1000 + i as u32, i as u32);
        }
        assert_eq!(tracker.pending_count(), MAX_PENDING_REQUESTS);

        let newest = tracker.add_request(USB, 0x9999, 1000);
        assert_eq!(tracker.pending_count(), MAX_PENDING_REQUESTS);
        assert!(!tracker.is_pending(1, USB)); // oldest gone
        assert!(tracker.is_pending(newest, USB));
    }

    #[test]
    fn timeouts_evict_and_count() {
        let mut tracker = RequestTracker::new();
        tracker.add_request(USB, 0x1000, 0);
        tracker.add_request(USB, 0x2000, 4000);

        assert_eq!(tracker.cleanup_timeouts(1000, 5000), 1);
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.timeout_count(), 1);
        assert!(tracker.is_pending(2, USB));
    }

    #[test]
    fn reset_statistics_keeps_pending() {
        let mut tracker = RequestTracker::new();
        tracker.add_request(USB, 0x1000, 0);
        tracker.cleanup_timeouts(0, 10_000);
        assert_eq!(tracker.timeout_count(), 1);

        tracker.add_request(SER1, 0x2000, 10_000);
        tracker.reset_statistics();
        assert_eq!(tracker.timeout_count(), 0);
        assert_eq!(tracker.pending_count(), 1);
    }
}
