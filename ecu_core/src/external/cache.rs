//! Lazy-loading cache between external keys and internal messages.
//!
//! External consumers (OBD-II scanners, dashboards) ask for values by
//! external key. The first request looks up the key's mapping, creates a
//! cache entry in the `Subscribed` state and subscribes to the internal
//! message id; from then on every internal publish refreshes the entry.
//! Freshness is inclusive: an entry exactly `max_age` old is still valid.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use ecu_common::consts::CACHE_DEFAULT_MAX_AGE_MS;
use tracing::debug;

use crate::bus::{MessageBus, handler};

/// Lifecycle of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No data yet and no subscription.
    Empty,
    /// Subscribed, waiting for the first internal publish.
    Subscribed,
    /// Fresh data available.
    Valid,
    /// Data older than the freshness window.
    Stale,
    /// Subscription failed.
    Error,
}

/// external key → internal message relationship.
#[derive(Debug, Clone, Copy)]
pub struct CacheMapping {
    pub external_key: u32,
    pub internal_msg_id: u32,
    pub max_age_ms: u32,
    pub description: &'static str,
}

/// One cached value.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    pub value: Option<f32>,
    pub last_update_ms: u32,
    pub internal_msg_id: u32,
    pub max_age_ms: u32,
    pub state: CacheState,
    pub request_count: u32,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub total_requests: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
    pub subscriptions_created: u32,
    pub messages_received: u32,
    pub entries_created: u32,
    pub stale_entries: u32,
    pub subscription_errors: u32,
}

struct CacheInner {
    entries: BTreeMap<u32, CacheEntry>,
    mappings: BTreeMap<u32, CacheMapping>,
    /// internal msg id → external keys fed by it.
    reverse: BTreeMap<u32, Vec<u32>>,
    /// Internal ids we already subscribed on.
    subscribed_ids: BTreeMap<u32, ()>,
    default_max_age_ms: u32,
    stats: CacheStats,
}

/// Cache handle; clones share entries with the bus subscriptions.
#[derive(Clone)]
pub struct ExternalCanBusCache {
    inner: Rc<RefCell<CacheInner>>,
    bus: Rc<MessageBus>,
}

impl ExternalCanBusCache {
    pub fn new(bus: Rc<MessageBus>, default_max_age_ms: u32) -> Self {
        let max_age = if default_max_age_ms == 0 {
            CACHE_DEFAULT_MAX_AGE_MS
        } else {
            default_max_age_ms
        };
        Self {
            inner: Rc::new(RefCell::new(CacheInner {
                entries: BTreeMap::new(),
                mappings: BTreeMap::new(),
                reverse: BTreeMap::new(),
                subscribed_ids: BTreeMap::new(),
                default_max_age_ms: max_age,
                stats: CacheStats::default(),
            })),
            bus,
        }
    }

    /// Register (or overwrite) a mapping.
    pub fn add_mapping(&self, mapping: CacheMapping) {
        let mut inner = self.inner.borrow_mut();
        if let Some(old) = inner.mappings.insert(mapping.external_key, mapping)
            && old.internal_msg_id != mapping.internal_msg_id
            && let Some(keys) = inner.reverse.get_mut(&old.internal_msg_id)
        {
            keys.retain(|k| *k != mapping.external_key);
        }
        inner
            .reverse
            .entry(mapping.internal_msg_id)
            .or_default()
            .push(mapping.external_key);
        // Keep the reverse list duplicate-free for repeated add_mapping.
        if let Some(keys) = inner.reverse.get_mut(&mapping.internal_msg_id) {
            keys.sort_unstable();
            keys.dedup();
        }
    }

    /// Remove a mapping (existing entries are dropped too).
    pub fn remove_mapping(&self, external_key: u32) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(mapping) = inner.mappings.remove(&external_key) else {
            return false;
        };
        if let Some(keys) = inner.reverse.get_mut(&mapping.internal_msg_id) {
            keys.retain(|k| *k != external_key);
        }
        inner.entries.remove(&external_key);
        true
    }

    /// Load a slice of predefined mappings.
    pub fn load_mappings(&self, mappings: &[CacheMapping]) {
        for mapping in mappings {
            self.add_mapping(*mapping);
        }
    }

    /// Core lazy-loading read.
    ///
    /// Returns the cached value when a fresh one exists. The first
    /// request for a mapped key creates the entry and subscribes to its
    /// internal message; unmapped keys return `None` without side
    /// effects beyond the miss counter.
    pub fn get_value(&self, external_key: u32, max_age_ms: Option<u32>) -> Option<f32> {
        let now_ms = self.bus.now_ms();
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.stats.total_requests += 1;

        if !inner.entries.contains_key(&external_key) {
            let Some(mapping) = inner.mappings.get(&external_key).copied() else {
                inner.stats.cache_misses += 1;
                return None;
            };
            let max_age = if mapping.max_age_ms == 0 {
                inner.default_max_age_ms
            } else {
                mapping.max_age_ms
            };
            inner.entries.insert(
                external_key,
                CacheEntry {
                    value: None,
                    last_update_ms: 0,
                    internal_msg_id: mapping.internal_msg_id,
                    max_age_ms: max_age,
                    state: CacheState::Subscribed,
                    request_count: 0,
                },
            );
            inner.stats.entries_created += 1;
            self.subscribe_internal(inner, mapping.internal_msg_id, external_key);
        }

        let default_age = inner.default_max_age_ms;
        let entry = inner.entries.get_mut(&external_key)?;
        entry.request_count += 1;

        let window = match max_age_ms {
            Some(0) | None => {
                if entry.max_age_ms == 0 {
                    default_age
                } else {
                    entry.max_age_ms
                }
            }
            Some(age) => age,
        };

        match entry.value {
            Some(value) if now_ms.saturating_sub(entry.last_update_ms) <= window => {
                entry.state = CacheState::Valid;
                inner.stats.cache_hits += 1;
                Some(value)
            }
            Some(_) => {
                entry.state = CacheState::Stale;
                inner.stats.cache_misses += 1;
                None
            }
            None => {
                inner.stats.cache_misses += 1;
                None
            }
        }
    }

    /// True when a fresh value exists (no subscription side effects for
    /// unmapped keys).
    pub fn has_fresh_value(&self, external_key: u32, max_age_ms: Option<u32>) -> bool {
        self.get_value(external_key, max_age_ms).is_some()
    }

    /// Ensure a mapped key is subscribed (entry in `Subscribed` state if
    /// no data has arrived yet).
    pub fn refresh_value(&self, external_key: u32) -> bool {
        self.get_value(external_key, None);
        self.inner.borrow().entries.contains_key(&external_key)
    }

    /// Mark an entry stale.
    pub fn invalidate_entry(&self, external_key: u32) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entries.get_mut(&external_key)
            && entry.state == CacheState::Valid
        {
            entry.state = CacheState::Stale;
        }
    }

    /// Drop every entry. Mappings and bus subscriptions survive; entries
    /// are recreated lazily on the next request.
    pub fn clear_all(&self) {
        self.inner.borrow_mut().entries.clear();
    }

    /// Downgrade entries whose data aged past the freshness window.
    pub fn update(&self, now_ms: u32) {
        let mut inner = self.inner.borrow_mut();
        let mut went_stale = 0;
        for entry in inner.entries.values_mut() {
            if entry.state == CacheState::Valid
                && entry.value.is_some()
                && now_ms.saturating_sub(entry.last_update_ms) > entry.max_age_ms
            {
                entry.state = CacheState::Stale;
                went_stale += 1;
            }
        }
        inner.stats.stale_entries += went_stale;
    }

    fn subscribe_internal(&self, inner: &mut CacheInner, internal_msg_id: u32, external_key: u32) {
        inner
            .reverse
            .entry(internal_msg_id)
            .or_default()
            .push(external_key);
        if let Some(keys) = inner.reverse.get_mut(&internal_msg_id) {
            keys.sort_unstable();
            keys.dedup();
        }

        if inner.subscribed_ids.contains_key(&internal_msg_id) {
            return;
        }

        let shared = self.inner.clone();
        let ok = self.bus.subscribe(
            internal_msg_id,
            handler(move |msg| {
                let Some(value) = msg.unpack_float() else {
                    return;
                };
                let now_ms = (msg.timestamp_us / 1000) as u32;
                let mut inner = shared.borrow_mut();
                inner.stats.messages_received += 1;
                let keys = inner.reverse.get(&msg.id).cloned().unwrap_or_default();
                for key in keys {
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        entry.value = Some(value);
                        entry.last_update_ms = now_ms;
                        entry.state = CacheState::Valid;
                    }
                }
            }),
        );

        if ok {
            inner.subscribed_ids.insert(internal_msg_id, ());
            inner.stats.subscriptions_created += 1;
        } else {
            inner.stats.subscription_errors += 1;
            if let Some(entry) = inner.entries.get_mut(&external_key) {
                entry.state = CacheState::Error;
            }
            debug!(internal_msg_id, "cache subscription failed");
        }
    }

    // ─── Introspection ──────────────────────────────────────────────

    pub fn entry_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.borrow().subscribed_ids.len()
    }

    pub fn fresh_entry_count(&self) -> usize {
        self.inner
            .borrow()
            .entries
            .values()
            .filter(|e| e.state == CacheState::Valid)
            .count()
    }

    pub fn entry(&self, external_key: u32) -> Option<CacheEntry> {
        self.inner.borrow().entries.get(&external_key).copied()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.borrow().stats
    }

    pub fn reset_statistics(&self) {
        self.inner.borrow_mut().stats = CacheStats::default();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ecu_common::msg::{MSG_ENGINE_RPM, MSG_VEHICLE_SPEED};

    const KEY_RPM: u32 = 0x0C;
    const KEY_SPEED: u32 = 0x0D;

    fn setup() -> (Rc<MessageBus>, ExternalCanBusCache) {
        let bus = Rc::new(MessageBus::new());
        let cache = ExternalCanBusCache::new(bus.clone(), 1000);
        cache.add_mapping(CacheMapping {
            external_key: KEY_RPM,
            internal_msg_id: MSG_ENGINE_RPM,
            max_age_ms: 1000,
            description: "Engine RPM",
        });
        cache.add_mapping(CacheMapping {
            external_key: KEY_SPEED,
            internal_msg_id: MSG_VEHICLE_SPEED,
            max_age_ms: 500,
            description: "Vehicle speed",
        });
        (bus, cache)
    }

    #[test]
    fn first_request_subscribes_without_data() {
        let (_bus, cache) = setup();
        assert_eq!(cache.entry_count(), 0);

        assert_eq!(cache.get_value(KEY_RPM, None), None);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.subscription_count(), 1);
        assert_eq!(cache.entry(KEY_RPM).unwrap().state, CacheState::Subscribed);
        assert_eq!(cache.stats().cache_misses, 1);
    }

    #[test]
    fn publish_then_request_is_valid() {
        let (bus, cache) = setup();
        cache.get_value(KEY_RPM, None); // lazy subscription

        bus.publish_float(MSG_ENGINE_RPM, 3500.0);
        bus.process();

        assert_eq!(cache.get_value(KEY_RPM, None), Some(3500.0));
        assert_eq!(cache.entry(KEY_RPM).unwrap().state, CacheState::Valid);
        assert_eq!(cache.stats().cache_hits, 1);
        assert_eq!(cache.stats().messages_received, 1);
    }

    #[test]
    fn unmapped_key_returns_none_without_entry() {
        let (_bus, cache) = setup();
        assert_eq!(cache.get_value(0xDEAD, None), None);
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.subscription_count(), 0);
    }

    #[test]
    fn age_equal_to_max_age_is_fresh() {
        let (bus, cache) = setup();
        cache.get_value(KEY_RPM, None);
        bus.set_time(1_000_000); // 1000 ms
        bus.publish_float(MSG_ENGINE_RPM, 3000.0);
        bus.process();

        // Exactly max_age (1000 ms) later: still valid (inclusive).
        bus.set_time(2_000_000);
        assert_eq!(cache.get_value(KEY_RPM, None), Some(3000.0));

        // One millisecond past the window: stale.
        bus.set_time(2_001_000);
        assert_eq!(cache.get_value(KEY_RPM, None), None);
        assert_eq!(cache.entry(KEY_RPM).unwrap().state, CacheState::Stale);
    }

    #[test]
    fn per_request_max_age_overrides_entry() {
        let (bus, cache) = setup();
        cache.get_value(KEY_RPM, None);
        bus.set_time(1_000_000);
        bus.publish_float(MSG_ENGINE_RPM, 3000.0);
        bus.process();

        bus.set_time(1_200_000); // 200 ms later
        assert_eq!(cache.get_value(KEY_RPM, Some(100)), None);
        assert_eq!(cache.get_value(KEY_RPM, Some(300)), Some(3000.0));
    }

    #[test]
    fn update_downgrades_aged_entries() {
        let (bus, cache) = setup();
        cache.get_value(KEY_SPEED, None);
        bus.set_time(1_000_000);
        bus.publish_float(MSG_VEHICLE_SPEED, 60.0);
        bus.process();
        assert_eq!(cache.get_value(KEY_SPEED, None), Some(60.0));

        // 600 ms later the 500 ms window has lapsed.
        cache.update(1600);
        assert_eq!(cache.entry(KEY_SPEED).unwrap().state, CacheState::Stale);
        assert_eq!(cache.stats().stale_entries, 1);
    }

    #[test]
    fn latest_publish_wins() {
        let (bus, cache) = setup();
        cache.get_value(KEY_RPM, None);
        bus.publish_float(MSG_ENGINE_RPM, 1000.0);
        bus.publish_float(MSG_ENGINE_RPM, 2000.0);
        bus.publish_float(MSG_ENGINE_RPM, 3000.0);
        bus.process();
        assert_eq!(cache.get_value(KEY_RPM, None), Some(3000.0));
    }

    #[test]
    fn invalidate_marks_stale() {
        let (bus, cache) = setup();
        cache.get_value(KEY_RPM, None);
        bus.publish_float(MSG_ENGINE_RPM, 3000.0);
        bus.process();
        cache.get_value(KEY_RPM, None);

        cache.invalidate_entry(KEY_RPM);
        assert_eq!(cache.entry(KEY_RPM).unwrap().state, CacheState::Stale);
        assert_eq!(cache.get_value(KEY_RPM, None), None);
    }

    #[test]
    fn clear_all_recreates_lazily() {
        let (bus, cache) = setup();
        cache.get_value(KEY_RPM, None);
        bus.publish_float(MSG_ENGINE_RPM, 3000.0);
        bus.process();
        assert_eq!(cache.entry_count(), 1);

        cache.clear_all();
        assert_eq!(cache.entry_count(), 0);
        // The bus subscription survives; the next request re-creates the
        // entry and the next publish fills it.
        cache.get_value(KEY_RPM, None);
        bus.publish_float(MSG_ENGINE_RPM, 4000.0);
        bus.process();
        assert_eq!(cache.get_value(KEY_RPM, None), Some(4000.0));
        assert_eq!(cache.subscription_count(), 1);
    }

    #[test]
    fn two_keys_one_internal_message() {
        let (bus, cache) = setup();
        cache.add_mapping(CacheMapping {
            external_key: 0x10000001,
            internal_msg_id: MSG_ENGINE_RPM,
            max_age_ms: 1000,
            description: "Dashboard RPM",
        });
        cache.get_value(KEY_RPM, None);
        cache.get_value(0x10000001, None);
        assert_eq!(cache.subscription_count(), 1); // one shared subscription

        bus.publish_float(MSG_ENGINE_RPM, 4200.0);
        bus.process();
        assert_eq!(cache.get_value(KEY_RPM, None), Some(4200.0));
        assert_eq!(cache.get_value(0x10000001, None), Some(4200.0));
    }

    #[test]
    fn mapping_overwrite_rewires_reverse_lookup() {
        let (bus, cache) = setup();
        cache.get_value(KEY_RPM, None);
        // Remap the key onto the speed message.
        cache.remove_mapping(KEY_RPM);
        cache.add_mapping(CacheMapping {
            external_key: KEY_RPM,
            internal_msg_id: MSG_VEHICLE_SPEED,
            max_age_ms: 1000,
            description: "Remapped",
        });
        cache.get_value(KEY_RPM, None);
        bus.publish_float(MSG_VEHICLE_SPEED, 88.0);
        bus.process();
        assert_eq!(cache.get_value(KEY_RPM, None), Some(88.0));
    }
}
