//! Vendor-custom CAN message handling.
//!
//! Inbound frames decode through registered mappings (byte offset,
//! 1-2 byte width, endianness, scale, range) into internal float
//! publishes. Outbound messages are scheduled per-id: each interval the
//! handler pulls the mapped value from the cache and packs a frame.

use std::collections::BTreeMap;

use ecu_common::msg::{CanMessage, MSG_COOLANT_TEMP, MSG_ENGINE_RPM, MSG_VEHICLE_SPEED};
use tracing::debug;

use crate::bus::MessageBus;

use super::cache::{CacheMapping, ExternalCanBusCache};

// ─── Well-known external keys ───────────────────────────────────────

pub const CUSTOM_DASHBOARD_RPM: u32 = 0x1000_0001;
pub const CUSTOM_DASHBOARD_SPEED: u32 = 0x1000_0002;
pub const CUSTOM_DASHBOARD_TEMP: u32 = 0x1000_0003;

/// Predefined custom-key mappings, loaded into the cache at init.
pub const CUSTOM_CACHE_MAPPINGS: &[CacheMapping] = &[
    CacheMapping {
        external_key: CUSTOM_DASHBOARD_RPM,
        internal_msg_id: MSG_ENGINE_RPM,
        max_age_ms: 200,
        description: "Dashboard RPM",
    },
    CacheMapping {
        external_key: CUSTOM_DASHBOARD_SPEED,
        internal_msg_id: MSG_VEHICLE_SPEED,
        max_age_ms: 200,
        description: "Dashboard speed",
    },
    CacheMapping {
        external_key: CUSTOM_DASHBOARD_TEMP,
        internal_msg_id: MSG_COOLANT_TEMP,
        max_age_ms: 1000,
        description: "Dashboard temperature",
    },
];

// ─── Mappings ───────────────────────────────────────────────────────

/// How one inbound vendor frame decodes into an internal float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CustomRxMapping {
    pub external_can_id: u32,
    pub internal_msg_id: u32,
    pub byte_offset: u8,
    /// 1 or 2.
    pub byte_length: u8,
    pub big_endian: bool,
    pub scale: f32,
    pub min: f32,
    pub max: f32,
}

/// Scheduled outbound vendor frame, fed from the cache.
#[derive(Debug, Clone, Copy)]
pub struct CustomTxConfig {
    pub external_can_id: u32,
    /// Cache key supplying the value.
    pub external_key: u32,
    /// 0 = on demand only.
    pub interval_ms: u32,
}

#[derive(Debug, Clone, Copy)]
struct TxState {
    config: CustomTxConfig,
    last_tx_ms: Option<u32>,
}

/// Custom message statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomStats {
    pub messages_received: u32,
    pub messages_sent: u32,
    pub handler_calls: u32,
    pub format_errors: u32,
}

// ─── Handler ────────────────────────────────────────────────────────

pub struct CustomMessageHandler {
    cache: ExternalCanBusCache,
    rx_mappings: BTreeMap<u32, CustomRxMapping>,
    tx_configs: BTreeMap<u32, TxState>,
    stats: CustomStats,
}

impl CustomMessageHandler {
    pub fn new(cache: ExternalCanBusCache) -> Self {
        Self {
            cache,
            rx_mappings: BTreeMap::new(),
            tx_configs: BTreeMap::new(),
            stats: CustomStats::default(),
        }
    }

    /// Register (or replace) an inbound decode mapping.
    pub fn register_rx_mapping(&mut self, mapping: CustomRxMapping) -> bool {
        if mapping.byte_length == 0 || mapping.byte_length > 2 {
            return false;
        }
        self.rx_mappings.insert(mapping.external_can_id, mapping);
        true
    }

    pub fn unregister_rx_mapping(&mut self, external_can_id: u32) -> bool {
        self.rx_mappings.remove(&external_can_id).is_some()
    }

    /// Schedule a periodic outbound frame.
    pub fn configure_tx(&mut self, config: CustomTxConfig) {
        self.tx_configs.insert(
            config.external_can_id,
            TxState {
                config,
                last_tx_ms: None,
            },
        );
    }

    /// True when this frame id has a registered mapping.
    pub fn is_custom_message(&self, msg: &CanMessage) -> bool {
        self.rx_mappings.contains_key(&msg.id)
    }

    /// Decode an inbound frame and publish the internal float.
    pub fn process_message(&mut self, msg: &CanMessage, bus: &MessageBus) -> bool {
        let Some(mapping) = self.rx_mappings.get(&msg.id).copied() else {
            return false;
        };
        self.stats.messages_received += 1;
        self.stats.handler_calls += 1;

        let start = mapping.byte_offset as usize;
        let end = start + mapping.byte_length as usize;
        if end > msg.len as usize {
            self.stats.format_errors += 1;
            return false;
        }

        let raw = if mapping.byte_length == 1 {
            msg.buf[start] as u32
        } else if mapping.big_endian {
            u16::from_be_bytes([msg.buf[start], msg.buf[start + 1]]) as u32
        } else {
            u16::from_le_bytes([msg.buf[start], msg.buf[start + 1]]) as u32
        };

        let value = raw as f32 * mapping.scale;
        if value < mapping.min || value > mapping.max {
            self.stats.format_errors += 1;
            debug!(id = msg.id, value, "custom value out of range");
            return false;
        }

        bus.publish_float(mapping.internal_msg_id, value);
        true
    }

    /// Collect outbound frames that are due. The caller transmits them.
    pub fn update(&mut self, now_ms: u32) -> Vec<CanMessage> {
        let mut due = Vec::new();
        for state in self.tx_configs.values_mut() {
            let interval = state.config.interval_ms;
            if interval == 0 {
                continue;
            }
            let ready = match state.last_tx_ms {
                Some(last) => now_ms.saturating_sub(last) >= interval,
                None => true,
            };
            if !ready {
                continue;
            }
            if let Some(value) = self.cache.get_value(state.config.external_key, None) {
                due.push(CanMessage::new(
                    state.config.external_can_id,
                    &value.to_le_bytes(),
                ));
                state.last_tx_ms = Some(now_ms);
                self.stats.messages_sent += 1;
            }
        }
        due
    }

    /// Build an on-demand float frame.
    pub fn float_frame(external_can_id: u32, value: f32) -> CanMessage {
        CanMessage::new(external_can_id, &value.to_le_bytes())
    }

    pub fn rx_mapping_count(&self) -> usize {
        self.rx_mappings.len()
    }

    pub fn stats(&self) -> CustomStats {
        self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats = CustomStats::default();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
