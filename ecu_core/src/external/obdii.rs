//! OBD-II Mode 01 protocol handler.
//!
//! Requests arrive on 0x7DF (functional) or 0x7E0..=0x7E7 (physical);
//! responses go out on 0x7E8. Live data is served from the external
//! cache — a missing value answers with NRC 0x22 rather than stale data.
//! Frame layout: `[len, mode, pid, data...]`, negative responses
//! `[0x03, 0x7F, mode, nrc]`.

use std::collections::BTreeMap;

use ecu_common::msg::{
    CanMessage, MSG_COOLANT_TEMP, MSG_ENGINE_LOAD, MSG_ENGINE_RPM, MSG_INTAKE_AIR_TEMP,
    MSG_MANIFOLD_PRESSURE, MSG_THROTTLE_POSITION, MSG_VEHICLE_SPEED,
};

use super::cache::{CacheMapping, ExternalCanBusCache};

// ─── Protocol constants ─────────────────────────────────────────────

pub const OBDII_REQUEST_ID: u32 = 0x7DF;
pub const OBDII_PHYSICAL_REQUEST_BASE: u32 = 0x7E0;
pub const OBDII_PHYSICAL_REQUEST_END: u32 = 0x7E7;
pub const OBDII_RESPONSE_ID: u32 = 0x7E8;

pub const OBDII_MODE_CURRENT_DATA: u8 = 0x01;
pub const OBDII_POSITIVE_RESPONSE: u8 = 0x40;
pub const OBDII_NEGATIVE_RESPONSE: u8 = 0x7F;

pub const OBDII_NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
pub const OBDII_NRC_CONDITIONS_NOT_CORRECT: u8 = 0x22;
pub const OBDII_NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;

// Mode 01 PIDs.
pub const OBDII_PID_SUPPORTED_01_20: u8 = 0x00;
pub const OBDII_PID_ENGINE_LOAD: u8 = 0x04;
pub const OBDII_PID_COOLANT_TEMP: u8 = 0x05;
pub const OBDII_PID_MANIFOLD_PRESSURE: u8 = 0x0B;
pub const OBDII_PID_ENGINE_RPM: u8 = 0x0C;
pub const OBDII_PID_VEHICLE_SPEED: u8 = 0x0D;
pub const OBDII_PID_INTAKE_AIR_TEMP: u8 = 0x0F;
pub const OBDII_PID_THROTTLE_POSITION: u8 = 0x11;

/// Predefined PID → internal message mappings, loaded into the cache at
/// init.
pub const OBDII_CACHE_MAPPINGS: &[CacheMapping] = &[
    CacheMapping {
        external_key: OBDII_PID_ENGINE_LOAD as u32,
        internal_msg_id: MSG_ENGINE_LOAD,
        max_age_ms: 1000,
        description: "Engine load",
    },
    CacheMapping {
        external_key: OBDII_PID_COOLANT_TEMP as u32,
        internal_msg_id: MSG_COOLANT_TEMP,
        max_age_ms: 2000,
        description: "Coolant temperature",
    },
    CacheMapping {
        external_key: OBDII_PID_MANIFOLD_PRESSURE as u32,
        internal_msg_id: MSG_MANIFOLD_PRESSURE,
        max_age_ms: 500,
        description: "Manifold pressure",
    },
    CacheMapping {
        external_key: OBDII_PID_ENGINE_RPM as u32,
        internal_msg_id: MSG_ENGINE_RPM,
        max_age_ms: 500,
        description: "Engine RPM",
    },
    CacheMapping {
        external_key: OBDII_PID_VEHICLE_SPEED as u32,
        internal_msg_id: MSG_VEHICLE_SPEED,
        max_age_ms: 500,
        description: "Vehicle speed",
    },
    CacheMapping {
        external_key: OBDII_PID_INTAKE_AIR_TEMP as u32,
        internal_msg_id: MSG_INTAKE_AIR_TEMP,
        max_age_ms: 2000,
        description: "Intake air temperature",
    },
    CacheMapping {
        external_key: OBDII_PID_THROTTLE_POSITION as u32,
        internal_msg_id: MSG_THROTTLE_POSITION,
        max_age_ms: 500,
        description: "Throttle position",
    },
];

// ─── Encodings ──────────────────────────────────────────────────────

/// RPM × 4 as a big-endian 16-bit pair.
pub fn encode_rpm(rpm: f32) -> [u8; 2] {
    let quarter = (rpm.clamp(0.0, 16_383.75) * 4.0) as u16;
    quarter.to_be_bytes()
}

/// Speed in km/h, one byte.
pub fn encode_speed(kmh: f32) -> u8 {
    kmh.clamp(0.0, 255.0) as u8
}

/// Temperature with the +40 °C offset, one byte.
pub fn encode_temp(celsius: f32) -> u8 {
    (celsius + 40.0).clamp(0.0, 255.0) as u8
}

/// Percent scaled onto 0..=255.
pub fn encode_percent(percent: f32) -> u8 {
    (percent.clamp(0.0, 100.0) * 255.0 / 100.0) as u8
}

/// Absolute pressure in kPa, one byte.
pub fn encode_pressure_kpa(kpa: f32) -> u8 {
    kpa.clamp(0.0, 255.0) as u8
}

// ─── Statistics ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ObdiiStats {
    pub requests_received: u32,
    pub responses_sent: u32,
    pub mode01_requests: u32,
    pub supported_pid_requests: u32,
    pub unsupported_requests: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
    pub negative_responses: u32,
    pub malformed_requests: u32,
}

// ─── Handler ────────────────────────────────────────────────────────

type CustomPidHandler = Box<dyn FnMut(u8) -> Option<(u8, [u8; 4])>>;

/// Mode 01 request handler backed by the external cache.
pub struct ObdiiHandler {
    cache: ExternalCanBusCache,
    /// Supported-PID bitmask for 0x01..=0x20 (bit 31 = PID 0x01).
    supported_01_20: u32,
    custom_pids: BTreeMap<u8, CustomPidHandler>,
    stats: ObdiiStats,
}

impl ObdiiHandler {
    pub fn new(cache: ExternalCanBusCache) -> Self {
        let mut handler = Self {
            cache,
            supported_01_20: 0,
            custom_pids: BTreeMap::new(),
            stats: ObdiiStats::default(),
        };
        for mapping in OBDII_CACHE_MAPPINGS {
            handler.enable_standard_pid(mapping.external_key as u8, true);
        }
        handler
    }

    /// True for frames addressed to the OBD-II request range.
    pub fn is_obdii_request(msg: &CanMessage) -> bool {
        msg.id == OBDII_REQUEST_ID
            || (OBDII_PHYSICAL_REQUEST_BASE..=OBDII_PHYSICAL_REQUEST_END).contains(&msg.id)
    }

    /// Toggle a standard PID in the support mask.
    pub fn enable_standard_pid(&mut self, pid: u8, enable: bool) {
        if !(0x01..=0x20).contains(&pid) {
            return;
        }
        let bit = 1u32 << (32 - pid as u32);
        if enable {
            self.supported_01_20 |= bit;
        } else {
            self.supported_01_20 &= !bit;
        }
    }

    pub fn is_pid_supported(&self, pid: u8) -> bool {
        if self.custom_pids.contains_key(&pid) {
            return true;
        }
        if !(0x01..=0x20).contains(&pid) {
            return false;
        }
        self.supported_01_20 & (1u32 << (32 - pid as u32)) != 0
    }

    /// Register a vendor PID handler (takes precedence over standard
    /// decoding). The handler returns `(len, data)`.
    pub fn register_custom_pid<F>(&mut self, pid: u8, handler: F) -> bool
    where
        F: FnMut(u8) -> Option<(u8, [u8; 4])> + 'static,
    {
        self.custom_pids.insert(pid, Box::new(handler));
        true
    }

    pub fn unregister_custom_pid(&mut self, pid: u8) {
        self.custom_pids.remove(&pid);
    }

    /// Process a request frame; returns the response frame to transmit.
    pub fn process_request(&mut self, msg: &CanMessage) -> Option<CanMessage> {
        if !Self::is_obdii_request(msg) {
            return None;
        }
        self.stats.requests_received += 1;

        // [len, mode, pid]; len counts mode + pid (+ extra data).
        if msg.len < 3 || msg.buf[0] < 2 {
            self.stats.malformed_requests += 1;
            return None;
        }
        let mode = msg.buf[1];
        let pid = msg.buf[2];

        if mode != OBDII_MODE_CURRENT_DATA {
            self.stats.unsupported_requests += 1;
            return Some(self.negative_response(mode, OBDII_NRC_SERVICE_NOT_SUPPORTED));
        }
        self.stats.mode01_requests += 1;

        if pid == OBDII_PID_SUPPORTED_01_20 {
            self.stats.supported_pid_requests += 1;
            let mask = self.supported_01_20.to_be_bytes();
            return Some(self.positive_response(pid, &mask));
        }

        if let Some(custom) = self.custom_pids.get_mut(&pid) {
            return match custom(pid) {
                Some((len, data)) => {
                    let len = (len as usize).min(4);
                    let data = data[..len].to_vec();
                    Some(self.positive_response(pid, &data))
                }
                None => {
                    self.stats.cache_misses += 1;
                    Some(self.negative_response(mode, OBDII_NRC_CONDITIONS_NOT_CORRECT))
                }
            };
        }

        if !self.is_pid_supported(pid) {
            self.stats.unsupported_requests += 1;
            return Some(self.negative_response(mode, OBDII_NRC_REQUEST_OUT_OF_RANGE));
        }

        match self.cache.get_value(pid as u32, None) {
            Some(value) => {
                self.stats.cache_hits += 1;
                let (len, data) = Self::encode_pid(pid, value);
                Some(self.positive_response(pid, &data[..len as usize]))
            }
            None => {
                self.stats.cache_misses += 1;
                Some(self.negative_response(mode, OBDII_NRC_CONDITIONS_NOT_CORRECT))
            }
        }
    }

    fn encode_pid(pid: u8, value: f32) -> (u8, [u8; 4]) {
        let mut data = [0u8; 4];
        match pid {
            OBDII_PID_ENGINE_RPM => {
                data[..2].copy_from_slice(&encode_rpm(value));
                (2, data)
            }
            OBDII_PID_VEHICLE_SPEED => {
                data[0] = encode_speed(value);
                (1, data)
            }
            OBDII_PID_COOLANT_TEMP | OBDII_PID_INTAKE_AIR_TEMP => {
                data[0] = encode_temp(value);
                (1, data)
            }
            OBDII_PID_THROTTLE_POSITION | OBDII_PID_ENGINE_LOAD => {
                data[0] = encode_percent(value);
                (1, data)
            }
            OBDII_PID_MANIFOLD_PRESSURE => {
                data[0] = encode_pressure_kpa(value);
                (1, data)
            }
            _ => {
                // Unscaled single byte for anything without a dedicated
                // encoding.
                data[0] = value.clamp(0.0, 255.0) as u8;
                (1, data)
            }
        }
    }

    fn positive_response(&mut self, pid: u8, data: &[u8]) -> CanMessage {
        let mut buf = [0u8; 8];
        let n = data.len().min(4);
        buf[0] = 2 + n as u8;
        buf[1] = OBDII_MODE_CURRENT_DATA + OBDII_POSITIVE_RESPONSE;
        buf[2] = pid;
        buf[3..3 + n].copy_from_slice(&data[..n]);
        self.stats.responses_sent += 1;
        CanMessage::new(OBDII_RESPONSE_ID, &buf[..3 + n])
    }

    fn negative_response(&mut self, mode: u8, nrc: u8) -> CanMessage {
        self.stats.negative_responses += 1;
        self.stats.responses_sent += 1;
        CanMessage::new(OBDII_RESPONSE_ID, &[0x03, OBDII_NEGATIVE_RESPONSE, mode, nrc])
    }

    pub fn stats(&self) -> ObdiiStats {
        self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats = ObdiiStats::default();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
