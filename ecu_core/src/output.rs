//! Output manager: subscription-driven actuation of PWM, digital, DAC,
//! SPI and virtual outputs.
//!
//! Each registered output configures its pin, then subscribes a handler
//! on its message id; the float payload drives the hardware through the
//! HAL. Writes closer together than the output's rate limit are dropped
//! (not queued) and counted. The manager owns all GPIO state — nothing
//! else in the system touches pins.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use ecu_common::consts::MAX_OUTPUTS;
use tracing::debug;

use crate::bus::{MessageBus, handler};
use crate::hal::SharedHal;

// ─── Definitions ────────────────────────────────────────────────────

/// Output kind with per-kind configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputKind {
    /// PWM output; incoming values are percent clamped to [min, max].
    Pwm {
        frequency_hz: u32,
        resolution_bits: u8,
        min_duty_pct: f32,
        max_duty_pct: f32,
        default_pct: f32,
    },
    /// Digital output; values >= 0.5 drive the active level.
    Digital {
        active_high: bool,
        open_drain: bool,
        default_state: bool,
    },
    /// DAC output; values map linearly into a millivolt range.
    Analog {
        min_value: f32,
        max_value: f32,
        min_mv: u16,
        max_mv: u16,
        default_value: f32,
    },
    /// Forward to an external shift register / relay board.
    Spi { channel: u8, default_value: u16 },
    /// No hardware write; internal trigger/log hook.
    Virtual,
}

/// Immutable output definition.
#[derive(Debug, Clone, Copy)]
pub struct OutputDefinition {
    pub pin: u8,
    pub kind: OutputKind,
    /// Message id this output listens on.
    pub msg_id: u32,
    /// Minimum time between writes [ms]; 0 disables limiting.
    pub rate_limit_ms: u32,
    pub name: &'static str,
}

bitflags! {
    /// Per-output fault flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OutputFaults: u8 {
        const HARDWARE = 0b0000_0001;
        const RANGE    = 0b0000_0010;
    }
}

struct Output {
    def: OutputDefinition,
    current_value: f32,
    /// Time of the last rate-limited write; `None` re-arms the limiter
    /// (fresh registration or safe-state reset).
    last_update_ms: Option<u32>,
    has_written: bool,
    faults: OutputFaults,
}

/// Output manager statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStats {
    pub total_outputs: u32,
    pub total_updates: u32,
    pub rate_limited: u32,
    pub fault_count: u32,
}

// ─── Manager ────────────────────────────────────────────────────────

struct OutputBank {
    outputs: heapless::Vec<Output, MAX_OUTPUTS>,
    hal: SharedHal,
    stats: OutputStats,
    last_status_ms: u32,
}

/// Handle to the output bank; clones share state so bus handlers can
/// drive outputs while `update()` runs from the main loop.
#[derive(Clone)]
pub struct OutputManager {
    bank: Rc<RefCell<OutputBank>>,
}

impl OutputManager {
    pub fn new(hal: SharedHal) -> Self {
        Self {
            bank: Rc::new(RefCell::new(OutputBank {
                outputs: heapless::Vec::new(),
                hal,
                stats: OutputStats::default(),
                last_status_ms: 0,
            })),
        }
    }

    /// Register outputs: configure each pin per kind, apply the declared
    /// default, and subscribe a dispatch handler on the output's message
    /// id. Returns how many were registered.
    pub fn register_outputs(&self, defs: &[OutputDefinition], bus: &MessageBus) -> usize {
        let mut registered = 0;
        for def in defs {
            let index = {
                let mut bank = self.bank.borrow_mut();
                let mut hal = bank.hal.borrow_mut();
                match def.kind {
                    OutputKind::Pwm {
                        frequency_hz,
                        resolution_bits,
                        ..
                    } => hal.configure_pwm(def.pin, frequency_hz, resolution_bits),
                    OutputKind::Digital { open_drain, .. } => {
                        hal.configure_digital_output(def.pin, open_drain)
                    }
                    _ => {}
                }
                drop(hal);

                let output = Output {
                    def: *def,
                    current_value: 0.0,
                    last_update_ms: None,
                    has_written: false,
                    faults: OutputFaults::empty(),
                };
                if bank.outputs.push(output).is_err() {
                    debug!(name = def.name, "output table full");
                    break;
                }
                bank.stats.total_outputs += 1;
                bank.outputs.len() - 1
            };

            // Drive the declared default before any message arrives.
            self.bank.borrow_mut().write_default(index);

            let bank = self.bank.clone();
            bus.subscribe(
                def.msg_id,
                handler(move |msg| {
                    if let Some(value) = msg.unpack_float() {
                        let now_ms = (msg.timestamp_us / 1000) as u32;
                        bank.borrow_mut().apply_value(index, value, now_ms);
                    }
                }),
            );
            registered += 1;
        }
        registered
    }

    /// Direct write bypassing the bus; still subject to rate limiting.
    pub fn set_value(&self, index: usize, value: f32, now_ms: u32) -> bool {
        self.bank.borrow_mut().apply_value(index, value, now_ms)
    }

    /// Refresh hardware state (PWM duties are re-asserted) and publish
    /// the periodic status block.
    pub fn update(&self, now_us: u64, bus: &MessageBus) {
        let mut bank = self.bank.borrow_mut();
        for i in 0..bank.outputs.len() {
            if bank.outputs[i].has_written {
                let value = bank.outputs[i].current_value;
                bank.write_hardware(i, value);
            }
        }

        let now_ms = (now_us / 1000) as u32;
        if now_ms.saturating_sub(bank.last_status_ms) >= 1000 && now_ms > 0 {
            bank.last_status_ms = now_ms;
            let stats = bank.stats;
            let count = bank.outputs.len() as u8;
            drop(bank);
            let mut out = [0u8; 8];
            out[0..2].copy_from_slice(&(stats.total_updates.min(65535) as u16).to_le_bytes());
            out[2..4].copy_from_slice(&(stats.rate_limited.min(65535) as u16).to_le_bytes());
            out[4..6].copy_from_slice(&(stats.fault_count.min(65535) as u16).to_le_bytes());
            out[6] = count;
            bus.publish(ecu_common::msg::MSG_SYSTEM_OUTPUT_STATUS, &out);
        }
    }

    /// Force every output to its declared safe default, bypassing rate
    /// limits.
    pub fn all_outputs_safe_state(&self) {
        let mut bank = self.bank.borrow_mut();
        for i in 0..bank.outputs.len() {
            bank.write_default(i);
        }
    }

    pub fn stats(&self) -> OutputStats {
        self.bank.borrow().stats
    }

    pub fn output_count(&self) -> usize {
        self.bank.borrow().outputs.len()
    }

    /// Last commanded value of one output.
    pub fn current_value(&self, index: usize) -> Option<f32> {
        self.bank.borrow().outputs.get(index).map(|o| o.current_value)
    }

    /// Fault flags of one output.
    pub fn faults(&self, index: usize) -> Option<OutputFaults> {
        self.bank.borrow().outputs.get(index).map(|o| o.faults)
    }

    /// Index of the output listening on `msg_id`.
    pub fn find_output_by_msg_id(&self, msg_id: u32) -> Option<usize> {
        self.bank
            .borrow()
            .outputs
            .iter()
            .position(|o| o.def.msg_id == msg_id)
    }
}

impl OutputBank {
    /// Apply a value to one output, honoring its rate limit.
    fn apply_value(&mut self, index: usize, value: f32, now_ms: u32) -> bool {
        let Some(output) = self.outputs.get(index) else {
            return false;
        };
        let limit = output.def.rate_limit_ms;
        if limit > 0
            && let Some(last) = output.last_update_ms
            && now_ms.saturating_sub(last) < limit
        {
            self.stats.rate_limited += 1;
            return false;
        }
        if !value.is_finite() {
            self.outputs[index].faults |= OutputFaults::RANGE;
            self.stats.fault_count += 1;
            return false;
        }

        self.write_hardware(index, value);
        let output = &mut self.outputs[index];
        output.current_value = value;
        output.last_update_ms = Some(now_ms);
        output.has_written = true;
        self.stats.total_updates += 1;
        true
    }

    /// Raw hardware write for the output's kind.
    fn write_hardware(&mut self, index: usize, value: f32) {
        let def = self.outputs[index].def;
        let mut hal = self.hal.borrow_mut();
        match def.kind {
            OutputKind::Pwm {
                resolution_bits,
                min_duty_pct,
                max_duty_pct,
                ..
            } => {
                let pct = value.clamp(min_duty_pct, max_duty_pct);
                let full_scale = ((1u32 << resolution_bits) - 1) as f32;
                let counts = (pct / 100.0 * full_scale).round() as u16;
                hal.write_pwm(def.pin, counts);
            }
            OutputKind::Digital { active_high, .. } => {
                let active = value >= 0.5;
                hal.write_digital(def.pin, active == active_high);
            }
            OutputKind::Analog {
                min_value,
                max_value,
                min_mv,
                max_mv,
                ..
            } => {
                let clamped = value.clamp(min_value, max_value);
                let span = max_value - min_value;
                let t = if span > 0.0 { (clamped - min_value) / span } else { 0.0 };
                let mv = min_mv as f32 + t * (max_mv as f32 - min_mv as f32);
                hal.write_dac(def.pin, mv as u16);
            }
            OutputKind::Spi { channel, .. } => {
                hal.write_spi(channel, value.max(0.0) as u16);
            }
            OutputKind::Virtual => {}
        }
    }

    /// Drive the declared default value (safe state) bypassing limits.
    fn write_default(&mut self, index: usize) {
        let def = self.outputs[index].def;
        let default = match def.kind {
            OutputKind::Pwm { default_pct, .. } => default_pct,
            OutputKind::Digital { default_state, .. } => {
                if default_state { 1.0 } else { 0.0 }
            }
            OutputKind::Analog { default_value, .. } => default_value,
            OutputKind::Spi { default_value, .. } => default_value as f32,
            OutputKind::Virtual => 0.0,
        };
        self.write_hardware(index, default);
        let output = &mut self.outputs[index];
        output.current_value = default;
        output.has_written = true;
        output.last_update_ms = None;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
