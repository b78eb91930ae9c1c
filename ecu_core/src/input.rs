//! Input manager: periodic sensor sampling, calibration, filtering,
//! publication.
//!
//! Sensors are registered once with an immutable definition (pin, kind,
//! calibration payload, target message id, update period, filter
//! strength) and sampled from `update()` whenever their period has
//! elapsed. Raw readings are converted to engineering units per kind,
//! smoothed, and published as floats on the sensor's message id. Invalid
//! conversions (rail-pinned voltages) skip the publish and raise the
//! sensor's error counter.
//!
//! Frequency inputs only ever consume ISR-accumulated edge data from the
//! HAL; no publishing happens outside `update()`.

pub mod calibration;
pub mod thermistor;

use ecu_common::consts::MAX_SENSORS;
use tracing::debug;

use crate::bus::MessageBus;
use crate::hal::SharedHal;
use self::calibration::{
    LinearCal, adc_counts_to_voltage, apply_filter, calibrate_digital, calibrate_linear,
    is_voltage_valid,
};
use self::thermistor::ThermistorTable;

// ─── Definitions ────────────────────────────────────────────────────

/// Frequency-counter sub-variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrequencyMode {
    /// Count edges over a fixed window.
    Polled { window_us: u32 },
    /// Edge-to-edge period captured by interrupt, published at a fixed rate.
    EdgeTimer { message_rate_hz: u8 },
}

/// Frequency-counter calibration payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyCal {
    pub mode: FrequencyMode,
    /// Pulses per engineering unit (e.g. teeth per revolution).
    pub pulses_per_unit: f32,
    /// Final scale applied after pulse conversion.
    pub scaling: f32,
    /// No edges for this long reads as 0 Hz.
    pub timeout_us: u32,
}

/// Sensor kind with its per-kind calibration payload.
#[derive(Debug, Clone)]
pub enum SensorKind {
    AnalogLinear(LinearCal),
    Thermistor(ThermistorTable),
    DigitalPullup { use_pullup: bool, invert: bool },
    FrequencyCounter(FrequencyCal),
    I2cExpanderDigital { device: u8, invert: bool },
    I2cAdc { device: u8, channel: u8, cal: LinearCal },
}

/// Immutable sensor definition, registered once.
#[derive(Debug, Clone)]
pub struct SensorDefinition {
    pub pin: u8,
    pub kind: SensorKind,
    /// Message id the calibrated value is published on.
    pub msg_id: u32,
    /// Sample period [µs]; 0 samples every `update()` call.
    pub update_interval_us: u32,
    /// Exponential filter strength 0..=255 (0 = none).
    pub filter_strength: u8,
    pub name: &'static str,
}

/// Mutable per-sensor runtime state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorRuntime {
    pub last_raw: f32,
    pub calibrated_value: f32,
    pub last_sample_us: u64,
    pub update_count: u32,
    pub error_count: u32,
    pub valid: bool,
    // Frequency bookkeeping.
    window_open: bool,
    window_start_us: u64,
    window_edges: u32,
    last_publish_us: u64,
}

struct Sensor {
    def: SensorDefinition,
    rt: SensorRuntime,
    filter_primed: bool,
}

// ─── Manager ────────────────────────────────────────────────────────

/// Owns the sensor table and drives sampling.
pub struct InputManager {
    sensors: heapless::Vec<Sensor, MAX_SENSORS>,
    hal: SharedHal,
    total_updates: u32,
    total_errors: u32,
}

impl InputManager {
    pub fn new(hal: SharedHal) -> Self {
        Self {
            sensors: heapless::Vec::new(),
            hal,
            total_updates: 0,
            total_errors: 0,
        }
    }

    /// Append sensor definitions. Existing entries are never modified.
    /// Returns how many were registered (stops at table capacity).
    pub fn register_sensors(&mut self, defs: &[SensorDefinition]) -> usize {
        let mut registered = 0;
        for def in defs {
            let sensor = Sensor {
                def: def.clone(),
                rt: SensorRuntime::default(),
                filter_primed: false,
            };
            if self.sensors.push(sensor).is_err() {
                debug!(name = def.name, "sensor table full");
                break;
            }
            registered += 1;
        }
        registered
    }

    /// Sample every sensor whose period has elapsed and publish results.
    /// Each sensor publishes at most once per call.
    pub fn update(&mut self, now_us: u64, bus: &MessageBus) {
        let hal = self.hal.clone();
        let mut hal = hal.borrow_mut();
        let resolution = hal.adc_resolution_bits();
        let vref = hal.adc_vref();

        for sensor in self.sensors.iter_mut() {
            let interval = sensor.def.update_interval_us as u64;
            let due = interval == 0
                || sensor.rt.update_count == 0
                || now_us.saturating_sub(sensor.rt.last_sample_us) >= interval;
            if !due {
                continue;
            }

            let result = match &sensor.def.kind {
                SensorKind::AnalogLinear(cal) => {
                    let counts = hal.read_analog(sensor.def.pin);
                    let volts = adc_counts_to_voltage(counts, resolution, vref);
                    sensor.rt.last_raw = volts;
                    if is_voltage_valid(volts) {
                        Some(calibrate_linear(cal, volts))
                    } else {
                        None
                    }
                }
                SensorKind::Thermistor(table) => {
                    let counts = hal.read_analog(sensor.def.pin);
                    let volts = adc_counts_to_voltage(counts, resolution, vref);
                    sensor.rt.last_raw = volts;
                    if is_voltage_valid(volts) {
                        Some(table.temperature_for_voltage(volts))
                    } else {
                        None
                    }
                }
                SensorKind::DigitalPullup { invert, .. } => {
                    let level = hal.read_digital(sensor.def.pin);
                    sensor.rt.last_raw = if level { 1.0 } else { 0.0 };
                    Some(calibrate_digital(*invert, level))
                }
                SensorKind::I2cExpanderDigital { device, invert } => {
                    let level = hal.expander_read(*device, sensor.def.pin);
                    sensor.rt.last_raw = if level { 1.0 } else { 0.0 };
                    Some(calibrate_digital(*invert, level))
                }
                SensorKind::I2cAdc { device, channel, cal } => {
                    let counts = hal.expander_adc_read(*device, *channel);
                    let volts = adc_counts_to_voltage(counts, resolution, vref);
                    sensor.rt.last_raw = volts;
                    if is_voltage_valid(volts) {
                        Some(calibrate_linear(cal, volts))
                    } else {
                        None
                    }
                }
                SensorKind::FrequencyCounter(cal) => {
                    Self::sample_frequency(&mut *hal, sensor.def.pin, cal, &mut sensor.rt, now_us)
                }
            };

            sensor.rt.last_sample_us = now_us;

            match result {
                Some(raw_value) => {
                    let filtered = if sensor.filter_primed {
                        apply_filter(
                            sensor.rt.calibrated_value,
                            raw_value,
                            sensor.def.filter_strength,
                        )
                    } else {
                        sensor.filter_primed = true;
                        raw_value
                    };
                    sensor.rt.calibrated_value = filtered;
                    sensor.rt.valid = true;
                    sensor.rt.update_count += 1;
                    self.total_updates += 1;
                    bus.publish_float(sensor.def.msg_id, filtered);
                }
                None => {
                    sensor.rt.valid = false;
                    sensor.rt.error_count += 1;
                    self.total_errors += 1;
                }
            }
        }
    }

    /// Frequency conversion. Returns `Some(engineering_value)` when a
    /// window/rate boundary elapsed, `None` (no publish, no error) when
    /// the sensor is still mid-window.
    fn sample_frequency(
        hal: &mut dyn crate::hal::EcuHal,
        pin: u8,
        cal: &FrequencyCal,
        rt: &mut SensorRuntime,
        now_us: u64,
    ) -> Option<f32> {
        match cal.mode {
            FrequencyMode::Polled { window_us } => {
                rt.window_edges += hal.take_edge_count(pin);
                if !rt.window_open {
                    rt.window_open = true;
                    rt.window_start_us = now_us;
                    return None;
                }
                let elapsed = now_us.saturating_sub(rt.window_start_us);
                if elapsed < window_us as u64 {
                    return None;
                }
                let hz = rt.window_edges as f32 * 1_000_000.0 / elapsed as f32;
                rt.window_edges = 0;
                rt.window_start_us = now_us;
                rt.last_raw = hz;
                Some(hz / cal.pulses_per_unit * cal.scaling)
            }
            FrequencyMode::EdgeTimer { message_rate_hz } => {
                let publish_interval = 1_000_000u64 / message_rate_hz.max(1) as u64;
                if rt.window_open && now_us.saturating_sub(rt.last_publish_us) < publish_interval {
                    return None;
                }
                rt.window_open = true;
                rt.last_publish_us = now_us;
                let hz = match hal.last_edge_period_us(pin) {
                    Some((period_us, last_edge_us))
                        if period_us > 0
                            && now_us.saturating_sub(last_edge_us) <= cal.timeout_us as u64 =>
                    {
                        1_000_000.0 / period_us as f32
                    }
                    _ => 0.0,
                };
                rt.last_raw = hz;
                Some(hz / cal.pulses_per_unit * cal.scaling)
            }
        }
    }

    // ─── Introspection ──────────────────────────────────────────────

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn valid_sensor_count(&self) -> usize {
        self.sensors.iter().filter(|s| s.rt.valid).count()
    }

    pub fn total_updates(&self) -> u32 {
        self.total_updates
    }

    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    /// Index of the sensor publishing on `msg_id`.
    pub fn find_sensor_by_msg_id(&self, msg_id: u32) -> Option<usize> {
        self.sensors.iter().position(|s| s.def.msg_id == msg_id)
    }

    /// Runtime snapshot for one sensor.
    pub fn sensor_status(&self, index: usize) -> Option<SensorRuntime> {
        self.sensors.get(index).map(|s| s.rt)
    }

    /// Name of one sensor.
    pub fn sensor_name(&self, index: usize) -> Option<&'static str> {
        self.sensors.get(index).map(|s| s.def.name)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
