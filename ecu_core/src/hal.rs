//! Hardware abstraction seam.
//!
//! The core never touches registers: every pin read/write goes through
//! [`EcuHal`]. Board bring-up code supplies the real implementation; the
//! bundled [`SimHal`] backs tests and simulation runs with plain arrays
//! plus injection/inspection helpers.
//!
//! Frequency inputs follow the deferred-ISR rule: the driver only
//! accumulates edge counts and timestamps; conversion and publishing
//! happen in the input manager's `update()`.

use std::cell::RefCell;
use std::rc::Rc;

use ecu_common::consts::{ADC_RESOLUTION_BITS, ADC_VREF};

/// Shared handle to the HAL. The output manager owns GPIO state by
/// convention; the input manager only reads.
pub type SharedHal = Rc<RefCell<dyn EcuHal>>;

/// Hardware access used by the input and output managers.
pub trait EcuHal {
    // ── Inputs ──
    /// Raw ADC counts for an analog pin.
    fn read_analog(&mut self, pin: u8) -> u16;
    /// Digital pin level (true = high).
    fn read_digital(&mut self, pin: u8) -> bool;
    /// Digital level from an I²C GPIO expander.
    fn expander_read(&mut self, device: u8, pin: u8) -> bool;
    /// Raw counts from an I²C ADC channel.
    fn expander_adc_read(&mut self, device: u8, channel: u8) -> u16;

    // ── Frequency capture (ISR-fed, drained by update) ──
    /// Edges accumulated on a pin since the last call (resets the counter).
    fn take_edge_count(&mut self, pin: u8) -> u32;
    /// Most recent edge-to-edge period and the absolute time of the last
    /// edge, if any edge pair has been captured.
    fn last_edge_period_us(&mut self, pin: u8) -> Option<(u64, u64)>;

    // ── Outputs ──
    fn configure_pwm(&mut self, pin: u8, frequency_hz: u32, resolution_bits: u8);
    fn configure_digital_output(&mut self, pin: u8, open_drain: bool);
    fn write_pwm(&mut self, pin: u8, duty_counts: u16);
    fn write_digital(&mut self, pin: u8, level: bool);
    fn write_dac(&mut self, pin: u8, millivolts: u16);
    fn write_spi(&mut self, channel: u8, value: u16);

    // ── ADC parameters ──
    fn adc_resolution_bits(&self) -> u8 {
        ADC_RESOLUTION_BITS
    }
    fn adc_vref(&self) -> f32 {
        ADC_VREF
    }
}

// ─── Simulation driver ──────────────────────────────────────────────

const SIM_PINS: usize = 64;

/// Pure-software HAL used by tests and the simulation binary.
///
/// Analog values are set in volts and converted through the configured
/// ADC resolution, so calibration paths run exactly as on hardware.
pub struct SimHal {
    analog_counts: [u16; SIM_PINS],
    digital_levels: [bool; SIM_PINS],
    expander_levels: [[bool; 16]; 4],
    expander_adc: [[u16; 4]; 4],
    edge_counts: [u32; SIM_PINS],
    edge_periods: [Option<(u64, u64)>; SIM_PINS],

    /// Last written PWM duty per pin [counts].
    pub pwm_duty: [u16; SIM_PINS],
    /// Last written digital level per pin.
    pub digital_out: [bool; SIM_PINS],
    /// Last written DAC value per pin [mV].
    pub dac_mv: [u16; SIM_PINS],
    /// Last value shifted out per SPI channel.
    pub spi_out: [u16; 8],
    /// (pin, frequency, resolution) of every PWM configure call.
    pub pwm_configs: Vec<(u8, u32, u8)>,
}

impl Default for SimHal {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHal {
    pub fn new() -> Self {
        Self {
            analog_counts: [0; SIM_PINS],
            // Idle-high: pulled-up digital inputs read inactive.
            digital_levels: [true; SIM_PINS],
            expander_levels: [[true; 16]; 4],
            expander_adc: [[0; 4]; 4],
            edge_counts: [0; SIM_PINS],
            edge_periods: [None; SIM_PINS],
            pwm_duty: [0; SIM_PINS],
            digital_out: [false; SIM_PINS],
            dac_mv: [0; SIM_PINS],
            spi_out: [0; 8],
            pwm_configs: Vec::new(),
        }
    }

    /// Shared handle for wiring into the managers.
    pub fn shared() -> Rc<RefCell<SimHal>> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Set an analog input in volts.
    pub fn set_analog_voltage(&mut self, pin: u8, volts: f32) {
        let full_scale = ((1u32 << ADC_RESOLUTION_BITS) - 1) as f32;
        let counts = (volts / ADC_VREF * full_scale).clamp(0.0, full_scale);
        self.analog_counts[pin as usize] = counts as u16;
    }

    /// Set a digital input level.
    pub fn set_digital(&mut self, pin: u8, level: bool) {
        self.digital_levels[pin as usize] = level;
    }

    /// Set an expander input level.
    pub fn set_expander(&mut self, device: u8, pin: u8, level: bool) {
        self.expander_levels[device as usize][pin as usize] = level;
    }

    /// Set an expander ADC channel in volts.
    pub fn set_expander_voltage(&mut self, device: u8, channel: u8, volts: f32) {
        let full_scale = ((1u32 << ADC_RESOLUTION_BITS) - 1) as f32;
        let counts = (volts / ADC_VREF * full_scale).clamp(0.0, full_scale);
        self.expander_adc[device as usize][channel as usize] = counts as u16;
    }

    /// Inject frequency edges as an ISR would.
    pub fn inject_edges(&mut self, pin: u8, count: u32, period_us: u64, last_edge_us: u64) {
        self.edge_counts[pin as usize] += count;
        self.edge_periods[pin as usize] = Some((period_us, last_edge_us));
    }
}

impl EcuHal for SimHal {
    fn read_analog(&mut self, pin: u8) -> u16 {
        self.analog_counts[pin as usize]
    }

    fn read_digital(&mut self, pin: u8) -> bool {
        self.digital_levels[pin as usize]
    }

    fn expander_read(&mut self, device: u8, pin: u8) -> bool {
        self.expander_levels[device as usize % 4][pin as usize % 16]
    }

    fn expander_adc_read(&mut self, device: u8, channel: u8) -> u16 {
        self.expander_adc[device as usize % 4][channel as usize % 4]
    }

    fn take_edge_count(&mut self, pin: u8) -> u32 {
        std::mem::take(&mut self.edge_counts[pin as usize])
    }

    fn last_edge_period_us(&mut self, pin: u8) -> Option<(u64, u64)> {
        self.edge_periods[pin as usize]
    }

    fn configure_pwm(&mut self, pin: u8, frequency_hz: u32, resolution_bits: u8) {
        self.pwm_configs.push((pin, frequency_hz, resolution_bits));
    }

    fn configure_digital_output(&mut self, _pin: u8, _open_drain: bool) {}

    fn write_pwm(&mut self, pin: u8, duty_counts: u16) {
        self.pwm_duty[pin as usize] = duty_counts;
    }

    fn write_digital(&mut self, pin: u8, level: bool) {
        self.digital_out[pin as usize] = level;
    }

    fn write_dac(&mut self, pin: u8, millivolts: u16) {
        self.dac_mv[pin as usize] = millivolts;
    }

    fn write_spi(&mut self, channel: u8, value: u16) {
        self.spi_out[channel as usize % 8] = value;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
