//! ECU configuration types and TOML loading.
//!
//! One strict (`deny_unknown_fields`) struct per configuration section,
//! serde defaults for every tunable, and a `validate()` pass with numeric
//! bounds. A validation failure at boot refuses init — the firmware never
//! runs on a half-checked configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::consts::{CYCLE_TIME_US, CYCLE_TIME_US_MAX, CYCLE_TIME_US_MIN, PADDLE_DEBOUNCE_MS};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `DeserializeOwned` type.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Identity ───────────────────────────────────────────────────────

fn default_ecu_name() -> String {
    "transmission-ecu".to_string()
}
fn default_firmware_version() -> String {
    "0.1.0".to_string()
}

/// ECU identity — persisted to storage and reported over the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// ECU display name.
    #[serde(default = "default_ecu_name")]
    pub name: String,
    /// Serial number.
    #[serde(default)]
    pub serial_number: u32,
    /// Firmware version string.
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_ecu_name(),
            serial_number: 0,
            firmware_version: default_firmware_version(),
        }
    }
}

// ─── Cycle timing ───────────────────────────────────────────────────

fn default_cycle_time_us() -> u32 {
    CYCLE_TIME_US as u32
}
fn default_status_interval_ms() -> u32 {
    1000
}

/// Super-loop timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CycleConfig {
    /// Loop period [µs].
    #[serde(default = "default_cycle_time_us")]
    pub cycle_time_us: u32,
    /// Status/heartbeat publish interval [ms].
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u32,
    /// CPU core for the RT loop (`rt` feature only).
    #[serde(default)]
    pub rt_cpu_core: usize,
    /// SCHED_FIFO priority (`rt` feature only).
    #[serde(default = "default_rt_priority")]
    pub rt_priority: i32,
}

fn default_rt_priority() -> i32 {
    80
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            cycle_time_us: default_cycle_time_us(),
            status_interval_ms: default_status_interval_ms(),
            rt_cpu_core: 0,
            rt_priority: default_rt_priority(),
        }
    }
}

// ─── Pin assignments ────────────────────────────────────────────────

/// Physical pin assignments for the transmission module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinConfig {
    pub trans_fluid_temp: u8,
    pub trans_park: u8,
    pub trans_reverse: u8,
    pub trans_neutral: u8,
    pub trans_drive: u8,
    pub trans_second: u8,
    pub trans_first: u8,
    pub paddle_upshift: u8,
    pub paddle_downshift: u8,
    pub sol_shift_a: u8,
    pub sol_shift_b: u8,
    pub sol_overrun: u8,
    pub sol_pressure: u8,
    pub sol_lockup: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            trans_fluid_temp: 21,
            trans_park: 22,
            trans_reverse: 23,
            trans_neutral: 24,
            trans_drive: 25,
            trans_second: 26,
            trans_first: 27,
            paddle_upshift: 28,
            paddle_downshift: 29,
            sol_shift_a: 40,
            sol_shift_b: 41,
            sol_overrun: 42,
            sol_pressure: 43,
            sol_lockup: 44,
        }
    }
}

// ─── I²C devices ────────────────────────────────────────────────────

/// One I²C device (expander or ADC) behind an opaque vendor driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct I2cDeviceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub address: u8,
    /// Which I²C interface the device hangs on.
    #[serde(default)]
    pub device_number: u8,
}

impl Default for I2cDeviceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: 0,
            device_number: 0,
        }
    }
}

fn default_i2c_frequency() -> u32 {
    400_000
}
fn default_i2c_interfaces() -> u8 {
    1
}

/// I²C bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct I2cConfig {
    #[serde(default = "default_i2c_interfaces")]
    pub number_of_interfaces: u8,
    #[serde(default = "default_i2c_frequency")]
    pub bus_frequency: u32,
    #[serde(default)]
    pub adc: I2cDeviceConfig,
    #[serde(default)]
    pub gpio_expander: I2cDeviceConfig,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            number_of_interfaces: default_i2c_interfaces(),
            bus_frequency: default_i2c_frequency(),
            adc: I2cDeviceConfig::default(),
            gpio_expander: I2cDeviceConfig::default(),
        }
    }
}

// ─── Transmission tuning ────────────────────────────────────────────

fn default_throttle_disengage() -> f32 {
    75.0
}
fn default_throttle_engage() -> f32 {
    15.0
}
fn default_min_speed() -> f32 {
    15.0
}
fn default_braking_speed() -> f32 {
    30.0
}

/// Overrun clutch tuning thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrunConfig {
    /// Throttle above this disengages the clutch [%].
    #[serde(default = "default_throttle_disengage")]
    pub throttle_disengage_pct: f32,
    /// Throttle below this engages the clutch [%].
    #[serde(default = "default_throttle_engage")]
    pub throttle_engage_pct: f32,
    /// Below this speed the clutch stays disengaged [mph].
    #[serde(default = "default_min_speed")]
    pub min_speed_mph: f32,
    /// Braking above this speed engages the clutch [mph].
    #[serde(default = "default_braking_speed")]
    pub braking_speed_mph: f32,
}

impl Default for OverrunConfig {
    fn default() -> Self {
        Self {
            throttle_disengage_pct: default_throttle_disengage(),
            throttle_engage_pct: default_throttle_engage(),
            min_speed_mph: default_min_speed(),
            braking_speed_mph: default_braking_speed(),
        }
    }
}

fn default_overheat_warn() -> f32 {
    120.0
}
fn default_overheat_limit() -> f32 {
    130.0
}

fn default_therm_t1() -> f32 {
    25.0
}
fn default_therm_r1() -> f32 {
    3500.0
}
fn default_therm_t2() -> f32 {
    110.0
}
fn default_therm_r2() -> f32 {
    250.0
}
fn default_therm_pullup() -> u16 {
    2200
}
fn default_therm_min() -> f32 {
    -20.0
}
fn default_therm_max() -> f32 {
    130.0
}

/// Fluid-temperature thermistor reference points (β model).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThermistorConfig {
    #[serde(default = "default_therm_t1")]
    pub ref_temp1_c: f32,
    #[serde(default = "default_therm_r1")]
    pub ref_resistance1_ohms: f32,
    #[serde(default = "default_therm_t2")]
    pub ref_temp2_c: f32,
    #[serde(default = "default_therm_r2")]
    pub ref_resistance2_ohms: f32,
    #[serde(default = "default_therm_pullup")]
    pub pullup_ohms: u16,
    #[serde(default = "default_therm_min")]
    pub table_min_c: f32,
    #[serde(default = "default_therm_max")]
    pub table_max_c: f32,
}

impl Default for ThermistorConfig {
    fn default() -> Self {
        Self {
            ref_temp1_c: default_therm_t1(),
            ref_resistance1_ohms: default_therm_r1(),
            ref_temp2_c: default_therm_t2(),
            ref_resistance2_ohms: default_therm_r2(),
            pullup_ohms: default_therm_pullup(),
            table_min_c: default_therm_min(),
            table_max_c: default_therm_max(),
        }
    }
}

fn default_paddle_debounce() -> u16 {
    PADDLE_DEBOUNCE_MS
}

/// Transmission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransmissionConfig {
    /// Paddle debounce window [ms].
    #[serde(default = "default_paddle_debounce")]
    pub paddle_debounce_ms: u16,
    /// Shift requests are denied above this fluid temperature [°C].
    #[serde(default = "default_overheat_warn")]
    pub overheat_warn_c: f32,
    /// Hard limit: safe state is forced above this temperature [°C].
    #[serde(default = "default_overheat_limit")]
    pub overheat_limit_c: f32,
    #[serde(default)]
    pub overrun: OverrunConfig,
    #[serde(default)]
    pub thermistor: ThermistorConfig,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            paddle_debounce_ms: default_paddle_debounce(),
            overheat_warn_c: default_overheat_warn(),
            overheat_limit_c: default_overheat_limit(),
            overrun: OverrunConfig::default(),
            thermistor: ThermistorConfig::default(),
        }
    }
}

// ─── External interfaces ────────────────────────────────────────────

fn default_can_baudrate() -> u32 {
    500_000
}
fn default_enabled_true() -> bool {
    true
}
fn default_cache_max_age() -> u32 {
    crate::consts::CACHE_DEFAULT_MAX_AGE_MS
}

/// External CAN bus gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalCanConfig {
    #[serde(default = "default_enabled_true")]
    pub enabled: bool,
    #[serde(default = "default_can_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_enabled_true")]
    pub enable_obdii: bool,
    #[serde(default = "default_enabled_true")]
    pub enable_custom_messages: bool,
    #[serde(default = "default_cache_max_age")]
    pub cache_default_max_age_ms: u32,
}

impl Default for ExternalCanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baudrate: default_can_baudrate(),
            enable_obdii: true,
            enable_custom_messages: true,
            cache_default_max_age_ms: default_cache_max_age(),
        }
    }
}

fn default_serial_baudrate() -> u32 {
    2_000_000
}
fn default_device_id() -> u8 {
    0x01
}

/// External point-to-point serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalSerialConfig {
    #[serde(default = "default_enabled_true")]
    pub enabled: bool,
    /// This ECU's device id on the link (0xFF is reserved for broadcast).
    #[serde(default = "default_device_id")]
    pub device_id: u8,
    #[serde(default = "default_serial_baudrate")]
    pub baudrate: u32,
}

impl Default for ExternalSerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_id: default_device_id(),
            baudrate: default_serial_baudrate(),
        }
    }
}

// ─── Top-level configuration ────────────────────────────────────────

/// Complete ECU configuration — loaded from `ecu.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcuConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub i2c: I2cConfig,
    #[serde(default)]
    pub transmission: TransmissionConfig,
    #[serde(default)]
    pub external_canbus: ExternalCanConfig,
    #[serde(default)]
    pub external_serial: ExternalSerialConfig,
}

impl EcuConfig {
    /// Load and validate a configuration file.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all fields against allowed bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "identity.name cannot be empty".to_string(),
            ));
        }

        let c = &self.cycle;
        if !(CYCLE_TIME_US_MIN..=CYCLE_TIME_US_MAX).contains(&c.cycle_time_us) {
            return Err(ConfigError::ValidationError(format!(
                "cycle.cycle_time_us={} out of range [{CYCLE_TIME_US_MIN}, {CYCLE_TIME_US_MAX}]",
                c.cycle_time_us
            )));
        }
        if c.status_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "cycle.status_interval_ms must be > 0".to_string(),
            ));
        }

        let t = &self.transmission;
        if !(10..=5000).contains(&t.paddle_debounce_ms) {
            return Err(ConfigError::ValidationError(format!(
                "transmission.paddle_debounce_ms={} out of range [10, 5000]",
                t.paddle_debounce_ms
            )));
        }
        if t.overheat_limit_c <= t.overheat_warn_c {
            return Err(ConfigError::ValidationError(format!(
                "transmission.overheat_limit_c ({}) must be > overheat_warn_c ({})",
                t.overheat_limit_c, t.overheat_warn_c
            )));
        }

        let o = &t.overrun;
        if !(0.0..=100.0).contains(&o.throttle_disengage_pct)
            || !(0.0..=100.0).contains(&o.throttle_engage_pct)
        {
            return Err(ConfigError::ValidationError(
                "transmission.overrun throttle thresholds must be within [0, 100]".to_string(),
            ));
        }
        if o.throttle_engage_pct >= o.throttle_disengage_pct {
            return Err(ConfigError::ValidationError(format!(
                "transmission.overrun.throttle_engage_pct ({}) must be < throttle_disengage_pct ({})",
                o.throttle_engage_pct, o.throttle_disengage_pct
            )));
        }
        if o.min_speed_mph < 0.0 || o.braking_speed_mph < 0.0 {
            return Err(ConfigError::ValidationError(
                "transmission.overrun speed thresholds must be >= 0".to_string(),
            ));
        }

        let th = &t.thermistor;
        if th.ref_resistance1_ohms <= 0.0 || th.ref_resistance2_ohms <= 0.0 {
            return Err(ConfigError::ValidationError(
                "transmission.thermistor reference resistances must be > 0".to_string(),
            ));
        }
        if th.ref_temp1_c == th.ref_temp2_c {
            return Err(ConfigError::ValidationError(
                "transmission.thermistor reference temperatures must differ".to_string(),
            ));
        }
        if th.table_min_c >= th.table_max_c {
            return Err(ConfigError::ValidationError(format!(
                "transmission.thermistor.table_min_c ({}) must be < table_max_c ({})",
                th.table_min_c, th.table_max_c
            )));
        }
        if th.pullup_ohms == 0 {
            return Err(ConfigError::ValidationError(
                "transmission.thermistor.pullup_ohms must be > 0".to_string(),
            ));
        }

        let can = &self.external_canbus;
        if can.enabled && !(125_000..=1_000_000).contains(&can.baudrate) {
            return Err(ConfigError::ValidationError(format!(
                "external_canbus.baudrate={} out of range [125000, 1000000]",
                can.baudrate
            )));
        }

        let ser = &self.external_serial;
        if ser.enabled && ser.device_id == 0xFF {
            return Err(ConfigError::ValidationError(
                "external_serial.device_id 0xFF is reserved for broadcast".to_string(),
            ));
        }

        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_validate() {
        let config = EcuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transmission.paddle_debounce_ms, PADDLE_DEBOUNCE_MS);
        assert_eq!(config.transmission.overrun.throttle_disengage_pct, 75.0);
        assert_eq!(config.transmission.overrun.throttle_engage_pct, 15.0);
    }

    #[test]
    fn load_minimal_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[identity]
name = "test-ecu"
serial_number = 42

[transmission]
paddle_debounce_ms = 150
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = EcuConfig::load_validated(file.path()).unwrap();
        assert_eq!(config.identity.name, "test-ecu");
        assert_eq!(config.identity.serial_number, 42);
        assert_eq!(config.transmission.paddle_debounce_ms, 150);
        // Untouched sections fall back to defaults.
        assert_eq!(config.cycle.cycle_time_us, CYCLE_TIME_US as u32);
    }

    #[test]
    fn missing_file_reported() {
        let result = EcuConfig::load_validated(Path::new("/nonexistent/ecu.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn unknown_field_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[identity]\nname = \"x\"\nbogus_field = 1\n").unwrap();
        file.flush().unwrap();

        let result = EcuConfig::load_validated(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn debounce_bounds_enforced() {
        let mut config = EcuConfig::default();
        config.transmission.paddle_debounce_ms = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        config.transmission.paddle_debounce_ms = 6000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrun_threshold_ordering_enforced() {
        let mut config = EcuConfig::default();
        config.transmission.overrun.throttle_engage_pct = 80.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overheat_ordering_enforced() {
        let mut config = EcuConfig::default();
        config.transmission.overheat_limit_c = 100.0;
        config.transmission.overheat_warn_c = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn thermistor_reference_points_must_differ() {
        let mut config = EcuConfig::default();
        config.transmission.thermistor.ref_temp2_c = config.transmission.thermistor.ref_temp1_c;
        assert!(config.validate().is_err());
    }

    #[test]
    fn broadcast_device_id_rejected() {
        let mut config = EcuConfig::default();
        config.external_serial.device_id = 0xFF;
        assert!(config.validate().is_err());
        config.external_serial.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cycle_time_bounds_enforced() {
        let mut config = EcuConfig::default();
        config.cycle.cycle_time_us = 10;
        assert!(config.validate().is_err());
    }
}
