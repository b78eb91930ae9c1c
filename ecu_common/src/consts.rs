//! System-wide constants for the ECU workspace.
//!
//! Single source of truth for all capacity limits and default timings.
//! Imported by all crates — no duplication permitted.

/// Maximum number of bus subscriptions.
pub const MAX_SUBSCRIBERS: usize = 64;

/// Internal bus queue depth (contract minimum is 256 slots).
pub const BUS_QUEUE_SIZE: usize = 256;

/// Maximum number of registered sensors.
pub const MAX_SENSORS: usize = 32;

/// Maximum number of registered outputs.
pub const MAX_OUTPUTS: usize = 24;

/// Maximum thermistor lookup-table length.
pub const MAX_THERM_TABLE: usize = 32;

/// Maximum serial forwarding rules.
pub const MAX_FORWARDING_RULES: usize = 16;

/// Maximum pending request-tracker entries.
pub const MAX_PENDING_REQUESTS: usize = 16;

/// Maximum registered parameters.
pub const MAX_PARAMETERS: usize = 48;

/// Storage write-back cache entries (contract minimum is 16).
pub const STORAGE_CACHE_SIZE: usize = 20;

/// Maximum key records the EEPROM backend directory holds.
pub const STORAGE_MAX_KEYS: usize = 64;

/// Default EEPROM backend capacity [bytes].
pub const STORAGE_DEFAULT_SIZE: usize = 4096;

/// Default system cycle time [µs] (1 kHz loop).
pub const CYCLE_TIME_US: u64 = 1000;

/// Minimum allowed cycle time [µs] for runtime config.
pub const CYCLE_TIME_US_MIN: u32 = 100;

/// Maximum allowed cycle time [µs] for runtime config.
pub const CYCLE_TIME_US_MAX: u32 = 100_000;

/// Default paddle debounce [ms].
pub const PADDLE_DEBOUNCE_MS: u16 = 200;

/// Default ADC resolution [bits].
pub const ADC_RESOLUTION_BITS: u8 = 12;

/// Default ADC reference voltage [V].
pub const ADC_VREF: f32 = 3.3;

/// Default cache entry freshness window [ms].
pub const CACHE_DEFAULT_MAX_AGE_MS: u32 = 1000;

/// Default request-tracker expiry [ms].
pub const REQUEST_TIMEOUT_MS: u32 = 5000;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ecu/ecu.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(BUS_QUEUE_SIZE >= 256);
        assert!(STORAGE_CACHE_SIZE >= 16);
        assert!(MAX_SUBSCRIBERS > 0);
        assert!(CYCLE_TIME_US as u32 >= CYCLE_TIME_US_MIN);
        assert!(CYCLE_TIME_US as u32 <= CYCLE_TIME_US_MAX);
        assert!(ADC_RESOLUTION_BITS <= 16);
    }

    #[test]
    fn storage_directory_fits_backend() {
        // Each directory record is 11 bytes on the wire.
        assert!(STORAGE_MAX_KEYS * 11 < STORAGE_DEFAULT_SIZE);
    }
}
