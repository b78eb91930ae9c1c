//! Configuration manager: validated boot configuration plus persisted
//! overrides.
//!
//! The TOML file is the source of defaults; a handful of tunables (ECU
//! identity, paddle debounce, overrun thresholds) survive reflashes in
//! storage and override the file at boot. `initialize` must run before
//! any component consumes the configuration — a validation failure
//! refuses init.

use ecu_common::config::{ConfigError, EcuConfig};
use ecu_common::msg::{MSG_CONFIG_ECU_NAME, MSG_CONFIG_FIRMWARE_VERSION};
use tracing::{debug, info};

use crate::storage::StorageManager;

// Persisted override keys.
const KEY_PADDLE_DEBOUNCE: &str = "trans.paddle_debounce_ms";
const KEY_OVERRUN_DISENGAGE: &str = "trans.overrun.throttle_disengage";
const KEY_OVERRUN_ENGAGE: &str = "trans.overrun.throttle_engage";
const KEY_OVERRUN_MIN_SPEED: &str = "trans.overrun.min_speed";
const KEY_OVERRUN_BRAKING: &str = "trans.overrun.braking_speed";
const KEY_SERIAL_NUMBER: &str = "ecu.serial_number";

/// Owns the validated configuration for the lifetime of the process.
pub struct ConfigManager {
    config: EcuConfig,
    storage: StorageManager,
    loaded: bool,
}

impl ConfigManager {
    pub fn new(config: EcuConfig, storage: StorageManager) -> Self {
        Self {
            config,
            storage,
            loaded: false,
        }
    }

    /// Validate the boot configuration and apply persisted overrides.
    pub fn initialize(&mut self) -> Result<(), ConfigError> {
        self.config.validate()?;

        let overrides: [(&str, &mut f32); 4] = [
            (
                KEY_OVERRUN_DISENGAGE,
                &mut self.config.transmission.overrun.throttle_disengage_pct,
            ),
            (
                KEY_OVERRUN_ENGAGE,
                &mut self.config.transmission.overrun.throttle_engage_pct,
            ),
            (
                KEY_OVERRUN_MIN_SPEED,
                &mut self.config.transmission.overrun.min_speed_mph,
            ),
            (
                KEY_OVERRUN_BRAKING,
                &mut self.config.transmission.overrun.braking_speed_mph,
            ),
        ];
        for (key, slot) in overrides {
            let (value, found) = self.storage.load_float(key, *slot);
            if found {
                debug!(key, value, "persisted override applied");
                *slot = value.clamp(0.0, 100.0);
            }
        }

        let (debounce, found) = self.storage.load_float(
            KEY_PADDLE_DEBOUNCE,
            self.config.transmission.paddle_debounce_ms as f32,
        );
        if found {
            self.config.transmission.paddle_debounce_ms = debounce.clamp(10.0, 5000.0) as u16;
        }

        let (serial, found) = self
            .storage
            .load_float(KEY_SERIAL_NUMBER, self.config.identity.serial_number as f32);
        if found {
            self.config.identity.serial_number = serial as u32;
        }

        if let Some(name) = self.load_string(MSG_CONFIG_ECU_NAME) {
            self.config.identity.name = name;
        } else {
            // First boot: seed identity records.
            self.storage
                .save_bytes(MSG_CONFIG_ECU_NAME, self.config.identity.name.as_bytes());
            self.storage.save_bytes(
                MSG_CONFIG_FIRMWARE_VERSION,
                self.config.identity.firmware_version.as_bytes(),
            );
        }

        // The overridden configuration must still hold together.
        self.config.validate()?;
        self.loaded = true;
        info!(
            name = %self.config.identity.name,
            serial = self.config.identity.serial_number,
            "configuration loaded"
        );
        Ok(())
    }

    fn load_string(&self, key: u32) -> Option<String> {
        let mut buf = [0u8; 64];
        let n = self.storage.load_bytes(key, &mut buf)?;
        let n = n.min(buf.len());
        String::from_utf8(buf[..n].to_vec()).ok()
    }

    pub fn config(&self) -> &EcuConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn ecu_name(&self) -> &str {
        &self.config.identity.name
    }

    pub fn firmware_version(&self) -> &str {
        &self.config.identity.firmware_version
    }

    pub fn serial_number(&self) -> u32 {
        self.config.identity.serial_number
    }

    // ─── Runtime updates ────────────────────────────────────────────

    /// Persist a new ECU name.
    pub fn update_ecu_name(&mut self, name: &str) -> bool {
        if name.is_empty() || name.len() > 64 {
            return false;
        }
        if !self.storage.save_bytes(MSG_CONFIG_ECU_NAME, name.as_bytes()) {
            return false;
        }
        self.config.identity.name = name.to_string();
        true
    }

    /// Persist a new serial number.
    pub fn update_serial_number(&mut self, serial: u32) -> bool {
        if !self.storage.save_float(KEY_SERIAL_NUMBER, serial as f32) {
            return false;
        }
        self.config.identity.serial_number = serial;
        true
    }

    /// Persist the current transmission tuning values.
    pub fn persist_transmission_tuning(
        &self,
        paddle_debounce_ms: u16,
        throttle_disengage_pct: f32,
        throttle_engage_pct: f32,
        min_speed_mph: f32,
        braking_speed_mph: f32,
    ) -> bool {
        self.storage
            .save_float(KEY_PADDLE_DEBOUNCE, paddle_debounce_ms as f32)
            && self
                .storage
                .save_float(KEY_OVERRUN_DISENGAGE, throttle_disengage_pct)
            && self.storage.save_float(KEY_OVERRUN_ENGAGE, throttle_engage_pct)
            && self.storage.save_float(KEY_OVERRUN_MIN_SPEED, min_speed_mph)
            && self.storage.save_float(KEY_OVERRUN_BRAKING, braking_speed_mph)
    }

    /// Drop every persisted override and restore compiled defaults.
    pub fn reset_to_defaults(&mut self) -> bool {
        use crate::storage::{key_hash, storage_key};
        for key in [
            KEY_PADDLE_DEBOUNCE,
            KEY_OVERRUN_DISENGAGE,
            KEY_OVERRUN_ENGAGE,
            KEY_OVERRUN_MIN_SPEED,
            KEY_OVERRUN_BRAKING,
            KEY_SERIAL_NUMBER,
        ] {
            self.storage.delete_key(storage_key(key_hash(key)));
        }
        self.storage.delete_key(MSG_CONFIG_ECU_NAME);
        self.storage.delete_key(MSG_CONFIG_FIRMWARE_VERSION);
        self.config = EcuConfig::default();
        self.config.validate().is_ok()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::storage::backend::EepromBackend;
    use std::rc::Rc;

    fn storage() -> StorageManager {
        let bus = Rc::new(MessageBus::new());
        let storage = StorageManager::new(Box::new(EepromBackend::default()), bus);
        assert!(storage.init());
        storage
    }

    #[test]
    fn initialize_with_defaults() {
        let mut manager = ConfigManager::new(EcuConfig::default(), storage());
        assert!(!manager.is_loaded());
        manager.initialize().unwrap();
        assert!(manager.is_loaded());
        assert_eq!(manager.config().transmission.paddle_debounce_ms, 200);
    }

    #[test]
    fn invalid_configuration_refuses_init() {
        let mut config = EcuConfig::default();
        config.transmission.paddle_debounce_ms = 1; // below the floor
        let mut manager = ConfigManager::new(config, storage());
        assert!(manager.initialize().is_err());
        assert!(!manager.is_loaded());
    }

    #[test]
    fn persisted_overrides_apply() {
        let storage = storage();
        storage.save_float(KEY_PADDLE_DEBOUNCE, 350.0);
        storage.save_float(KEY_OVERRUN_DISENGAGE, 80.0);

        let mut manager = ConfigManager::new(EcuConfig::default(), storage);
        manager.initialize().unwrap();
        assert_eq!(manager.config().transmission.paddle_debounce_ms, 350);
        assert_eq!(
            manager.config().transmission.overrun.throttle_disengage_pct,
            80.0
        );
        // Untouched values keep their file defaults.
        assert_eq!(manager.config().transmission.overrun.throttle_engage_pct, 15.0);
    }

    #[test]
    fn first_boot_seeds_identity() {
        let storage = storage();
        let mut manager = ConfigManager::new(EcuConfig::default(), storage.clone());
        manager.initialize().unwrap();
        assert!(storage.key_exists(MSG_CONFIG_ECU_NAME));
        assert!(storage.key_exists(MSG_CONFIG_FIRMWARE_VERSION));
    }

    #[test]
    fn identity_survives_reboot() {
        let storage = storage();
        let mut manager = ConfigManager::new(EcuConfig::default(), storage.clone());
        manager.initialize().unwrap();
        assert!(manager.update_ecu_name("race-car-7"));
        assert!(manager.update_serial_number(1234));

        // Second boot against the same storage.
        let mut manager = ConfigManager::new(EcuConfig::default(), storage);
        manager.initialize().unwrap();
        assert_eq!(manager.ecu_name(), "race-car-7");
        assert_eq!(manager.serial_number(), 1234);
    }

    #[test]
    fn tuning_round_trips_through_storage() {
        let storage = storage();
        let manager = ConfigManager::new(EcuConfig::default(), storage.clone());
        assert!(manager.persist_transmission_tuning(300, 85.0, 10.0, 20.0, 40.0));

        let mut manager = ConfigManager::new(EcuConfig::default(), storage);
        manager.initialize().unwrap();
        let t = &manager.config().transmission;
        assert_eq!(t.paddle_debounce_ms, 300);
        assert_eq!(t.overrun.throttle_disengage_pct, 85.0);
        assert_eq!(t.overrun.throttle_engage_pct, 10.0);
        assert_eq!(t.overrun.min_speed_mph, 20.0);
        assert_eq!(t.overrun.braking_speed_mph, 40.0);
    }

    #[test]
    fn reset_to_defaults_clears_overrides() {
        let storage = storage();
        let mut manager = ConfigManager::new(EcuConfig::default(), storage.clone());
        manager.initialize().unwrap();
        manager.persist_transmission_tuning(400, 90.0, 5.0, 25.0, 50.0);
        assert!(manager.reset_to_defaults());
        assert!(!storage.key_exists(MSG_CONFIG_ECU_NAME));

        // A fresh boot sees pure defaults again... except values still
        // cached in the float cache are gone too (deleted keys).
        let mut manager = ConfigManager::new(EcuConfig::default(), storage);
        manager.initialize().unwrap();
        assert_eq!(manager.config().transmission.paddle_debounce_ms, 200);
    }
}
