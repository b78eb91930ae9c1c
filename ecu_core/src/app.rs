//! System context: every component, constructed once and wired in
//! dependency order.
//!
//! `EcuApp` replaces process-wide singletons — main builds one, tests
//! build as many private ones as they like. Construction follows the
//! dependency order (storage backend → storage manager → config manager
//! → message bus consumers) and refuses to come up on configuration
//! validation failure.

use std::rc::Rc;

use ecu_common::config::{ConfigError, EcuConfig};
use ecu_common::msg::{MSG_PARAM_ECU_SERIAL_NUMBER, MSG_SYSTEM_HEALTH, MSG_SYSTEM_HEARTBEAT};
use tracing::info;

use crate::bus::MessageBus;
use crate::config::ConfigManager;
use crate::external::cache::ExternalCanBusCache;
use crate::external::canbus::ExternalCanBus;
use crate::external::serial::ExternalSerial;
use crate::external::transport::{CanTransport, SerialPort};
use crate::hal::SharedHal;
use crate::input::InputManager;
use crate::output::OutputManager;
use crate::params::ParameterRegistry;
use crate::params::tracker::{RequestTracker, SharedRequestTracker};
use crate::storage::StorageManager;
use crate::storage::backend::StorageBackend;
use crate::transmission::TransmissionControl;

/// Errors per status interval beyond which the health bit degrades.
const ERROR_RATE_THRESHOLD: u32 = 25;

/// The whole control core.
pub struct EcuApp {
    pub bus: Rc<MessageBus>,
    pub inputs: InputManager,
    pub outputs: OutputManager,
    pub transmission: TransmissionControl,
    pub cache: ExternalCanBusCache,
    pub canbus: Option<ExternalCanBus>,
    pub serial: Option<ExternalSerial>,
    pub registry: ParameterRegistry,
    pub tracker: SharedRequestTracker,
    pub storage: StorageManager,
    pub config: ConfigManager,

    loop_count: u32,
    loops_per_second: u32,
    last_loop_time_us: u64,
    last_stats_reset_ms: u32,
    last_status_ms: u32,
    last_error_total: u32,
    health_ok: bool,
}

impl EcuApp {
    /// Build and wire the full system. Ordered init: storage backend →
    /// storage manager → config manager → bus consumers. External
    /// gateways come up only when enabled and given a transport.
    pub fn new(
        boot_config: EcuConfig,
        hal: SharedHal,
        backend: Box<dyn StorageBackend>,
        can_transport: Option<Box<dyn CanTransport>>,
        serial_port: Option<Box<dyn SerialPort>>,
    ) -> Result<Self, ConfigError> {
        let bus = Rc::new(MessageBus::new());

        let storage = StorageManager::new(backend, bus.clone());
        if !storage.init() {
            return Err(ConfigError::ValidationError(
                "storage backend failed to start".to_string(),
            ));
        }

        let mut config = ConfigManager::new(boot_config, storage.clone());
        config.initialize()?;
        let cfg = config.config().clone();

        let mut inputs = InputManager::new(hal.clone());
        let outputs = OutputManager::new(hal);

        let transmission = TransmissionControl::new(bus.clone(), &cfg.transmission);
        let sensors = transmission.init(&cfg.transmission, &cfg.pins, &mut inputs, &outputs);
        info!(sensors, "transmission module registered");

        let registry = ParameterRegistry::new(bus.clone());
        registry.install_broadcast_handler();
        transmission.register_parameters(&registry);
        let serial_number = cfg.identity.serial_number;
        registry.register_parameter(
            MSG_PARAM_ECU_SERIAL_NUMBER,
            move || serial_number as f32,
            "ECU serial number",
        );

        let tracker = RequestTracker::shared();
        let cache =
            ExternalCanBusCache::new(bus.clone(), cfg.external_canbus.cache_default_max_age_ms);

        let canbus = match (cfg.external_canbus.enabled, can_transport) {
            (true, Some(transport)) => Some(ExternalCanBus::new(
                &cfg.external_canbus,
                transport,
                cache.clone(),
                bus.clone(),
                tracker.clone(),
            )),
            _ => None,
        };
        let serial = match (cfg.external_serial.enabled, serial_port) {
            (true, Some(port)) => Some(ExternalSerial::new(
                &cfg.external_serial,
                port,
                bus.clone(),
                tracker.clone(),
            )),
            _ => None,
        };

        info!(
            name = %config.ecu_name(),
            canbus = canbus.is_some(),
            serial = serial.is_some(),
            "system context initialized"
        );

        Ok(Self {
            bus,
            inputs,
            outputs,
            transmission,
            cache,
            canbus,
            serial,
            registry,
            tracker,
            storage,
            config,
            loop_count: 0,
            loops_per_second: 0,
            last_loop_time_us: 0,
            last_stats_reset_ms: 0,
            last_status_ms: 0,
            last_error_total: 0,
            health_ok: true,
        })
    }

    /// One super-loop pass in the fixed order.
    pub fn run_tick(&mut self, now_us: u64) {
        self.bus.set_time(now_us);
        let now_ms = (now_us / 1000) as u32;

        // Sample sensors; each manages its own period.
        self.inputs.update(now_us, &self.bus);
        // Route sensor data to the modules.
        self.bus.process();
        // Storage write-behind.
        self.storage.update(now_ms);
        // Refresh physical outputs.
        self.outputs.update(now_us, &self.bus);
        // Control pass.
        self.transmission.update(now_us);
        // External links.
        if let Some(serial) = &self.serial {
            serial.update(now_us);
        }
        if let Some(canbus) = self.canbus.as_mut() {
            canbus.update(now_us);
        }
        // Deliver everything the control pass and gateways produced.
        self.bus.process();

        self.track_loop(now_us, now_ms);
    }

    fn track_loop(&mut self, now_us: u64, now_ms: u32) {
        self.last_loop_time_us = now_us;
        self.loop_count += 1;
        if now_ms.saturating_sub(self.last_stats_reset_ms) >= 1000 {
            self.loops_per_second = self.loop_count;
            self.loop_count = 0;
            self.last_stats_reset_ms = now_ms;
        }

        let interval = self.config.config().cycle.status_interval_ms;
        if now_ms.saturating_sub(self.last_status_ms) >= interval && now_ms > 0 {
            self.last_status_ms = now_ms;
            let errors = self.error_total();
            let delta = errors.saturating_sub(self.last_error_total);
            self.last_error_total = errors;
            self.health_ok = delta <= ERROR_RATE_THRESHOLD;

            self.bus
                .publish_u32(MSG_SYSTEM_HEARTBEAT, self.loops_per_second);
            self.bus
                .publish_u8(MSG_SYSTEM_HEALTH, u8::from(!self.health_ok));
        }
    }

    /// Sum of every subsystem's error counters.
    fn error_total(&self) -> u32 {
        let mut total = self.bus.stats().queue_overflows + self.bus.stats().subscribe_failures;
        total += self.inputs.total_errors();
        total += self.outputs.stats().fault_count;
        total += self.cache.stats().subscription_errors;
        if let Some(canbus) = &self.canbus {
            total += canbus.stats().errors;
        }
        if let Some(serial) = &self.serial {
            let s = serial.stats();
            total += s.checksum_errors + s.sync_errors + s.length_errors;
        }
        total
    }

    /// Force every actuator into its safe configuration.
    pub fn safe_state(&self) {
        self.transmission.outputs_safe_state();
        self.bus.process();
        self.outputs.all_outputs_safe_state();
    }

    /// Drop persisted overrides and restore compiled defaults.
    pub fn reset_to_defaults(&mut self) -> bool {
        self.config.reset_to_defaults()
    }

    // ─── Accessors for the cycle runner ─────────────────────────────

    pub fn cycle_time_us(&self) -> u32 {
        self.config.config().cycle.cycle_time_us
    }

    pub fn rt_parameters(&self) -> (usize, i32) {
        let cycle = &self.config.config().cycle;
        (cycle.rt_cpu_core, cycle.rt_priority)
    }

    pub fn loops_per_second(&self) -> u32 {
        self.loops_per_second
    }

    /// Timestamp of the most recent loop pass [µs].
    pub fn last_loop_time_us(&self) -> u64 {
        self.last_loop_time_us
    }

    pub fn is_healthy(&self) -> bool {
        self.health_ok
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
