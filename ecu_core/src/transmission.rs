//! Transmission control: gear detection, paddle-shift arbitration,
//! solenoid patterning, overrun-clutch policy.
//!
//! Pure message-bus architecture — the module subscribes to the gear
//! lever switches, paddles, fluid temperature and vehicle context that
//! the input manager publishes, and drives the five solenoids by
//! publishing on their actuator ids. Nothing here touches hardware.

pub mod overrun;
pub mod solenoids;

use std::cell::RefCell;
use std::rc::Rc;

use ecu_common::config::{PinConfig, TransmissionConfig};
use ecu_common::msg::{
    MSG_BRAKE_PEDAL, MSG_PADDLE_DOWNSHIFT, MSG_PADDLE_UPSHIFT, MSG_PARAM_OVERRUN_BRAKING_SPEED,
    MSG_PARAM_OVERRUN_MIN_SPEED, MSG_PARAM_OVERRUN_THROTTLE_DISENGAGE,
    MSG_PARAM_OVERRUN_THROTTLE_ENGAGE, MSG_PARAM_PADDLE_DEBOUNCE_MS, MSG_SYSTEM_SAFE_STATE,
    MSG_THROTTLE_POSITION, MSG_TRANS_CURRENT_GEAR, MSG_TRANS_DRIVE_GEAR, MSG_TRANS_DRIVE_SWITCH,
    MSG_TRANS_FIRST_SWITCH, MSG_TRANS_FLUID_TEMP, MSG_TRANS_LOCKUP_SOL, MSG_TRANS_NEUTRAL_SWITCH,
    MSG_TRANS_OVERRUN_SOL, MSG_TRANS_OVERRUN_STATE, MSG_TRANS_PARK_SWITCH,
    MSG_TRANS_PRESSURE_SOL, MSG_TRANS_REVERSE_SWITCH, MSG_TRANS_SECOND_SWITCH,
    MSG_TRANS_SHIFT_REQUEST, MSG_TRANS_SHIFT_SOL_A, MSG_TRANS_SHIFT_SOL_B, MSG_VEHICLE_SPEED,
};
use tracing::{debug, warn};

use crate::bus::{MessageBus, handler};
use crate::input::thermistor::ThermistorTable;
use crate::input::{InputManager, SensorDefinition, SensorKind};
use crate::output::{OutputDefinition, OutputKind, OutputManager};
use crate::params::ParameterRegistry;
use self::overrun::{OverrunInputs, OverrunState, OverrunTuning, evaluate};
use self::solenoids::{SAFE_PATTERN, SolenoidPattern, pattern_for};

// ─── State types ────────────────────────────────────────────────────

/// Gear lever position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gear {
    Unknown = 0,
    Park = 1,
    Reverse = 2,
    Neutral = 3,
    Drive = 4,
    Second = 5,
    First = 6,
}

impl Gear {
    /// Lever label.
    pub fn as_str(self) -> &'static str {
        match self {
            Gear::Unknown => "?",
            Gear::Park => "P",
            Gear::Reverse => "R",
            Gear::Neutral => "N",
            Gear::Drive => "D",
            Gear::Second => "2",
            Gear::First => "1",
        }
    }
}

/// Pending paddle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShiftRequest {
    #[default]
    None,
    Up,
    Down,
}

/// Snapshot of the transmission state.
#[derive(Debug, Clone, Copy)]
pub struct TransmissionState {
    pub current_gear: Gear,
    pub shift_request: ShiftRequest,
    pub valid_gear_position: bool,
    pub overrun_state: OverrunState,
    /// Last fluid temperature [°C]; NaN until the first reading.
    pub fluid_temp_c: f32,
    /// Automatic gear register inside Drive, 1..=4.
    pub drive_gear: u8,
    pub shift_count: u32,
    pub invalid_gear_count: u32,
    pub overrun_change_count: u32,
}

impl Default for TransmissionState {
    fn default() -> Self {
        Self {
            current_gear: Gear::Unknown,
            shift_request: ShiftRequest::None,
            valid_gear_position: false,
            overrun_state: OverrunState::Disengaged,
            fluid_temp_c: f32::NAN,
            drive_gear: 1,
            shift_count: 0,
            invalid_gear_count: 0,
            overrun_change_count: 0,
        }
    }
}

// ─── Internals ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct PaddleState {
    active: bool,
    last_accepted_ms: Option<u32>,
}

/// Gear switch order in the level array.
const SW_PARK: usize = 0;
const SW_REVERSE: usize = 1;
const SW_NEUTRAL: usize = 2;
const SW_DRIVE: usize = 3;
const SW_SECOND: usize = 4;
const SW_FIRST: usize = 5;

struct TransInner {
    state: TransmissionState,
    tuning: OverrunTuning,
    paddle_debounce_ms: u16,
    overheat_warn_c: f32,
    overheat_limit_c: f32,

    override_active: bool,
    override_state: OverrunState,

    switches: [bool; 6],
    have_fluid_temp: bool,
    throttle_pct: f32,
    speed_mph: f32,
    brake_active: bool,
    decelerating: bool,

    paddles: [PaddleState; 2],

    last_pattern: Option<SolenoidPattern>,
    last_published_overrun: Option<OverrunState>,
    in_safe_state: bool,
}

impl TransInner {
    fn new(config: &TransmissionConfig) -> Self {
        Self {
            state: TransmissionState::default(),
            tuning: OverrunTuning::from(&config.overrun),
            paddle_debounce_ms: config.paddle_debounce_ms,
            overheat_warn_c: config.overheat_warn_c,
            overheat_limit_c: config.overheat_limit_c,
            override_active: false,
            override_state: OverrunState::Disengaged,
            switches: [false; 6],
            have_fluid_temp: false,
            throttle_pct: 0.0,
            speed_mph: 0.0,
            brake_active: false,
            decelerating: false,
            paddles: [PaddleState::default(); 2],
            last_pattern: None,
            last_published_overrun: None,
            in_safe_state: false,
        }
    }

    /// Rising-edge paddle input with debounce. `which` is 0 = up, 1 = down.
    fn paddle_edge(&mut self, which: usize, active: bool, now_ms: u32) {
        let paddle = &mut self.paddles[which];
        let rising = active && !paddle.active;
        paddle.active = active;
        if !rising {
            return;
        }
        if let Some(last) = paddle.last_accepted_ms
            && now_ms.saturating_sub(last) < self.paddle_debounce_ms as u32
        {
            return;
        }
        if self.state.shift_request != ShiftRequest::None {
            return;
        }
        paddle.last_accepted_ms = Some(now_ms);
        self.state.shift_request = if which == 0 {
            ShiftRequest::Up
        } else {
            ShiftRequest::Down
        };
    }

    /// Exactly-one-switch gear detection.
    fn detect_gear(&mut self) {
        let mut active_count = 0;
        let mut active_index = 0;
        for (i, level) in self.switches.iter().enumerate() {
            if *level {
                active_count += 1;
                active_index = i;
            }
        }
        if active_count == 1 {
            self.state.current_gear = match active_index {
                SW_PARK => Gear::Park,
                SW_REVERSE => Gear::Reverse,
                SW_NEUTRAL => Gear::Neutral,
                SW_DRIVE => Gear::Drive,
                SW_SECOND => Gear::Second,
                _ => Gear::First,
            };
            self.state.valid_gear_position = true;
        } else {
            // Zero or conflicting switches: fail to Neutral.
            self.state.current_gear = Gear::Neutral;
            self.state.valid_gear_position = false;
            self.state.invalid_gear_count += 1;
        }
    }

    fn fluid_over(&self, threshold_c: f32) -> bool {
        self.have_fluid_temp && self.state.fluid_temp_c > threshold_c
    }
}

// ─── Control handle ─────────────────────────────────────────────────

/// Transmission control component. Clones share state with the bus
/// handlers registered at init.
#[derive(Clone)]
pub struct TransmissionControl {
    inner: Rc<RefCell<TransInner>>,
    bus: Rc<MessageBus>,
}

impl TransmissionControl {
    pub fn new(bus: Rc<MessageBus>, config: &TransmissionConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TransInner::new(config))),
            bus,
        }
    }

    /// Register the module's sensors and outputs and subscribe all
    /// message handlers. Returns the number of sensors registered
    /// (1 thermistor + 2 paddles + 6 gear switches).
    pub fn init(
        &self,
        config: &TransmissionConfig,
        pins: &PinConfig,
        inputs: &mut InputManager,
        outputs: &OutputManager,
    ) -> usize {
        let registered = inputs.register_sensors(&self.sensor_definitions(config, pins));
        outputs.register_outputs(&self.output_definitions(pins), &self.bus);
        self.subscribe_handlers();
        debug!(registered, "transmission module initialized");
        registered
    }

    fn sensor_definitions(
        &self,
        config: &TransmissionConfig,
        pins: &PinConfig,
    ) -> Vec<SensorDefinition> {
        let th = &config.thermistor;
        let table = ThermistorTable::generate(
            th.ref_temp1_c,
            th.ref_resistance1_ohms,
            th.ref_temp2_c,
            th.ref_resistance2_ohms,
            th.pullup_ohms,
            th.table_min_c,
            th.table_max_c,
            20,
        );

        let switch = |pin: u8, msg_id: u32, name: &'static str| SensorDefinition {
            pin,
            kind: SensorKind::DigitalPullup {
                use_pullup: true,
                invert: true,
            },
            msg_id,
            update_interval_us: 0,
            filter_strength: 0,
            name,
        };

        vec![
            SensorDefinition {
                pin: pins.trans_fluid_temp,
                kind: SensorKind::Thermistor(table),
                msg_id: MSG_TRANS_FLUID_TEMP,
                update_interval_us: 100_000,
                filter_strength: 128,
                name: "Trans fluid temp",
            },
            switch(pins.paddle_upshift, MSG_PADDLE_UPSHIFT, "Paddle upshift"),
            switch(pins.paddle_downshift, MSG_PADDLE_DOWNSHIFT, "Paddle downshift"),
            switch(pins.trans_park, MSG_TRANS_PARK_SWITCH, "Gear switch P"),
            switch(pins.trans_reverse, MSG_TRANS_REVERSE_SWITCH, "Gear switch R"),
            switch(pins.trans_neutral, MSG_TRANS_NEUTRAL_SWITCH, "Gear switch N"),
            switch(pins.trans_drive, MSG_TRANS_DRIVE_SWITCH, "Gear switch D"),
            switch(pins.trans_second, MSG_TRANS_SECOND_SWITCH, "Gear switch 2"),
            switch(pins.trans_first, MSG_TRANS_FIRST_SWITCH, "Gear switch 1"),
        ]
    }

    fn output_definitions(&self, pins: &PinConfig) -> Vec<OutputDefinition> {
        let solenoid = |pin: u8, msg_id: u32, default_state: bool, name: &'static str| {
            OutputDefinition {
                pin,
                kind: OutputKind::Digital {
                    active_high: true,
                    open_drain: false,
                    default_state,
                },
                msg_id,
                rate_limit_ms: 0,
                name,
            }
        };

        vec![
            solenoid(pins.sol_shift_a, MSG_TRANS_SHIFT_SOL_A, false, "Shift solenoid A"),
            solenoid(pins.sol_shift_b, MSG_TRANS_SHIFT_SOL_B, false, "Shift solenoid B"),
            // Inverted polarity: ON = clutch disengaged = safe default.
            solenoid(pins.sol_overrun, MSG_TRANS_OVERRUN_SOL, true, "Overrun solenoid"),
            OutputDefinition {
                pin: pins.sol_pressure,
                kind: OutputKind::Pwm {
                    frequency_hz: 1000,
                    resolution_bits: 12,
                    min_duty_pct: 0.0,
                    max_duty_pct: 100.0,
                    default_pct: 0.0,
                },
                msg_id: MSG_TRANS_PRESSURE_SOL,
                rate_limit_ms: 0,
                name: "Line pressure solenoid",
            },
            solenoid(pins.sol_lockup, MSG_TRANS_LOCKUP_SOL, false, "Lockup solenoid"),
        ]
    }

    fn subscribe_handlers(&self) {
        let switch_ids = [
            (MSG_TRANS_PARK_SWITCH, SW_PARK),
            (MSG_TRANS_REVERSE_SWITCH, SW_REVERSE),
            (MSG_TRANS_NEUTRAL_SWITCH, SW_NEUTRAL),
            (MSG_TRANS_DRIVE_SWITCH, SW_DRIVE),
            (MSG_TRANS_SECOND_SWITCH, SW_SECOND),
            (MSG_TRANS_FIRST_SWITCH, SW_FIRST),
        ];
        for (msg_id, index) in switch_ids {
            let inner = self.inner.clone();
            self.bus.subscribe(
                msg_id,
                handler(move |msg| {
                    if let Some(v) = msg.unpack_float() {
                        inner.borrow_mut().switches[index] = v > 0.5;
                    }
                }),
            );
        }

        for (msg_id, which) in [(MSG_PADDLE_UPSHIFT, 0usize), (MSG_PADDLE_DOWNSHIFT, 1usize)] {
            let inner = self.inner.clone();
            self.bus.subscribe(
                msg_id,
                handler(move |msg| {
                    if let Some(v) = msg.unpack_float() {
                        let now_ms = (msg.timestamp_us / 1000) as u32;
                        inner.borrow_mut().paddle_edge(which, v > 0.5, now_ms);
                    }
                }),
            );
        }

        let inner = self.inner.clone();
        self.bus.subscribe(
            MSG_TRANS_FLUID_TEMP,
            handler(move |msg| {
                if let Some(v) = msg.unpack_float() {
                    let mut inner = inner.borrow_mut();
                    inner.state.fluid_temp_c = v;
                    inner.have_fluid_temp = true;
                }
            }),
        );

        let inner = self.inner.clone();
        self.bus.subscribe(
            MSG_THROTTLE_POSITION,
            handler(move |msg| {
                if let Some(v) = msg.unpack_float() {
                    inner.borrow_mut().throttle_pct = v;
                }
            }),
        );

        let inner = self.inner.clone();
        self.bus.subscribe(
            MSG_VEHICLE_SPEED,
            handler(move |msg| {
                if let Some(v) = msg.unpack_float() {
                    let mut inner = inner.borrow_mut();
                    inner.decelerating = v < inner.speed_mph - 0.25;
                    inner.speed_mph = v;
                }
            }),
        );

        let inner = self.inner.clone();
        self.bus.subscribe(
            MSG_BRAKE_PEDAL,
            handler(move |msg| {
                if let Some(v) = msg.unpack_float() {
                    inner.borrow_mut().brake_active = v > 0.5;
                }
            }),
        );
    }

    /// Expose the module's tunables over the parameter envelope.
    pub fn register_parameters(&self, registry: &ParameterRegistry) {
        let inner = self.inner.clone();
        let read_inner = inner.clone();
        registry.register_writable(
            MSG_PARAM_PADDLE_DEBOUNCE_MS,
            move || read_inner.borrow().paddle_debounce_ms as f32,
            move |v| {
                inner.borrow_mut().paddle_debounce_ms = v.clamp(10.0, 5000.0) as u16;
                true
            },
            "Paddle debounce [ms]",
        );

        let tuning_params: [(u32, fn(&OverrunTuning) -> f32, fn(&mut OverrunTuning, f32)); 4] = [
            (
                MSG_PARAM_OVERRUN_THROTTLE_DISENGAGE,
                |t| t.throttle_disengage_pct,
                |t, v| t.throttle_disengage_pct = v.clamp(0.0, 100.0),
            ),
            (
                MSG_PARAM_OVERRUN_THROTTLE_ENGAGE,
                |t| t.throttle_engage_pct,
                |t, v| t.throttle_engage_pct = v.clamp(0.0, 100.0),
            ),
            (
                MSG_PARAM_OVERRUN_MIN_SPEED,
                |t| t.min_speed_mph,
                |t, v| t.min_speed_mph = v.clamp(0.0, 100.0),
            ),
            (
                MSG_PARAM_OVERRUN_BRAKING_SPEED,
                |t| t.braking_speed_mph,
                |t, v| t.braking_speed_mph = v.clamp(0.0, 100.0),
            ),
        ];
        for (id, get, set) in tuning_params {
            let read_inner = self.inner.clone();
            let write_inner = self.inner.clone();
            registry.register_writable(
                id,
                move || get(&read_inner.borrow().tuning),
                move |v| {
                    set(&mut write_inner.borrow_mut().tuning, v);
                    true
                },
                "Overrun tuning",
            );
        }

        // Current gear is state, not calibration: read-only.
        let inner = self.inner.clone();
        registry.register_parameter(
            MSG_TRANS_CURRENT_GEAR,
            move || inner.borrow().state.current_gear as u8 as f32,
            "Current gear position",
        );
    }

    // ─── Loop body ──────────────────────────────────────────────────

    /// One control pass: detect gear, arbitrate shifts, run the overrun
    /// policy, publish solenoid outputs and state.
    pub fn update(&self, _now_us: u64) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        inner.detect_gear();

        let hard_overheat = inner.fluid_over(inner.overheat_limit_c);
        let deny_shifts = inner.fluid_over(inner.overheat_warn_c);
        let shift_pending = inner.state.shift_request != ShiftRequest::None;

        // Shift arbitration: Drive only, valid lever, not overheating.
        if shift_pending {
            let honored = inner.state.current_gear == Gear::Drive
                && inner.state.valid_gear_position
                && !deny_shifts;
            if honored {
                let target = match inner.state.shift_request {
                    ShiftRequest::Up => (inner.state.drive_gear + 1).min(4),
                    ShiftRequest::Down => (inner.state.drive_gear - 1).max(1),
                    ShiftRequest::None => inner.state.drive_gear,
                };
                if target != inner.state.drive_gear {
                    inner.state.drive_gear = target;
                    inner.state.shift_count += 1;
                    self.bus
                        .publish_float(MSG_TRANS_DRIVE_GEAR, target as f32);
                }
            } else {
                debug!(gear = ?inner.state.current_gear, deny_shifts, "shift request denied");
            }
        }

        // Safe state: invalid lever or fluid beyond the hard limit.
        let safe = !inner.state.valid_gear_position || hard_overheat;
        if safe && !inner.in_safe_state {
            if hard_overheat {
                warn!(temp = inner.state.fluid_temp_c, "fluid over hard limit");
            }
            self.bus.publish_u8(MSG_SYSTEM_SAFE_STATE, 1);
        }
        inner.in_safe_state = safe;

        // Overrun clutch.
        let target_overrun = if inner.override_active {
            inner.override_state
        } else if safe {
            OverrunState::Disengaged
        } else {
            evaluate(
                &inner.tuning,
                &OverrunInputs {
                    gear: inner.state.current_gear,
                    drive_gear: inner.state.drive_gear,
                    shift_pending,
                    throttle_pct: inner.throttle_pct,
                    speed_mph: inner.speed_mph,
                    brake_active: inner.brake_active,
                    decelerating: inner.decelerating,
                },
                inner.state.overrun_state,
            )
        };
        if target_overrun != inner.state.overrun_state {
            inner.state.overrun_state = target_overrun;
            inner.state.overrun_change_count += 1;
        }
        if inner.last_published_overrun != Some(inner.state.overrun_state) {
            inner.last_published_overrun = Some(inner.state.overrun_state);
            self.bus
                .publish_float(MSG_TRANS_OVERRUN_SOL, inner.state.overrun_state.solenoid_value());
            let engaged = if inner.state.overrun_state == OverrunState::Engaged {
                1.0
            } else {
                0.0
            };
            self.bus.publish_float(MSG_TRANS_OVERRUN_STATE, engaged);
        }

        // Solenoid pattern.
        let pattern = if safe {
            SAFE_PATTERN
        } else {
            pattern_for(inner.state.current_gear, inner.state.drive_gear)
        };
        if inner.last_pattern != Some(pattern) {
            inner.last_pattern = Some(pattern);
            self.publish_pattern(&pattern);
        }

        // State broadcast.
        self.bus
            .publish_float(MSG_TRANS_CURRENT_GEAR, inner.state.current_gear as u8 as f32);
        if shift_pending {
            let code = match inner.state.shift_request {
                ShiftRequest::Up => 1.0,
                ShiftRequest::Down => 2.0,
                ShiftRequest::None => 0.0,
            };
            self.bus.publish_float(MSG_TRANS_SHIFT_REQUEST, code);
        }

        // The request was serviced (or denied) this pass.
        inner.state.shift_request = ShiftRequest::None;
    }

    fn publish_pattern(&self, pattern: &SolenoidPattern) {
        let as_float = |b: bool| if b { 1.0 } else { 0.0 };
        self.bus
            .publish_float(MSG_TRANS_SHIFT_SOL_A, as_float(pattern.shift_a));
        self.bus
            .publish_float(MSG_TRANS_SHIFT_SOL_B, as_float(pattern.shift_b));
        self.bus
            .publish_float(MSG_TRANS_LOCKUP_SOL, as_float(pattern.lockup));
        self.bus
            .publish_float(MSG_TRANS_PRESSURE_SOL, pattern.line_pressure_pct);
    }

    // ─── Commands ───────────────────────────────────────────────────

    /// Force safe outputs immediately (A/B/lockup off, pressure 0,
    /// overrun solenoid on).
    pub fn outputs_safe_state(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state.overrun_state != OverrunState::Disengaged {
            inner.state.overrun_state = OverrunState::Disengaged;
            inner.state.overrun_change_count += 1;
        }
        inner.last_pattern = Some(SAFE_PATTERN);
        inner.last_published_overrun = Some(OverrunState::Disengaged);
        drop(inner);
        self.publish_pattern(&SAFE_PATTERN);
        self.bus
            .publish_float(MSG_TRANS_OVERRUN_SOL, OverrunState::Disengaged.solenoid_value());
        self.bus.publish_u8(MSG_SYSTEM_SAFE_STATE, 1);
    }

    /// Short-circuit the overrun policy with a fixed state.
    pub fn set_overrun_override(&self, state: OverrunState, enabled: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.override_active = enabled;
        inner.override_state = state;
        if enabled && inner.state.overrun_state != state {
            inner.state.overrun_state = state;
            inner.state.overrun_change_count += 1;
        }
    }

    /// Restore automatic overrun control.
    pub fn clear_overrun_override(&self) {
        self.inner.borrow_mut().override_active = false;
    }

    pub fn is_overrun_override_active(&self) -> bool {
        self.inner.borrow().override_active
    }

    /// Drop a pending (unserviced) shift request.
    pub fn clear_shift_request(&self) {
        self.inner.borrow_mut().state.shift_request = ShiftRequest::None;
    }

    /// True when the last fluid temperature exceeds `threshold_c`.
    pub fn is_overheating(&self, threshold_c: f32) -> bool {
        self.inner.borrow().fluid_over(threshold_c)
    }

    // ─── Tuning access ──────────────────────────────────────────────

    pub fn paddle_debounce_ms(&self) -> u16 {
        self.inner.borrow().paddle_debounce_ms
    }

    pub fn set_paddle_debounce_ms(&self, debounce_ms: u16) {
        self.inner.borrow_mut().paddle_debounce_ms = debounce_ms;
    }

    pub fn overrun_tuning(&self) -> OverrunTuning {
        self.inner.borrow().tuning
    }

    /// Set overrun thresholds; values are clamped to their bands.
    pub fn set_overrun_tuning(
        &self,
        throttle_disengage_pct: f32,
        throttle_engage_pct: f32,
        min_speed_mph: f32,
        braking_speed_mph: f32,
    ) {
        self.inner.borrow_mut().tuning = OverrunTuning::clamped(
            throttle_disengage_pct,
            throttle_engage_pct,
            min_speed_mph,
            braking_speed_mph,
        );
    }

    // ─── Statistics ─────────────────────────────────────────────────

    pub fn state(&self) -> TransmissionState {
        self.inner.borrow().state
    }

    pub fn shift_count(&self) -> u32 {
        self.inner.borrow().state.shift_count
    }

    pub fn invalid_gear_count(&self) -> u32 {
        self.inner.borrow().state.invalid_gear_count
    }

    pub fn overrun_change_count(&self) -> u32 {
        self.inner.borrow().state.overrun_change_count
    }

    pub fn reset_statistics(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.state.shift_count = 0;
        inner.state.invalid_gear_count = 0;
        inner.state.overrun_change_count = 0;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
