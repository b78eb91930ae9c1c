//! End-to-end scenarios for the control core.
//!
//! Each test builds a private system context against the simulation HAL
//! and mock transports, then drives the super-loop exactly as the
//! firmware binary does.

use std::cell::RefCell;
use std::rc::Rc;

use ecu_common::config::{EcuConfig, PinConfig};
use ecu_common::msg::{
    CanMessage, MSG_BRAKE_PEDAL, MSG_ENGINE_RPM, MSG_STORAGE_LOAD_FLOAT, MSG_STORAGE_LOAD_RESPONSE,
    MSG_STORAGE_SAVE_FLOAT, MSG_THROTTLE_POSITION, MSG_TRANS_CURRENT_GEAR, MSG_VEHICLE_SPEED,
};
use ecu_common::param::{Channel, ParamMsg, ParamOperation};

use ecu_core::app::EcuApp;
use ecu_core::bus::handler;
use ecu_core::external::obdii::{OBDII_PID_ENGINE_RPM, OBDII_REQUEST_ID, OBDII_RESPONSE_ID};
use ecu_core::external::transport::{CanTransport, MockCanTransport, MockSerialPort, SerialPort};
use ecu_core::hal::SimHal;
use ecu_core::storage::backend::EepromBackend;
use ecu_core::storage::{LoadFloatMsg, LoadResponseMsg, SaveFloatMsg, key_hash};
use ecu_core::transmission::Gear;
use ecu_core::transmission::overrun::OverrunState;

// ─── Harness ────────────────────────────────────────────────────────

struct SharedCan(Rc<RefCell<MockCanTransport>>);

impl CanTransport for SharedCan {
    fn receive(&mut self) -> Option<CanMessage> {
        self.0.borrow_mut().receive()
    }
    fn transmit(&mut self, msg: &CanMessage) -> bool {
        self.0.borrow_mut().transmit(msg)
    }
}

struct SharedPort(Rc<RefCell<MockSerialPort>>);

impl SerialPort for SharedPort {
    fn read_byte(&mut self) -> Option<u8> {
        self.0.borrow_mut().read_byte()
    }
    fn write(&mut self, data: &[u8]) -> usize {
        self.0.borrow_mut().write(data)
    }
}

struct EcuRig {
    app: EcuApp,
    hal: Rc<RefCell<SimHal>>,
    can: Rc<RefCell<MockCanTransport>>,
    pins: PinConfig,
    now_us: u64,
}

impl EcuRig {
    fn new() -> Self {
        let hal = SimHal::shared();
        let can = Rc::new(RefCell::new(MockCanTransport::new()));
        let port = Rc::new(RefCell::new(MockSerialPort::new()));
        let config = EcuConfig::default();
        let pins = config.pins.clone();

        let app = EcuApp::new(
            config,
            hal.clone(),
            Box::new(EepromBackend::default()),
            Some(Box::new(SharedCan(can.clone()))),
            Some(Box::new(SharedPort(port.clone()))),
        )
        .expect("system context");

        Self {
            app,
            hal,
            can,
            pins,
            now_us: 0,
        }
    }

    /// Advance time and run loop ticks every millisecond.
    fn run_ms(&mut self, ms: u64) {
        for _ in 0..ms {
            self.now_us += 1000;
            self.app.run_tick(self.now_us);
        }
    }

    /// Put the gear lever into one position (active-low switches).
    fn set_lever(&self, active_pin: Option<u8>) {
        let mut hal = self.hal.borrow_mut();
        for pin in [
            self.pins.trans_park,
            self.pins.trans_reverse,
            self.pins.trans_neutral,
            self.pins.trans_drive,
            self.pins.trans_second,
            self.pins.trans_first,
        ] {
            hal.set_digital(pin, Some(pin) != active_pin);
        }
    }

    fn press_upshift(&mut self) {
        self.hal
            .borrow_mut()
            .set_digital(self.pins.paddle_upshift, false);
        self.run_ms(10);
        self.hal
            .borrow_mut()
            .set_digital(self.pins.paddle_upshift, true);
        self.run_ms(10);
    }

    fn publish_context(&mut self, throttle_pct: f32, speed_mph: f32, brake: bool) {
        self.app.bus.publish_float(MSG_THROTTLE_POSITION, throttle_pct);
        self.app.bus.publish_float(MSG_VEHICLE_SPEED, speed_mph);
        self.app
            .bus
            .publish_float(MSG_BRAKE_PEDAL, if brake { 1.0 } else { 0.0 });
        self.run_ms(2);
    }

    fn solenoid_levels(&self) -> (bool, bool, bool, bool) {
        let hal = self.hal.borrow();
        (
            hal.digital_out[self.pins.sol_shift_a as usize],
            hal.digital_out[self.pins.sol_shift_b as usize],
            hal.digital_out[self.pins.sol_lockup as usize],
            hal.digital_out[self.pins.sol_overrun as usize],
        )
    }

    fn pressure_duty(&self) -> u16 {
        self.hal.borrow().pwm_duty[self.pins.sol_pressure as usize]
    }

    /// Drive: healthy fluid temperature, lever in D, settled context.
    fn warm_up_in_drive(&mut self) {
        self.hal
            .borrow_mut()
            .set_analog_voltage(self.pins.trans_fluid_temp, 1.8);
        self.set_lever(Some(self.pins.trans_drive));
        self.run_ms(150);
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[test]
fn cold_boot_into_park() {
    let mut rig = EcuRig::new();
    rig.hal
        .borrow_mut()
        .set_analog_voltage(rig.pins.trans_fluid_temp, 1.8);
    rig.set_lever(Some(rig.pins.trans_park));

    rig.run_ms(150);

    let state = rig.app.transmission.state();
    assert_eq!(state.current_gear, Gear::Park);
    assert!(state.valid_gear_position);

    let (a, b, lockup, overrun) = rig.solenoid_levels();
    assert!(!a && !b && !lockup, "park pattern all off");
    assert!(overrun, "overrun solenoid on = clutch disengaged");
    assert_eq!(rig.pressure_duty(), 0);
}

#[test]
fn upshift_sequence_first_to_fourth() {
    let mut rig = EcuRig::new();
    rig.warm_up_in_drive();
    rig.publish_context(50.0, 40.0, false);
    assert_eq!(rig.app.transmission.state().drive_gear, 1);

    for _ in 0..3 {
        rig.run_ms(300);
        rig.press_upshift();
    }

    assert_eq!(rig.app.transmission.shift_count(), 3);
    assert_eq!(rig.app.transmission.state().drive_gear, 4);

    let (a, b, lockup, overrun) = rig.solenoid_levels();
    assert!(a && !b && lockup, "gear 4 pattern A=1 B=0 lockup=1");
    assert!(overrun, "top gear runs with the clutch disengaged");
    assert!(rig.pressure_duty() > 4000, "full line pressure");
}

#[test]
fn braking_in_third_engages_overrun() {
    let mut rig = EcuRig::new();
    rig.warm_up_in_drive();
    rig.publish_context(50.0, 40.0, false);

    // Shift up twice: auto gear 3.
    for _ in 0..2 {
        rig.run_ms(300);
        rig.press_upshift();
    }
    assert_eq!(rig.app.transmission.state().drive_gear, 3);

    rig.publish_context(5.0, 75.0, true);
    rig.run_ms(10);

    assert_eq!(
        rig.app.transmission.state().overrun_state,
        OverrunState::Engaged
    );
    let (_, _, _, overrun) = rig.solenoid_levels();
    assert!(!overrun, "solenoid off = clutch engaged for engine braking");
}

#[test]
fn obdii_rpm_query_round_trip() {
    let mut rig = EcuRig::new();
    rig.run_ms(10);

    // First scanner poll primes the lazy cache subscription.
    rig.can
        .borrow_mut()
        .inject_frame(OBDII_REQUEST_ID, &[0x02, 0x01, OBDII_PID_ENGINE_RPM]);
    rig.run_ms(5);

    // Engine side publishes live RPM.
    rig.app.bus.publish_float(MSG_ENGINE_RPM, 3200.0);
    rig.run_ms(5);

    rig.can
        .borrow_mut()
        .inject_frame(OBDII_REQUEST_ID, &[0x02, 0x01, OBDII_PID_ENGINE_RPM]);
    rig.run_ms(5);

    let can = rig.can.borrow();
    let response = can
        .tx
        .iter()
        .find(|f| f.id == OBDII_RESPONSE_ID && f.buf[1] == 0x41)
        .expect("positive Mode 01 response");
    assert_eq!(response.buf[2], OBDII_PID_ENGINE_RPM);
    // 3200 rpm × 4 = 0x3200.
    assert_eq!(response.buf[3], 0x32);
    assert_eq!(response.buf[4], 0x00);
}

#[test]
fn storage_save_load_round_trip_from_cache() {
    let mut rig = EcuRig::new();
    rig.run_ms(10);

    let responses = Rc::new(RefCell::new(Vec::new()));
    let r = responses.clone();
    rig.app.bus.subscribe(
        MSG_STORAGE_LOAD_RESPONSE,
        handler(move |msg| {
            if let Some(resp) = LoadResponseMsg::from_msg(msg) {
                r.borrow_mut().push(resp);
            }
        }),
    );

    let hash = key_hash("trans.line_pressure");
    let save = SaveFloatMsg {
        key_hash: hash,
        value: 80.0,
        sender_id: 1,
        priority: 0,
    };
    rig.app.bus.publish(MSG_STORAGE_SAVE_FLOAT, &save.to_bytes());
    rig.run_ms(2);

    let disk_reads_before = rig.app.storage.stats().disk_reads;
    let load = LoadFloatMsg {
        key_hash: hash,
        default_value: 0.0,
        sender_id: 1,
        request_id: 7,
    };
    rig.app.bus.publish(MSG_STORAGE_LOAD_FLOAT, &load.to_bytes());
    rig.run_ms(2);

    let responses = responses.borrow();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].value, 80.0);
    assert!(responses[0].success);
    assert_eq!(responses[0].request_id, 7);
    // Served from the write-back cache, not the backend.
    assert_eq!(rig.app.storage.stats().disk_reads, disk_reads_before);
}

#[test]
fn parameter_write_to_read_only_gear_errors() {
    let mut rig = EcuRig::new();
    rig.run_ms(10);

    let errors = Rc::new(RefCell::new(Vec::new()));
    let e = errors.clone();
    rig.app.bus.subscribe(
        MSG_TRANS_CURRENT_GEAR,
        handler(move |msg| {
            if let Some(param) = ParamMsg::from_msg(msg)
                && param.operation == ParamOperation::Error
            {
                e.borrow_mut().push(param);
            }
        }),
    );

    let request = ParamMsg {
        operation: ParamOperation::WriteRequest,
        value: 2.0,
        source_channel: Channel::SerialUsb as u8,
        request_id: 11,
    };
    rig.app.bus.publish(MSG_TRANS_CURRENT_GEAR, &request.to_bytes());
    rig.run_ms(2);

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].value, ecu_common::param::PARAM_ERROR_READ_ONLY);
    assert_eq!(errors[0].request_id, 11);
}

// ─── Cross-cutting behaviors ────────────────────────────────────────

#[test]
fn paddle_presses_inside_debounce_honored_once() {
    let mut rig = EcuRig::new();
    rig.warm_up_in_drive();

    // Two presses 20 ms apart with the default 200 ms debounce.
    rig.press_upshift();
    rig.press_upshift();
    assert_eq!(rig.app.transmission.shift_count(), 1);
}

#[test]
fn shift_in_park_denied() {
    let mut rig = EcuRig::new();
    rig.hal
        .borrow_mut()
        .set_analog_voltage(rig.pins.trans_fluid_temp, 1.8);
    rig.set_lever(Some(rig.pins.trans_park));
    rig.run_ms(150);

    rig.press_upshift();
    assert_eq!(rig.app.transmission.shift_count(), 0);
    assert_eq!(rig.app.transmission.state().drive_gear, 1);
}

#[test]
fn invalid_lever_fails_to_neutral_safe_state() {
    let mut rig = EcuRig::new();
    rig.hal
        .borrow_mut()
        .set_analog_voltage(rig.pins.trans_fluid_temp, 1.8);
    // Two switches grounded at once.
    rig.set_lever(Some(rig.pins.trans_drive));
    rig.hal.borrow_mut().set_digital(rig.pins.trans_park, false);
    rig.run_ms(150);

    let state = rig.app.transmission.state();
    assert_eq!(state.current_gear, Gear::Neutral);
    assert!(!state.valid_gear_position);
    assert!(rig.app.transmission.invalid_gear_count() > 0);

    let (a, b, lockup, overrun) = rig.solenoid_levels();
    assert!(!a && !b && !lockup && overrun, "safe outputs");
    assert_eq!(rig.pressure_duty(), 0);
}

#[test]
fn gear_position_published_for_external_consumers() {
    let mut rig = EcuRig::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    rig.app.bus.subscribe(
        MSG_TRANS_CURRENT_GEAR,
        handler(move |msg| {
            if let Some(v) = msg.unpack_float() {
                s.borrow_mut().push(v);
            }
        }),
    );

    rig.hal
        .borrow_mut()
        .set_analog_voltage(rig.pins.trans_fluid_temp, 1.8);
    rig.set_lever(Some(rig.pins.trans_reverse));
    rig.run_ms(20);

    assert_eq!(*seen.borrow().last().unwrap(), Gear::Reverse as u8 as f32);
}

#[test]
fn health_stays_green_through_normal_operation() {
    let mut rig = EcuRig::new();
    rig.hal
        .borrow_mut()
        .set_analog_voltage(rig.pins.trans_fluid_temp, 1.8);
    rig.set_lever(Some(rig.pins.trans_drive));
    rig.run_ms(2500);
    assert!(rig.app.is_healthy());
    assert!(rig.app.loops_per_second() > 0);
}
