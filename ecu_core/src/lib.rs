//! # ECU Control Core
//!
//! Real-time engine/transmission control core. A single-threaded
//! cooperative super-loop reads physical sensors, applies calibrated
//! control logic (automatic transmission control: gear detection,
//! paddle-shift arbitration, solenoid patterning, overrun-clutch policy,
//! line-pressure control), and exposes parameters and telemetry over a
//! message bus bridging the internal subsystems, an external CAN bus
//! (OBD-II plus vendor frames), a point-to-point serial link, and
//! non-volatile storage.
//!
//! ## Architecture
//!
//! Components communicate exclusively through the [`bus::MessageBus`];
//! the only direct calls are registration-time setup. [`app::EcuApp`] is
//! the single system context constructed in `main` — no global state, so
//! tests build private instances.
//!
//! Init order (leaves first): storage backend → storage manager → config
//! manager → message bus → input/output managers → transmission control →
//! external cache → CAN/serial gateways → parameter registry.

#![deny(clippy::disallowed_types)]

pub mod app;
pub mod bus;
pub mod config;
pub mod cycle;
pub mod external;
pub mod hal;
pub mod input;
pub mod output;
pub mod params;
pub mod storage;
pub mod transmission;
