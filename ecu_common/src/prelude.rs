//! Prelude module for common re-exports.
//!
//! `use ecu_common::prelude::*;` pulls in the types nearly every
//! component needs without listing individual paths.

// ─── Messages ───────────────────────────────────────────────────────
pub use crate::msg::{CanMessage, is_extended_id, make_msg_id, msg_parameter, msg_subsystem};

// ─── Parameter envelope ─────────────────────────────────────────────
pub use crate::param::{Channel, ParamMsg, ParamOperation};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, EcuConfig};

// ─── System constants ───────────────────────────────────────────────
pub use crate::consts::{BUS_QUEUE_SIZE, CYCLE_TIME_US, MAX_SUBSCRIBERS};
