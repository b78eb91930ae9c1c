//! Overrun clutch policy.
//!
//! The overrun solenoid has inverted polarity: solenoid ON = clutch
//! disengaged. Engaging the clutch couples engine to wheels under
//! deceleration (engine braking); the race strategy disengages it under
//! power, in top gear, during shifts, and at low speed, with a
//! hysteresis band that holds the previous state in between.

use super::Gear;

/// Overrun clutch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunState {
    /// Clutch coupled — engine braking available (solenoid OFF).
    Engaged,
    /// Clutch free — smooth delivery (solenoid ON).
    Disengaged,
}

impl OverrunState {
    /// Value published for the solenoid output (inverted polarity).
    #[inline]
    pub fn solenoid_value(self) -> f32 {
        match self {
            OverrunState::Engaged => 0.0,
            OverrunState::Disengaged => 1.0,
        }
    }
}

/// Tuning thresholds, clamped to sane ranges on every write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverrunTuning {
    /// Throttle at or above this disengages [%].
    pub throttle_disengage_pct: f32,
    /// Throttle at or below this engages [%].
    pub throttle_engage_pct: f32,
    /// Below this speed the clutch stays disengaged [mph].
    pub min_speed_mph: f32,
    /// Brake above this speed engages for engine braking [mph].
    pub braking_speed_mph: f32,
}

impl OverrunTuning {
    /// Clamp every threshold into its allowed band.
    pub fn clamped(
        throttle_disengage_pct: f32,
        throttle_engage_pct: f32,
        min_speed_mph: f32,
        braking_speed_mph: f32,
    ) -> Self {
        Self {
            throttle_disengage_pct: throttle_disengage_pct.clamp(0.0, 100.0),
            throttle_engage_pct: throttle_engage_pct.clamp(0.0, 100.0),
            min_speed_mph: min_speed_mph.clamp(0.0, 100.0),
            braking_speed_mph: braking_speed_mph.clamp(0.0, 100.0),
        }
    }
}

impl From<&ecu_common::config::OverrunConfig> for OverrunTuning {
    fn from(cfg: &ecu_common::config::OverrunConfig) -> Self {
        Self::clamped(
            cfg.throttle_disengage_pct,
            cfg.throttle_engage_pct,
            cfg.min_speed_mph,
            cfg.braking_speed_mph,
        )
    }
}

/// Context the policy evaluates each loop.
#[derive(Debug, Clone, Copy)]
pub struct OverrunInputs {
    pub gear: Gear,
    /// Automatic gear register 1..=4 (Drive only).
    pub drive_gear: u8,
    /// A shift request is being serviced this loop.
    pub shift_pending: bool,
    pub throttle_pct: f32,
    pub speed_mph: f32,
    pub brake_active: bool,
    pub decelerating: bool,
}

/// Evaluate the policy. Rules are ordered; the hysteresis band between
/// the throttle thresholds holds `previous`.
pub fn evaluate(tuning: &OverrunTuning, inputs: &OverrunInputs, previous: OverrunState) -> OverrunState {
    // Smooth the shift: free the clutch while a request is serviced.
    if inputs.shift_pending {
        return OverrunState::Disengaged;
    }
    // Only Drive runs the contextual policy.
    if inputs.gear != Gear::Drive {
        return OverrunState::Disengaged;
    }
    // Top gear runs disengaged.
    if inputs.drive_gear >= 4 {
        return OverrunState::Disengaged;
    }
    // Hard braking at speed: engage for engine braking.
    if inputs.brake_active && inputs.speed_mph > tuning.braking_speed_mph {
        return OverrunState::Engaged;
    }
    // Too slow for engagement to be smooth.
    if inputs.speed_mph < tuning.min_speed_mph {
        return OverrunState::Disengaged;
    }
    if inputs.throttle_pct >= tuning.throttle_disengage_pct {
        return OverrunState::Disengaged;
    }
    if inputs.throttle_pct <= tuning.throttle_engage_pct {
        return OverrunState::Engaged;
    }
    if inputs.decelerating {
        return OverrunState::Engaged;
    }
    previous
}

// ─── Tests ──────────────────────────────────────────────────────────
