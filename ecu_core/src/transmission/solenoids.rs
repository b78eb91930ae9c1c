//! Solenoid pattern table for the 5-solenoid gearbox.
//!
//! Shift solenoids A/B and the lockup solenoid are digital; line
//! pressure is a PWM percentage (0 % in Park/Neutral, 100 % in every
//! moving gear). Lockup engages in 4th only.

use super::Gear;

/// One row of the solenoid table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolenoidPattern {
    pub shift_a: bool,
    pub shift_b: bool,
    pub lockup: bool,
    pub line_pressure_pct: f32,
}

/// Non-damaging outputs: everything off, pressure released.
pub const SAFE_PATTERN: SolenoidPattern = SolenoidPattern {
    shift_a: false,
    shift_b: false,
    lockup: false,
    line_pressure_pct: 0.0,
};

/// Pattern for a gear position. `drive_gear` (1..=4) selects the row
/// inside Drive; other positions ignore it.
pub fn pattern_for(gear: Gear, drive_gear: u8) -> SolenoidPattern {
    match gear {
        Gear::Park | Gear::Neutral | Gear::Unknown => SAFE_PATTERN,
        Gear::Reverse => SolenoidPattern {
            shift_a: false,
            shift_b: false,
            lockup: false,
            line_pressure_pct: 100.0,
        },
        Gear::Drive => match drive_gear {
            1 => SolenoidPattern {
                shift_a: true,
                shift_b: true,
                lockup: false,
                line_pressure_pct: 100.0,
            },
            2 => SolenoidPattern {
                shift_a: false,
                shift_b: true,
                lockup: false,
                line_pressure_pct: 100.0,
            },
            3 => SolenoidPattern {
                shift_a: false,
                shift_b: false,
                lockup: false,
                line_pressure_pct: 100.0,
            },
            _ => SolenoidPattern {
                shift_a: true,
                shift_b: false,
                lockup: true,
                line_pressure_pct: 100.0,
            },
        },
        Gear::Second => SolenoidPattern {
            shift_a: false,
            shift_b: true,
            lockup: false,
            line_pressure_pct: 100.0,
        },
        Gear::First => SolenoidPattern {
            shift_a: false,
            shift_b: false,
            lockup: false,
            line_pressure_pct: 100.0,
        },
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn park_and_neutral_release_pressure() {
        for gear in [Gear::Park, Gear::Neutral] {
            let p = pattern_for(gear, 1);
            assert_eq!(p, SAFE_PATTERN);
        }
    }

    #[test]
    fn reverse_holds_full_pressure() {
        let p = pattern_for(Gear::Reverse, 1);
        assert!(!p.shift_a && !p.shift_b && !p.lockup);
        assert_eq!(p.line_pressure_pct, 100.0);
    }

    #[test]
    fn drive_auto_gear_table() {
        let rows = [
            (1, true, true, false),
            (2, false, true, false),
            (3, false, false, false),
            (4, true, false, true),
        ];
        for (gear, a, b, lockup) in rows {
            let p = pattern_for(Gear::Drive, gear);
            assert_eq!(p.shift_a, a, "gear {gear} A");
            assert_eq!(p.shift_b, b, "gear {gear} B");
            assert_eq!(p.lockup, lockup, "gear {gear} lockup");
            assert_eq!(p.line_pressure_pct, 100.0);
        }
    }

    #[test]
    fn lockup_only_in_fourth() {
        for g in 1..=3 {
            assert!(!pattern_for(Gear::Drive, g).lockup);
        }
        assert!(pattern_for(Gear::Drive, 4).lockup);
    }

    #[test]
    fn manual_positions() {
        let second = pattern_for(Gear::Second, 4);
        assert!(!second.shift_a && second.shift_b && !second.lockup);
        assert_eq!(second.line_pressure_pct, 100.0);

        let first = pattern_for(Gear::First, 4);
        assert!(!first.shift_a && !first.shift_b && !first.lockup);
        assert_eq!(first.line_pressure_pct, 100.0);
    }

    #[test]
    fn unknown_gear_is_safe() {
        assert_eq!(pattern_for(Gear::Unknown, 4), SAFE_PATTERN);
    }
}
