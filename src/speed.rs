//! Conversions between the three speed scales the device understands: the
//! 0–100 rotation speed shown to the user, the raw 0–254 wire speed, and the
//! three-level virtual remote commands.

/// Upper bound of the exposed rotation speed scale.
pub const MAX_ROTATION_SPEED: f64 = 100.0;

/// Rotation speeds above this value count as actively blowing air rather than
/// idling.
pub const ACTIVE_SPEED_THRESHOLD: f64 = 20.0;

/// Raw wire speeds are `round(percent * 2.54)`, so 100% maps to 254.
const RAW_SPEED_PER_PERCENT: f64 = 2.54;

/// One of the speed buttons on the physical remote, emulated over the wire.
///
/// The remote also knows `timer1..3`, `join` and `leave`, but none of those
/// participate in speed control.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VirtualRemoteCommand {
    Low,
    Medium,
    High,
}

/// Used whenever a speed or mode does not map onto a remote button. Medium is
/// the device's safe default: it matches the "auto" resting state.
pub const FALLBACK_VIRTUAL_REMOTE_COMMAND: VirtualRemoteCommand = VirtualRemoteCommand::Medium;

impl VirtualRemoteCommand {
    /// Partitions `[0, 100]` into three equal intervals, one per button.
    ///
    /// Boundaries belong to the lower interval: 100/3 is still `low`, 200/3 is
    /// still `medium`. Out-of-range input falls back to `medium`.
    pub fn for_rotation_speed(rotation_speed: f64) -> Self {
        let step = MAX_ROTATION_SPEED / 3.0;
        if (0.0..=step).contains(&rotation_speed) {
            VirtualRemoteCommand::Low
        } else if rotation_speed > step && rotation_speed <= 2.0 * step {
            VirtualRemoteCommand::Medium
        } else if rotation_speed > 2.0 * step && rotation_speed <= MAX_ROTATION_SPEED {
            VirtualRemoteCommand::High
        } else {
            FALLBACK_VIRTUAL_REMOTE_COMMAND
        }
    }

    /// The rotation speed a button press settles on, i.e. the inverse of
    /// [`Self::for_rotation_speed`] evaluated at the top of each interval.
    pub fn rotation_speed(self) -> f64 {
        match self {
            VirtualRemoteCommand::Low => MAX_ROTATION_SPEED / 3.0,
            VirtualRemoteCommand::Medium => 2.0 * MAX_ROTATION_SPEED / 3.0,
            VirtualRemoteCommand::High => MAX_ROTATION_SPEED,
        }
    }
}

/// Converts an exposed rotation speed to the raw 0–254 wire scale.
///
/// The caller is responsible for clamping `percent` to `[0, 100]` first; the
/// rounding never produces a value above 254 for in-range input.
pub fn raw_speed_for_percent(percent: f64) -> u8 {
    (percent * RAW_SPEED_PER_PERCENT).round() as u8
}

/// Converts a raw 0–254 wire speed back to the exposed 0–100 scale.
pub fn percent_for_raw_speed(raw: u8) -> f64 {
    (f64::from(raw) / RAW_SPEED_PER_PERCENT).round()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rotation_speed_maps_to_a_command() {
        for tenth in 0..=1000 {
            let speed = f64::from(tenth) / 10.0;
            // Must not panic and must return one of the three commands.
            let _ = VirtualRemoteCommand::for_rotation_speed(speed);
        }
    }

    #[test]
    fn interval_boundaries_belong_to_the_lower_interval() {
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(0.0), VirtualRemoteCommand::Low);
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(33.333), VirtualRemoteCommand::Low);
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(33.334), VirtualRemoteCommand::Medium);
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(66.666), VirtualRemoteCommand::Medium);
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(66.667), VirtualRemoteCommand::High);
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(100.0), VirtualRemoteCommand::High);
    }

    #[test]
    fn out_of_range_speeds_fall_back_to_medium() {
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(-1.0), VirtualRemoteCommand::Medium);
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(100.1), VirtualRemoteCommand::Medium);
        assert_eq!(VirtualRemoteCommand::for_rotation_speed(1000.0), VirtualRemoteCommand::Medium);
        assert_eq!(
            VirtualRemoteCommand::for_rotation_speed(f64::NAN),
            VirtualRemoteCommand::Medium
        );
    }

    #[test]
    fn command_rotation_speeds_are_the_interval_tops() {
        assert_eq!(VirtualRemoteCommand::Low.rotation_speed(), 100.0 / 3.0);
        assert_eq!(VirtualRemoteCommand::Medium.rotation_speed(), 200.0 / 3.0);
        assert_eq!(VirtualRemoteCommand::High.rotation_speed(), 100.0);
    }

    #[test]
    fn command_rotation_speeds_round_trip() {
        for cmd in [
            VirtualRemoteCommand::Low,
            VirtualRemoteCommand::Medium,
            VirtualRemoteCommand::High,
        ] {
            assert_eq!(VirtualRemoteCommand::for_rotation_speed(cmd.rotation_speed()), cmd);
        }
    }

    #[test]
    fn raw_speed_covers_the_device_scale() {
        assert_eq!(raw_speed_for_percent(0.0), 0);
        assert_eq!(raw_speed_for_percent(50.0), 127);
        assert_eq!(raw_speed_for_percent(100.0), 254);
    }

    #[test]
    fn raw_speed_round_trips_within_one_percent() {
        for percent in 0..=100 {
            let raw = raw_speed_for_percent(f64::from(percent));
            let back = percent_for_raw_speed(raw);
            assert!(
                (back - f64::from(percent)).abs() <= 1.0,
                "{percent}% -> {raw} -> {back}%"
            );
        }
    }
}
