//! Reconciliation between the physical fan and the controller-facing model.
//!
//! The controller sees three fan characteristics (`Active`, the current fan
//! state and the rotation speed percentage). The device reports raw speeds
//! and status dictionaries. [`FanController`] folds both directions into a
//! consistent view: inbound reports update the characteristics, outbound
//! writes are translated into speed commands, and a short hold-off window
//! keeps inbound echoes from clobbering a write the user just made.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::speed::{
    self, ACTIVE_SPEED_THRESHOLD, FALLBACK_VIRTUAL_REMOTE_COMMAND, VirtualRemoteCommand,
};
use crate::status::DeviceStatus;

/// Inbound device reports received within this duration of a manual write do
/// not overwrite the fan characteristics. The device needs a few polling
/// cycles to settle after a command, and reflecting the stale readings back
/// at the controller makes sliders jump around.
pub const MANUAL_WRITE_HOLDOFF: Duration = Duration::from_secs(10);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString, strum::VariantNames,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Active {
    Inactive,
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum CurrentFanState {
    Inactive,
    Idle,
    BlowingAir,
}

/// A characteristic value that changed and should be shown to the controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CharacteristicUpdate {
    Active(Active),
    CurrentFanState(CurrentFanState),
    /// Percentage, 0–100.
    RotationSpeed(f64),
}

/// An outbound command for the transport layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeedCommand {
    /// Raw 0–254 device speed.
    Raw(u8),
    VirtualRemote(VirtualRemoteCommand),
}

/// Last-shown characteristic values with change detection.
///
/// Only values that differ from what was last forwarded are sent on, so
/// steady-state polling produces no controller traffic.
struct CharacteristicStore {
    active: Option<Active>,
    fan_state: Option<CurrentFanState>,
    rotation_speed: Option<f64>,
    updates: mpsc::UnboundedSender<CharacteristicUpdate>,
}

impl CharacteristicStore {
    fn new(updates: mpsc::UnboundedSender<CharacteristicUpdate>) -> Self {
        Self { active: None, fan_state: None, rotation_speed: None, updates }
    }

    fn set_active(&mut self, value: Active) {
        if self.active != Some(value) {
            self.active = Some(value);
            let _ = self.updates.send(CharacteristicUpdate::Active(value));
        }
    }

    fn set_fan_state(&mut self, value: CurrentFanState) {
        if self.fan_state != Some(value) {
            self.fan_state = Some(value);
            let _ = self.updates.send(CharacteristicUpdate::CurrentFanState(value));
        }
    }

    fn set_rotation_speed(&mut self, value: f64) {
        if self.rotation_speed != Some(value) {
            self.rotation_speed = Some(value);
            let _ = self.updates.send(CharacteristicUpdate::RotationSpeed(value));
        }
    }
}

pub struct FanController {
    allows_manual_speed_control: bool,
    co2_sensor: bool,
    non_cve: bool,
    characteristics: CharacteristicStore,
    commands: mpsc::UnboundedSender<SpeedCommand>,
    last_status: Option<DeviceStatus>,
    last_status_at: Option<Instant>,
    last_raw_speed: Option<u8>,
    last_raw_speed_at: Option<Instant>,
    last_manual_write_at: Option<Instant>,
}

impl FanController {
    pub fn new(
        config: &Config,
        updates: mpsc::UnboundedSender<CharacteristicUpdate>,
        commands: mpsc::UnboundedSender<SpeedCommand>,
    ) -> Self {
        Self {
            allows_manual_speed_control: config.allows_manual_speed_control(),
            co2_sensor: config.co2_sensor,
            non_cve: config.non_cve,
            characteristics: CharacteristicStore::new(updates),
            commands,
            last_status: None,
            last_status_at: None,
            last_raw_speed: None,
            last_raw_speed_at: None,
            last_manual_write_at: None,
        }
    }

    /// The most recent status report, if any arrived yet.
    pub fn last_status(&self) -> Option<&DeviceStatus> {
        self.last_status.as_ref()
    }

    pub fn last_raw_speed(&self) -> Option<u8> {
        self.last_raw_speed
    }

    fn in_holdoff(&self) -> bool {
        self.last_manual_write_at
            .is_some_and(|at| at.elapsed() < MANUAL_WRITE_HOLDOFF)
    }

    /// The device reported a full status dictionary.
    ///
    /// Always recorded. The fan characteristics are only re-synced outside
    /// the manual write hold-off.
    pub fn on_status(&mut self, device_status: DeviceStatus) {
        let hint = device_status.fan_mode();
        let reported_speed = device_status.speed_status();
        self.last_status = Some(device_status);
        self.last_status_at = Some(Instant::now());
        if self.in_holdoff() {
            debug!("a status report within the manual write hold-off, not syncing");
            return;
        }
        if self.allows_manual_speed_control {
            // The mode is advisory on these units; the reported percentage is
            // the ground truth and the hint stays out of the derivation.
            self.sync_characteristics_by_rotation_speed(reported_speed.unwrap_or(0.0), None);
        } else {
            // Units that overrule manual control report a meaningful mode
            // rather than a meaningful percentage.
            let mode = hint.unwrap_or(FALLBACK_VIRTUAL_REMOTE_COMMAND);
            self.sync_characteristics_by_rotation_speed(mode.rotation_speed(), hint);
        }
    }

    /// The device echoed its raw 0–254 speed.
    pub fn on_speed_echo(&mut self, raw: u8) {
        self.last_raw_speed = Some(raw);
        self.last_raw_speed_at = Some(Instant::now());
        if self.in_holdoff() {
            debug!(raw, "a speed echo within the manual write hold-off, not syncing");
            return;
        }
        let percent = speed::percent_for_raw_speed(raw);
        let hint = if self.allows_manual_speed_control {
            None
        } else {
            self.last_status.as_ref().and_then(DeviceStatus::fan_mode)
        };
        self.sync_characteristics_by_rotation_speed(percent, hint);
    }

    /// The controller wrote a rotation speed percentage.
    pub fn set_rotation_speed(&mut self, percent: f64) {
        self.last_manual_write_at = Some(Instant::now());
        if self.allows_manual_speed_control {
            let raw = speed::raw_speed_for_percent(percent);
            debug!(percent, raw, "setting the rotation speed");
            self.sync_characteristics_by_rotation_speed(percent, None);
            let _ = self.commands.send(SpeedCommand::Raw(raw));
        } else {
            let command = VirtualRemoteCommand::for_rotation_speed(percent);
            if self.co2_sensor {
                warn!(
                    %command,
                    "a CO2 sensor overrules manual speed control, sending a remote command"
                );
            }
            if self.non_cve {
                warn!(
                    %command,
                    "a non-CVE unit overrules manual speed control, sending a remote command"
                );
            }
            self.sync_characteristics_by_rotation_speed(command.rotation_speed(), Some(command));
            let _ = self.commands.send(SpeedCommand::VirtualRemote(command));
        }
    }

    /// The controller toggled the `Active` characteristic.
    pub fn set_active(&mut self, value: Active) {
        self.last_manual_write_at = Some(Instant::now());
        let target = match value {
            Active::Inactive => 0.0,
            Active::Active => self
                .characteristics
                .rotation_speed
                .filter(|speed| *speed > 0.0)
                .unwrap_or(ACTIVE_SPEED_THRESHOLD),
        };
        if self.allows_manual_speed_control {
            let raw = speed::raw_speed_for_percent(target);
            debug!(?value, target, raw, "toggling the fan");
            self.sync_characteristics_by_rotation_speed(target, None);
            let _ = self.commands.send(SpeedCommand::Raw(raw));
        } else {
            let command = VirtualRemoteCommand::for_rotation_speed(target);
            debug!(?value, %command, "toggling the fan via the virtual remote");
            // Deactivation still sends `low`, the lowest the remote can go,
            // but the shown state is a stopped fan, not a slow one.
            match value {
                Active::Inactive => self.sync_characteristics_by_rotation_speed(target, None),
                Active::Active => self.sync_characteristics_by_rotation_speed(
                    command.rotation_speed(),
                    Some(command),
                ),
            }
            let _ = self.commands.send(SpeedCommand::VirtualRemote(command));
        }
    }

    /// Derives all three fan characteristics from one effective speed.
    ///
    /// The `hint` is the mode the device itself reports. A `low` hint forces
    /// the idle state even above the numeric threshold, but never turns a
    /// running fan into an inactive one.
    fn sync_characteristics_by_rotation_speed(
        &mut self,
        rotation_speed: f64,
        hint: Option<VirtualRemoteCommand>,
    ) {
        self.characteristics.set_rotation_speed(rotation_speed);
        if rotation_speed == 0.0 {
            self.characteristics.set_fan_state(CurrentFanState::Inactive);
            self.characteristics.set_active(Active::Inactive);
        } else if rotation_speed <= ACTIVE_SPEED_THRESHOLD
            || hint == Some(VirtualRemoteCommand::Low)
        {
            self.characteristics.set_fan_state(CurrentFanState::Idle);
            self.characteristics.set_active(Active::Active);
        } else {
            self.characteristics.set_fan_state(CurrentFanState::BlowingAir);
            self.characteristics.set_active(Active::Active);
        }
    }
}
