//! # Telemetry Snapshot Module
//!
//! Last known battery and charging state reported by the stimulator.
//!
//! Values are only ever written by the notification handler and never
//! expire on their own. Whether they are wiped when the link drops is
//! decided by `TelemetryRetention` in the config.

use crate::battery;
use crate::error::DecodeError;
use crate::protocol::{self, Notification};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// What happens to telemetry when the link is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryRetention {
    /// Keep showing the last known values
    #[default]
    Preserve,
    /// Reset to unknown
    Clear,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySnapshot {
    pub battery_percent: Option<u8>,
    pub battery_voltage: Option<f64>,
    pub charging: Option<bool>,
    pub last_updated: Option<DateTime<Local>>,
}

impl TelemetrySnapshot {
    /// Decode a raw notification frame and fold it into the snapshot.
    ///
    /// Returns `Ok(true)` when a field changed. Unrecognized frames return
    /// `Ok(false)`; a malformed battery frame returns the decode error and
    /// leaves every field untouched.
    pub fn apply_frame(&mut self, frame: &[u8]) -> Result<bool, DecodeError> {
        match protocol::decode(frame)? {
            Notification::Battery(volts) => {
                self.battery_voltage = Some(volts);
                self.battery_percent = Some(battery::percent(volts));
                self.last_updated = Some(Local::now());
                Ok(true)
            }
            Notification::Charging(charging) => {
                self.charging = Some(charging);
                self.last_updated = Some(Local::now());
                Ok(true)
            }
            Notification::UnrecognizedStatus(status) => {
                log::debug!("Ignoring charging frame with status byte {:#04x}", status);
                Ok(false)
            }
            Notification::Unrecognized => {
                log::trace!("Ignoring unclassified notification: {:?}", String::from_utf8_lossy(frame));
                Ok(false)
            }
        }
    }

    /// Apply the link-loss retention policy.
    pub fn on_link_lost(&mut self, retention: TelemetryRetention) {
        if retention == TelemetryRetention::Clear {
            *self = Self::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_frame_updates_percent() {
        let mut snapshot = TelemetrySnapshot::default();
        assert_eq!(snapshot.apply_frame(b"Batt:3.80"), Ok(true));
        assert_eq!(snapshot.battery_percent, Some(battery::percent(3.80)));
        assert_eq!(snapshot.battery_voltage, Some(3.80));
        assert!(snapshot.last_updated.is_some());
    }

    #[test]
    fn test_garbage_battery_frame_leaves_snapshot_unchanged() {
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.apply_frame(b"Batt:3.5").unwrap();
        let before = snapshot.clone();

        assert!(snapshot.apply_frame(b"Batt:garbage").is_err());
        assert_eq!(snapshot, before);
    }

    #[test]
    fn test_charging_frames() {
        let mut snapshot = TelemetrySnapshot::default();
        assert_eq!(snapshot.apply_frame(&[0x75, 0x01, 0x31]), Ok(true));
        assert_eq!(snapshot.charging, Some(true));
        assert_eq!(snapshot.apply_frame(&[0x75, 0x01, 0x30]), Ok(true));
        assert_eq!(snapshot.charging, Some(false));
    }

    #[test]
    fn test_unrecognized_status_leaves_snapshot_unchanged() {
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.apply_frame(&[0x75, 0x01, 0x31]).unwrap();
        let before = snapshot.clone();

        assert_eq!(snapshot.apply_frame(&[0x75, 0x01, 0x39]), Ok(false));
        assert_eq!(snapshot, before);
    }

    #[test]
    fn test_retention_policy() {
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.apply_frame(b"Batt:3.9").unwrap();

        snapshot.on_link_lost(TelemetryRetention::Preserve);
        assert!(snapshot.battery_percent.is_some());

        snapshot.on_link_lost(TelemetryRetention::Clear);
        assert_eq!(snapshot, TelemetrySnapshot::default());
    }
}
