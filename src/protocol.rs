//! # Stimulator Protocol Module
//!
//! Command encoding and notification decoding for the stimulator's single
//! text channel.
//!
//! ## Outgoing
//! Every command is one ASCII line terminated by `\n` and written as the raw
//! bytes of that line. Any link-level encoding is the transport's business.
//!
//! | Command | Bytes |
//! |---|---|
//! | activate | `D\n` |
//! | deactivate | `0\n` |
//! | query battery | `Q\n` |
//! | query charging | `u\n` |
//! | strength *n* | `<n>\n`, n in 1..=9 |
//!
//! ## Incoming
//! The device multiplexes text and binary frames on one notify
//! characteristic, so each frame is inspected both as trimmed UTF-8 text
//! (`Batt:<volts>`) and as raw bytes (`u`, status index, `'0'`/`'1'`).
//! Other frames (mode and battery-rate telemetry) are not interpreted.

use crate::error::DecodeError;
use std::fmt;
use uuid::Uuid;

/// Stimulator GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic commands are written to
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic carrying telemetry and acknowledgements
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Advertised names of supported devices start with this
pub const DEVICE_NAME_PREFIX: &str = "VNS";

const BATTERY_PREFIX: &str = "Batt:";
const CHARGING_TAG: u8 = b'u';

/// Stimulation strength, always within 1..=9
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Strength(u8);

impl Strength {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 9;

    /// Returns `None` when `value` is outside 1..=9.
    #[cfg(test)]
    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    /// Clamps any integer into the valid range.
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(Self::MIN as i64, Self::MAX as i64) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Strength {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outgoing command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Activate,
    Deactivate,
    QueryBattery,
    QueryCharging,
    /// Sets the strength; also used as a keep-alive while running
    Strength(Strength),
}

impl Command {
    /// Wire bytes for this command
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Activate => b"D\n".to_vec(),
            Command::Deactivate => b"0\n".to_vec(),
            Command::QueryBattery => b"Q\n".to_vec(),
            Command::QueryCharging => b"u\n".to_vec(),
            Command::Strength(s) => vec![b'0' + s.get(), b'\n'],
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Activate => write!(f, "activate"),
            Command::Deactivate => write!(f, "deactivate"),
            Command::QueryBattery => write!(f, "battery query"),
            Command::QueryCharging => write!(f, "charging query"),
            Command::Strength(s) => write!(f, "strength {}", s),
        }
    }
}

/// Decoded notification
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Battery voltage in volts
    Battery(f64),
    Charging(bool),
    /// Charging frame with a status byte other than `'0'` or `'1'`
    UnrecognizedStatus(u8),
    /// Anything else the device sends
    Unrecognized,
}

/// Decode one notification frame.
///
/// Only a malformed `Batt:` value is an error; unknown frames decode to
/// `Unrecognized` or `UnrecognizedStatus` and are meant to be ignored.
pub fn decode(frame: &[u8]) -> Result<Notification, DecodeError> {
    let text = String::from_utf8_lossy(frame);
    if let Some(raw) = text.trim().strip_prefix(BATTERY_PREFIX) {
        let raw = raw.trim();
        return match raw.parse::<f64>() {
            Ok(volts) if volts.is_finite() => Ok(Notification::Battery(volts)),
            _ => Err(DecodeError::InvalidVoltage(raw.to_string())),
        };
    }

    // Byte 1 is the device's status index and carries no meaning here
    if frame.len() >= 3 && frame[0] == CHARGING_TAG {
        return Ok(match frame[2] {
            b'0' => Notification::Charging(false),
            b'1' => Notification::Charging(true),
            other => Notification::UnrecognizedStatus(other),
        });
    }

    Ok(Notification::Unrecognized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::Activate.encode(), b"D\n");
        assert_eq!(Command::Deactivate.encode(), b"0\n");
        assert_eq!(Command::QueryBattery.encode(), b"Q\n");
        assert_eq!(Command::QueryCharging.encode(), b"u\n");
        assert_eq!(Command::Strength(Strength::clamped(5)).encode(), b"5\n");
        assert_eq!(Command::Strength(Strength::clamped(9)).encode(), b"9\n");
    }

    #[test]
    fn test_strength_bounds() {
        assert_eq!(Strength::new(0), None);
        assert_eq!(Strength::new(10), None);
        assert_eq!(Strength::new(4).map(Strength::get), Some(4));
        assert_eq!(Strength::clamped(-3).get(), 1);
        assert_eq!(Strength::clamped(42).get(), 9);
    }

    #[test]
    fn test_decode_battery() {
        assert_eq!(decode(b"Batt:3.80"), Ok(Notification::Battery(3.80)));
        assert_eq!(decode(b"  Batt: 3.5\r\n"), Ok(Notification::Battery(3.5)));
    }

    #[test]
    fn test_decode_battery_garbage() {
        assert_eq!(
            decode(b"Batt:garbage"),
            Err(DecodeError::InvalidVoltage("garbage".to_string()))
        );
        assert!(decode(b"Batt:NaN").is_err());
        assert!(decode(b"Batt:").is_err());
    }

    #[test]
    fn test_decode_charging_flag() {
        assert_eq!(decode(&[0x75, 0x01, 0x30]), Ok(Notification::Charging(false)));
        assert_eq!(decode(&[0x75, 0x01, 0x31]), Ok(Notification::Charging(true)));
        assert_eq!(decode(&[0x75, 0x01, 0x39]), Ok(Notification::UnrecognizedStatus(0x39)));
    }

    #[test]
    fn test_decode_short_charging_frame_is_unrecognized() {
        assert_eq!(decode(&[0x75, 0x01]), Ok(Notification::Unrecognized));
    }

    #[test]
    fn test_decode_other_frames() {
        assert_eq!(decode(b"Mode:2"), Ok(Notification::Unrecognized));
        assert_eq!(decode(b""), Ok(Notification::Unrecognized));
        assert_eq!(decode(&[0xff, 0xfe, 0x00]), Ok(Notification::Unrecognized));
    }
}
