//! # Battery Model
//!
//! Maps the stimulator's reported cell voltage to a 0-100% charge level.
//!
//! The curve is linear between the empty and full thresholds and clamped
//! outside of them. Rounding is half-away-from-zero (`f64::round`), so the
//! midpoint voltage of 3.225 V reads as exactly 50%.

/// Voltage at or above which the cell is reported as full
pub const FULL_VOLTAGE: f64 = 3.95;

/// Voltage at or below which the cell is reported as empty
pub const EMPTY_VOLTAGE: f64 = 2.5;

/// Convert a battery voltage reading into a charge percentage.
///
/// Total over all inputs: NaN falls through every comparison and maps to 0.
pub fn percent(voltage: f64) -> u8 {
    if voltage >= FULL_VOLTAGE {
        return 100;
    }
    if voltage.is_nan() || voltage <= EMPTY_VOLTAGE {
        return 0;
    }

    let fraction = (voltage - EMPTY_VOLTAGE) / (FULL_VOLTAGE - EMPTY_VOLTAGE);
    (fraction * 100.0).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_clamps_below_empty() {
        for v in [-1.0, 0.0, 1.2, 2.49, 2.5] {
            assert_eq!(percent(v), 0, "voltage {}", v);
        }
    }

    #[test]
    fn test_percent_clamps_above_full() {
        for v in [3.95, 3.96, 4.2, 12.0] {
            assert_eq!(percent(v), 100, "voltage {}", v);
        }
    }

    #[test]
    fn test_percent_midpoint() {
        assert_eq!(percent(3.225), 50);
    }

    #[test]
    fn test_percent_known_readings() {
        assert_eq!(percent(3.80), 90);
        assert_eq!(percent(3.0), 34);
    }

    #[test]
    fn test_percent_is_monotonic() {
        let mut last = 0;
        let mut v = 2.0;
        while v < 4.5 {
            let p = percent(v);
            assert!(p >= last, "percent dropped at {}: {} < {}", v, p, last);
            last = p;
            v += 0.001;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn test_percent_nan_is_empty() {
        assert_eq!(percent(f64::NAN), 0);
    }
}
