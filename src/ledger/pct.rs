//! Fixed-point percentage units.
//!
//! Ownership is tracked as `i64` with 4 decimal places so repeated rebalancing
//! cycles never accumulate floating point drift. `f64` only appears at the
//! boundary (scores, config, display).

/// Percentage points scaled by [`PCT_SCALE`]. `100.00%` is `1_000_000`.
pub type Pct = i64;

/// 1 percentage point = 10_000 units (4 decimal places).
pub const PCT_SCALE: i64 = 10_000;

/// The whole cap table.
pub const HUNDRED_PCT: Pct = 100 * PCT_SCALE;

/// Basis points per whole (rates are configured in bps).
pub const BPS_DENOMINATOR: i128 = 10_000;

/// Convert f64 percentage points to fixed-point.
#[inline]
pub fn to_pct(value: f64) -> Pct {
    (value * PCT_SCALE as f64).round() as Pct
}

/// Convert fixed-point to f64 percentage points.
#[inline]
pub fn from_pct(pct: Pct) -> f64 {
    pct as f64 / PCT_SCALE as f64
}

/// Render with the full 4 decimal places, e.g. `35.0000`.
pub fn format_pct(pct: Pct) -> String {
    let sign = if pct < 0 { "-" } else { "" };
    let abs = pct.unsigned_abs();
    let scale = PCT_SCALE as u64;
    format!("{}{}.{:04}", sign, abs / scale, abs % scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pct_conversion() {
        assert_eq!(to_pct(1.0), PCT_SCALE);
        assert_eq!(to_pct(100.0), HUNDRED_PCT);
        assert_eq!(to_pct(0.01), 100);
        assert_eq!(from_pct(HUNDRED_PCT), 100.0);
        assert_eq!(from_pct(-5_000), -0.5);
    }

    #[test]
    fn test_to_pct_rounds_instead_of_truncating() {
        // 0.1 + 0.2 is 0.30000000000000004 in f64
        assert_eq!(to_pct(0.1 + 0.2), 3_000);
        assert_eq!(to_pct(-0.99999), -10_000);
    }

    #[test]
    fn test_format_pct() {
        assert_eq!(format_pct(350_000), "35.0000");
        assert_eq!(format_pct(5), "0.0005");
        assert_eq!(format_pct(-12_345), "-1.2345");
    }
}
