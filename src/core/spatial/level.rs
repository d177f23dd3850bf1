pub const SILENT_LOG2: f32 = -1000.0;
pub const MIN_RADIUS: f32 = 0.02;
pub const RADIUS_RANGE: f32 = 0.04;
pub const FLOOR_DB: f32 = -48.0;

/// 20 * log10(2)
const DB_PER_OCTAVE: f32 = 6.020_6;
const FULL_SCALE_LEVEL: f32 = 100.0;

/// Base-2 logarithm from the float's exponent plus a quartic fit of the
/// mantissa. Max error is about 1.2e-4 and powers of two are exact.
/// Non-positive and NaN inputs return [`SILENT_LOG2`].
pub fn fast_log2(x: f32) -> f32 {
    if x.is_nan() || x <= 0.0 {
        return SILENT_LOG2;
    }
    if x.is_infinite() {
        return f32::MAX;
    }

    let bits = x.to_bits();
    let exponent = ((bits >> 23) & 0xff) as i32 - 127;
    let mantissa = f32::from_bits((bits & 0x007f_ffff) | 0x3f80_0000) - 1.0;

    let poly = (((-0.082_130_718 * mantissa + 0.321_188_984) * mantissa - 0.677_784_014)
        * mantissa
        + 1.438_725_75)
        * mantissa;

    poly + exponent as f32
}

/// Converts an engine level on the 0..=100 scale into dBFS.
pub fn level_to_db(level: f32) -> f32 {
    DB_PER_OCTAVE * fast_log2(level / FULL_SCALE_LEVEL)
}

pub fn level_to_radius(level: f32) -> f32 {
    let db = level_to_db(level);
    let t = ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0);
    MIN_RADIUS + RADIUS_RANGE * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powers_of_two_are_exact() {
        assert_eq!(fast_log2(1.0), 0.0);
        assert_eq!(fast_log2(8.0), 3.0);
        assert_eq!(fast_log2(0.25), -2.0);
    }

    #[test]
    fn non_positive_input_degrades_to_silence() {
        assert_eq!(fast_log2(0.0), SILENT_LOG2);
        assert_eq!(fast_log2(-3.0), SILENT_LOG2);
        assert_eq!(fast_log2(f32::NAN), SILENT_LOG2);
        assert_eq!(level_to_radius(0.0), MIN_RADIUS);
    }

    #[test]
    fn full_scale_level_is_zero_db() {
        assert!(level_to_db(100.0).abs() < 1e-4);
        assert!((level_to_radius(100.0) - 0.06).abs() < 1e-6);
    }
}
