//! Saturating float-to-integer conversions.
//!
//! `as` casts from `f64` saturate at the integer bounds and map NaN to zero,
//! which is the behavior every caller here wants. The casts are kept in one
//! place so the lint exceptions stay narrow.

/// Floor to `i64`, saturating. NaN maps to 0.
#[allow(clippy::cast_possible_truncation)]
pub fn floor_i64(value: f64) -> i64 {
    value.floor() as i64
}

/// Ceil to `i64`, saturating. NaN maps to 0.
#[allow(clippy::cast_possible_truncation)]
pub fn ceil_i64(value: f64) -> i64 {
    value.ceil() as i64
}

/// Round to `u64`, saturating. Negative values and NaN map to 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn round_u64(value: f64) -> u64 {
    value.round() as u64
}
