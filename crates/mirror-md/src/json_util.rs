//! Shared JSON parsing helpers for upstream payloads.
//!
//! Numeric fields may arrive as JSON numbers or as strings (`"101.5"`),
//! depending on the broker adapter behind the feed.

use mirror_core::types::DepthLevel;

/// Maximum book levels kept per side.
pub const MAX_LEVELS: usize = 5;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn parse_f64_field(v: &serde_json::Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

/// Named `f64` field, `0.0` when absent or malformed.
#[inline]
pub fn f64_or_zero(v: &serde_json::Value, key: &str) -> f64 {
    parse_f64_field(v, key).unwrap_or(0.0)
}

/// Parse one book side.
///
/// Levels may be objects (`{"price": .., "quantity": ..}`) or arrays
/// (`[price, quantity, ...]`). At most [`MAX_LEVELS`] are kept.
pub fn parse_levels(side: Option<&serde_json::Value>) -> Vec<DepthLevel> {
    let Some(levels) = side.and_then(|s| s.as_array()) else {
        return Vec::new();
    };
    levels
        .iter()
        .take(MAX_LEVELS)
        .filter_map(|level| {
            if let Some(arr) = level.as_array() {
                Some(DepthLevel {
                    price: parse_str_f64(arr.first())?,
                    quantity: parse_str_f64(arr.get(1)).unwrap_or(0.0),
                })
            } else {
                Some(DepthLevel {
                    price: parse_f64_field(level, "price")?,
                    quantity: parse_f64_field(level, "quantity").or_else(|| parse_f64_field(level, "qty")).unwrap_or(0.0),
                })
            }
        })
        .collect()
}
