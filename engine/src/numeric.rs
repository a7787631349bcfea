//! FILENAME: engine/src/numeric.rs
//! PURPOSE: Numeric helpers shared by formatters and aggregation.
//! CONTEXT: Rounding works on the shortest decimal representation of a value
//! so that half-up rounding behaves the way people expect (2.675 -> 2.68),
//! not the way binary floating point would round it.

use crate::value::DataValue;
use once_cell::sync::Lazy;
use regex::Regex;

/// Numbers embedded in free text, used by the "aggressive" statistics.
static EMBEDDED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?[0-9]+(\.[0-9]+)?").expect("static pattern is valid"));

/// Direction used when rounding to a fixed number of places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingDirection {
    /// Half-up, ties away from zero.
    #[default]
    Nearest,
    /// Towards positive infinity.
    Up,
    /// Towards negative infinity.
    Down,
}

/// Rounds half-up to `places` decimals and returns the fixed-point text.
pub fn round_half_up_text(x: f64, places: u32) -> String {
    if !x.is_finite() {
        return x.to_string();
    }
    let places = places as usize;
    let repr = x.abs().to_string();
    let (int_part, frac_part) = repr.split_once('.').unwrap_or((repr.as_str(), ""));

    let mut digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes().chain(std::iter::repeat(b'0')).take(places))
        .map(|b| b - b'0')
        .collect();
    let mut int_len = int_part.len();

    if frac_part.as_bytes().get(places).is_some_and(|d| *d >= b'5') {
        let mut i = digits.len();
        loop {
            if i == 0 {
                digits.insert(0, 1);
                int_len += 1;
                break;
            }
            i -= 1;
            if digits[i] == 9 {
                digits[i] = 0;
            } else {
                digits[i] += 1;
                break;
            }
        }
    }

    let mut out = String::with_capacity(digits.len() + 2);
    if x < 0.0 && digits.iter().any(|d| *d != 0) {
        out.push('-');
    }
    for d in &digits[..int_len] {
        out.push((b'0' + d) as char);
    }
    if places > 0 {
        out.push('.');
        for d in &digits[int_len..] {
            out.push((b'0' + d) as char);
        }
    }
    out
}

/// Rounds half-up to `places` decimals.
pub fn round_half_up(x: f64, places: u32) -> f64 {
    round_half_up_text(x, places).parse().unwrap_or(x)
}

/// Rounds in the given direction to `places` decimals.
pub fn round_to(x: f64, places: u32, direction: RoundingDirection) -> f64 {
    match direction {
        RoundingDirection::Nearest => round_half_up(x, places),
        RoundingDirection::Up | RoundingDirection::Down => {
            let scale = 10f64.powi(places as i32);
            let scaled = x * scale;
            // Values that are already on the grid must not move
            let snapped = round_half_up(scaled, 9);
            let moved = if (snapped - snapped.round()).abs() < 1e-9 {
                snapped.round()
            } else if direction == RoundingDirection::Up {
                scaled.ceil()
            } else {
                scaled.floor()
            };
            moved / scale
        }
    }
}

// ============================================================================
// LIST STATISTICS
// ============================================================================

/// Numeric elements only.
pub fn numbers(values: &[DataValue]) -> Vec<f64> {
    values.iter().filter_map(DataValue::as_number).collect()
}

pub fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(sum(values) / values.len() as f64)
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Most common text; ties go to the value seen first.
pub fn mode(values: &[String]) -> Option<String> {
    let mut counts: Vec<(&String, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }
    let best = counts.iter().map(|(_, c)| *c).max()?;
    counts
        .into_iter()
        .find(|(_, c)| *c == best)
        .map(|(value, _)| value.clone())
}

/// Every number embedded in a piece of text.
pub fn embedded_numbers(text: &str) -> Vec<f64> {
    EMBEDDED_NUMBER
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_up_uses_decimal_representation() {
        assert_eq!(round_half_up_text(2.675, 2), "2.68");
        assert_eq!(round_half_up_text(2.5, 0), "3");
        assert_eq!(round_half_up_text(-2.5, 0), "-3");
        assert_eq!(round_half_up_text(9.995, 2), "10.00");
        assert_eq!(round_half_up_text(3.14159, 1), "3.1");
        assert_eq!(round_half_up_text(-0.004, 2), "0.00");
    }

    #[test]
    fn directional_rounding() {
        assert_eq!(round_to(2.341, 1, RoundingDirection::Up), 2.4);
        assert_eq!(round_to(2.349, 1, RoundingDirection::Down), 2.3);
        assert_eq!(round_to(-2.341, 1, RoundingDirection::Down), -2.4);
        assert_eq!(round_to(2.3, 1, RoundingDirection::Up), 2.3);
    }

    #[test]
    fn statistics_over_lists() {
        assert_eq!(mean(&[4.0]), Some(4.0));
        assert_eq!(mean(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0, 10.0]), Some(2.5));
        assert_eq!(
            mode(&["b".to_string(), "a".to_string(), "a".to_string(), "b".to_string()]),
            Some("b".to_string())
        );
    }

    #[test]
    fn embedded_numbers_found_in_text() {
        assert_eq!(embedded_numbers("scored 7.5 then -2 and x"), vec![7.5, -2.0]);
    }
}
