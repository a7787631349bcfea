//! FILENAME: engine/src/aggregation/postprocess.rs
//! PURPOSE: Uniform post-processing of a computed value.
//! CONTEXT: Runs after every method, in this order:
//!   1. arithmetic adjustment (division by zero is skipped)
//!   2. rounding
//!   3. literal or regex text replacement
//!   4. non-finite numbers become blank
//! Numeric steps only touch values that coerce to a number.

use super::spec::{Adjustment, AggregationSpec, ArithmeticOp, ReplaceMode, RoundingPolicy, TextReplacement};
use crate::numeric::round_to;
use crate::value::DataValue;
use regex::Regex;

pub fn apply(spec: &AggregationSpec, value: DataValue) -> DataValue {
    let mut value = value;

    if let Some(adjustment) = &spec.adjustment {
        value = adjust(adjustment, value);
    }
    if let RoundingPolicy::RoundTo { places, direction } = spec.rounding {
        if let Some(n) = scalar_number(&value) {
            value = DataValue::Number(round_to(n, places, direction));
        }
    }
    if let Some(replacement) = &spec.replacement {
        value = replace(replacement, value);
    }

    match value {
        DataValue::Number(n) if !n.is_finite() => DataValue::Empty,
        other => other,
    }
}

/// Numbers, and text that parses as one. Lists and maps are left alone.
fn scalar_number(value: &DataValue) -> Option<f64> {
    match value {
        DataValue::Number(_) | DataValue::Text(_) => value.as_number(),
        _ => None,
    }
}

fn adjust(adjustment: &Adjustment, value: DataValue) -> DataValue {
    let Some(n) = scalar_number(&value) else {
        return value;
    };
    let operand = adjustment.operand;
    let adjusted = match adjustment.op {
        ArithmeticOp::Add => n + operand,
        ArithmeticOp::Subtract => n - operand,
        ArithmeticOp::Multiply => n * operand,
        ArithmeticOp::Divide if operand == 0.0 => n,
        ArithmeticOp::Divide => n / operand,
    };
    DataValue::Number(adjusted)
}

fn replace(replacement: &TextReplacement, value: DataValue) -> DataValue {
    if replacement.pattern.is_empty() {
        return value;
    }
    let text = value.to_text();
    let replaced = match replacement.mode {
        ReplaceMode::Literal => text.replace(&replacement.pattern, &replacement.replacement),
        ReplaceMode::Regex => match Regex::new(&replacement.pattern) {
            Ok(re) => re
                .replace_all(&text, replacement.replacement.as_str())
                .into_owned(),
            Err(err) => {
                log_warn!("AGGREGATE", "invalid replacement pattern '{}': {}", replacement.pattern, err);
                return value;
            }
        },
    };
    if replaced == text {
        value
    } else {
        DataValue::Text(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::spec::SimpleStatistic;
    use crate::numeric::RoundingDirection;

    fn spec() -> AggregationSpec {
        AggregationSpec::simple(SimpleStatistic::Sum, vec![])
    }

    #[test]
    fn adjustment_then_rounding() {
        let mut spec = spec();
        spec.adjustment = Some(Adjustment {
            op: ArithmeticOp::Divide,
            operand: 3.0,
        });
        spec.rounding = RoundingPolicy::RoundTo {
            places: 2,
            direction: RoundingDirection::Nearest,
        };
        assert_eq!(apply(&spec, DataValue::Number(10.0)), DataValue::Number(3.33));

        spec.rounding = RoundingPolicy::RoundTo {
            places: 0,
            direction: RoundingDirection::Up,
        };
        assert_eq!(apply(&spec, DataValue::text("10")), DataValue::Number(4.0));
    }

    #[test]
    fn divide_by_zero_is_skipped() {
        let mut spec = spec();
        spec.adjustment = Some(Adjustment {
            op: ArithmeticOp::Divide,
            operand: 0.0,
        });
        assert_eq!(apply(&spec, DataValue::Number(5.0)), DataValue::Number(5.0));
    }

    #[test]
    fn replacement_runs_after_rounding() {
        let mut spec = spec();
        spec.rounding = RoundingPolicy::RoundTo {
            places: 0,
            direction: RoundingDirection::Nearest,
        };
        spec.replacement = Some(TextReplacement {
            mode: ReplaceMode::Regex,
            pattern: "^3$".to_string(),
            replacement: "three".to_string(),
        });
        assert_eq!(apply(&spec, DataValue::Number(2.6)), DataValue::text("three"));
        assert_eq!(apply(&spec, DataValue::Number(4.2)), DataValue::Number(4.0));
    }

    #[test]
    fn literal_replacement_and_text_passthrough() {
        let mut spec = spec();
        spec.adjustment = Some(Adjustment {
            op: ArithmeticOp::Add,
            operand: 1.0,
        });
        spec.replacement = Some(TextReplacement {
            mode: ReplaceMode::Literal,
            pattern: "Pass".to_string(),
            replacement: "P".to_string(),
        });
        assert_eq!(apply(&spec, DataValue::text("Pass!")), DataValue::text("P!"));
    }

    #[test]
    fn non_finite_becomes_blank() {
        let mut spec = spec();
        spec.adjustment = Some(Adjustment {
            op: ArithmeticOp::Multiply,
            operand: f64::MAX,
        });
        assert_eq!(apply(&spec, DataValue::Number(f64::MAX)), DataValue::Empty);
    }
}
