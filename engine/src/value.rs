//! FILENAME: engine/src/value.rs
//! PURPOSE: The value type stored against an identifier for a column.
//! CONTEXT: Stored data is loosely shaped: simple columns hold text or numbers,
//! multi-field columns hold a positional list, file columns hold records.
//! `DataValue` mirrors that JSON shape and offers the coercions the resolver
//! and the aggregation strategies need.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// A stored or computed value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<DataValue>),
    Map(BTreeMap<String, DataValue>),
}

impl DataValue {
    pub fn text(s: impl Into<String>) -> Self {
        DataValue::Text(s.into())
    }

    /// Blank means "no data": empty, whitespace-only text, or an empty list.
    pub fn is_blank(&self) -> bool {
        match self {
            DataValue::Empty => true,
            DataValue::Text(s) => s.trim().is_empty(),
            DataValue::List(items) => items.is_empty(),
            DataValue::Map(map) => map.is_empty(),
            DataValue::Bool(_) | DataValue::Number(_) => false,
        }
    }

    /// Numeric coercion. Text is trimmed and parsed; non-finite results are rejected.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DataValue::Number(n) if n.is_finite() => Some(*n),
            DataValue::Text(s) => parse_number(s),
            _ => None,
        }
    }

    /// Positional view of the value when it holds a list.
    ///
    /// Text that contains a JSON array is decoded. Anything else is not a list.
    pub fn as_list(&self) -> Option<Cow<'_, [DataValue]>> {
        match self {
            DataValue::List(items) => Some(Cow::Borrowed(items.as_slice())),
            DataValue::Text(s) if s.trim_start().starts_with('[') => {
                serde_json::from_str::<Vec<DataValue>>(s).ok().map(Cow::Owned)
            }
            _ => None,
        }
    }

    /// Flattens nested lists into their leaf values.
    pub fn flatten(&self) -> Vec<DataValue> {
        match self.as_list() {
            Some(items) => items.iter().flat_map(|item| item.flatten()).collect(),
            None => vec![self.clone()],
        }
    }

    /// Text form used for substitution and comparison.
    pub fn to_text(&self) -> String {
        match self {
            DataValue::Empty => String::new(),
            DataValue::Bool(b) => b.to_string(),
            DataValue::Number(n) => format_number(*n),
            DataValue::Text(s) => s.clone(),
            DataValue::List(_) | DataValue::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl From<f64> for DataValue {
    fn from(n: f64) -> Self {
        DataValue::Number(n)
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::Text(s.to_string())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::Text(s)
    }
}

impl<T: Into<DataValue>> From<Vec<T>> for DataValue {
    fn from(items: Vec<T>) -> Self {
        DataValue::List(items.into_iter().map(Into::into).collect())
    }
}

/// Parses trimmed text as a finite number.
pub fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Formats a number without a trailing ".0" for integral values.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{:.0}", n)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_covers_whitespace_and_empty_lists() {
        assert!(DataValue::Empty.is_blank());
        assert!(DataValue::text("   ").is_blank());
        assert!(DataValue::List(vec![]).is_blank());
        assert!(!DataValue::Number(0.0).is_blank());
    }

    #[test]
    fn numeric_coercion_rejects_non_finite_text() {
        assert_eq!(DataValue::text(" 4.5 ").as_number(), Some(4.5));
        assert_eq!(DataValue::text("nan").as_number(), None);
        assert_eq!(DataValue::text("inf").as_number(), None);
        assert_eq!(DataValue::text("abc").as_number(), None);
    }

    #[test]
    fn json_text_is_read_as_list() {
        let value = DataValue::text(r#"["a", 2, null]"#);
        let list = value.as_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[1], DataValue::Number(2.0));
        assert_eq!(list[2], DataValue::Empty);
        assert!(DataValue::text("plain").as_list().is_none());
    }

    #[test]
    fn integral_numbers_format_without_fraction() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-13.0), "-13");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[test]
    fn untagged_json_round_trip() {
        let value = DataValue::from(vec!["x", "y"]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"["x","y"]"#);
        let back: DataValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
