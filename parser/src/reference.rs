//! FILENAME: parser/src/reference.rs
//! PURPOSE: Grammar for column references embedded in free-form text.
//! CONTEXT: Templates, condition rules and formulas are stored as plain text
//! containing zero or more delimited reference tokens. This module finds them,
//! turns them into `Reference` values, formats them back, and splices
//! replacements into text by token span.
//!
//! TOKEN FORMS:
//! - Delimited: `$BASE$`, `$BASE.2$`, `$BASE.2.join_bullets$`, `$BASE.round1$`
//! - Legacy:    `BASE->>"$[2]"` (normalized to `$BASE.2$`)
//!
//! A non-numeric second segment makes the token "simple": no sub-field, and the
//! remaining segments form the formatter name.

use crate::parser::{ParseError, ParseResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// The delimiter that opens and closes a reference token.
pub const DELIMITER: char = '$';

const LEGACY_MARKER: &str = "->>";

/// A parsed column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference {
    pub base_column_id: String,
    pub sub_field_index: Option<usize>,
    pub magic_formatter: Option<String>,
}

impl Reference {
    /// A whole-column reference.
    pub fn new(base_column_id: impl Into<String>) -> Self {
        Reference {
            base_column_id: base_column_id.into(),
            sub_field_index: None,
            magic_formatter: None,
        }
    }

    pub fn with_sub_field(mut self, index: usize) -> Self {
        self.sub_field_index = Some(index);
        self
    }

    pub fn with_formatter(mut self, name: impl Into<String>) -> Self {
        self.magic_formatter = Some(name.into());
        self
    }

    /// True when the reference carries no sub-field index.
    pub fn is_simple(&self) -> bool {
        self.sub_field_index.is_none()
    }

    /// The same reference without its formatter (`BASE` or `BASE.N`).
    pub fn without_formatter(&self) -> Reference {
        Reference {
            base_column_id: self.base_column_id.clone(),
            sub_field_index: self.sub_field_index,
            magic_formatter: None,
        }
    }

    /// Whether `format` followed by `parse` reproduces this reference exactly.
    ///
    /// The base id must be non-empty and drawn from `[A-Za-z0-9_-]`. Every
    /// formatter segment must be non-empty and drawn from the same set, and the
    /// first segment must not be all digits (it would read back as an index).
    pub fn is_well_formed(&self) -> bool {
        if !is_valid_id(&self.base_column_id) {
            return false;
        }
        match &self.magic_formatter {
            None => true,
            Some(name) => {
                let mut segments = name.split('.');
                let first_ok = segments
                    .next()
                    .is_some_and(|first| is_valid_id(first) && !is_index(first));
                first_ok && segments.all(is_valid_id)
            }
        }
    }

    /// The undelimited form stored in configuration lists, e.g. `COL.2.round1`.
    pub fn to_bare(&self) -> String {
        let mut out = self.base_column_id.clone();
        if let Some(index) = self.sub_field_index {
            out.push('.');
            out.push_str(&index.to_string());
        }
        if let Some(formatter) = &self.magic_formatter {
            out.push('.');
            out.push_str(formatter);
        }
        out
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_bare())
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> String {
        reference.to_bare()
    }
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(raw: String) -> ParseResult<Reference> {
        parse_bare(&raw)
    }
}

// ============================================================================
// TOKEN SCANNING
// ============================================================================

/// One reference found in a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceToken<'a> {
    /// Byte range of the whole token, delimiters included.
    pub span: Range<usize>,
    pub raw: &'a str,
    pub reference: Reference,
    /// True when the token used the legacy bracket form.
    pub legacy: bool,
}

/// Lazy iterator over the reference tokens of a text.
///
/// The iterator is `Clone`, so a scan can be restarted from any point by
/// cloning it, or from the beginning by calling `parse` again.
#[derive(Debug, Clone)]
pub struct References<'a> {
    text: &'a str,
    pos: usize,
}

/// Scans `text` for reference tokens.
pub fn parse(text: &str) -> References<'_> {
    References { text, pos: 0 }
}

impl<'a> Iterator for References<'a> {
    type Item = ReferenceToken<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.text.as_bytes();

        while self.pos < bytes.len() {
            let start = self.pos;
            let byte = bytes[start];

            if byte == DELIMITER as u8 {
                if let Some((end, reference)) = scan_delimited(self.text, start) {
                    self.pos = end;
                    return Some(self.token(start..end, reference, false));
                }
                // Unterminated or empty token: treat the delimiter as text
                self.pos = start + 1;
            } else if is_id_byte(byte) {
                let run_end = start
                    + bytes[start..]
                        .iter()
                        .take_while(|b| is_id_byte(**b))
                        .count();
                if let Some((end, reference)) = scan_legacy(self.text, start, run_end) {
                    self.pos = end;
                    return Some(self.token(start..end, reference, true));
                }
                self.pos = run_end;
            } else {
                // Non-ASCII bytes never match either form, so stepping a
                // single byte never produces a slice inside a character
                self.pos = start + 1;
            }
        }

        None
    }
}

impl<'a> References<'a> {
    fn token(&self, span: Range<usize>, reference: Reference, legacy: bool) -> ReferenceToken<'a> {
        ReferenceToken {
            raw: &self.text[span.clone()],
            span,
            reference,
            legacy,
        }
    }
}

impl std::iter::FusedIterator for References<'_> {}

/// Tries to read `$BODY$` starting at `start`. Returns the end offset and the reference.
fn scan_delimited(text: &str, start: usize) -> Option<(usize, Reference)> {
    let bytes = text.as_bytes();
    let body_start = start + 1;
    let body_len = bytes[body_start..]
        .iter()
        .take_while(|b| is_body_byte(**b))
        .count();
    let close = body_start + body_len;

    if body_len == 0 || bytes.get(close) != Some(&(DELIMITER as u8)) {
        return None;
    }

    let reference = parse_body(&text[body_start..close])?;
    Some((close + 1, reference))
}

/// Tries to read `BASE->>"$[N]"` where `start..run_end` is a run of id characters.
fn scan_legacy(text: &str, start: usize, run_end: usize) -> Option<(usize, Reference)> {
    let run = &text[start..run_end];
    // The id run swallows the '-' that opens the marker
    if !run.ends_with('-') || !text[run_end - 1..].starts_with(LEGACY_MARKER) {
        return None;
    }

    let rest = &text[run_end - 1 + LEGACY_MARKER.len()..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = rest[1..].strip_prefix("$[")?;
    let digits_len = inner.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len == 0 {
        return None;
    }
    let after_digits = &inner[digits_len..];
    if !after_digits.starts_with(']') || !after_digits[1..].starts_with(quote) {
        return None;
    }

    // Legacy ids never contained '-', so the base ends at the first one
    let base = run.split('-').next().filter(|b| !b.is_empty())?;
    let index = inner[..digits_len].parse::<usize>().ok()?;

    let consumed = LEGACY_MARKER.len() + 1 + 2 + digits_len + 2;
    let end = run_end - 1 + consumed;
    Some((end, Reference::new(base).with_sub_field(index)))
}

/// Parses the text between the delimiters.
fn parse_body(body: &str) -> Option<Reference> {
    let mut segments = body.split('.');
    let base = segments.next()?;
    if !is_valid_id(base) {
        return None;
    }

    let rest: Vec<&str> = segments.collect();
    let (sub_field_index, formatter_segments) = match rest.first() {
        Some(first) if is_index(first) => (first.parse::<usize>().ok(), &rest[1..]),
        _ => (None, &rest[..]),
    };

    let formatter: Vec<&str> = formatter_segments
        .iter()
        .copied()
        .filter(|s| !s.is_empty())
        .collect();

    Some(Reference {
        base_column_id: base.to_string(),
        sub_field_index,
        magic_formatter: if formatter.is_empty() {
            None
        } else {
            Some(formatter.join("."))
        },
    })
}

/// Parses a single undelimited reference as stored in configuration.
///
/// Accepts `COL`, `COL.2`, `COL.2.fmt`, the delimited `$COL.2$`, and the
/// legacy `COL->>"$[2]"`.
pub fn parse_bare(raw: &str) -> ParseResult<Reference> {
    let trimmed = raw.trim();

    if trimmed.contains(LEGACY_MARKER) {
        return parse(trimmed)
            .find(|token| token.legacy && token.span == (0..trimmed.len()))
            .map(|token| token.reference)
            .ok_or_else(|| ParseError::new(format!("Malformed legacy reference: {}", raw)));
    }

    let body = trimmed
        .strip_prefix(DELIMITER)
        .and_then(|inner| inner.strip_suffix(DELIMITER))
        .unwrap_or(trimmed);

    if body.is_empty() || !body.bytes().all(is_body_byte) {
        return Err(ParseError::new(format!("Invalid reference: {}", raw)));
    }

    parse_body(body).ok_or_else(|| ParseError::new(format!("Invalid reference: {}", raw)))
}

/// Formats a reference as a delimited token.
pub fn format(reference: &Reference) -> String {
    format!("{}{}{}", DELIMITER, reference.to_bare(), DELIMITER)
}

// ============================================================================
// SPLICING
// ============================================================================

/// Rebuilds `text`, replacing each token for which `replace` returns `Some`.
///
/// Replacement works on the spans produced by a single scan of the original
/// text, so replacement output is never rescanned. Returns the new text and
/// the number of tokens replaced.
pub fn splice<F>(text: &str, mut replace: F) -> (String, usize)
where
    F: FnMut(&ReferenceToken<'_>) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut replaced = 0;

    for token in parse(text) {
        if let Some(replacement) = replace(&token) {
            out.push_str(&text[cursor..token.span.start]);
            out.push_str(&replacement);
            cursor = token.span.end;
            replaced += 1;
        }
    }

    out.push_str(&text[cursor..]);
    (out, replaced)
}

/// Rewrites every legacy bracket token in `text` into the delimited dotted form.
pub fn normalize_legacy(text: &str) -> String {
    splice(text, |token| token.legacy.then(|| format(&token.reference))).0
}

// ============================================================================
// CHARACTER CLASSES
// ============================================================================

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn is_body_byte(b: u8) -> bool {
    is_id_byte(b) || b == b'.'
}

fn is_valid_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_id_byte)
}

fn is_index(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && s.parse::<usize>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(text: &str) -> Vec<Reference> {
        parse(text).map(|t| t.reference).collect()
    }

    #[test]
    fn bare_base_id_is_whole_column() {
        assert_eq!(refs("$COL123$"), vec![Reference::new("COL123")]);
    }

    #[test]
    fn numeric_second_segment_is_sub_field() {
        assert_eq!(
            refs("$COL123.2$"),
            vec![Reference::new("COL123").with_sub_field(2)]
        );
    }

    #[test]
    fn non_numeric_second_segment_is_simple_with_formatter() {
        let parsed = refs("$COL.round1$");
        assert_eq!(parsed, vec![Reference::new("COL").with_formatter("round1")]);
        assert!(parsed[0].is_simple());
    }

    #[test]
    fn dotted_formatter_keeps_its_suffix() {
        assert_eq!(
            refs("$COL.1.image.w150$"),
            vec![Reference::new("COL").with_sub_field(1).with_formatter("image.w150")]
        );
    }

    #[test]
    fn currency_amounts_are_not_references() {
        let tokens: Vec<_> = parse("costs $5 and $COL_a$ today").collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].raw, "$COL_a$");
        assert_eq!(tokens[0].span, 13..20);
    }

    #[test]
    fn adjacent_tokens_are_found_separately() {
        assert_eq!(refs("$A$$B$"), vec![Reference::new("A"), Reference::new("B")]);
    }

    #[test]
    fn legacy_form_is_normalized() {
        let tokens: Vec<_> = parse(r#"value COL_x->>"$[3]" end"#).collect();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].legacy);
        assert_eq!(tokens[0].reference, Reference::new("COL_x").with_sub_field(3));
        assert_eq!(
            normalize_legacy(r#"value COL_x->>"$[3]" end"#),
            "value $COL_x.3$ end"
        );
    }

    #[test]
    fn parse_bare_accepts_all_stored_forms() {
        assert_eq!(parse_bare("COL").unwrap(), Reference::new("COL"));
        assert_eq!(parse_bare("$COL.4$").unwrap(), Reference::new("COL").with_sub_field(4));
        assert_eq!(
            parse_bare("COL->>'$[0]'").unwrap(),
            Reference::new("COL").with_sub_field(0)
        );
        assert!(parse_bare("").is_err());
        assert!(parse_bare("bad id!").is_err());
    }

    #[test]
    fn iterator_is_restartable_by_clone() {
        let mut scan = parse("$A$ $B$ $C$");
        scan.next();
        let resumed: Vec<_> = scan.clone().map(|t| t.reference.base_column_id).collect();
        let again: Vec<_> = scan.map(|t| t.reference.base_column_id).collect();
        assert_eq!(resumed, vec!["B", "C"]);
        assert_eq!(resumed, again);
    }

    #[test]
    fn splice_does_not_rescan_replacements() {
        let (out, count) = splice("$A.0$ $A.1$", |t| {
            let next = t.reference.sub_field_index.map(|i| i + 1)?;
            Some(format(&Reference::new("A").with_sub_field(next)))
        });
        assert_eq!(out, "$A.1$ $A.2$");
        assert_eq!(count, 2);
    }

    #[test]
    fn reference_serializes_as_bare_string() {
        let reference = Reference::new("COL").with_sub_field(1);
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"COL.1\"");
        let back: Reference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}
