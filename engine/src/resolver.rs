//! FILENAME: engine/src/resolver.rs
//! PURPOSE: Turns references into values and substitutes them into text.
//! CONTEXT: The resolver combines the reference grammar, the schema accessor
//! and one identifier's snapshot. It never mutates either side, so it can be
//! used concurrently for different identifiers.
//!
//! RESOLUTION ORDER:
//! 1. System identity fields come straight from the snapshot's identity.
//! 2. Otherwise the column must exist, or the reference is dangling.
//! 3. Multi-field columns with an index yield the positional element.
//! 4. A magic formatter, when named, transforms the result.

use crate::column::{ColumnId, ColumnMetadata};
use crate::config::DanglingPolicy;
use crate::error::{EngineError, EngineResult};
use crate::formatter::MagicFormatter;
use crate::snapshot::{HistoryPick, Snapshot, SystemField, TimeWindow};
use crate::store::{SchemaAccessor, SnapshotStore};
use crate::value::{format_number, DataValue};
use parser::{splice, Reference};

/// Prefix of tokens owned by summary reports; never substituted here.
const SUMMARY_PREFIX: &str = "SMY_";

// ============================================================================
// RESOLVED VALUES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    /// The stored (or extracted) value, untransformed.
    Value(DataValue),
    /// Output of a magic formatter.
    Formatted(String),
}

impl ResolvedValue {
    pub fn to_text(&self) -> String {
        match self {
            ResolvedValue::Value(value) => value.to_text(),
            ResolvedValue::Formatted(text) => text.clone(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            ResolvedValue::Value(value) => value.is_blank(),
            ResolvedValue::Formatted(text) => text.trim().is_empty(),
        }
    }

    pub fn into_value(self) -> DataValue {
        match self {
            ResolvedValue::Value(value) => value,
            ResolvedValue::Formatted(text) => DataValue::Text(text),
        }
    }
}

/// A resolved value plus any recoverable problems met on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: ResolvedValue,
    pub warnings: Vec<EngineError>,
}

impl Resolved {
    fn clean(value: ResolvedValue) -> Self {
        Resolved {
            value,
            warnings: Vec::new(),
        }
    }
}

/// Positional element of a list value. Anything that is not a list, or an
/// index past the end, yields `Empty`.
pub fn extract_sub_field(value: &DataValue, index: usize) -> DataValue {
    value
        .as_list()
        .and_then(|items| items.get(index).cloned())
        .unwrap_or_default()
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct Resolver<'a> {
    schema: &'a dyn SchemaAccessor,
}

impl<'a> Resolver<'a> {
    pub fn new(schema: &'a dyn SchemaAccessor) -> Self {
        Resolver { schema }
    }

    /// Resolves one reference against one snapshot.
    ///
    /// Only a dangling base id is an `Err`. Out-of-range indices and unknown
    /// formatters resolve (to empty, or to the unformatted value) and are
    /// reported in `warnings`.
    pub fn resolve(&self, reference: &Reference, snapshot: &Snapshot) -> EngineResult<Resolved> {
        if let Some(field) = SystemField::from_base_id(&reference.base_column_id) {
            let value = DataValue::text(snapshot.identity.get(field));
            return Ok(self.apply_formatter(reference, value, None));
        }

        let Some(column) = self.schema.get_column(&reference.base_column_id) else {
            log_debug!("RESOLVER", "dangling reference {}", reference);
            return Err(EngineError::DanglingReference(reference.base_column_id.clone()));
        };

        let raw = snapshot.get(&column.id);
        let value = match reference.sub_field_index {
            Some(index) if column.is_multi_field() => {
                let available = column.sub_fields.len();
                if available > 0 && index >= available {
                    log_debug!("RESOLVER", "index {} out of range for {}", index, column.id);
                    return Ok(Resolved {
                        value: ResolvedValue::Value(DataValue::Empty),
                        warnings: vec![EngineError::InvalidSubFieldIndex {
                            column_id: column.id.clone(),
                            index,
                            available,
                        }],
                    });
                }
                extract_sub_field(raw, index)
            }
            Some(index) => {
                log_debug!("RESOLVER", "{} has no sub-fields, index {} is invalid", column.id, index);
                return Ok(Resolved {
                    value: ResolvedValue::Value(DataValue::Empty),
                    warnings: vec![EngineError::InvalidSubFieldIndex {
                        column_id: column.id.clone(),
                        index,
                        available: 0,
                    }],
                });
            }
            None => raw.clone(),
        };

        Ok(self.apply_formatter(reference, value, Some(&*column)))
    }

    /// Like `resolve`, but a failure becomes `Empty` with the error pushed
    /// onto `diagnostics`.
    pub fn resolve_or_blank(&self, reference: &Reference, snapshot: &Snapshot, diagnostics: &mut Vec<EngineError>) -> ResolvedValue {
        match self.resolve(reference, snapshot) {
            Ok(resolved) => {
                diagnostics.extend(resolved.warnings);
                resolved.value
            }
            Err(err) => {
                diagnostics.push(err);
                ResolvedValue::Value(DataValue::Empty)
            }
        }
    }

    fn apply_formatter(&self, reference: &Reference, value: DataValue, column: Option<&ColumnMetadata>) -> Resolved {
        let Some(name) = reference.magic_formatter.as_deref() else {
            return Resolved::clean(ResolvedValue::Value(value));
        };
        match MagicFormatter::parse(name) {
            Some(formatter) => Resolved::clean(ResolvedValue::Formatted(formatter.apply(
                &value,
                column,
                reference.sub_field_index,
            ))),
            None => {
                log_warn!("RESOLVER", "unknown formatter '{}' in {}, passing value through", name, reference);
                Resolved {
                    value: ResolvedValue::Value(value),
                    warnings: vec![EngineError::UnknownFormatter(name.to_string())],
                }
            }
        }
    }

    /// Replaces every reference in `text` with its resolved text.
    pub fn substitute(&self, text: &str, snapshot: &Snapshot, options: &SubstituteOptions) -> Substitution {
        let mut diagnostics = Vec::new();

        let (text, replaced) = splice(text, |token| {
            if token.reference.base_column_id.starts_with(SUMMARY_PREFIX) {
                return None;
            }
            let replacement = match self.resolve(&token.reference, snapshot) {
                Ok(resolved) => {
                    diagnostics.extend(resolved.warnings);
                    render(&resolved.value, options)
                }
                Err(err) => {
                    log_warn!("RESOLVER", "{} in '{}'", err, token.raw);
                    diagnostics.push(err);
                    options.dangling.placeholder().to_string()
                }
            };
            Some(replacement)
        });

        Substitution {
            text,
            diagnostics,
            replaced,
        }
    }
}

fn render(value: &ResolvedValue, options: &SubstituteOptions) -> String {
    if value.is_blank() {
        if let Some(blank) = &options.blank_replacement {
            return blank.clone();
        }
    }
    match value {
        ResolvedValue::Value(v) if options.wrap_negative_numbers => match v.as_number() {
            Some(n) if n < 0.0 => format!("({})", format_number(n)),
            _ => v.to_text(),
        },
        other => other.to_text(),
    }
}

// ============================================================================
// SUBSTITUTION
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SubstituteOptions {
    pub dangling: DanglingPolicy,
    /// Text used for blank values, e.g. `"0"` inside formulas.
    pub blank_replacement: Option<String>,
    /// Parenthesize negative numbers so they survive operator precedence.
    pub wrap_negative_numbers: bool,
}

impl SubstituteOptions {
    /// Options used when substituting into an arithmetic formula.
    pub fn for_formula(blank_as_zero: bool) -> Self {
        SubstituteOptions {
            dangling: DanglingPolicy::Empty,
            blank_replacement: blank_as_zero.then(|| "0".to_string()),
            wrap_negative_numbers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub text: String,
    pub diagnostics: Vec<EngineError>,
    /// Number of tokens replaced.
    pub replaced: usize,
}

/// Distinct base column ids named in `text`, in order of first appearance.
pub fn column_ids_in(text: &str) -> Vec<ColumnId> {
    let mut ids: Vec<ColumnId> = Vec::new();
    for token in parser::parse_references(text) {
        let id = token.reference.base_column_id;
        if !id.starts_with(SUMMARY_PREFIX) && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Builds a snapshot for template rendering, optionally taking each column's
/// value from its change history instead of its current value.
///
/// `HistoryPick::All` keeps the current values. The other picks replace each
/// column with the single selected history point, or `Empty` when the window
/// holds none.
pub fn fetch_snapshot(
    store: &dyn SnapshotStore,
    identifier: &str,
    column_ids: &[ColumnId],
    pick: HistoryPick,
    window: &TimeWindow,
) -> Option<Snapshot> {
    let mut snapshot = store.get_attributes(identifier, column_ids)?;
    if pick == HistoryPick::All {
        return Some(snapshot);
    }

    let own_username = snapshot.identity.username.clone();
    for column_id in column_ids {
        let history = store.get_history(identifier, column_id, window);
        let value = pick
            .select(&history, &own_username)
            .first()
            .map(|entry| entry.value.clone())
            .unwrap_or_default();
        snapshot.set(column_id.clone(), value);
    }
    Some(snapshot)
}

/// Fetches the columns `text` names for one identifier and substitutes them.
pub fn substitute_for(
    schema: &dyn SchemaAccessor,
    store: &dyn SnapshotStore,
    identifier: &str,
    text: &str,
    options: &SubstituteOptions,
) -> EngineResult<Substitution> {
    let ids = column_ids_in(text);
    let snapshot = store
        .get_attributes(identifier, &ids)
        .ok_or_else(|| EngineError::UnknownIdentifier(identifier.to_string()))?;
    Ok(Resolver::new(schema).substitute(text, &snapshot, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnKind, SubField};
    use crate::memory::{MemorySchema, MemorySnapshots};
    use crate::snapshot::IdentityAttributes;
    use chrono::{TimeZone, Utc};

    fn schema() -> MemorySchema {
        let schema = MemorySchema::new();
        schema.insert(ColumnMetadata::multi_field(
            "COL123",
            "T1",
            "Quiz",
            vec![SubField::new("Q1"), SubField::new("Q2"), SubField::new("Q3")],
        ));
        schema.insert(ColumnMetadata::new("SCORE", "T1", "Score", ColumnKind::SimpleEntry));
        schema
    }

    fn snapshot() -> Snapshot {
        let identity = IdentityAttributes {
            preferred_name: "Ada".to_string(),
            username: "ada1".to_string(),
            ..IdentityAttributes::default()
        };
        let mut snapshot = Snapshot::new("s1", identity);
        snapshot.set("COL123", DataValue::from(vec!["first", "second", "third"]));
        snapshot.set("SCORE", DataValue::Number(-3.0));
        snapshot
    }

    fn resolve(text: &str) -> EngineResult<Resolved> {
        let schema = schema();
        let reference = parser::parse_bare(text).unwrap();
        Resolver::new(&schema).resolve(&reference, &snapshot())
    }

    #[test]
    fn sub_field_index_selects_position() {
        let resolved = resolve("COL123.2").unwrap();
        assert_eq!(resolved.value, ResolvedValue::Value(DataValue::text("third")));
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn whole_column_keeps_the_list() {
        let resolved = resolve("COL123").unwrap();
        assert_eq!(resolved.value.to_text(), r#"["first","second","third"]"#);
    }

    #[test]
    fn system_fields_bypass_schema() {
        let resolved = resolve("PREFERREDNAME").unwrap();
        assert_eq!(resolved.value.to_text(), "Ada");
    }

    #[test]
    fn dangling_reference_is_an_error() {
        assert_eq!(
            resolve("NOPE").unwrap_err(),
            EngineError::DanglingReference("NOPE".to_string())
        );
    }

    #[test]
    fn out_of_range_index_is_empty_with_warning() {
        let resolved = resolve("COL123.7").unwrap();
        assert!(resolved.value.is_blank());
        assert!(matches!(
            resolved.warnings[0],
            EngineError::InvalidSubFieldIndex { index: 7, available: 3, .. }
        ));
    }

    #[test]
    fn index_on_single_value_column_is_empty_with_warning() {
        let resolved = resolve("SCORE.2").unwrap();
        assert!(resolved.value.is_blank());
        assert_eq!(
            resolved.warnings,
            vec![EngineError::InvalidSubFieldIndex {
                column_id: "SCORE".to_string(),
                index: 2,
                available: 0,
            }]
        );
    }

    #[test]
    fn malformed_stored_value_is_empty() {
        let schema = schema();
        let mut snapshot = snapshot();
        snapshot.set("COL123", DataValue::text("not a list"));
        let reference = parser::parse_bare("COL123.1").unwrap();
        let resolved = Resolver::new(&schema).resolve(&reference, &snapshot).unwrap();
        assert!(resolved.value.is_blank());
    }

    #[test]
    fn unknown_formatter_passes_through() {
        let resolved = resolve("COL123.0.sparkle").unwrap();
        assert_eq!(resolved.value.to_text(), "first");
        assert_eq!(
            resolved.warnings,
            vec![EngineError::UnknownFormatter("sparkle".to_string())]
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        assert_eq!(resolve("COL123.1.join_bullets"), resolve("COL123.1.join_bullets"));
    }

    #[test]
    fn substitute_splices_tokens_and_placeholders() {
        let schema = schema();
        let options = SubstituteOptions {
            dangling: DanglingPolicy::Marker("[?]".to_string()),
            ..SubstituteOptions::default()
        };
        let out = Resolver::new(&schema).substitute(
            "Hi $PREFERREDNAME$, Q2 was $COL123.1$, $GONE$ and $SMY_TOTAL$",
            &snapshot(),
            &options,
        );
        assert_eq!(out.text, "Hi Ada, Q2 was second, [?] and $SMY_TOTAL$");
        assert_eq!(out.replaced, 3);
        assert_eq!(out.diagnostics.len(), 1);
    }

    #[test]
    fn formula_options_wrap_negatives_and_zero_blanks() {
        let schema = schema();
        let mut snapshot = snapshot();
        snapshot.set("COL123", DataValue::List(vec![]));
        let out = Resolver::new(&schema).substitute(
            "$SCORE$ ^ 2 + $COL123.0$",
            &snapshot,
            &SubstituteOptions::for_formula(true),
        );
        assert_eq!(out.text, "(-3) ^ 2 + 0");
    }

    #[test]
    fn column_ids_are_distinct_in_order() {
        assert_eq!(
            column_ids_in("$B$ $A.1$ $B.round1$ $SMY_X$"),
            vec!["B".to_string(), "A".to_string()]
        );
    }

    #[test]
    fn history_pick_replaces_current_values() {
        let store = MemorySnapshots::new();
        let identity = IdentityAttributes {
            username: "s1".to_string(),
            ..IdentityAttributes::default()
        };
        store.enrol("s1", "T1", identity);
        let t = |m| Utc.with_ymd_and_hms(2024, 2, 1, 10, m, 0).unwrap();
        store.set_value_at("s1", "SCORE", DataValue::Number(1.0), "tutor", t(0));
        store.set_value_at("s1", "SCORE", DataValue::Number(2.0), "s1", t(5));
        store.set_value_at("s1", "SCORE", DataValue::Number(3.0), "tutor", t(9));

        let ids = vec!["SCORE".to_string()];
        let window = TimeWindow::unbounded();
        let latest = fetch_snapshot(&store, "s1", &ids, HistoryPick::Latest, &window).unwrap();
        let own = fetch_snapshot(&store, "s1", &ids, HistoryPick::UserLatest, &window).unwrap();
        let earliest = fetch_snapshot(&store, "s1", &ids, HistoryPick::Earliest, &window).unwrap();
        assert_eq!(latest.get("SCORE"), &DataValue::Number(3.0));
        assert_eq!(own.get("SCORE"), &DataValue::Number(2.0));
        assert_eq!(earliest.get("SCORE"), &DataValue::Number(1.0));
    }
}
