//! FILENAME: engine/src/migration.rs
//! PURPOSE: Remaps stored references after a multi-field column's sub-fields change.
//! CONTEXT: Sub-field indices are positional; only labels survive a reorder.
//! A migration runs in three phases:
//!   1. Diff: match each new sub-field to an old one, by label at the same
//!      position, then by label anywhere, then by edit distance above a
//!      similarity threshold. Each old sub-field is matched at most once.
//!   2. Locate: scan every dependent asset for references to the column
//!      whose index was moved.
//!   3. Rewrite: splice each located token by span with its new index.
//!
//! Rewriting works on the spans of a single scan, so a token already moved to
//! index N is never picked up again as "old N" in the same pass.

use crate::aggregation::AggregationSpec;
use crate::column::{ColumnId, ColumnMetadata, SubField};
use crate::conditions::ConditionGroup;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::memory::MemorySchema;
use parser::{splice, Reference};
use std::collections::BTreeMap;

// ============================================================================
// EDIT DISTANCE
// ============================================================================

/// Levenshtein distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// 1.0 for identical labels, falling towards 0.0 as they diverge.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

// ============================================================================
// PLAN
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    SamePosition,
    Moved,
    Fuzzy,
}

/// Where one new sub-field came from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMapping {
    pub new_index: usize,
    pub new_label: String,
    /// `None` for a sub-field with no history to carry over.
    pub old_index: Option<usize>,
    pub old_label: Option<String>,
    pub matched_by: Option<MatchKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    pub column_id: ColumnId,
    /// True when any surviving sub-field changed position.
    pub shift_needed: bool,
    pub mapping: Vec<IndexMapping>,
    /// New indices that matched nothing and need a human to confirm.
    pub unmatched: Vec<usize>,
    /// Old index to new index, for moved sub-fields only.
    pub rewrites: BTreeMap<usize, usize>,
}

impl MigrationPlan {
    /// The unmatched indices as an error, when there are any.
    pub fn ambiguity(&self) -> Option<EngineError> {
        (!self.unmatched.is_empty()).then(|| EngineError::AmbiguousMigrationMatch {
            column_id: self.column_id.clone(),
            unmatched: self.unmatched.clone(),
        })
    }

    /// The moved counterpart of `reference`, if it points at a moved sub-field.
    pub fn remap(&self, reference: &Reference) -> Option<Reference> {
        if reference.base_column_id != self.column_id {
            return None;
        }
        let new_index = *self.rewrites.get(&reference.sub_field_index?)?;
        let mut moved = reference.clone();
        moved.sub_field_index = Some(new_index);
        Some(moved)
    }

    /// Rewrites every moved token in `text`. Returns the change count.
    pub fn rewrite_text(&self, text: &mut String) -> usize {
        if self.rewrites.is_empty() {
            return 0;
        }
        let (rewritten, count) = splice(text, |token| {
            self.remap(&token.reference)
                .map(|moved| parser::format_reference(&moved))
        });
        if count > 0 {
            *text = rewritten;
        }
        count
    }

    fn rewrite_reference(&self, reference: &mut Reference) -> usize {
        match self.remap(reference) {
            Some(moved) => {
                *reference = moved;
                1
            }
            None => 0,
        }
    }
}

/// Matches `new` sub-fields against `old` ones.
pub fn plan_migration(column_id: &str, old: &[SubField], new: &[SubField], threshold: f64) -> MigrationPlan {
    let mut claimed = vec![false; old.len()];
    let mut found: Vec<Option<(usize, MatchKind)>> = vec![None; new.len()];

    for (n, field) in new.iter().enumerate() {
        if old.get(n).is_some_and(|o| o.label == field.label) {
            claimed[n] = true;
            found[n] = Some((n, MatchKind::SamePosition));
        }
    }

    for (n, field) in new.iter().enumerate() {
        if found[n].is_some() {
            continue;
        }
        if let Some(o) = (0..old.len()).find(|&o| !claimed[o] && old[o].label == field.label) {
            claimed[o] = true;
            found[n] = Some((o, MatchKind::Moved));
        }
    }

    for (n, field) in new.iter().enumerate() {
        if found[n].is_some() {
            continue;
        }
        let mut best: Option<(usize, f64)> = None;
        for (o, candidate) in old.iter().enumerate() {
            if claimed[o] {
                continue;
            }
            let score = similarity(&field.label, &candidate.label);
            if score >= threshold && best.map_or(true, |(_, top)| score > top) {
                best = Some((o, score));
            }
        }
        if let Some((o, score)) = best {
            log_debug!(
                "MIGRATE",
                "{}: '{}' matched '{}' with similarity {:.3}",
                column_id,
                field.label,
                old[o].label,
                score
            );
            claimed[o] = true;
            found[n] = Some((o, MatchKind::Fuzzy));
        }
    }

    let mapping: Vec<IndexMapping> = new
        .iter()
        .zip(&found)
        .enumerate()
        .map(|(n, (field, found))| IndexMapping {
            new_index: n,
            new_label: field.label.clone(),
            old_index: found.map(|(o, _)| o),
            old_label: found.map(|(o, _)| old[o].label.clone()),
            matched_by: found.map(|(_, kind)| kind),
        })
        .collect();

    let rewrites: BTreeMap<usize, usize> = mapping
        .iter()
        .filter_map(|m| m.old_index.filter(|&o| o != m.new_index).map(|o| (o, m.new_index)))
        .collect();
    let unmatched: Vec<usize> = mapping
        .iter()
        .filter(|m| m.old_index.is_none())
        .map(|m| m.new_index)
        .collect();

    if !unmatched.is_empty() {
        log_warn!(
            "MIGRATE",
            "{}: sub-fields {:?} matched no previous sub-field",
            column_id,
            unmatched
        );
    }
    if !rewrites.is_empty() {
        log_info!("MIGRATE", "{}: {} sub-field(s) moved", column_id, rewrites.len());
    }

    MigrationPlan {
        column_id: column_id.to_string(),
        shift_needed: !rewrites.is_empty(),
        mapping,
        unmatched,
        rewrites,
    }
}

/// `plan_migration` with the configured similarity threshold.
pub fn plan_with_config(column_id: &str, old: &[SubField], new: &[SubField], config: &EngineConfig) -> MigrationPlan {
    plan_migration(column_id, old, new, config.similarity_threshold)
}

// ============================================================================
// ASSETS
// ============================================================================

/// Anything that stores references: templates, rule trees, formulas,
/// notification bodies. Owners expose their fields; the migrator rewrites them.
pub trait RewritableAsset {
    /// Free text that may contain delimited reference tokens.
    fn visit_text_fields(&mut self, f: &mut dyn FnMut(&mut String));

    /// Structured references stored outside of text.
    fn visit_reference_fields(&mut self, _f: &mut dyn FnMut(&mut Reference)) {}
}

/// A named set of free-text fields, e.g. a message template.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextAsset {
    pub id: String,
    pub fields: Vec<String>,
}

impl TextAsset {
    pub fn new(id: impl Into<String>, fields: Vec<String>) -> Self {
        TextAsset { id: id.into(), fields }
    }
}

impl RewritableAsset for TextAsset {
    fn visit_text_fields(&mut self, f: &mut dyn FnMut(&mut String)) {
        for field in &mut self.fields {
            f(field);
        }
    }
}

impl RewritableAsset for String {
    fn visit_text_fields(&mut self, f: &mut dyn FnMut(&mut String)) {
        f(self);
    }
}

impl RewritableAsset for AggregationSpec {
    fn visit_text_fields(&mut self, f: &mut dyn FnMut(&mut String)) {
        self.for_each_text_mut(f);
    }

    fn visit_reference_fields(&mut self, f: &mut dyn FnMut(&mut Reference)) {
        self.for_each_reference_mut(f);
    }
}

impl RewritableAsset for ConditionGroup {
    fn visit_text_fields(&mut self, f: &mut dyn FnMut(&mut String)) {
        self.for_each_rule_mut(&mut |rule| {
            for text in rule.value.texts_mut() {
                f(text);
            }
        });
    }

    fn visit_reference_fields(&mut self, f: &mut dyn FnMut(&mut Reference)) {
        self.for_each_rule_mut(&mut |rule| f(&mut rule.reference));
    }
}

impl RewritableAsset for ColumnMetadata {
    fn visit_text_fields(&mut self, f: &mut dyn FnMut(&mut String)) {
        if let Some(spec) = self.aggregation.as_mut() {
            spec.visit_text_fields(f);
        }
    }

    fn visit_reference_fields(&mut self, f: &mut dyn FnMut(&mut Reference)) {
        if let Some(spec) = self.aggregation.as_mut() {
            spec.visit_reference_fields(f);
        }
    }
}

/// Rewrites every asset. Returns the number of references changed per asset.
pub fn apply_migration(plan: &MigrationPlan, assets: &mut [&mut dyn RewritableAsset]) -> Vec<usize> {
    let counts: Vec<usize> = assets.iter_mut().map(|asset| rewrite_asset(plan, &mut **asset)).collect();
    log_info!(
        "MIGRATE",
        "{}: rewrote {} reference(s) across {} asset(s)",
        plan.column_id,
        counts.iter().sum::<usize>(),
        counts.len()
    );
    counts
}

fn rewrite_asset(plan: &MigrationPlan, asset: &mut dyn RewritableAsset) -> usize {
    if plan.rewrites.is_empty() {
        return 0;
    }
    let mut changed = 0;
    asset.visit_text_fields(&mut |text| changed += plan.rewrite_text(text));
    asset.visit_reference_fields(&mut |reference| changed += plan.rewrite_reference(reference));
    changed
}

/// Rewrites the aggregation specs of every column in `schema`.
/// Returns the ids of the columns that changed.
pub fn apply_to_schema(plan: &MigrationPlan, schema: &MemorySchema) -> Vec<ColumnId> {
    let mut changed = Vec::new();
    for column in schema.columns() {
        let mut column = (*column).clone();
        if rewrite_asset(plan, &mut column) > 0 {
            changed.push(column.id.clone());
            schema.insert(column);
        }
    }
    changed
}
