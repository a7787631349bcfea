//! FILENAME: engine/src/conditions.rs
//! PURPOSE: Condition trees used by case-builder aggregation.
//! CONTEXT: A tree is a group of rules and nested groups joined by AND or OR,
//! optionally negated. Each rule compares a resolved reference against a
//! value that may itself contain references.
//!
//! COMPARISON MODES:
//! - Numeric when both sides parse as numbers.
//! - Otherwise text, compared case-insensitively.

use crate::error::EngineError;
use crate::resolver::{Resolver, SubstituteOptions};
use crate::snapshot::Snapshot;
use crate::value::{format_number, parse_number};
use parser::Reference;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combiner {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    In,
    NotIn,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Between,
    NotBetween,
    BeginsWith,
    NotBeginsWith,
    Contains,
    NotContains,
    EndsWith,
    NotEndsWith,
    IsEmpty,
    IsNotEmpty,
    MatchesRegex,
    NotMatchesRegex,
}

impl Operator {
    /// Maps a comparator string from legacy stored rules.
    pub fn from_legacy(comparator: &str) -> Option<Operator> {
        let op = match comparator.trim().to_ascii_uppercase().as_str() {
            "=" | "==" => Operator::Equal,
            "<>" | "!=" => Operator::NotEqual,
            ">" => Operator::Greater,
            "<" => Operator::Less,
            ">=" => Operator::GreaterOrEqual,
            "<=" => Operator::LessOrEqual,
            "LIKE" => Operator::Contains,
            "NOT LIKE" => Operator::NotContains,
            "STARTSWITH" => Operator::BeginsWith,
            "ENDSWITH" => Operator::EndsWith,
            "IN" => Operator::In,
            "NOT IN" => Operator::NotIn,
            "BETWEEN" => Operator::Between,
            "NOT BETWEEN" => Operator::NotBetween,
            "IS NULL" => Operator::IsEmpty,
            "IS NOT NULL" => Operator::IsNotEmpty,
            _ => return None,
        };
        Some(op)
    }
}

/// Right-hand side of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl Default for RuleValue {
    fn default() -> Self {
        RuleValue::Text(String::new())
    }
}

impl RuleValue {
    /// Mutable access to every text part, for substitution and rewriting.
    pub fn texts_mut(&mut self) -> Vec<&mut String> {
        match self {
            RuleValue::Number(_) => Vec::new(),
            RuleValue::Text(text) => vec![text],
            RuleValue::List(items) => items.iter_mut().collect(),
        }
    }

    fn texts(&self) -> Vec<String> {
        match self {
            RuleValue::Number(n) => vec![format_number(*n)],
            RuleValue::Text(text) => vec![text.clone()],
            RuleValue::List(items) => items.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub reference: Reference,
    pub operator: Operator,
    #[serde(default)]
    pub value: RuleValue,
}

impl Rule {
    pub fn new(reference: Reference, operator: Operator, value: RuleValue) -> Self {
        Rule {
            reference,
            operator,
            value,
        }
    }

    pub fn evaluate(&self, resolver: &Resolver<'_>, snapshot: &Snapshot, diagnostics: &mut Vec<EngineError>) -> bool {
        let left = resolver.resolve_or_blank(&self.reference, snapshot, diagnostics);

        let options = SubstituteOptions::default();
        let right: Vec<String> = self
            .value
            .texts()
            .into_iter()
            .map(|text| {
                let substituted = resolver.substitute(&text, snapshot, &options);
                diagnostics.extend(substituted.diagnostics);
                substituted.text
            })
            .collect();

        match self.operator {
            Operator::IsEmpty => left.is_blank(),
            Operator::IsNotEmpty => !left.is_blank(),
            op => compare(op, &left.to_text(), &right),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Rule(Rule),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub combiner: Combiner,
    #[serde(default)]
    pub not: bool,
    pub rules: Vec<ConditionNode>,
}

impl ConditionGroup {
    pub fn all(rules: Vec<ConditionNode>) -> Self {
        ConditionGroup {
            combiner: Combiner::And,
            not: false,
            rules,
        }
    }

    pub fn any(rules: Vec<ConditionNode>) -> Self {
        ConditionGroup {
            combiner: Combiner::Or,
            not: false,
            rules,
        }
    }

    pub fn negated(mut self) -> Self {
        self.not = !self.not;
        self
    }

    /// An empty AND group is true; an empty OR group is false.
    pub fn evaluate(&self, resolver: &Resolver<'_>, snapshot: &Snapshot, diagnostics: &mut Vec<EngineError>) -> bool {
        let mut results = self.rules.iter().map(|node| match node {
            ConditionNode::Group(group) => group.evaluate(resolver, snapshot, diagnostics),
            ConditionNode::Rule(rule) => rule.evaluate(resolver, snapshot, diagnostics),
        });
        let combined = match self.combiner {
            Combiner::And => results.all(|r| r),
            Combiner::Or => results.any(|r| r),
        };
        combined != self.not
    }

    /// Every reference in the tree: rule subjects and references inside values.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<Reference>) {
        for node in &self.rules {
            match node {
                ConditionNode::Group(group) => group.collect_references(out),
                ConditionNode::Rule(rule) => {
                    out.push(rule.reference.clone());
                    for text in rule.value.texts() {
                        out.extend(parser::parse_references(&text).map(|t| t.reference));
                    }
                }
            }
        }
    }

    /// Visits every rule mutably, depth first.
    pub fn for_each_rule_mut(&mut self, f: &mut dyn FnMut(&mut Rule)) {
        for node in &mut self.rules {
            match node {
                ConditionNode::Group(group) => group.for_each_rule_mut(f),
                ConditionNode::Rule(rule) => f(rule),
            }
        }
    }
}

impl From<Rule> for ConditionNode {
    fn from(rule: Rule) -> Self {
        ConditionNode::Rule(rule)
    }
}

impl From<ConditionGroup> for ConditionNode {
    fn from(group: ConditionGroup) -> Self {
        ConditionNode::Group(group)
    }
}

// ============================================================================
// COMPARISON
// ============================================================================

fn compare(op: Operator, left: &str, right: &[String]) -> bool {
    let first = right.first().map(String::as_str).unwrap_or("");
    let left_lower = left.to_lowercase();
    let first_lower = first.to_lowercase();

    match op {
        Operator::Equal => ordering(left, first) == Ordering::Equal,
        Operator::NotEqual => ordering(left, first) != Ordering::Equal,
        Operator::Less => ordering(left, first) == Ordering::Less,
        Operator::LessOrEqual => ordering(left, first) != Ordering::Greater,
        Operator::Greater => ordering(left, first) == Ordering::Greater,
        Operator::GreaterOrEqual => ordering(left, first) != Ordering::Less,
        Operator::In => membership(&left_lower, right),
        Operator::NotIn => !membership(&left_lower, right),
        Operator::Between => between(left, right).unwrap_or(false),
        Operator::NotBetween => between(left, right).map(|inside| !inside).unwrap_or(false),
        Operator::BeginsWith => left_lower.starts_with(&first_lower),
        Operator::NotBeginsWith => !left_lower.starts_with(&first_lower),
        Operator::Contains => left_lower.contains(&first_lower),
        Operator::NotContains => !left_lower.contains(&first_lower),
        Operator::EndsWith => left_lower.ends_with(&first_lower),
        Operator::NotEndsWith => !left_lower.ends_with(&first_lower),
        Operator::MatchesRegex => regex_search(left, first).unwrap_or(false),
        Operator::NotMatchesRegex => regex_search(left, first).map(|hit| !hit).unwrap_or(false),
        Operator::IsEmpty => left.trim().is_empty(),
        Operator::IsNotEmpty => !left.trim().is_empty(),
    }
}

/// Numeric ordering when both sides are numbers, case-insensitive text otherwise.
fn ordering(left: &str, right: &str) -> Ordering {
    match (parse_number(left), parse_number(right)) {
        // Both finite, so -0 and 0 compare equal.
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.to_lowercase().cmp(&right.to_lowercase()),
    }
}

/// A single text value is split on commas.
fn split_items(right: &[String]) -> Vec<String> {
    let items: Vec<&str> = match right {
        [single] => single.split(',').collect(),
        many => many.iter().map(String::as_str).collect(),
    };
    items.into_iter().map(|s| s.trim().to_lowercase()).collect()
}

fn membership(left_lower: &str, right: &[String]) -> bool {
    let needle = left_lower.trim();
    split_items(right).iter().any(|item| item == needle)
}

/// Strict `lo < x < hi`. `None` when any part is not a number.
fn between(left: &str, right: &[String]) -> Option<bool> {
    let items = split_items(right);
    let [lo, hi] = items.as_slice() else {
        return None;
    };
    let x = parse_number(left)?;
    Some(parse_number(lo)? < x && x < parse_number(hi)?)
}

fn regex_search(left: &str, pattern: &str) -> Option<bool> {
    match Regex::new(pattern) {
        Ok(re) => Some(re.is_match(left)),
        Err(err) => {
            log_warn!("AGGREGATE", "invalid rule pattern '{}': {}", pattern, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnKind, ColumnMetadata};
    use crate::memory::MemorySchema;
    use crate::snapshot::IdentityAttributes;
    use crate::value::DataValue;

    fn fixture() -> (MemorySchema, Snapshot) {
        let schema = MemorySchema::new();
        for id in ["GRADE", "NAME", "LIMIT"] {
            schema.insert(ColumnMetadata::new(id, "T1", id, ColumnKind::SimpleEntry));
        }
        let mut snapshot = Snapshot::new("s1", IdentityAttributes::default());
        snapshot.set("GRADE", DataValue::Number(72.0));
        snapshot.set("NAME", DataValue::text("Grace Hopper"));
        snapshot.set("LIMIT", DataValue::Number(70.0));
        (schema, snapshot)
    }

    fn rule(reference: &str, op: Operator, value: &str) -> ConditionNode {
        Rule::new(
            parser::parse_bare(reference).unwrap(),
            op,
            RuleValue::Text(value.to_string()),
        )
        .into()
    }

    fn holds(group: &ConditionGroup) -> bool {
        let (schema, snapshot) = fixture();
        let mut diagnostics = Vec::new();
        group.evaluate(&Resolver::new(&schema), &snapshot, &mut diagnostics)
    }

    #[test]
    fn numeric_and_text_comparisons() {
        assert!(holds(&ConditionGroup::all(vec![rule("GRADE", Operator::Greater, "9")])));
        assert!(holds(&ConditionGroup::all(vec![rule("NAME", Operator::Equal, "grace HOPPER")])));
        assert!(holds(&ConditionGroup::all(vec![rule("NAME", Operator::Contains, "HOP")])));
        assert!(holds(&ConditionGroup::all(vec![rule("NAME", Operator::BeginsWith, "grace")])));
        assert!(!holds(&ConditionGroup::all(vec![rule("NAME", Operator::EndsWith, "grace")])));
    }

    #[test]
    fn negative_zero_equals_zero() {
        let stored = DataValue::Number(-0.0).to_text();
        let zero = vec!["0".to_string()];
        assert!(compare(Operator::Equal, &stored, &zero));
        assert!(!compare(Operator::Less, &stored, &zero));
        assert!(compare(Operator::GreaterOrEqual, "-0.0", &zero));
    }

    #[test]
    fn rule_values_may_contain_references() {
        assert!(holds(&ConditionGroup::all(vec![rule("GRADE", Operator::GreaterOrEqual, "$LIMIT$")])));
    }

    #[test]
    fn membership_and_ranges() {
        assert!(holds(&ConditionGroup::all(vec![rule("GRADE", Operator::In, "50, 72,90")])));
        assert!(holds(&ConditionGroup::all(vec![rule("GRADE", Operator::Between, "70,80")])));
        assert!(!holds(&ConditionGroup::all(vec![rule("GRADE", Operator::Between, "72,80")])));
        assert!(!holds(&ConditionGroup::all(vec![rule("GRADE", Operator::NotBetween, "oops")])));
    }

    #[test]
    fn groups_combine_and_negate() {
        let any = ConditionGroup::any(vec![
            rule("GRADE", Operator::Less, "10"),
            rule("NAME", Operator::MatchesRegex, "Hop+er$"),
        ]);
        assert!(holds(&any));
        assert!(!holds(&any.clone().negated()));

        let nested = ConditionGroup::all(vec![any.into(), rule("GRADE", Operator::IsNotEmpty, "")]);
        assert!(holds(&nested));
        assert!(holds(&ConditionGroup::all(vec![])));
        assert!(!holds(&ConditionGroup::any(vec![])));
    }

    #[test]
    fn legacy_comparators_map_to_operators() {
        assert_eq!(Operator::from_legacy("<>"), Some(Operator::NotEqual));
        assert_eq!(Operator::from_legacy("not like"), Some(Operator::NotContains));
        assert_eq!(Operator::from_legacy("IS NULL"), Some(Operator::IsEmpty));
        assert_eq!(Operator::from_legacy("~"), None);
    }

    #[test]
    fn tree_deserializes_from_json() {
        let json = r#"{
            "combiner": "OR",
            "rules": [
                {"reference": "GRADE", "operator": "greater", "value": 90},
                {"combiner": "AND", "not": true, "rules": [
                    {"reference": "$NAME$", "operator": "is_empty"}
                ]}
            ]
        }"#;
        let group: ConditionGroup = serde_json::from_str(json).unwrap();
        assert_eq!(group.combiner, Combiner::Or);
        assert_eq!(group.references().len(), 2);
        assert!(holds(&group));
    }
}
