//! FILENAME: engine/src/aggregation/spec.rs
//! PURPOSE: The typed configuration of an aggregator column.
//! CONTEXT: Every strategy and option is a closed enum so each call site
//! matches exhaustively. Serialized with serde tags (`type`, `name`, `mode`)
//! so stored configuration stays readable JSON.

use crate::conditions::ConditionGroup;
use crate::numeric::RoundingDirection;
use crate::snapshot::{HistoryPick, TimeWindow};
use parser::{splice, Reference};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;

// ============================================================================
// METHODS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationMethod {
    Simple { statistic: SimpleStatistic },
    /// Arithmetic over substituted references, e.g. `$A$ + $B$ * 2`.
    Formula { expression: String },
    CaseBuilder { cases: Vec<Case> },
    /// First source value looked up in `inputs`; the matching `outputs` entry wins.
    Mapper { inputs: Vec<String>, outputs: Vec<String> },
    PeerReview { grouping: Reference, score: Reference },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SimpleStatistic {
    Sum,
    Average,
    Median,
    Mode,
    SumAggressive,
    AverageAggressive,
    Count,
    CountNonEmpty,
    CountBlank,
    CountIf { value: String },
    CountIfStartsWith { prefix: String },
    CountIfContains { needle: String },
    CountIfMatchesRegex { pattern: String },
    CountAllRegexMatches { pattern: String },
    Clone,
    HighestAverage { n: usize },
    LowestAverage { n: usize },
    HighestSum { n: usize },
    LowestSum { n: usize },
    Concatenate {
        #[serde(default)]
        separator: String,
    },
}

/// One case of a case builder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub rules: Option<ConditionGroup>,
    /// Output text; may contain references.
    #[serde(default)]
    pub content: String,
    /// Used when no other case matches.
    #[serde(default)]
    pub default: bool,
}

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalcTrigger {
    #[default]
    OnWrite,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AxisMode {
    #[default]
    RowWise,
    /// Feed the selected change-history points of each source instead of its current value.
    TimeSeries {
        #[serde(default)]
        pick: HistoryPick,
        #[serde(default)]
        window: TimeWindow,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoundingPolicy {
    #[default]
    None,
    RoundTo {
        places: u32,
        #[serde(default)]
        direction: RoundingDirection,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlankHandling {
    /// Blanks are excluded from numeric reductions.
    #[default]
    Leave,
    /// Blanks count as zero.
    TreatAsZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub op: ArithmeticOp,
    pub operand: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    #[default]
    Literal,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextReplacement {
    #[serde(default)]
    pub mode: ReplaceMode,
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

// ============================================================================
// SPEC
// ============================================================================

/// Keeps the first appearance of each reference.
fn unique(references: Vec<Reference>) -> Vec<Reference> {
    let mut out: Vec<Reference> = Vec::with_capacity(references.len());
    for reference in references {
        if !out.contains(&reference) {
            out.push(reference);
        }
    }
    out
}

fn unique_sources<'de, D>(deserializer: D) -> Result<Vec<Reference>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<Reference>::deserialize(deserializer).map(unique)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub method: AggregationMethod,
    /// Ordered, each reference at most once.
    #[serde(default, deserialize_with = "unique_sources")]
    pub sources: Vec<Reference>,
    #[serde(default)]
    pub trigger: RecalcTrigger,
    #[serde(default)]
    pub axis: AxisMode,
    #[serde(default)]
    pub rounding: RoundingPolicy,
    #[serde(default)]
    pub blank_handling: BlankHandling,
    #[serde(default)]
    pub adjustment: Option<Adjustment>,
    #[serde(default)]
    pub replacement: Option<TextReplacement>,
}

impl AggregationSpec {
    pub fn new(method: AggregationMethod, sources: Vec<Reference>) -> Self {
        AggregationSpec {
            method,
            sources: unique(sources),
            trigger: RecalcTrigger::OnWrite,
            axis: AxisMode::RowWise,
            rounding: RoundingPolicy::None,
            blank_handling: BlankHandling::Leave,
            adjustment: None,
            replacement: None,
        }
    }

    pub fn simple(statistic: SimpleStatistic, sources: Vec<Reference>) -> Self {
        AggregationSpec::new(AggregationMethod::Simple { statistic }, sources)
    }

    pub fn formula(expression: impl Into<String>) -> Self {
        AggregationSpec::new(
            AggregationMethod::Formula {
                expression: expression.into(),
            },
            Vec::new(),
        )
    }

    /// Every reference the spec reads, across sources and all method settings.
    ///
    /// With `by_prevalence`, references named more often come first (ties keep
    /// first-appearance order). With `dedupe`, each reference appears once.
    pub fn referenced_columns(&self, dedupe: bool, by_prevalence: bool) -> Vec<Reference> {
        let mut all: Vec<Reference> = self.sources.clone();
        match &self.method {
            AggregationMethod::Simple { .. } | AggregationMethod::Mapper { .. } => {}
            AggregationMethod::Formula { expression } => {
                all.extend(parser::parse_references(expression).map(|t| t.reference));
            }
            AggregationMethod::CaseBuilder { cases } => {
                for case in cases {
                    if let Some(rules) = case.rules.as_ref().filter(|_| !case.default) {
                        all.extend(rules.references());
                    }
                    all.extend(parser::parse_references(&case.content).map(|t| t.reference));
                }
            }
            AggregationMethod::PeerReview { grouping, score } => {
                all.push(grouping.clone());
                all.push(score.clone());
            }
        }

        let mut out = if dedupe { unique(all.clone()) } else { all.clone() };

        if by_prevalence {
            out.sort_by_cached_key(|r| Reverse(all.iter().filter(|other| *other == r).count()));
        }
        out
    }

    /// The sources in order with repeats dropped.
    pub fn distinct_sources(&self) -> Vec<&Reference> {
        let mut out: Vec<&Reference> = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            if !out.contains(&source) {
                out.push(source);
            }
        }
        out
    }

    /// Distinct base column ids the spec reads.
    pub fn source_column_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for reference in self.referenced_columns(true, false) {
            if !ids.contains(&reference.base_column_id) {
                ids.push(reference.base_column_id);
            }
        }
        ids
    }

    /// Visits every free-text field that may hold delimited references.
    pub fn for_each_text_mut(&mut self, f: &mut dyn FnMut(&mut String)) {
        match &mut self.method {
            AggregationMethod::Formula { expression } => f(expression),
            AggregationMethod::CaseBuilder { cases } => {
                for case in cases {
                    f(&mut case.content);
                    if let Some(rules) = case.rules.as_mut() {
                        rules.for_each_rule_mut(&mut |rule| {
                            for text in rule.value.texts_mut() {
                                f(text);
                            }
                        });
                    }
                }
            }
            AggregationMethod::Simple { .. }
            | AggregationMethod::Mapper { .. }
            | AggregationMethod::PeerReview { .. } => {}
        }
    }

    /// Visits every structured reference field.
    pub fn for_each_reference_mut(&mut self, f: &mut dyn FnMut(&mut Reference)) {
        for source in &mut self.sources {
            f(source);
        }
        match &mut self.method {
            AggregationMethod::CaseBuilder { cases } => {
                for case in cases {
                    if let Some(rules) = case.rules.as_mut() {
                        rules.for_each_rule_mut(&mut |rule| f(&mut rule.reference));
                    }
                }
            }
            AggregationMethod::PeerReview { grouping, score } => {
                f(grouping);
                f(score);
            }
            AggregationMethod::Simple { .. }
            | AggregationMethod::Mapper { .. }
            | AggregationMethod::Formula { .. } => {}
        }
    }

    /// Rewrites base column ids through `mapping`, e.g. when a list is cloned.
    /// Returns the number of references changed.
    pub fn swap_references(&mut self, mapping: &HashMap<String, String>) -> usize {
        let mut changed = 0;

        self.for_each_reference_mut(&mut |reference| {
            if let Some(new_id) = mapping.get(&reference.base_column_id) {
                reference.base_column_id = new_id.clone();
                changed += 1;
            }
        });

        self.for_each_text_mut(&mut |text| {
            let (rewritten, count) = splice(text, |token| {
                mapping.get(&token.reference.base_column_id).map(|new_id| {
                    let mut reference = token.reference.clone();
                    reference.base_column_id = new_id.clone();
                    parser::format_reference(&reference)
                })
            });
            if count > 0 {
                *text = rewritten;
                changed += count;
            }
        });

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{Operator, Rule, RuleValue};

    fn r(raw: &str) -> Reference {
        parser::parse_bare(raw).unwrap()
    }

    fn case_spec() -> AggregationSpec {
        let rules = ConditionGroup::all(vec![Rule::new(
            r("GRADE"),
            Operator::Greater,
            RuleValue::Text("$PASS$".to_string()),
        )
        .into()]);
        AggregationSpec::new(
            AggregationMethod::CaseBuilder {
                cases: vec![
                    Case {
                        rules: Some(rules),
                        content: "Well done $NAME$".to_string(),
                        default: false,
                    },
                    Case {
                        rules: None,
                        content: "Keep going".to_string(),
                        default: true,
                    },
                ],
            },
            vec![],
        )
    }

    #[test]
    fn references_come_from_every_setting() {
        let refs = case_spec().referenced_columns(true, false);
        assert_eq!(refs, vec![r("GRADE"), r("PASS"), r("NAME")]);

        let formula = AggregationSpec::formula("$A$ + $B.1$ * $A$");
        assert_eq!(formula.referenced_columns(true, false), vec![r("A"), r("B.1")]);
        assert_eq!(formula.referenced_columns(false, false).len(), 3);
    }

    #[test]
    fn prevalence_orders_most_common_first() {
        let spec = AggregationSpec::new(
            AggregationMethod::Formula {
                expression: "$B$ + $A$ + $B$".to_string(),
            },
            vec![r("A"), r("C"), r("B")],
        );
        assert_eq!(spec.referenced_columns(true, true), vec![r("B"), r("A"), r("C")]);
        assert_eq!(spec.source_column_ids(), vec!["A", "C", "B"]);
    }

    #[test]
    fn repeated_sources_are_kept_once() {
        let spec = AggregationSpec::simple(SimpleStatistic::Sum, vec![r("A"), r("B"), r("A")]);
        assert_eq!(spec.sources, vec![r("A"), r("B")]);

        let stored: AggregationSpec = serde_json::from_str(
            r#"{"method": {"type": "simple", "statistic": {"name": "sum"}}, "sources": ["B", "A", "B.1", "B"]}"#,
        )
        .unwrap();
        assert_eq!(stored.sources, vec![r("B"), r("A"), r("B.1")]);

        let mut pushed = spec.clone();
        pushed.sources.push(r("B"));
        assert_eq!(pushed.distinct_sources(), vec![&r("A"), &r("B")]);
    }

    #[test]
    fn swap_rewrites_structured_and_text_references() {
        let mut spec = case_spec();
        let mapping: HashMap<String, String> = [
            ("GRADE".to_string(), "GRADE2".to_string()),
            ("NAME".to_string(), "NAME2".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(spec.swap_references(&mapping), 2);
        assert_eq!(
            spec.referenced_columns(true, false),
            vec![r("GRADE2"), r("PASS"), r("NAME2")]
        );
    }

    #[test]
    fn deserializes_tagged_json() {
        let json = r#"{
            "method": {"type": "simple", "statistic": {"name": "count_if", "value": "Yes"}},
            "sources": ["A", "B.2"],
            "trigger": "manual",
            "axis": {"mode": "time_series", "pick": "latest"},
            "rounding": {"mode": "round_to", "places": 1, "direction": "up"},
            "adjustment": {"op": "multiply", "operand": 10}
        }"#;
        let spec: AggregationSpec = serde_json::from_str(json).unwrap();
        assert_eq!(
            spec.method,
            AggregationMethod::Simple {
                statistic: SimpleStatistic::CountIf {
                    value: "Yes".to_string()
                }
            }
        );
        assert_eq!(spec.sources[1], r("B.2"));
        assert_eq!(spec.trigger, RecalcTrigger::Manual);
        assert!(matches!(spec.axis, AxisMode::TimeSeries { pick: HistoryPick::Latest, .. }));
        assert_eq!(spec.blank_handling, BlankHandling::Leave);
    }
}
