//! FILENAME: persistence/src/records.rs
//! PURPOSE: Versioned column records and the migration chain between them.
//! CONTEXT: Version 1 is the legacy flat layout: string kind tags, one flat
//! bag of aggregation options and query-builder rule trees with comparator
//! strings. Version 2 is `ColumnMetadata` itself, tagged with
//! `schema_version`. Every load runs the chain up to `CURRENT_VERSION`, so
//! the engine only ever sees typed columns.

use crate::error::PersistenceError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use engine::aggregation::{
    Adjustment, ArithmeticOp, AxisMode, BlankHandling, Case, ReplaceMode, RoundingPolicy, TextReplacement,
};
use engine::numeric::RoundingDirection;
use engine::{
    ActiveWindow, AggregationMethod, AggregationSpec, Choice, ColumnKind, ColumnMetadata, Combiner,
    ConditionGroup, ConditionNode, HistoryPick, Operator, RecalcTrigger, Rule, RuleValue, SimpleStatistic,
    SubField, SubFieldKind, TimeWindow, WorkflowState,
};
use parser::{parse_bare, Reference};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const CURRENT_VERSION: u64 = 2;

const VERSION_KEY: &str = "schema_version";

// ============================================================================
// VERSION 2
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRecordV2 {
    pub schema_version: u64,
    #[serde(flatten)]
    pub column: ColumnMetadata,
}

impl ColumnRecordV2 {
    pub fn new(column: ColumnMetadata) -> Self {
        ColumnRecordV2 {
            schema_version: CURRENT_VERSION,
            column,
        }
    }
}

// ============================================================================
// VERSION 1
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ColumnV1 {
    pub uuid: String,
    pub table_uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub workflow_state: String,
    pub multientry_data_format: Value,
    pub active: ActiveV1,
    pub simple_input: SimpleInputV1,
    pub multi_entry: MultiEntryV1,
    pub aggregation_options: Option<AggregationOptionsV1>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ActiveV1 {
    pub from: Option<String>,
    pub to: Option<String>,
    pub from_time: Option<String>,
    pub to_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimpleInputV1 {
    pub options: ChoicesV1,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MultiEntryV1 {
    pub options: Vec<SubFieldV1>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubFieldV1 {
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub select: ChoicesV1,
}

/// Choices were stored either as objects or as one comma-joined string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChoicesV1 {
    List(Vec<ChoiceV1>),
    Joined(String),
}

impl Default for ChoicesV1 {
    fn default() -> Self {
        ChoicesV1::List(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChoiceV1 {
    pub value: String,
    pub display: String,
    pub description: String,
}

/// Source lists were stored either as a list or as one comma-joined string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AttributesV1 {
    List(Vec<String>),
    Joined(String),
}

impl Default for AttributesV1 {
    fn default() -> Self {
        AttributesV1::List(Vec::new())
    }
}

impl AttributesV1 {
    fn items(&self) -> Vec<String> {
        match self {
            AttributesV1::List(items) => items.clone(),
            AttributesV1::Joined(joined) => split_joined(joined),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AggregationOptionsV1 {
    pub method: String,
    pub attributes: AttributesV1,
    pub recalculate_trigger: String,
    pub aggregator_type_mapper_inputs: Vec<String>,
    pub aggregator_type_mapper_outputs: Vec<String>,
    pub aggregator_type_mathematical_operations_formula: String,
    pub aggregator_type_case_builder_cases: Vec<CaseV1>,
    pub aggregator_type_self_peer_review_grouping_column: String,
    pub aggregator_type_self_peer_review_score_column: String,
    pub rounding: Value,
    pub rounding_direction: String,
    pub post_aggregation_arithmetic_operator: String,
    pub post_aggregation_arithmetic_value: Value,
    pub regex_replace_pattern: String,
    pub regex_replace_replacement: String,
    pub regex_replace_mode: String,
    pub axes: Vec<String>,
    pub t_axis_source: String,
    pub t_axis_source_limit: String,
    pub t_axis_source_limit_from: Option<String>,
    pub t_axis_source_limit_to: Option<String>,
    pub blank_handling: String,
    /// Per-statistic parameters, e.g. `aggregator_type_simple_countif_parameter_value`.
    #[serde(flatten)]
    pub parameters: BTreeMap<String, Value>,
}

impl AggregationOptionsV1 {
    fn parameter(&self, statistic: &str, name: &str) -> String {
        let key = format!("aggregator_type_simple_{}_parameter_{}", statistic, name);
        self.parameters.get(&key).map(value_text).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaseV1 {
    pub content: String,
    pub rules: Option<RuleGroupV1>,
    pub default_case: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleGroupV1 {
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub not: bool,
    pub rules: Vec<RuleNodeV1>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RuleNodeV1 {
    Group(RuleGroupV1),
    Rule(RuleV1),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleV1 {
    pub id: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

// ============================================================================
// LOADING
// ============================================================================

/// Loads one stored column, running every migration its version needs.
///
/// Records without a `schema_version` tag are read as `default_version`.
pub fn load_column(value: Value, default_version: u64) -> Result<ColumnMetadata, PersistenceError> {
    let version = value.get(VERSION_KEY).and_then(Value::as_u64).unwrap_or(default_version);
    match version {
        1 => {
            let legacy: ColumnV1 = serde_json::from_value(value)?;
            migrate_v1(legacy)
        }
        2 => {
            let record: ColumnRecordV2 = serde_json::from_value(with_version(value, 2))?;
            Ok(record.column)
        }
        other => Err(PersistenceError::UnsupportedVersion(other)),
    }
}

pub fn store_column(column: &ColumnMetadata) -> Result<Value, PersistenceError> {
    Ok(serde_json::to_value(ColumnRecordV2::new(column.clone()))?)
}

fn with_version(mut value: Value, version: u64) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert(VERSION_KEY.to_string(), Value::from(version));
    }
    value
}

// ============================================================================
// V1 -> V2
// ============================================================================

pub fn migrate_v1(legacy: ColumnV1) -> Result<ColumnMetadata, PersistenceError> {
    let id = legacy.uuid.clone();
    if id.is_empty() {
        return Err(PersistenceError::invalid("<unnamed>", "missing uuid"));
    }
    let kind = column_kind(&legacy.kind).ok_or_else(|| {
        PersistenceError::invalid(&id, format!("unknown column type '{}'", legacy.kind))
    })?;

    let mut column = ColumnMetadata::new(id.as_str(), legacy.table_uuid.as_str(), legacy.name.as_str(), kind);
    column.workflow = match legacy.workflow_state.as_str() {
        "deleted" => WorkflowState::Deleted,
        _ => WorkflowState::Active,
    };
    column.active = active_window(&id, &legacy.active)?;
    column.choices = choices(&legacy.simple_input.options);
    column.multi_field_output = truthy(&legacy.multientry_data_format);

    if kind == ColumnKind::MultiField || column.multi_field_output {
        column.sub_fields = legacy
            .multi_entry
            .options
            .iter()
            .map(|option| SubField::new(option.label.as_str()).with_choices(sub_field_kind(&option.kind), choices(&option.select)))
            .collect();
    }

    if kind == ColumnKind::Aggregator {
        let options = legacy
            .aggregation_options
            .as_ref()
            .ok_or_else(|| PersistenceError::invalid(&id, "aggregator without aggregation options"))?;
        column.aggregation = Some(aggregation_spec(&id, options)?);
    }
    Ok(column)
}

fn column_kind(tag: &str) -> Option<ColumnKind> {
    let kind = match tag {
        "mark" => ColumnKind::SimpleEntry,
        "multiEntry" => ColumnKind::MultiField,
        "aggregator" => ColumnKind::Aggregator,
        "submission" => ColumnKind::Timestamp,
        "counter" => ColumnKind::Counter,
        "toggle" => ColumnKind::Toggle,
        "attendance" => ColumnKind::Attendance,
        "signinout" | "signinoutmemory" => ColumnKind::SignInOut,
        "image" => ColumnKind::Image,
        "imgurl" => ColumnKind::ImageUrl,
        "file" => ColumnKind::File,
        "teacherallocation" => ColumnKind::TeacherAllocation,
        _ => return None,
    };
    Some(kind)
}

fn sub_field_kind(tag: &str) -> SubFieldKind {
    match tag {
        "textarea" | "regex-long" => SubFieldKind::LongText,
        "wysiwyg" | "html-simple" => SubFieldKind::RichText,
        "select" => SubFieldKind::Select,
        "dropdown" => SubFieldKind::Dropdown,
        "slider" => SubFieldKind::Slider,
        "audio-recording" => SubFieldKind::AudioRecording,
        "sketch-small" | "sketch" => SubFieldKind::Sketch,
        "label-only" => SubFieldKind::LabelOnly,
        "timestamp" => SubFieldKind::Timestamp,
        "auth-user" => SubFieldKind::AuthUser,
        "geolocation" => SubFieldKind::Geolocation,
        _ => SubFieldKind::Text,
    }
}

fn choices(stored: &ChoicesV1) -> Vec<Choice> {
    match stored {
        ChoicesV1::List(items) => items
            .iter()
            .map(|c| Choice {
                value: c.value.clone(),
                display: c.display.clone(),
                description: c.description.clone(),
            })
            .collect(),
        ChoicesV1::Joined(joined) => split_joined(joined).into_iter().map(|v| Choice::new(v.as_str(), v.as_str())).collect(),
    }
}

fn active_window(id: &str, active: &ActiveV1) -> Result<ActiveWindow, PersistenceError> {
    let from = active.from.as_deref().map(|raw| parse_instant(id, raw)).transpose()?.flatten();
    let to = active.to.as_deref().map(|raw| parse_instant(id, raw)).transpose()?.flatten();

    // The legacy default of 00:00:00 to 23:59:59 means no daily restriction
    let start = active.from_time.as_deref().map(|raw| parse_time(id, raw)).transpose()?;
    let end = active.to_time.as_deref().map(|raw| parse_time(id, raw)).transpose()?;
    let daily = match (start, end) {
        (Some(start), Some(end)) if !is_whole_day(start, end) => Some((start, end)),
        _ => None,
    };
    Ok(ActiveWindow { from, to, daily })
}

fn is_whole_day(start: NaiveTime, end: NaiveTime) -> bool {
    start == NaiveTime::MIN && end >= NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` and bare dates. Blank means unset.
fn parse_instant(id: &str, raw: &str) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(Some(parsed.and_utc()));
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0)) {
        return Ok(Some(midnight.and_utc()));
    }
    Err(PersistenceError::invalid(id, format!("unreadable date '{}'", raw)))
}

fn parse_time(id: &str, raw: &str) -> Result<NaiveTime, PersistenceError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M"))
        .map_err(|_| PersistenceError::invalid(id, format!("unreadable time '{}'", raw)))
}

// ============================================================================
// AGGREGATION OPTIONS
// ============================================================================

fn aggregation_spec(id: &str, options: &AggregationOptionsV1) -> Result<AggregationSpec, PersistenceError> {
    let sources = options
        .attributes
        .items()
        .iter()
        .map(|raw| reference(id, raw))
        .collect::<Result<Vec<_>, _>>()?;
    let mut spec = AggregationSpec::new(aggregation_method(id, options)?, sources);

    spec.trigger = match options.recalculate_trigger.as_str() {
        "manual" => RecalcTrigger::Manual,
        _ => RecalcTrigger::OnWrite,
    };
    spec.blank_handling = match options.blank_handling.as_str() {
        "zero" => BlankHandling::TreatAsZero,
        _ => BlankHandling::Leave,
    };
    if options.axes.iter().any(|axis| axis == "t") {
        let window = if options.t_axis_source_limit == "yes" {
            TimeWindow {
                start: options.t_axis_source_limit_from.as_deref().map(|raw| parse_instant(id, raw)).transpose()?.flatten(),
                end: options.t_axis_source_limit_to.as_deref().map(|raw| parse_instant(id, raw)).transpose()?.flatten(),
            }
        } else {
            TimeWindow::unbounded()
        };
        spec.axis = AxisMode::TimeSeries {
            pick: history_pick(&options.t_axis_source),
            window,
        };
    }
    spec.rounding = rounding(id, options)?;
    spec.adjustment = adjustment(id, options)?;
    if !options.regex_replace_pattern.is_empty() {
        spec.replacement = Some(TextReplacement {
            mode: match options.regex_replace_mode.as_str() {
                "regex" => ReplaceMode::Regex,
                _ => ReplaceMode::Literal,
            },
            pattern: options.regex_replace_pattern.clone(),
            replacement: options.regex_replace_replacement.clone(),
        });
    }
    Ok(spec)
}

fn aggregation_method(id: &str, options: &AggregationOptionsV1) -> Result<AggregationMethod, PersistenceError> {
    let n = |statistic: &str| -> Result<usize, PersistenceError> {
        let raw = options.parameter(statistic, "n");
        raw.trim()
            .parse()
            .map_err(|_| PersistenceError::invalid(id, format!("{} needs a whole number, got '{}'", statistic, raw)))
    };

    let statistic = match options.method.as_str() {
        "sum" => SimpleStatistic::Sum,
        "average" => SimpleStatistic::Average,
        "median" => SimpleStatistic::Median,
        "mode" => SimpleStatistic::Mode,
        "sumaggressive" => SimpleStatistic::SumAggressive,
        "averageaggressive" => SimpleStatistic::AverageAggressive,
        "count" => SimpleStatistic::Count,
        "counta" => SimpleStatistic::CountNonEmpty,
        "countblank" => SimpleStatistic::CountBlank,
        "clone" => SimpleStatistic::Clone,
        "countif" => SimpleStatistic::CountIf {
            value: options.parameter("countif", "value"),
        },
        "countifstartswith" => SimpleStatistic::CountIfStartsWith {
            prefix: options.parameter("countifstartswith", "term"),
        },
        "countifcontains" => SimpleStatistic::CountIfContains {
            needle: options.parameter("countifcontains", "term"),
        },
        "countifmatchregex" => SimpleStatistic::CountIfMatchesRegex {
            pattern: options.parameter("countifmatchregex", "term"),
        },
        "countallmatchregex" => SimpleStatistic::CountAllRegexMatches {
            pattern: options.parameter("countallmatchregex", "term"),
        },
        "concatenate" => SimpleStatistic::Concatenate {
            separator: options.parameter("concatenate", "separator"),
        },
        "highest_average" => SimpleStatistic::HighestAverage { n: n("highest_average")? },
        "lowest_average" => SimpleStatistic::LowestAverage { n: n("lowest_average")? },
        "highest_sum" => SimpleStatistic::HighestSum { n: n("highest_sum")? },
        "lowest_sum" => SimpleStatistic::LowestSum { n: n("lowest_sum")? },
        "mapper" => {
            return Ok(AggregationMethod::Mapper {
                inputs: options.aggregator_type_mapper_inputs.clone(),
                outputs: options.aggregator_type_mapper_outputs.clone(),
            })
        }
        "mathematical_operations" => {
            return Ok(AggregationMethod::Formula {
                expression: options.aggregator_type_mathematical_operations_formula.clone(),
            })
        }
        "case_builder" => {
            let cases = options
                .aggregator_type_case_builder_cases
                .iter()
                .map(|case| migrate_case(id, case))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(AggregationMethod::CaseBuilder { cases });
        }
        "self_peer_review" => {
            return Ok(AggregationMethod::PeerReview {
                grouping: reference(id, &options.aggregator_type_self_peer_review_grouping_column)?,
                score: reference(id, &options.aggregator_type_self_peer_review_score_column)?,
            })
        }
        other => return Err(PersistenceError::invalid(id, format!("unknown aggregation method '{}'", other))),
    };
    Ok(AggregationMethod::Simple { statistic })
}

fn history_pick(tag: &str) -> HistoryPick {
    match tag {
        "earliest" => HistoryPick::Earliest,
        "latest" => HistoryPick::Latest,
        "user_earliest" => HistoryPick::UserEarliest,
        "user_latest" => HistoryPick::UserLatest,
        _ => HistoryPick::All,
    }
}

fn rounding(id: &str, options: &AggregationOptionsV1) -> Result<RoundingPolicy, PersistenceError> {
    let digits = value_text(&options.rounding);
    if digits.trim().is_empty() {
        return Ok(RoundingPolicy::None);
    }
    let places = digits
        .trim()
        .parse()
        .map_err(|_| PersistenceError::invalid(id, format!("rounding needs a digit count, got '{}'", digits)))?;
    let direction = match options.rounding_direction.as_str() {
        "ceiling" => RoundingDirection::Up,
        "floor" => RoundingDirection::Down,
        _ => RoundingDirection::Nearest,
    };
    Ok(RoundingPolicy::RoundTo { places, direction })
}

fn adjustment(id: &str, options: &AggregationOptionsV1) -> Result<Option<Adjustment>, PersistenceError> {
    let op = match options.post_aggregation_arithmetic_operator.trim() {
        "" => return Ok(None),
        "+" => ArithmeticOp::Add,
        "-" => ArithmeticOp::Subtract,
        "*" => ArithmeticOp::Multiply,
        "/" => ArithmeticOp::Divide,
        other => return Err(PersistenceError::invalid(id, format!("unknown arithmetic operator '{}'", other))),
    };
    let raw = value_text(&options.post_aggregation_arithmetic_value);
    let operand = raw
        .trim()
        .parse()
        .map_err(|_| PersistenceError::invalid(id, format!("arithmetic operand '{}' is not a number", raw)))?;
    Ok(Some(Adjustment { op, operand }))
}

// ============================================================================
// RULE TREES
// ============================================================================

fn migrate_case(id: &str, case: &CaseV1) -> Result<Case, PersistenceError> {
    let default = truthy(&case.default_case);
    let rules = match &case.rules {
        Some(group) if !default && !group.rules.is_empty() => Some(migrate_group(id, group)?),
        _ => None,
    };
    Ok(Case {
        rules,
        content: case.content.clone(),
        default,
    })
}

pub fn migrate_group(id: &str, group: &RuleGroupV1) -> Result<ConditionGroup, PersistenceError> {
    let rules = group
        .rules
        .iter()
        .map(|node| match node {
            RuleNodeV1::Group(inner) => migrate_group(id, inner).map(ConditionNode::from),
            RuleNodeV1::Rule(rule) => migrate_rule(id, rule).map(ConditionNode::from),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ConditionGroup {
        combiner: if group.condition.eq_ignore_ascii_case("OR") {
            Combiner::Or
        } else {
            Combiner::And
        },
        not: group.not,
        rules,
    })
}

fn migrate_rule(id: &str, rule: &RuleV1) -> Result<Rule, PersistenceError> {
    let operator = serde_json::from_value::<Operator>(Value::String(rule.operator.clone()))
        .ok()
        .or_else(|| Operator::from_legacy(&rule.operator))
        .ok_or_else(|| PersistenceError::invalid(id, format!("unknown operator '{}'", rule.operator)))?;
    Ok(Rule::new(reference(id, &rule.id)?, operator, rule_value(&rule.value)))
}

fn rule_value(value: &Value) -> RuleValue {
    match value {
        Value::Number(n) => n.as_f64().map_or_else(RuleValue::default, RuleValue::Number),
        Value::Array(items) => RuleValue::List(items.iter().map(value_text).collect()),
        Value::Null => RuleValue::default(),
        other => RuleValue::Text(value_text(other)),
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn reference(id: &str, raw: &str) -> Result<Reference, PersistenceError> {
    parse_bare(raw).map_err(|e| PersistenceError::invalid(id, format!("bad reference '{}': {}", raw, e)))
}

fn split_joined(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.as_str(), "1" | "true" | "yes"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}
