//! FILENAME: engine/src/column.rs
//! PURPOSE: Column metadata as seen by the resolver, aggregation and migration.
//! CONTEXT: Columns are authored and stored elsewhere. The engine reads them
//! through the `SchemaAccessor` and never mutates them. Sub-field indices are
//! positional only; the label is the durable identity of a sub-field.

use crate::aggregation::AggregationSpec;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type ColumnId = String;
pub type TableId = String;

/// What kind of data a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    SimpleEntry,
    MultiField,
    Aggregator,
    Timestamp,
    Counter,
    Toggle,
    Attendance,
    SignInOut,
    Image,
    ImageUrl,
    File,
    TeacherAllocation,
}

/// Input kind of one sub-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubFieldKind {
    #[default]
    Text,
    LongText,
    RichText,
    Select,
    Dropdown,
    Slider,
    AudioRecording,
    Sketch,
    LabelOnly,
    Timestamp,
    AuthUser,
    Geolocation,
}

/// One selectable option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub value: String,
    pub display: String,
    #[serde(default)]
    pub description: String,
}

impl Choice {
    pub fn new(value: impl Into<String>, display: impl Into<String>) -> Self {
        Choice {
            value: value.into(),
            display: display.into(),
            description: String::new(),
        }
    }
}

/// How a slider maps a stored number onto its declared choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeMode {
    /// Use the smallest choice value at or above the stored value.
    RoundUp,
    /// Use the largest choice value at or below the stored value.
    RoundDown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubField {
    pub label: String,
    #[serde(default)]
    pub kind: SubFieldKind,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub range_mode: Option<RangeMode>,
}

impl SubField {
    pub fn new(label: impl Into<String>) -> Self {
        SubField {
            label: label.into(),
            kind: SubFieldKind::Text,
            choices: Vec::new(),
            range_mode: None,
        }
    }

    pub fn with_choices(mut self, kind: SubFieldKind, choices: Vec<Choice>) -> Self {
        self.kind = kind;
        self.choices = choices;
        self
    }
}

// ============================================================================
// ACTIVE WINDOW, WORKFLOW, PERMISSIONS
// ============================================================================

/// Period during which a column accepts and produces data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Optional daily time range; may wrap past midnight.
    pub daily: Option<(NaiveTime, NaiveTime)>,
}

impl ActiveWindow {
    pub fn always() -> Self {
        ActiveWindow::default()
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.from.is_some_and(|from| now < from) || self.to.is_some_and(|to| now > to) {
            return false;
        }
        match self.daily {
            None => true,
            Some((start, end)) => {
                let time = now.time();
                if start <= end {
                    time >= start && time <= end
                } else {
                    time >= start || time <= end
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Active,
    /// Soft-deleted: still resolvable, no longer computed.
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnPermissions {
    /// Usernames allowed to write values.
    pub writers: BTreeSet<String>,
    /// Whether the identifier may write their own value.
    #[serde(default)]
    pub self_editable: bool,
}

impl ColumnPermissions {
    pub fn may_write(&self, actor: &str) -> bool {
        self.writers.contains(actor)
    }
}

// ============================================================================
// COLUMN METADATA
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub id: ColumnId,
    pub table_id: TableId,
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub sub_fields: Vec<SubField>,
    /// Choices of a simple-entry column.
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// Aggregators whose output is a positional list.
    #[serde(default)]
    pub multi_field_output: bool,
    #[serde(default)]
    pub aggregation: Option<AggregationSpec>,
    #[serde(default)]
    pub active: ActiveWindow,
    #[serde(default)]
    pub workflow: WorkflowState,
    #[serde(default)]
    pub permissions: ColumnPermissions,
}

impl ColumnMetadata {
    pub fn new(id: impl Into<ColumnId>, table_id: impl Into<TableId>, name: impl Into<String>, kind: ColumnKind) -> Self {
        ColumnMetadata {
            id: id.into(),
            table_id: table_id.into(),
            name: name.into(),
            kind,
            sub_fields: Vec::new(),
            choices: Vec::new(),
            multi_field_output: false,
            aggregation: None,
            active: ActiveWindow::always(),
            workflow: WorkflowState::Active,
            permissions: ColumnPermissions::default(),
        }
    }

    pub fn multi_field(id: impl Into<ColumnId>, table_id: impl Into<TableId>, name: impl Into<String>, sub_fields: Vec<SubField>) -> Self {
        let mut column = ColumnMetadata::new(id, table_id, name, ColumnKind::MultiField);
        column.sub_fields = sub_fields;
        column
    }

    pub fn aggregator(id: impl Into<ColumnId>, table_id: impl Into<TableId>, name: impl Into<String>, spec: AggregationSpec) -> Self {
        let mut column = ColumnMetadata::new(id, table_id, name, ColumnKind::Aggregator);
        column.aggregation = Some(spec);
        column
    }

    /// Whether stored values are positional lists.
    pub fn is_multi_field(&self) -> bool {
        self.kind == ColumnKind::MultiField || self.multi_field_output
    }

    pub fn is_aggregator(&self) -> bool {
        self.kind == ColumnKind::Aggregator && self.aggregation.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.workflow == WorkflowState::Deleted
    }

    pub fn sub_field(&self, index: usize) -> Option<&SubField> {
        self.sub_fields.get(index)
    }

    /// Choices that apply to a value of this column, or of one of its sub-fields.
    pub fn choices_for(&self, sub_field: Option<usize>) -> &[Choice] {
        match sub_field {
            Some(index) => self.sub_field(index).map_or(&[], |s| s.choices.as_slice()),
            None => &self.choices,
        }
    }

    /// Human-readable name, e.g. `Quiz >> Q2` or `Quiz [Full dataset]`.
    pub fn friendly_name(&self, sub_field: Option<usize>) -> String {
        let mut name = self.name.clone();
        match sub_field {
            Some(index) => {
                let label = self.sub_field(index).map_or("", |s| s.label.as_str());
                name.push_str(" >> ");
                name.push_str(label);
            }
            None if self.is_multi_field() => name.push_str(" [Full dataset]"),
            None => {}
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn active_window_checks_dates_and_daily_range() {
        let window = ActiveWindow {
            from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            to: Some(Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap()),
            daily: Some((
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            )),
        };
        assert!(window.is_active_at(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()));
        assert!(!window.is_active_at(Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap()));
        assert!(!window.is_active_at(Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()));
    }

    #[test]
    fn daily_range_may_wrap_midnight() {
        let window = ActiveWindow {
            daily: Some((
                NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            )),
            ..ActiveWindow::default()
        };
        assert!(window.is_active_at(Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap()));
        assert!(window.is_active_at(Utc.with_ymd_and_hms(2024, 6, 2, 1, 0, 0).unwrap()));
        assert!(!window.is_active_at(Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap()));
    }

    #[test]
    fn friendly_name_describes_sub_field_or_full_dataset() {
        let column = ColumnMetadata::multi_field(
            "COL",
            "T1",
            "Quiz",
            vec![SubField::new("Q1"), SubField::new("Q2")],
        );
        assert_eq!(column.friendly_name(Some(1)), "Quiz >> Q2");
        assert_eq!(column.friendly_name(None), "Quiz [Full dataset]");
    }
}
