//! FILENAME: engine/src/snapshot.rs
//! PURPOSE: Per-identifier data snapshots and change history.
//! CONTEXT: The resolver and the aggregation engine never read the store
//! directly. They receive a `Snapshot` (current values plus identity
//! attributes) or a slice of `HistoryEntry` values for a time window.

use crate::column::ColumnId;
use crate::value::DataValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque key of one record (a student) within a table.
pub type Identifier = String;

// ============================================================================
// SYSTEM IDENTITY FIELDS
// ============================================================================

/// Identity attributes that references can name directly, bypassing the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemField {
    PreferredName,
    GivenNames,
    Surname,
    Sid,
    Email,
    Username,
    AlternativeId1,
    AlternativeId2,
}

impl SystemField {
    pub const ALL: [SystemField; 8] = [
        SystemField::PreferredName,
        SystemField::GivenNames,
        SystemField::Surname,
        SystemField::Sid,
        SystemField::Email,
        SystemField::Username,
        SystemField::AlternativeId1,
        SystemField::AlternativeId2,
    ];

    /// The token used inside references, e.g. `$PREFERREDNAME$`.
    pub fn reference_name(self) -> &'static str {
        match self {
            SystemField::PreferredName => "PREFERREDNAME",
            SystemField::GivenNames => "GIVENNAMES",
            SystemField::Surname => "SURNAME",
            SystemField::Sid => "SID",
            SystemField::Email => "EMAIL",
            SystemField::Username => "USERNAME",
            SystemField::AlternativeId1 => "ALTERNATIVEID1",
            SystemField::AlternativeId2 => "ALTERNATIVEID2",
        }
    }

    /// The snake_case attribute name.
    pub fn field_name(self) -> &'static str {
        match self {
            SystemField::PreferredName => "preferred_name",
            SystemField::GivenNames => "given_names",
            SystemField::Surname => "surname",
            SystemField::Sid => "sid",
            SystemField::Email => "email",
            SystemField::Username => "username",
            SystemField::AlternativeId1 => "alternative_id1",
            SystemField::AlternativeId2 => "alternative_id2",
        }
    }

    /// Case-insensitive lookup by reference name or attribute name.
    pub fn from_base_id(base_id: &str) -> Option<SystemField> {
        SystemField::ALL.into_iter().find(|field| {
            base_id.eq_ignore_ascii_case(field.reference_name())
                || base_id.eq_ignore_ascii_case(field.field_name())
        })
    }
}

/// Identity attributes of one identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityAttributes {
    pub preferred_name: String,
    pub given_names: String,
    pub surname: String,
    pub sid: String,
    pub email: String,
    pub username: String,
    pub alternative_id1: String,
    pub alternative_id2: String,
}

impl IdentityAttributes {
    pub fn get(&self, field: SystemField) -> &str {
        match field {
            SystemField::PreferredName => &self.preferred_name,
            SystemField::GivenNames => &self.given_names,
            SystemField::Surname => &self.surname,
            SystemField::Sid => &self.sid,
            SystemField::Email => &self.email,
            SystemField::Username => &self.username,
            SystemField::AlternativeId1 => &self.alternative_id1,
            SystemField::AlternativeId2 => &self.alternative_id2,
        }
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Current values of a set of columns for one identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub identifier: Identifier,
    pub identity: IdentityAttributes,
    pub values: HashMap<ColumnId, DataValue>,
}

static EMPTY: DataValue = DataValue::Empty;

impl Snapshot {
    pub fn new(identifier: impl Into<Identifier>, identity: IdentityAttributes) -> Self {
        Snapshot {
            identifier: identifier.into(),
            identity,
            values: HashMap::new(),
        }
    }

    /// The stored value for a column, or `Empty` when absent.
    pub fn get(&self, column_id: &str) -> &DataValue {
        self.values.get(column_id).unwrap_or(&EMPTY)
    }

    pub fn set(&mut self, column_id: impl Into<ColumnId>, value: DataValue) {
        self.values.insert(column_id.into(), value);
    }
}

// ============================================================================
// CHANGE HISTORY
// ============================================================================

/// One recorded write of a column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub value: DataValue,
    /// Username of whoever saved the value.
    pub author: String,
}

/// Optional bounds on a history query. Both ends are inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn unbounded() -> Self {
        TimeWindow::default()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| ts >= start) && self.end.map_or(true, |end| ts <= end)
    }
}

/// Which historical points feed a computation or a substitution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPick {
    #[default]
    All,
    Earliest,
    Latest,
    /// Earliest point saved by the identifier themselves.
    UserEarliest,
    /// Latest point saved by the identifier themselves.
    UserLatest,
}

impl HistoryPick {
    /// Selects entries from a chronologically ordered history.
    pub fn select<'h>(self, history: &'h [HistoryEntry], own_username: &str) -> Vec<&'h HistoryEntry> {
        let own = |entry: &&HistoryEntry| entry.author == own_username;
        match self {
            HistoryPick::All => history.iter().collect(),
            HistoryPick::Earliest => history.first().into_iter().collect(),
            HistoryPick::Latest => history.last().into_iter().collect(),
            HistoryPick::UserEarliest => history.iter().find(own).into_iter().collect(),
            HistoryPick::UserLatest => history.iter().rev().find(own).into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(minute: u32, value: &str, author: &str) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            value: DataValue::text(value),
            author: author.to_string(),
        }
    }

    #[test]
    fn system_fields_match_case_insensitively() {
        assert_eq!(SystemField::from_base_id("preferredname"), Some(SystemField::PreferredName));
        assert_eq!(SystemField::from_base_id("SID"), Some(SystemField::Sid));
        assert_eq!(SystemField::from_base_id("alternative_id2"), Some(SystemField::AlternativeId2));
        assert_eq!(SystemField::from_base_id("COL_1"), None);
    }

    #[test]
    fn history_pick_respects_author() {
        let history = vec![
            entry(0, "a", "tutor"),
            entry(1, "b", "s1"),
            entry(2, "c", "tutor"),
            entry(3, "d", "s1"),
            entry(4, "e", "tutor"),
        ];
        let texts = |picked: Vec<&HistoryEntry>| -> Vec<String> {
            picked.iter().map(|e| e.value.to_text()).collect()
        };
        assert_eq!(texts(HistoryPick::Earliest.select(&history, "s1")), vec!["a"]);
        assert_eq!(texts(HistoryPick::Latest.select(&history, "s1")), vec!["e"]);
        assert_eq!(texts(HistoryPick::UserEarliest.select(&history, "s1")), vec!["b"]);
        assert_eq!(texts(HistoryPick::UserLatest.select(&history, "s1")), vec!["d"]);
        assert_eq!(HistoryPick::All.select(&history, "s1").len(), 5);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let window = TimeWindow {
            start: Some(entry(1, "", "").timestamp),
            end: Some(entry(3, "", "").timestamp),
        };
        assert!(!window.contains(entry(0, "", "").timestamp));
        assert!(window.contains(entry(1, "", "").timestamp));
        assert!(window.contains(entry(3, "", "").timestamp));
        assert!(!window.contains(entry(4, "", "").timestamp));
    }
}
