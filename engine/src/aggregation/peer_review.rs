//! FILENAME: engine/src/aggregation/peer_review.rs
//! PURPOSE: Self and peer review scoring within a group.
//! CONTEXT: Group members share the value of a grouping column. Every member
//! scores every member (themselves included) through a score column; the
//! author of each history entry is the scorer and the identifier it was saved
//! against is the scoree. The most recent score of each (scorer, scoree) pair
//! counts.
//!
//! OUTPUT (18 positions):
//!   0  scores submitted for all members       1  ... for other members
//!   2  % submitted for all members (1 dp)     3  ... for other members (1 dp)
//!   4  avg by this member for all             5  avg by this member for others
//!   6  avg by all for this member             7  avg by others for this member
//!   8  avg by all for all                     9  avg by all for others
//!   10 avg by others for others               11 self score
//!   12 SAPA                                   13 SPA (square root)
//!   14 SPA (knee)                             15 PAF
//!   16 scores received from all members       17 ... from other members
//! Averages and factors are rounded to 4 places.

use crate::numeric::{mean, round_half_up};
use crate::resolver::{extract_sub_field, Resolver};
use crate::snapshot::{HistoryEntry, Identifier, Snapshot, TimeWindow};
use crate::store::{SchemaAccessor, SnapshotStore};
use crate::value::DataValue;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use parser::Reference;
use rustc_hash::{FxHashMap, FxHashSet};

/// One score as recorded in history.
#[derive(Debug, Clone)]
struct Score {
    timestamp: DateTime<Utc>,
    scorer: String,
    scoree: Identifier,
    value: DataValue,
}

/// The members of one group and how authors map onto them.
struct Group {
    this_id: Identifier,
    this_username: String,
    all_ids: Vec<Identifier>,
    others_ids: FxHashSet<Identifier>,
    all_usernames: FxHashSet<String>,
    others_usernames: FxHashSet<String>,
    username_to_id: FxHashMap<String, Identifier>,
}

pub struct PeerReview<'a> {
    pub schema: &'a dyn SchemaAccessor,
    pub store: &'a dyn SnapshotStore,
    pub table_id: &'a str,
    pub grouping: &'a Reference,
    pub score: &'a Reference,
}

impl PeerReview<'_> {
    pub fn compute(&self, snapshot: &Snapshot, diagnostics: &mut Vec<EngineError>) -> DataValue {
        let group = self.group_of(snapshot, diagnostics);
        let history = self.history(&group);
        log_debug!(
            "AGGREGATE",
            "peer review for {}: {} members, {} scores",
            group.this_id,
            group.all_ids.len(),
            history.len()
        );
        DataValue::List(summarize(&group, &history, self.score.sub_field_index))
    }

    /// Members sharing this identifier's grouping value. A blank grouping
    /// value puts the identifier in a group of its own.
    fn group_of(&self, snapshot: &Snapshot, diagnostics: &mut Vec<EngineError>) -> Group {
        let resolver = Resolver::new(self.schema);
        let own_group = resolver
            .resolve_or_blank(self.grouping, snapshot, diagnostics)
            .to_text();

        let mut members: Vec<(Identifier, String)> = Vec::new();
        if own_group.trim().is_empty() {
            members.push((snapshot.identifier.clone(), snapshot.identity.username.clone()));
        } else {
            let columns = vec![self.grouping.base_column_id.clone()];
            for identifier in self.store.identifiers_in(self.table_id) {
                let Some(other) = self.store.get_attributes(&identifier, &columns) else {
                    continue;
                };
                let mut ignored = Vec::new();
                let value = resolver.resolve_or_blank(self.grouping, &other, &mut ignored).to_text();
                if value == own_group {
                    members.push((identifier, other.identity.username.clone()));
                }
            }
            if !members.iter().any(|(id, _)| *id == snapshot.identifier) {
                members.push((snapshot.identifier.clone(), snapshot.identity.username.clone()));
            }
        }

        let this_id = snapshot.identifier.clone();
        let this_username = snapshot.identity.username.clone();
        let mut username_to_id = FxHashMap::default();
        for (id, username) in &members {
            username_to_id.entry(username.clone()).or_insert_with(|| id.clone());
        }

        Group {
            all_ids: members.iter().map(|(id, _)| id.clone()).collect(),
            others_ids: members
                .iter()
                .filter(|(id, _)| *id != this_id)
                .map(|(id, _)| id.clone())
                .collect(),
            all_usernames: members.iter().map(|(_, u)| u.clone()).collect(),
            others_usernames: members
                .iter()
                .filter(|(_, u)| *u != this_username)
                .map(|(_, u)| u.clone())
                .collect(),
            username_to_id,
            this_id,
            this_username,
        }
    }

    /// Score history of every member, most recent first.
    fn history(&self, group: &Group) -> Vec<Score> {
        let mut scores: Vec<Score> = group
            .all_ids
            .iter()
            .flat_map(|id| {
                self.store
                    .get_history(id, &self.score.base_column_id, &TimeWindow::unbounded())
                    .into_iter()
                    .map(move |HistoryEntry { timestamp, value, author }| Score {
                        timestamp,
                        scorer: author,
                        scoree: id.clone(),
                        value,
                    })
            })
            .collect();
        scores.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        scores
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

fn score_value(score: &Score, sub_field: Option<usize>) -> DataValue {
    match sub_field {
        Some(index) => extract_sub_field(&score.value, index),
        None => score.value.clone(),
    }
}

/// Latest score per (scorer, scoree) pair among the entries `keep` accepts.
fn latest_pairs<'s>(history: &'s [Score], keep: impl Fn(&Score) -> bool) -> Vec<&'s Score> {
    let mut seen: FxHashSet<(&str, &str)> = FxHashSet::default();
    let mut pairs = Vec::new();
    for score in history {
        if keep(score) && seen.insert((score.scorer.as_str(), score.scoree.as_str())) {
            pairs.push(score);
        }
    }
    pairs
}

fn average(pairs: &[&Score], sub_field: Option<usize>) -> Option<f64> {
    mean(&values_of(pairs, sub_field))
}

fn values_of(pairs: &[&Score], sub_field: Option<usize>) -> Vec<f64> {
    pairs
        .iter()
        .filter_map(|s| score_value(s, sub_field).as_number())
        .collect()
}

fn rounded(n: Option<f64>, places: u32) -> DataValue {
    n.filter(|v| v.is_finite())
        .map(|v| DataValue::Number(round_half_up(v, places)))
        .unwrap_or_default()
}

fn count(n: usize) -> DataValue {
    DataValue::Number(n as f64)
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn summarize(group: &Group, history: &[Score], sub_field: Option<usize>) -> Vec<DataValue> {
    let is_member = |id: &String| group.all_ids.contains(id);

    // Submissions by this member
    let mut targets: Vec<&str> = Vec::new();
    for score in history.iter().filter(|s| s.scorer == group.this_username) {
        if !targets.contains(&score.scoree.as_str()) {
            targets.push(&score.scoree);
        }
    }
    let targets_others = targets.iter().filter(|t| **t != group.this_id).count();

    let by_this_for_all = latest_pairs(history, |s| s.scorer == group.this_username && is_member(&s.scoree));
    let by_this_for_others =
        latest_pairs(history, |s| s.scorer == group.this_username && group.others_ids.contains(&s.scoree));
    let by_all_for_this =
        latest_pairs(history, |s| s.scoree == group.this_id && group.all_usernames.contains(&s.scorer));
    let by_others_for_this =
        latest_pairs(history, |s| s.scoree == group.this_id && group.others_usernames.contains(&s.scorer));
    let by_all_for_all = latest_pairs(history, |s| is_member(&s.scoree) && group.all_usernames.contains(&s.scorer));
    let by_all_for_others =
        latest_pairs(history, |s| group.others_ids.contains(&s.scoree) && group.all_usernames.contains(&s.scorer));
    let by_others_for_others = latest_pairs(history, |s| {
        group.others_ids.contains(&s.scoree) && group.others_usernames.contains(&s.scorer)
    });

    // First parseable self score, most recent first
    let self_score = history
        .iter()
        .filter(|s| s.scoree == group.this_id && s.scorer == group.this_username)
        .find_map(|s| score_value(s, sub_field).as_number());

    let avg_others_for_this = average(&by_others_for_this, sub_field);
    let sapa = match (self_score, avg_others_for_this) {
        (Some(own), Some(others)) if others != 0.0 && own / others >= 0.0 => Some((own / others).sqrt()),
        _ => None,
    };

    let total_for_this: f64 = values_of(&by_all_for_this, sub_field).iter().sum();
    let factors = contribution_factors(group, history, sub_field, total_for_this);

    vec![
        count(targets.len()),
        count(targets_others),
        rounded(Some(percentage(targets.len(), group.all_ids.len())), 1),
        rounded(Some(percentage(targets_others, group.others_ids.len())), 1),
        rounded(average(&by_this_for_all, sub_field), 4),
        rounded(average(&by_this_for_others, sub_field), 4),
        rounded(average(&by_all_for_this, sub_field), 4),
        rounded(avg_others_for_this, 4),
        rounded(average(&by_all_for_all, sub_field), 4),
        rounded(average(&by_all_for_others, sub_field), 4),
        rounded(average(&by_others_for_others, sub_field), 4),
        self_score.map(DataValue::Number).unwrap_or_default(),
        rounded(sapa, 4),
        rounded(factors.spa_sqrt, 4),
        rounded(factors.spa_knee, 4),
        rounded(factors.paf, 4),
        count(by_all_for_this.len()),
        count(by_others_for_this.len()),
    ]
}

#[derive(Debug, Default)]
struct Factors {
    spa_sqrt: Option<f64>,
    spa_knee: Option<f64>,
    paf: Option<f64>,
}

/// SPA and PAF from the full scorer-by-scoree matrix.
fn contribution_factors(group: &Group, history: &[Score], sub_field: Option<usize>, total_for_this: f64) -> Factors {
    let n = group.all_ids.len();
    let index: FxHashMap<&str, usize> = group
        .all_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut matrix = vec![vec![0.0_f64; n]; n];
    let mut recorded: FxHashSet<(usize, usize)> = FxHashSet::default();
    let mut scorers: FxHashSet<usize> = FxHashSet::default();
    for score in history {
        // Authors outside the group are ignored
        let Some(scorer) = group.username_to_id.get(&score.scorer).and_then(|id| index.get(id.as_str())) else {
            continue;
        };
        let Some(&scoree) = index.get(score.scoree.as_str()) else {
            continue;
        };
        if recorded.insert((*scorer, scoree)) {
            if let Some(value) = score_value(score, sub_field).as_number() {
                matrix[*scorer][scoree] = value;
            }
        }
        scorers.insert(*scorer);
    }

    let allocated: Vec<f64> = (0..n).map(|r| matrix[r].iter().sum()).collect();
    let received: Vec<f64> = (0..n).map(|c| (0..n).map(|r| matrix[r][c]).sum()).collect();

    let mut factors = Factors::default();
    let Some(avg_received) = mean(&received).filter(|avg| *avg != 0.0) else {
        return factors;
    };

    let spa_linear = total_for_this / avg_received;
    if spa_linear < 0.0 {
        return factors;
    }
    let spa_sqrt = spa_linear.sqrt();
    factors.spa_sqrt = Some(spa_sqrt);
    factors.spa_knee = Some(if spa_linear <= 1.0 { spa_linear } else { spa_sqrt });

    // Every scorer must have allocated something for the normalisation to hold
    if scorers.is_empty() || allocated.iter().any(|total| *total == 0.0) {
        log_warn!("AGGREGATE", "PAF unavailable for {}: incomplete score matrix", group.this_id);
        return factors;
    }
    let multiplier = n as f64 / scorers.len() as f64;
    let pa_scores: Vec<f64> = (0..n)
        .map(|c| (0..n).map(|r| matrix[r][c] / allocated[r]).sum::<f64>() * multiplier)
        .collect();
    let pa_sum: f64 = pa_scores.iter().sum();

    if (n as f64 * 0.95..=n as f64 * 1.05).contains(&pa_sum) {
        factors.paf = index.get(group.this_id.as_str()).map(|&i| pa_scores[i]);
    } else {
        log_warn!("AGGREGATE", "PAF check failed for {}: sum {}", group.this_id, pa_sum);
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnKind, ColumnMetadata};
    use crate::memory::{MemorySchema, MemorySnapshots};
    use crate::snapshot::IdentityAttributes;
    use chrono::TimeZone;

    fn identity(username: &str) -> IdentityAttributes {
        IdentityAttributes {
            username: username.to_string(),
            sid: username.to_string(),
            ..IdentityAttributes::default()
        }
    }

    /// Three members of team "red" score each other; "blue" is elsewhere.
    fn fixture() -> (MemorySchema, MemorySnapshots) {
        let schema = MemorySchema::new();
        schema.insert(ColumnMetadata::new("TEAM", "T1", "Team", ColumnKind::SimpleEntry));
        schema.insert(ColumnMetadata::new("SCORE", "T1", "Score", ColumnKind::SimpleEntry));

        let store = MemorySnapshots::new();
        for (id, team) in [("a", "red"), ("b", "red"), ("c", "red"), ("d", "blue")] {
            store.enrol(id, "T1", identity(id));
            store.set_value(id, "TEAM", DataValue::text(team), "tutor");
        }

        let t = |m| Utc.with_ymd_and_hms(2024, 4, 1, 12, m, 0).unwrap();
        let mut minute = 0;
        let mut score = |scorer: &str, scoree: &str, value: f64| {
            minute += 1;
            store.set_value_at(scoree, "SCORE", DataValue::Number(value), scorer, t(minute));
        };
        // Everyone gives everyone 10, except "a" rates "b" at 20
        for scorer in ["a", "b", "c"] {
            for scoree in ["a", "b", "c"] {
                score(scorer, scoree, 10.0);
            }
        }
        score("a", "b", 20.0);
        // An outsider's score against "a" must not count
        score("d", "a", 99.0);
        (schema, store)
    }

    fn review(id: &str) -> Vec<DataValue> {
        let (schema, store) = fixture();
        let grouping = Reference::new("TEAM");
        let score = Reference::new("SCORE");
        let review = PeerReview {
            schema: &schema,
            store: &store,
            table_id: "T1",
            grouping: &grouping,
            score: &score,
        };
        let snapshot = store.get_attributes(id, &["TEAM".to_string()]).unwrap();
        let mut diagnostics = Vec::new();
        match review.compute(&snapshot, &mut diagnostics) {
            DataValue::List(items) => items,
            other => panic!("expected list, got {:?}", other),
        }
    }

    fn num(value: &DataValue) -> f64 {
        value.as_number().unwrap()
    }

    #[test]
    fn output_has_eighteen_positions() {
        assert_eq!(review("a").len(), 18);
    }

    #[test]
    fn submission_counts_and_percentages() {
        let out = review("a");
        assert_eq!(num(&out[0]), 3.0);
        assert_eq!(num(&out[1]), 2.0);
        assert_eq!(num(&out[2]), 100.0);
        assert_eq!(num(&out[3]), 100.0);
    }

    #[test]
    fn latest_score_per_pair_wins() {
        let out = review("b");
        // b received 20 (latest from a), 10, 10
        assert_eq!(num(&out[6]), 13.3333);
        assert_eq!(num(&out[7]), 15.0);
        assert_eq!(num(&out[11]), 10.0);
        assert_eq!(num(&out[16]), 3.0);
        assert_eq!(num(&out[17]), 2.0);
    }

    #[test]
    fn outsiders_are_ignored() {
        let out = review("a");
        assert_eq!(num(&out[6]), 10.0);
        assert_eq!(num(&out[16]), 3.0);
    }

    #[test]
    fn sapa_spa_and_paf() {
        let out = review("c");
        // c: self 10, others gave 10 and 10
        assert_eq!(num(&out[12]), 1.0);
        // received totals: a 30, b 40, c 30; average 33.33
        assert_eq!(num(&out[13]), round_half_up((30.0_f64 / (100.0 / 3.0)).sqrt(), 4));
        assert_eq!(num(&out[14]), 0.9);
        // PAF sums to n by construction
        let paf_sum: f64 = ["a", "b", "c"].iter().map(|id| num(&review(id)[15])).sum();
        assert!((paf_sum - 3.0).abs() < 1e-3);
    }

    #[test]
    fn blank_group_is_alone() {
        let (schema, store) = fixture();
        store.enrol("e", "T1", identity("e"));
        let grouping = Reference::new("TEAM");
        let score = Reference::new("SCORE");
        let review = PeerReview {
            schema: &schema,
            store: &store,
            table_id: "T1",
            grouping: &grouping,
            score: &score,
        };
        let snapshot = store.get_attributes("e", &["TEAM".to_string()]).unwrap();
        let out = match review.compute(&snapshot, &mut Vec::new()) {
            DataValue::List(items) => items,
            other => panic!("expected list, got {:?}", other),
        };
        assert_eq!(num(&out[0]), 0.0);
        assert_eq!(num(&out[2]), 0.0);
        assert_eq!(num(&out[3]), 0.0);
        assert!(out[4].is_blank());
        assert!(out[15].is_blank());
    }
}
