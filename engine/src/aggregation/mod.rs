//! FILENAME: engine/src/aggregation/mod.rs
//! PURPOSE: Computes aggregator columns and recalculates their dependents.
//! CONTEXT: `compute` evaluates one aggregator for a set of identifiers, writes
//! the results back through the store and then cascades into on-write
//! aggregators that read it. The `visited` set belongs to one pass: every
//! branch carries the columns already on its path, so a misconfigured loop
//! ends with `CycleDetected` instead of recursing forever.
//!
//! `compute_bulk` is the scheduled/structural variant. It orders every
//! aggregator downstream of a set of source columns topologically, then walks
//! identifiers one at a time with a single snapshot each, checking the
//! cancellation flag between identifiers.

pub mod peer_review;
pub mod postprocess;
pub mod simple;
pub mod spec;

pub use peer_review::PeerReview;
pub use spec::{
    Adjustment, AggregationMethod, AggregationSpec, ArithmeticOp, AxisMode, BlankHandling, Case,
    RecalcTrigger, ReplaceMode, RoundingPolicy, SimpleStatistic, TextReplacement,
};

use crate::column::{ColumnId, ColumnMetadata};
use crate::config::EngineConfig;
use crate::dependency_graph::DependencyGraph;
use crate::error::EngineError;
use crate::formula::evaluate_formula;
use crate::resolver::{Resolver, SubstituteOptions};
use crate::snapshot::{HistoryPick, Identifier, Snapshot, SystemField, TimeWindow};
use crate::store::{ClaimGuard, JobClaim, SchemaAccessor, SnapshotStore};
use crate::value::DataValue;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Author recorded on values written back by the engine.
pub const WRITE_BACK_AUTHOR: &str = "aggregation";

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    Computed,
    /// Manual trigger and the call was not forced.
    SkippedManual,
    /// Deleted, or outside its active window.
    Inactive,
    /// The column is already on this pass's path.
    CycleDetected,
    NotFound,
    NotAnAggregator,
}

/// The computed value for one identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierOutcome {
    pub identifier: Identifier,
    pub value: DataValue,
    /// Time-series mode: the history points that fed the computation.
    pub series: Vec<DataValue>,
    pub diagnostics: Vec<EngineError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub column_id: ColumnId,
    pub status: ComputeStatus,
    pub outcomes: Vec<IdentifierOutcome>,
    /// On-write aggregators recomputed because they read this column.
    pub cascaded: Vec<AggregationResult>,
}

impl AggregationResult {
    fn skipped(column_id: &str, status: ComputeStatus) -> Self {
        AggregationResult {
            column_id: column_id.to_string(),
            status,
            outcomes: Vec::new(),
            cascaded: Vec::new(),
        }
    }

    pub fn value_for(&self, identifier: &str) -> Option<&DataValue> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.identifier == identifier)
            .map(|outcome| &outcome.value)
    }

    /// True if this column or any cascaded branch hit a cycle.
    pub fn cycle_detected(&self) -> bool {
        self.status == ComputeStatus::CycleDetected || self.cascaded.iter().any(AggregationResult::cycle_detected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkStatus {
    Completed,
    /// Stopped between identifiers; `processed` identifiers were finished.
    Cancelled { processed: usize },
    /// Another worker holds the claim for this scope.
    SkippedAlreadyRunning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkResult {
    pub status: BulkStatus,
    /// Aggregators in the order they were recomputed.
    pub order: Vec<ColumnId>,
    pub columns: BTreeMap<ColumnId, AggregationResult>,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct AggregationEngine<'a> {
    schema: &'a dyn SchemaAccessor,
    store: &'a dyn SnapshotStore,
    claims: Option<&'a dyn JobClaim>,
    config: EngineConfig,
    now: DateTime<Utc>,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(schema: &'a dyn SchemaAccessor, store: &'a dyn SnapshotStore) -> Self {
        AggregationEngine {
            schema,
            store,
            claims: None,
            config: EngineConfig::default(),
            now: Utc::now(),
        }
    }

    /// Bulk passes claim their scope through `claims` first.
    pub fn with_claims(mut self, claims: &'a dyn JobClaim) -> Self {
        self.claims = Some(claims);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Evaluates active windows at `now` instead of the wall clock.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Computes `column_id` for `identifiers` and cascades into on-write readers.
    ///
    /// `visited` holds the columns already computed on this branch of the
    /// current pass; pass an empty set to start a new pass.
    pub fn compute(
        &self,
        column_id: &str,
        identifiers: &[Identifier],
        forced: bool,
        visited: &BTreeSet<ColumnId>,
    ) -> AggregationResult {
        if visited.contains(column_id) {
            log_warn!(
                "AGGREGATE",
                "cycle detected at {} (path: {})",
                column_id,
                visited.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            return AggregationResult::skipped(column_id, ComputeStatus::CycleDetected);
        }
        let mut path = visited.clone();
        path.insert(column_id.to_string());

        let (column, spec) = match self.gate(column_id, forced) {
            Ok(found) => found,
            Err(status) => return AggregationResult::skipped(column_id, status),
        };

        let reads = spec.source_column_ids();
        let outcomes = identifiers
            .iter()
            .map(|identifier| {
                let Some(snapshot) = self.store.get_attributes(identifier, &reads) else {
                    return IdentifierOutcome {
                        identifier: identifier.clone(),
                        value: DataValue::Empty,
                        series: Vec::new(),
                        diagnostics: vec![EngineError::UnknownIdentifier(identifier.clone())],
                    };
                };
                let mut outcome = self.evaluate(&column, &spec, &snapshot);
                self.write_back(&column.id, &mut outcome);
                outcome
            })
            .collect();

        let cascaded = self
            .on_write_readers(column_id)
            .into_iter()
            .map(|reader| self.compute(&reader, identifiers, false, &path))
            .collect();

        AggregationResult {
            column_id: column_id.to_string(),
            status: ComputeStatus::Computed,
            outcomes,
            cascaded,
        }
    }

    /// Starts a new pass for one column.
    pub fn recompute(&self, column_id: &str, identifiers: &[Identifier], forced: bool) -> AggregationResult {
        self.compute(column_id, identifiers, forced, &BTreeSet::new())
    }

    /// Recomputes the on-write aggregators reading `changed_column` after a
    /// write for one identifier.
    pub fn on_write(&self, changed_column: &str, identifier: &str) -> Vec<AggregationResult> {
        let path = BTreeSet::from([changed_column.to_string()]);
        let identifiers = [identifier.to_string()];
        self.on_write_readers(changed_column)
            .into_iter()
            .map(|reader| self.compute(&reader, &identifiers, false, &path))
            .collect()
    }

    /// Recomputes every aggregator downstream of `source_ids`, sources before
    /// readers, for each identifier in turn.
    pub fn compute_bulk(
        &self,
        source_ids: &[ColumnId],
        identifiers: &[Identifier],
        forced: bool,
        cancel: &AtomicBool,
    ) -> BulkResult {
        let mut scope: Vec<&str> = source_ids.iter().map(String::as_str).collect();
        scope.sort_unstable();
        scope.dedup();
        let scope_key = format!("aggregation:{}", scope.join(","));

        let _guard = match self.claims {
            Some(claims) => match ClaimGuard::acquire(claims, scope_key.as_str()) {
                Some(guard) => Some(guard),
                None => {
                    log_warn!("JOBS", "claim {} is held elsewhere, skipping", scope_key);
                    return BulkResult {
                        status: BulkStatus::SkippedAlreadyRunning,
                        order: Vec::new(),
                        columns: BTreeMap::new(),
                    };
                }
            },
            None => None,
        };

        let changed: BTreeSet<ColumnId> = source_ids.iter().cloned().collect();
        let (order, cycle) = self.downstream_graph(&changed).recalc_order_lenient(&changed);
        let on_cycle: BTreeSet<ColumnId> = match &cycle {
            Some(err) => {
                log_warn!("AGGREGATE", "{}", err);
                err.cycle_path.iter().cloned().collect()
            }
            None => BTreeSet::new(),
        };

        log_info!(
            "JOBS",
            "bulk recalculation of {} aggregators for {} identifiers",
            order.len(),
            identifiers.len()
        );

        let mut columns: BTreeMap<ColumnId, AggregationResult> = BTreeMap::new();
        let mut runnable: Vec<(Arc<ColumnMetadata>, AggregationSpec)> = Vec::new();
        for column_id in &order {
            let status = if on_cycle.contains(column_id) {
                Err(ComputeStatus::CycleDetected)
            } else {
                self.gate(column_id, forced)
            };
            match status {
                Ok(found) => {
                    columns.insert(column_id.clone(), AggregationResult::skipped(column_id, ComputeStatus::Computed));
                    runnable.push(found);
                }
                Err(status) => {
                    columns.insert(column_id.clone(), AggregationResult::skipped(column_id, status));
                }
            }
        }

        let mut reads: Vec<ColumnId> = Vec::new();
        for (column, spec) in &runnable {
            for id in spec.source_column_ids().into_iter().chain([column.id.clone()]) {
                if !reads.contains(&id) {
                    reads.push(id);
                }
            }
        }

        let mut status = BulkStatus::Completed;
        for (processed, identifier) in identifiers.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                log_info!("JOBS", "bulk recalculation cancelled after {} identifiers", processed);
                status = BulkStatus::Cancelled { processed };
                break;
            }
            let Some(mut snapshot) = self.store.get_attributes(identifier, &reads) else {
                log_debug!("AGGREGATE", "unknown identifier {} in bulk pass", identifier);
                continue;
            };
            for (column, spec) in &runnable {
                let mut outcome = self.evaluate(column, spec, &snapshot);
                snapshot.set(column.id.clone(), outcome.value.clone());
                self.write_back(&column.id, &mut outcome);
                if let Some(result) = columns.get_mut(&column.id) {
                    result.outcomes.push(outcome);
                }
            }
        }

        BulkResult { status, order, columns }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// The column and its spec, or the reason it must not be computed.
    fn gate(&self, column_id: &str, forced: bool) -> Result<(Arc<ColumnMetadata>, AggregationSpec), ComputeStatus> {
        let column = self.schema.get_column(column_id).ok_or(ComputeStatus::NotFound)?;
        let spec = match (&column.aggregation, column.is_aggregator()) {
            (Some(spec), true) => spec.clone(),
            _ => return Err(ComputeStatus::NotAnAggregator),
        };
        if column.is_deleted() || (!forced && !column.active.is_active_at(self.now)) {
            log_debug!("AGGREGATE", "{} is inactive", column_id);
            return Err(ComputeStatus::Inactive);
        }
        if !forced && spec.trigger == RecalcTrigger::Manual {
            return Err(ComputeStatus::SkippedManual);
        }
        Ok((column, spec))
    }

    fn on_write_readers(&self, column_id: &str) -> Vec<ColumnId> {
        self.schema
            .aggregated_by(column_id)
            .into_iter()
            .filter(|reader| {
                self.schema
                    .get_column(reader)
                    .and_then(|column| column.aggregation.as_ref().map(|spec| spec.trigger))
                    == Some(RecalcTrigger::OnWrite)
            })
            .collect()
    }

    /// Dependency graph of every aggregator reachable from `changed`.
    fn downstream_graph(&self, changed: &BTreeSet<ColumnId>) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let mut seen: BTreeSet<ColumnId> = BTreeSet::new();
        let mut queue: VecDeque<ColumnId> = changed.iter().cloned().collect();

        while let Some(current) = queue.pop_front() {
            for reader in self.schema.aggregated_by(&current) {
                if !seen.insert(reader.clone()) {
                    continue;
                }
                if let Some(spec) = self.schema.get_column(&reader).and_then(|c| c.aggregation.clone()) {
                    graph.set_sources(&reader, spec.source_column_ids().into_iter().collect());
                }
                queue.push_back(reader);
            }
        }
        graph
    }

    fn write_back(&self, column_id: &str, outcome: &mut IdentifierOutcome) {
        if let Err(err) = self
            .store
            .put_attribute(&outcome.identifier, column_id, outcome.value.clone(), WRITE_BACK_AUTHOR)
        {
            log_warn!("AGGREGATE", "could not store {} for {}: {}", column_id, outcome.identifier, err);
            outcome.diagnostics.push(err);
        }
    }

    /// Runs the method for one identifier, then post-processing.
    fn evaluate(&self, column: &ColumnMetadata, spec: &AggregationSpec, snapshot: &Snapshot) -> IdentifierOutcome {
        let resolver = Resolver::new(self.schema);
        let mut diagnostics = Vec::new();

        let mut series = Vec::new();
        let values: Vec<DataValue> = match spec.axis {
            AxisMode::RowWise => spec
                .distinct_sources()
                .into_iter()
                .map(|source| resolver.resolve_or_blank(source, snapshot, &mut diagnostics).into_value())
                .collect(),
            AxisMode::TimeSeries { pick, window } => {
                series = self.history_points(spec, pick, &window, snapshot, &mut diagnostics);
                series.clone()
            }
        };

        let raw = match &spec.method {
            AggregationMethod::Simple { statistic } => simple::reduce(statistic, &values, spec.blank_handling),
            AggregationMethod::Mapper { inputs, outputs } => {
                let input = values.first().map(DataValue::to_text).unwrap_or_default();
                inputs
                    .iter()
                    .position(|candidate| *candidate == input)
                    .and_then(|i| outputs.get(i))
                    .map(|output| DataValue::text(output.as_str()))
                    .unwrap_or_default()
            }
            AggregationMethod::Formula { expression } => {
                let options = SubstituteOptions::for_formula(spec.blank_handling == BlankHandling::TreatAsZero);
                let substituted = resolver.substitute(expression, snapshot, &options);
                diagnostics.extend(substituted.diagnostics);
                match evaluate_formula(&substituted.text) {
                    Ok(n) => DataValue::Number(n),
                    Err(err) => {
                        log_warn!("AGGREGATE", "{} for {}: {}", column.id, snapshot.identifier, err);
                        diagnostics.push(err);
                        DataValue::Empty
                    }
                }
            }
            AggregationMethod::CaseBuilder { cases } => self.case_output(&resolver, cases, snapshot, &mut diagnostics),
            AggregationMethod::PeerReview { grouping, score } => PeerReview {
                schema: self.schema,
                store: self.store,
                table_id: &column.table_id,
                grouping,
                score,
            }
            .compute(snapshot, &mut diagnostics),
        };

        let value = postprocess::apply(spec, raw);
        log_debug!("AGGREGATE", "{} for {} = {}", column.id, snapshot.identifier, value);

        IdentifierOutcome {
            identifier: snapshot.identifier.clone(),
            value,
            series,
            diagnostics,
        }
    }

    /// The picked history points of every source within `window`, each
    /// resolved through the source's own reference.
    fn history_points(
        &self,
        spec: &AggregationSpec,
        pick: HistoryPick,
        window: &TimeWindow,
        snapshot: &Snapshot,
        diagnostics: &mut Vec<EngineError>,
    ) -> Vec<DataValue> {
        let resolver = Resolver::new(self.schema);
        let mut points = Vec::new();
        for source in spec.distinct_sources() {
            if SystemField::from_base_id(&source.base_column_id).is_some() {
                points.push(resolver.resolve_or_blank(source, snapshot, diagnostics).into_value());
                continue;
            }
            let history = self
                .store
                .get_history(&snapshot.identifier, &source.base_column_id, window);
            for entry in pick.select(&history, &snapshot.identity.username) {
                let mut point = snapshot.clone();
                point.set(source.base_column_id.clone(), entry.value.clone());
                points.push(resolver.resolve_or_blank(source, &point, diagnostics).into_value());
            }
        }
        points
    }

    /// First matching non-default case, else the default case, else blank.
    fn case_output(
        &self,
        resolver: &Resolver<'_>,
        cases: &[Case],
        snapshot: &Snapshot,
        diagnostics: &mut Vec<EngineError>,
    ) -> DataValue {
        let matched = cases.iter().filter(|case| !case.default).find(|case| {
            case.rules
                .as_ref()
                .is_some_and(|rules| rules.evaluate(resolver, snapshot, diagnostics))
        });
        let Some(case) = matched.or_else(|| cases.iter().find(|case| case.default)) else {
            return DataValue::Empty;
        };

        let options = SubstituteOptions {
            dangling: self.config.dangling.clone(),
            ..SubstituteOptions::default()
        };
        let substituted = resolver.substitute(&case.content, snapshot, &options);
        diagnostics.extend(substituted.diagnostics);
        if substituted.text.trim().is_empty() {
            DataValue::Empty
        } else {
            DataValue::Text(substituted.text)
        }
    }
}
