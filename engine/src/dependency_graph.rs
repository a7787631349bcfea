//! FILENAME: engine/src/dependency_graph.rs
//! PURPOSE: Directed graph of "column A is aggregated by column B" edges.
//! CONTEXT: Aggregator columns list their sources in their AggregationSpec.
//! This graph keeps both directions of that relationship so the engine can
//! find downstream aggregators quickly, order a bulk recalculation, and warn
//! authors before a spec change closes a loop.
//!
//! TERMINOLOGY:
//! - Sources: columns an aggregator reads (its precedents).
//!   If C averages A and B, then A and B are sources of C.
//! - Aggregated-by: aggregators that read a given column (its dependents).
//!   If C averages A and B, then C is in aggregated_by(A) and aggregated_by(B).
//!
//! Cycles are legal to store. They come from misconfiguration and are
//! defended against at traversal time, so ordering falls back gracefully.

use crate::column::ColumnId;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Error type for cycle detection.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleError {
    /// The columns involved in the cycle, in order.
    pub cycle_path: Vec<ColumnId>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circular aggregation detected: {}", self.cycle_path.join(" -> "))
    }
}

impl std::error::Error for CycleError {}

/// Ordered maps keep traversal deterministic across runs.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// For each aggregator, the columns it reads.
    sources: BTreeMap<ColumnId, BTreeSet<ColumnId>>,

    /// For each column, the aggregators that read it.
    aggregated_by: BTreeMap<ColumnId, BTreeSet<ColumnId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Sets the sources of an aggregator, replacing any previous ones.
    ///
    /// # Note
    /// This does NOT check for cycles. Use `would_create_cycle()` first if needed.
    pub fn set_sources(&mut self, aggregator: &str, new_sources: BTreeSet<ColumnId>) {
        self.clear_sources(aggregator);

        if !new_sources.is_empty() {
            for source in &new_sources {
                self.aggregated_by
                    .entry(source.clone())
                    .or_default()
                    .insert(aggregator.to_string());
            }
            self.sources.insert(aggregator.to_string(), new_sources);
        }
    }

    /// Removes every edge into an aggregator.
    pub fn clear_sources(&mut self, aggregator: &str) {
        if let Some(old_sources) = self.sources.remove(aggregator) {
            for source in old_sources {
                if let Some(readers) = self.aggregated_by.get_mut(&source) {
                    readers.remove(aggregator);
                    if readers.is_empty() {
                        self.aggregated_by.remove(&source);
                    }
                }
            }
        }
    }

    pub fn get_sources(&self, aggregator: &str) -> Option<&BTreeSet<ColumnId>> {
        self.sources.get(aggregator)
    }

    pub fn get_aggregated_by(&self, column: &str) -> Option<&BTreeSet<ColumnId>> {
        self.aggregated_by.get(column)
    }

    /// Checks if giving `aggregator` these sources would close a loop.
    pub fn would_create_cycle(&self, aggregator: &str, new_sources: &BTreeSet<ColumnId>) -> bool {
        if new_sources.contains(aggregator) {
            return true;
        }
        new_sources
            .iter()
            .any(|source| self.can_reach(source, aggregator))
    }

    /// Follows source chains from `start` looking for `target`.
    fn can_reach(&self, start: &str, target: &str) -> bool {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut stack = vec![start];

        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(sources) = self.sources.get(current) {
                stack.extend(
                    sources
                        .iter()
                        .map(String::as_str)
                        .filter(|s| !visited.contains(s)),
                );
            }
        }

        false
    }

    /// Every aggregator downstream of any of `changed`, sources before readers.
    ///
    /// The changed columns themselves are not included unless they are also
    /// downstream of another changed column.
    pub fn get_recalc_order(&self, changed: &BTreeSet<ColumnId>) -> Result<Vec<ColumnId>, CycleError> {
        let affected = self.get_all_downstream(changed);
        if affected.is_empty() {
            return Ok(Vec::new());
        }
        self.topological_sort(&affected)
    }

    /// Like `get_recalc_order`, but a cycle is appended in id order instead of failing.
    pub fn recalc_order_lenient(&self, changed: &BTreeSet<ColumnId>) -> (Vec<ColumnId>, Option<CycleError>) {
        match self.get_recalc_order(changed) {
            Ok(order) => (order, None),
            Err(err) => {
                let affected = self.get_all_downstream(changed);
                let (mut order, rest) = self.kahn(&affected);
                order.extend(rest);
                (order, Some(err))
            }
        }
    }

    /// Transitive aggregated-by closure, breadth first.
    fn get_all_downstream(&self, changed: &BTreeSet<ColumnId>) -> BTreeSet<ColumnId> {
        let mut result = BTreeSet::new();
        let mut queue: VecDeque<&ColumnId> = VecDeque::new();

        for column in changed {
            if let Some(readers) = self.aggregated_by.get(column) {
                queue.extend(readers.iter());
            }
        }

        while let Some(current) = queue.pop_front() {
            if !result.insert(current.clone()) {
                continue;
            }
            if let Some(readers) = self.aggregated_by.get(current) {
                queue.extend(readers.iter().filter(|r| !result.contains(*r)));
            }
        }

        result
    }

    /// Kahn's algorithm over a subset. Returns the sorted prefix and the
    /// leftover columns that sit on or behind a cycle.
    fn kahn(&self, columns: &BTreeSet<ColumnId>) -> (Vec<ColumnId>, Vec<ColumnId>) {
        let mut in_degree: BTreeMap<&ColumnId, usize> = columns.iter().map(|c| (c, 0)).collect();

        for column in columns {
            if let Some(sources) = self.sources.get(column) {
                let inside = sources.iter().filter(|s| columns.contains(*s)).count();
                in_degree.insert(column, inside);
            }
        }

        let mut ready: BTreeSet<&ColumnId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&column, _)| column)
            .collect();
        let mut sorted = Vec::with_capacity(columns.len());

        while let Some(column) = ready.pop_first() {
            sorted.push(column.clone());
            if let Some(readers) = self.aggregated_by.get(column) {
                for reader in readers {
                    if let Some(deg) = in_degree.get_mut(reader) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(reader);
                        }
                    }
                }
            }
        }

        let leftover = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(column, _)| column.clone())
            .collect();
        (sorted, leftover)
    }

    fn topological_sort(&self, columns: &BTreeSet<ColumnId>) -> Result<Vec<ColumnId>, CycleError> {
        let (sorted, leftover) = self.kahn(columns);
        if leftover.is_empty() {
            Ok(sorted)
        } else {
            Err(CycleError {
                cycle_path: self.find_cycle_path(&leftover),
            })
        }
    }

    /// Traces sources through the leftover set to report a readable loop.
    fn find_cycle_path(&self, cycle_columns: &[ColumnId]) -> Vec<ColumnId> {
        let Some(start) = cycle_columns.first() else {
            return Vec::new();
        };
        let members: BTreeSet<&ColumnId> = cycle_columns.iter().collect();
        let mut path = vec![start.clone()];
        let mut current = start;

        for _ in 0..cycle_columns.len() {
            let next = self
                .sources
                .get(current)
                .and_then(|sources| sources.iter().find(|s| members.contains(s)));
            match next {
                Some(next) if path.contains(next) => {
                    path.push(next.clone());
                    return path;
                }
                Some(next) => {
                    path.push(next.clone());
                    current = next;
                }
                None => break,
            }
        }

        cycle_columns.to_vec()
    }

    /// Number of aggregators with at least one source.
    pub fn aggregator_count(&self) -> usize {
        self.sources.len()
    }

    /// Total number of source edges.
    pub fn edge_count(&self) -> usize {
        self.sources.values().map(BTreeSet::len).sum()
    }
}
