//! FILENAME: engine/src/memory.rs
//! PURPOSE: In-memory implementations of the consumed capabilities.
//! CONTEXT: Used by tests, benches and the persistence crate's JSON document
//! store. All three types use interior locking so they can be shared across
//! worker threads behind `&self`.

use crate::column::{ColumnId, ColumnMetadata, TableId};
use crate::config::EngineConfig;
use crate::dependency_graph::DependencyGraph;
use crate::error::{EngineError, EngineResult};
use crate::snapshot::{HistoryEntry, IdentityAttributes, Identifier, Snapshot, TimeWindow};
use crate::store::{JobClaim, SchemaAccessor, SnapshotStore};
use crate::value::DataValue;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Column metadata keyed by id, with the aggregated-by graph kept in step.
#[derive(Debug, Default)]
pub struct MemorySchema {
    columns: RwLock<HashMap<ColumnId, Arc<ColumnMetadata>>>,
    graph: RwLock<DependencyGraph>,
}

impl MemorySchema {
    pub fn new() -> Self {
        MemorySchema::default()
    }

    /// Inserts or replaces a column and refreshes its source edges.
    pub fn insert(&self, column: ColumnMetadata) {
        let sources: BTreeSet<ColumnId> = column
            .aggregation
            .as_ref()
            .map(|spec| {
                spec.referenced_columns(true, false)
                    .into_iter()
                    .map(|r| r.base_column_id)
                    .collect()
            })
            .unwrap_or_default();

        write(&self.graph).set_sources(&column.id, sources);
        write(&self.columns).insert(column.id.clone(), Arc::new(column));
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ColumnMetadata>> {
        write(&self.graph).clear_sources(id);
        write(&self.columns).remove(id)
    }

    /// All columns, sorted by id.
    pub fn columns(&self) -> Vec<Arc<ColumnMetadata>> {
        let mut all: Vec<_> = read(&self.columns).values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// A copy of the current dependency graph.
    pub fn graph(&self) -> DependencyGraph {
        read(&self.graph).clone()
    }
}

impl SchemaAccessor for MemorySchema {
    fn get_column(&self, id: &str) -> Option<Arc<ColumnMetadata>> {
        read(&self.columns).get(id).cloned()
    }

    fn aggregated_by(&self, column_id: &str) -> Vec<ColumnId> {
        read(&self.graph)
            .get_aggregated_by(column_id)
            .map(|readers| readers.iter().cloned().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Everything stored for one identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub table_id: TableId,
    pub identity: IdentityAttributes,
    #[serde(default)]
    pub values: HashMap<ColumnId, DataValue>,
    /// Per-column history, oldest first.
    #[serde(default)]
    pub history: HashMap<ColumnId, Vec<HistoryEntry>>,
}

#[derive(Debug, Default)]
pub struct MemorySnapshots {
    records: RwLock<HashMap<Identifier, Record>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        MemorySnapshots::default()
    }

    pub fn from_records(records: HashMap<Identifier, Record>) -> Self {
        MemorySnapshots {
            records: RwLock::new(records),
        }
    }

    /// A copy of every record, e.g. for saving.
    pub fn records(&self) -> HashMap<Identifier, Record> {
        read(&self.records).clone()
    }

    /// Enrols an identifier in a table. Existing values are kept.
    pub fn enrol(&self, identifier: impl Into<Identifier>, table_id: impl Into<TableId>, identity: IdentityAttributes) {
        let mut records = write(&self.records);
        let record = records.entry(identifier.into()).or_default();
        record.table_id = table_id.into();
        record.identity = identity;
    }

    /// Writes a value at an explicit time, appending to the column's history.
    pub fn set_value_at(&self, identifier: &str, column_id: &str, value: DataValue, author: &str, at: DateTime<Utc>) {
        let mut records = write(&self.records);
        let record = records.entry(identifier.to_string()).or_default();
        let history = record.history.entry(column_id.to_string()).or_default();
        history.push(HistoryEntry {
            timestamp: at,
            value: value.clone(),
            author: author.to_string(),
        });
        history.sort_by_key(|entry| entry.timestamp);
        record.values.insert(column_id.to_string(), value);
    }

    pub fn set_value(&self, identifier: &str, column_id: &str, value: DataValue, author: &str) {
        self.set_value_at(identifier, column_id, value, author, Utc::now());
    }

    pub fn value(&self, identifier: &str, column_id: &str) -> DataValue {
        read(&self.records)
            .get(identifier)
            .and_then(|record| record.values.get(column_id).cloned())
            .unwrap_or_default()
    }
}

impl SnapshotStore for MemorySnapshots {
    fn get_attributes(&self, identifier: &str, column_ids: &[ColumnId]) -> Option<Snapshot> {
        let records = read(&self.records);
        let record = records.get(identifier)?;
        let mut snapshot = Snapshot::new(identifier, record.identity.clone());
        for column_id in column_ids {
            if let Some(value) = record.values.get(column_id) {
                snapshot.set(column_id.clone(), value.clone());
            }
        }
        Some(snapshot)
    }

    fn get_history(&self, identifier: &str, column_id: &str, window: &TimeWindow) -> Vec<HistoryEntry> {
        read(&self.records)
            .get(identifier)
            .and_then(|record| record.history.get(column_id))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| window.contains(entry.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn identifiers_in(&self, table_id: &str) -> Vec<Identifier> {
        let mut identifiers: Vec<Identifier> = read(&self.records)
            .iter()
            .filter(|(_, record)| record.table_id == table_id)
            .map(|(identifier, _)| identifier.clone())
            .collect();
        identifiers.sort();
        identifiers
    }

    fn put_attribute(&self, identifier: &str, column_id: &str, value: DataValue, author: &str) -> EngineResult<()> {
        if !read(&self.records).contains_key(identifier) {
            return Err(EngineError::UnknownIdentifier(identifier.to_string()));
        }
        self.set_value(identifier, column_id, value, author);
        Ok(())
    }
}

// ============================================================================
// JOB CLAIMS
// ============================================================================

/// Claims keyed by scope. A claim older than the stale window is assumed
/// abandoned and may be taken over.
#[derive(Debug)]
pub struct MemoryJobClaims {
    claims: Mutex<HashMap<String, DateTime<Utc>>>,
    stale_after: Duration,
}

impl MemoryJobClaims {
    pub fn new(stale_after: Duration) -> Self {
        MemoryJobClaims {
            claims: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Uses the configured stale window.
    pub fn from_config(config: &EngineConfig) -> Self {
        MemoryJobClaims::new(config.claim_stale_after())
    }

    /// Claims a scope as of `now`.
    pub fn try_claim_at(&self, scope_key: &str, now: DateTime<Utc>) -> bool {
        let mut claims = lock(&self.claims);
        match claims.get(scope_key) {
            Some(claimed_on) if now - *claimed_on < self.stale_after => {
                log_debug!("JOBS", "claim {} still held since {}", scope_key, claimed_on);
                false
            }
            Some(claimed_on) => {
                log_warn!("JOBS", "reclaiming stale claim {} from {}", scope_key, claimed_on);
                claims.insert(scope_key.to_string(), now);
                true
            }
            None => {
                claims.insert(scope_key.to_string(), now);
                true
            }
        }
    }

    pub fn is_claimed(&self, scope_key: &str) -> bool {
        lock(&self.claims).contains_key(scope_key)
    }
}

impl Default for MemoryJobClaims {
    fn default() -> Self {
        MemoryJobClaims::from_config(&EngineConfig::default())
    }
}

impl JobClaim for MemoryJobClaims {
    fn try_claim(&self, scope_key: &str) -> bool {
        self.try_claim_at(scope_key, Utc::now())
    }

    fn release(&self, scope_key: &str) {
        lock(&self.claims).remove(scope_key);
    }
}
