//! FILENAME: engine/src/store.rs
//! PURPOSE: Capabilities the engine consumes from its host.
//! CONTEXT: Schema, data, authorization and job claims are owned by external
//! collaborators. The engine reaches them only through these traits, which
//! keeps it testable against the in-memory implementations in `memory.rs`.

use crate::column::{ColumnId, ColumnMetadata, TableId};
use crate::error::EngineResult;
use crate::snapshot::{HistoryEntry, Identifier, Snapshot, TimeWindow};
use crate::value::DataValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only view of column metadata.
pub trait SchemaAccessor: Send + Sync {
    fn get_column(&self, id: &str) -> Option<Arc<ColumnMetadata>>;

    /// Bulk lookup. Ids that do not resolve are absent from the result.
    fn get_columns(&self, ids: &[ColumnId]) -> HashMap<ColumnId, Arc<ColumnMetadata>> {
        ids.iter()
            .filter_map(|id| self.get_column(id).map(|column| (id.clone(), column)))
            .collect()
    }

    fn get_table_of(&self, column_id: &str) -> Option<TableId> {
        self.get_column(column_id).map(|column| column.table_id.clone())
    }

    /// Aggregator columns that list `column_id` among their sources.
    fn aggregated_by(&self, column_id: &str) -> Vec<ColumnId>;
}

/// Access to stored values and their change history.
pub trait SnapshotStore: Send + Sync {
    /// Current values of `column_ids` for one identifier, or `None` if the
    /// identifier is unknown.
    fn get_attributes(&self, identifier: &str, column_ids: &[ColumnId]) -> Option<Snapshot>;

    /// Writes of one column for one identifier within `window`, oldest first.
    fn get_history(&self, identifier: &str, column_id: &str, window: &TimeWindow) -> Vec<HistoryEntry>;

    /// Every identifier enrolled in a table.
    fn identifiers_in(&self, table_id: &str) -> Vec<Identifier>;

    /// Stores a computed value. Serializing concurrent writers is the store's job.
    fn put_attribute(&self, identifier: &str, column_id: &str, value: DataValue, author: &str) -> EngineResult<()>;
}

/// Decides whether an actor may write a column.
pub trait AuthorizationCheck {
    fn is_authorized(&self, actor: &str, column_id: &str) -> bool;
}

/// External mutual exclusion for long-running recalculation.
pub trait JobClaim: Send + Sync {
    /// Returns false when another worker holds the claim.
    fn try_claim(&self, scope_key: &str) -> bool;
    fn release(&self, scope_key: &str);
}

/// Releases a claim when dropped.
pub struct ClaimGuard<'a> {
    claims: &'a dyn JobClaim,
    scope_key: String,
}

impl<'a> ClaimGuard<'a> {
    /// Claims `scope_key`, or returns `None` if it is already held.
    pub fn acquire(claims: &'a dyn JobClaim, scope_key: impl Into<String>) -> Option<Self> {
        let scope_key = scope_key.into();
        if claims.try_claim(&scope_key) {
            Some(ClaimGuard { claims, scope_key })
        } else {
            None
        }
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.claims.release(&self.scope_key);
    }
}

/// Authorization backed by each column's permission list.
pub struct PermissionsCheck<'a> {
    schema: &'a dyn SchemaAccessor,
}

impl<'a> PermissionsCheck<'a> {
    pub fn new(schema: &'a dyn SchemaAccessor) -> Self {
        PermissionsCheck { schema }
    }
}

impl AuthorizationCheck for PermissionsCheck<'_> {
    fn is_authorized(&self, actor: &str, column_id: &str) -> bool {
        self.schema
            .get_column(column_id)
            .is_some_and(|column| !column.is_deleted() && column.permissions.may_write(actor))
    }
}
