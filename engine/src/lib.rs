//! FILENAME: engine/src/lib.rs
//! PURPOSE: Main library entry point for the column engine.
//! CONTEXT: Resolves column references against a schema and per-identifier
//! snapshots, computes aggregator columns through their dependency graph and
//! remaps stored references when multi-field columns are restructured.
//! Re-exports the public types for use by other crates.

#[macro_use]
pub mod logging;

pub mod aggregation;
pub mod column;
pub mod conditions;
pub mod config;
pub mod dependency_graph;
pub mod error;
pub mod formatter;
pub mod formula;
pub mod memory;
pub mod migration;
pub mod numeric;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod value;

// Re-export commonly used types at the crate root
pub use aggregation::{
    AggregationEngine, AggregationMethod, AggregationResult, AggregationSpec, BulkResult, BulkStatus,
    ComputeStatus, IdentifierOutcome, RecalcTrigger, SimpleStatistic,
};
pub use column::{ActiveWindow, Choice, ColumnId, ColumnKind, ColumnMetadata, SubField, SubFieldKind, TableId, WorkflowState};
pub use conditions::{Combiner, ConditionGroup, ConditionNode, Operator, Rule, RuleValue};
pub use config::{DanglingPolicy, EngineConfig};
pub use dependency_graph::{CycleError, DependencyGraph};
pub use error::{EngineError, EngineResult};
pub use formatter::MagicFormatter;
pub use memory::{MemoryJobClaims, MemorySchema, MemorySnapshots, Record};
pub use migration::{
    apply_migration, apply_to_schema, plan_migration, plan_with_config, MigrationPlan, RewritableAsset, TextAsset,
};
pub use resolver::{ResolvedValue, Resolver, SubstituteOptions, Substitution};
pub use snapshot::{HistoryEntry, HistoryPick, IdentityAttributes, Identifier, Snapshot, SystemField, TimeWindow};
pub use store::{AuthorizationCheck, ClaimGuard, JobClaim, PermissionsCheck, SchemaAccessor, SnapshotStore};
pub use value::DataValue;
