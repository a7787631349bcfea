//! FILENAME: persistence/src/document.rs
//! PURPOSE: JSON document holding a whole schema plus its data snapshot.
//! CONTEXT: The document carries its own `schema_version`. Column records
//! without a tag inherit it, so an untouched legacy export loads through the
//! v1 migration and is written back in the current layout.

use crate::error::PersistenceError;
use crate::records::{load_column, store_column, CURRENT_VERSION};
use engine::{
    apply_to_schema, plan_with_config, AggregationEngine, ColumnId, EngineConfig, Identifier, MemoryJobClaims,
    MemorySchema, MemorySnapshots, MigrationPlan, Record, SchemaAccessor, SubField,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A loaded schema, its records and the engine tunables that go with them.
#[derive(Debug, Default)]
pub struct Document {
    pub config: EngineConfig,
    pub schema: MemorySchema,
    pub snapshots: MemorySnapshots,
}

impl Document {
    pub fn new(config: EngineConfig) -> Self {
        Document {
            config,
            ..Document::default()
        }
    }

    /// An aggregation engine over this document's schema and records.
    pub fn engine(&self) -> AggregationEngine<'_> {
        AggregationEngine::new(&self.schema, &self.snapshots).with_config(self.config.clone())
    }

    /// Job claims using this document's stale window.
    pub fn job_claims(&self) -> MemoryJobClaims {
        MemoryJobClaims::from_config(&self.config)
    }

    /// Replaces a multi-field column's sub-fields and remaps every aggregator
    /// reference to it. Stored answers are not reordered.
    ///
    /// Returns `None` for an unknown column. The plan's `unmatched` indices
    /// still need a human to confirm them.
    pub fn update_sub_fields(&self, column_id: &str, sub_fields: Vec<SubField>) -> Option<(MigrationPlan, Vec<ColumnId>)> {
        let column = self.schema.get_column(column_id)?;
        let plan = plan_with_config(column_id, &column.sub_fields, &sub_fields, &self.config);

        let mut updated = (*column).clone();
        updated.sub_fields = sub_fields;
        self.schema.insert(updated);

        let changed = apply_to_schema(&plan, &self.schema);
        Some((plan, changed))
    }
}

#[derive(Serialize, Deserialize)]
struct StoredDocument {
    #[serde(default = "legacy_version")]
    schema_version: u64,
    #[serde(default)]
    config: EngineConfig,
    #[serde(default)]
    columns: Vec<Value>,
    #[serde(default)]
    records: BTreeMap<Identifier, Record>,
}

fn legacy_version() -> u64 {
    1
}

pub fn from_json(text: &str) -> Result<Document, PersistenceError> {
    let stored: StoredDocument = serde_json::from_str(text)?;
    if stored.schema_version == 0 || stored.schema_version > CURRENT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(stored.schema_version));
    }

    let schema = MemorySchema::new();
    for value in stored.columns {
        schema.insert(load_column(value, stored.schema_version)?);
    }
    Ok(Document {
        config: stored.config,
        schema,
        snapshots: MemorySnapshots::from_records(stored.records.into_iter().collect()),
    })
}

/// Always writes the current layout, columns ordered by id.
pub fn to_json(document: &Document) -> Result<String, PersistenceError> {
    let columns = document.schema.columns();
    let stored = StoredDocument {
        schema_version: CURRENT_VERSION,
        config: document.config.clone(),
        columns: columns.iter().map(|c| store_column(c)).collect::<Result<_, _>>()?,
        records: document.snapshots.records().into_iter().collect(),
    };
    Ok(serde_json::to_string_pretty(&stored)?)
}

pub fn load_document(path: &Path) -> Result<Document, PersistenceError> {
    let text = fs::read_to_string(path)?;
    from_json(&text)
}

pub fn save_document(document: &Document, path: &Path) -> Result<(), PersistenceError> {
    fs::write(path, to_json(document)?)?;
    Ok(())
}
