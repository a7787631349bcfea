//! FILENAME: persistence/src/lib.rs
//! Column engine persistence module.
//!
//! Saves and loads a schema plus its data snapshot as one JSON document.
//! Stored column records are versioned; older layouts are migrated on load.

mod document;
mod error;
pub mod records;

pub use document::{from_json, load_document, save_document, to_json, Document};
pub use error::PersistenceError;
pub use records::{load_column, migrate_v1, store_column, ColumnRecordV2, ColumnV1, CURRENT_VERSION};

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{
        AggregationMethod, AggregationSpec, ColumnKind, ColumnMetadata, DataValue, DanglingPolicy, IdentityAttributes, SchemaAccessor,
        SimpleStatistic, SubField,
    };
    use parser::Reference;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample() -> Document {
        let document = Document::default();
        document.schema.insert(ColumnMetadata::new("A", "T1", "A", ColumnKind::SimpleEntry));
        document.schema.insert(ColumnMetadata::new("B", "T1", "B", ColumnKind::SimpleEntry));
        document.schema.insert(ColumnMetadata::multi_field(
            "Q",
            "T1",
            "Quiz",
            vec![SubField::new("Q1"), SubField::new("Q2")],
        ));
        document.schema.insert(ColumnMetadata::aggregator(
            "SUM",
            "T1",
            "Total",
            AggregationSpec::simple(SimpleStatistic::Sum, vec![Reference::new("A"), Reference::new("B")]),
        ));
        document.snapshots.enrol("s1", "T1", IdentityAttributes::default());
        document.snapshots.set_value("s1", "A", DataValue::Number(2.0), "s1");
        document.snapshots.set_value("s1", "B", DataValue::Number(3.0), "s1");
        document
    }

    // ========================================
    // FILE ROUND TRIP
    // ========================================

    #[test]
    fn saved_document_loads_back_with_schema_and_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.json");

        let mut document = sample();
        document.config.dangling = DanglingPolicy::Marker("?".to_string());
        save_document(&document, &path).unwrap();

        let loaded = load_document(&path).unwrap();
        assert_eq!(loaded.config, document.config);
        assert_eq!(loaded.schema.get_column("SUM"), document.schema.get_column("SUM"));
        assert_eq!(loaded.schema.get_column("Q").unwrap().sub_fields.len(), 2);
        assert_eq!(loaded.snapshots.value("s1", "B"), DataValue::Number(3.0));
        assert_eq!(loaded.schema.aggregated_by("A"), vec!["SUM".to_string()]);
    }

    #[test]
    fn loaded_document_computes_aggregators() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.json");
        save_document(&sample(), &path).unwrap();

        let loaded = load_document(&path).unwrap();
        let result = loaded.engine().recompute("SUM", &["s1".to_string()], false);
        assert_eq!(result.value_for("s1"), Some(&DataValue::Number(5.0)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = load_document(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, PersistenceError::Io(_)));
    }

    // ========================================
    // SUB-FIELD CHANGES
    // ========================================

    fn expression_of(document: &Document, column_id: &str) -> String {
        match document.schema.get_column(column_id).unwrap().aggregation.as_ref().unwrap().method.clone() {
            AggregationMethod::Formula { expression } => expression,
            other => panic!("not a formula: {:?}", other),
        }
    }

    fn quiz_document(threshold: f64) -> Document {
        let mut document = Document::default();
        document.config.similarity_threshold = threshold;
        document.schema.insert(ColumnMetadata::multi_field(
            "Q",
            "T1",
            "Quiz",
            vec![SubField::new("Question one"), SubField::new("Q2")],
        ));
        document
            .schema
            .insert(ColumnMetadata::aggregator("F", "T1", "F", AggregationSpec::formula("$Q.0$ - $Q.1$")));
        document
    }

    #[test]
    fn sub_field_update_uses_stored_similarity_threshold() {
        let document = quiz_document(0.7);
        let (plan, changed) = document
            .update_sub_fields("Q", vec![SubField::new("Q2"), SubField::new("Question 1")])
            .unwrap();

        assert!(plan.unmatched.is_empty());
        assert_eq!(changed, vec!["F".to_string()]);
        assert_eq!(expression_of(&document, "F"), "$Q.1$ - $Q.0$");
        assert_eq!(document.schema.get_column("Q").unwrap().sub_fields[1].label, "Question 1");
    }

    #[test]
    fn default_threshold_leaves_distant_label_unmatched() {
        let document = quiz_document(0.85);
        let (plan, _) = document
            .update_sub_fields("Q", vec![SubField::new("Q2"), SubField::new("Question 1")])
            .unwrap();

        assert_eq!(plan.unmatched, vec![1]);
        assert_eq!(expression_of(&document, "F"), "$Q.0$ - $Q.0$");
        assert!(document.update_sub_fields("NOPE", Vec::new()).is_none());
    }

    #[test]
    fn job_claims_follow_stored_stale_window() {
        let document = from_json(r#"{"schema_version": 2, "config": {"claim_stale_secs": 30}}"#).unwrap();
        let claims = document.job_claims();
        let start = chrono::Utc::now();

        assert!(claims.try_claim_at("scope", start));
        assert!(!claims.try_claim_at("scope", start + chrono::Duration::seconds(29)));
        assert!(claims.try_claim_at("scope", start + chrono::Duration::seconds(31)));
    }

    // ========================================
    // VERSIONS
    // ========================================

    #[test]
    fn legacy_document_is_migrated_and_saved_in_current_layout() {
        let legacy = json!({
            "columns": [
                {"uuid": "A", "table_uuid": "T1", "name": "A", "type": "mark"},
                {
                    "uuid": "AVG", "table_uuid": "T1", "name": "Average", "type": "aggregator",
                    "aggregation_options": {"method": "average", "attributes": ["A"], "rounding": "0"}
                }
            ]
        });
        let document = from_json(&legacy.to_string()).unwrap();
        assert!(document.schema.get_column("AVG").unwrap().is_aggregator());

        let text = to_json(&document).unwrap();
        let saved: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(saved["schema_version"], json!(CURRENT_VERSION));
        assert_eq!(saved["columns"][0]["id"], json!("A"));
        assert_eq!(saved["columns"][1]["schema_version"], json!(CURRENT_VERSION));
        assert_eq!(from_json(&text).unwrap().schema.get_column("AVG"), document.schema.get_column("AVG"));
    }

    #[test]
    fn future_document_version_is_rejected() {
        let err = from_json(r#"{"schema_version": 7, "columns": []}"#).unwrap_err();
        assert!(matches!(err, PersistenceError::UnsupportedVersion(7)));
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        assert!(matches!(from_json("{ not json").unwrap_err(), PersistenceError::Json(_)));
    }
}
