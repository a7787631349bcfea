//! FILENAME: engine/src/config.rs
//! PURPOSE: Engine tunables.
//! CONTEXT: Loaded by the host alongside the schema. Every field has a
//! default so a partial or empty document deserializes cleanly.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Minimum similarity for a fuzzy sub-field label match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Age in seconds after which a job claim is considered abandoned.
pub const DEFAULT_CLAIM_STALE_SECS: i64 = 7200;

/// What a dangling reference is replaced with during substitution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "text")]
pub enum DanglingPolicy {
    /// Substitute an empty string.
    #[default]
    Empty,
    /// Substitute a visible marker.
    Marker(String),
}

impl DanglingPolicy {
    pub fn placeholder(&self) -> &str {
        match self {
            DanglingPolicy::Empty => "",
            DanglingPolicy::Marker(text) => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub similarity_threshold: f64,
    pub claim_stale_secs: i64,
    pub dangling: DanglingPolicy,
}

impl EngineConfig {
    /// Age after which a job claim may be taken over.
    pub fn claim_stale_after(&self) -> Duration {
        Duration::seconds(self.claim_stale_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            claim_stale_secs: DEFAULT_CLAIM_STALE_SECS,
            dangling: DanglingPolicy::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"dangling": {"mode": "marker", "text": "[missing]"}}"#).unwrap();
        assert_eq!(config.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(config.claim_stale_secs, 7200);
        assert_eq!(config.dangling.placeholder(), "[missing]");
    }

    #[test]
    fn stale_window_follows_seconds() {
        let config = EngineConfig {
            claim_stale_secs: 90,
            ..EngineConfig::default()
        };
        assert_eq!(config.claim_stale_after(), Duration::seconds(90));
    }

    #[test]
    fn empty_document_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
