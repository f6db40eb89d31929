//! The run model: one user-submitted query execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::settings::RunSettings;

/// The default database when a request does not name one.
pub const DEFAULT_DATABASE: &str = "clickhouse";

/// A persisted record of a single query execution.
///
/// Field names follow the document keys of the run store; a record is
/// written once after the query finishes and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "Database")]
    pub database: String,

    #[serde(rename = "Version")]
    pub version: String,

    #[serde(rename = "Input")]
    pub input: String,

    #[serde(rename = "Output", default)]
    pub output: String,

    #[serde(rename = "Settings", default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<RunSettings>,

    /// Total execution time in milliseconds.
    #[serde(rename = "ExecutionTime", default)]
    pub execution_time_ms: u64,
}

impl Run {
    /// A new run with a fresh id; output and timing are filled in after
    /// the query finishes.
    pub fn new(input: &str, database: &str, version: &str, settings: Option<RunSettings>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            database: database.to_string(),
            version: version.to_string(),
            input: input.to_string(),
            output: String::new(),
            settings,
            execution_time_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ClickHouseSettings;

    #[test]
    fn new_runs_get_unique_ids() {
        let a = Run::new("SELECT 1", "clickhouse", "21.8", None);
        let b = Run::new("SELECT 1", "clickhouse", "21.8", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serializes_with_store_document_keys() {
        let mut run = Run::new("SELECT 1", "clickhouse", "21.8", None);
        run.output = "1\n".to_string();
        run.execution_time_ms = 120;

        let doc = serde_json::to_value(&run).unwrap();
        for key in ["Id", "CreatedAt", "Database", "Version", "Input", "Output", "ExecutionTime"] {
            assert!(doc.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(doc["Output"], "1\n");
        assert_eq!(doc["ExecutionTime"], 120);
    }

    #[test]
    fn settings_round_trip() {
        let run = Run::new(
            "SELECT 1",
            "clickhouse",
            "21.8",
            Some(RunSettings::ClickHouse(ClickHouseSettings {
                output_format: Some("JSON".to_string()),
            })),
        );

        let json = serde_json::to_string(&run).unwrap();
        let back: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(back.settings, run.settings);
    }
}
