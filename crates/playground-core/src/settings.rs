//! Per-run client settings.
//!
//! Settings are database-specific; only ClickHouse is supported today.

use serde::{Deserialize, Serialize};

use crate::version;

/// Database-specific settings attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunSettings {
    ClickHouse(ClickHouseSettings),
}

impl RunSettings {
    /// Extra client arguments derived from the settings.
    pub fn client_args(&self, version: &str, default_output_format: &str) -> Vec<String> {
        match self {
            RunSettings::ClickHouse(s) => s.format_args(version, default_output_format),
        }
    }
}

/// Settings for the ClickHouse client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickHouseSettings {
    #[serde(rename = "OutputFormat", default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

impl ClickHouseSettings {
    /// Output-formatting arguments for the client invocation.
    ///
    /// Versions below major 21 do not understand the `--format` flag and
    /// get no extra arguments.
    pub fn format_args(&self, version: &str, default_output_format: &str) -> Vec<String> {
        if !version::is_at_least_major(version, "21") {
            return Vec::new();
        }

        let format = self
            .output_format
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(default_output_format);

        vec![
            "--output_format_pretty_color".to_string(),
            "0".to_string(),
            "--output_format_pretty_grid_charset".to_string(),
            "ASCII".to_string(),
            "--format".to_string(),
            format.to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_versions_get_no_format_args() {
        let settings = ClickHouseSettings {
            output_format: Some("JSON".to_string()),
        };
        assert!(settings.format_args("20.8", "TabSeparated").is_empty());
    }

    #[test]
    fn explicit_format_overrides_default() {
        let settings = ClickHouseSettings {
            output_format: Some("JSON".to_string()),
        };
        let args = settings.format_args("21.8", "TabSeparated");
        assert_eq!(args.last().map(String::as_str), Some("JSON"));
    }

    #[test]
    fn default_format_used_when_unset() {
        let settings = ClickHouseSettings::default();
        let args = settings.format_args("22.1", "TabSeparated");
        assert_eq!(
            args,
            vec![
                "--output_format_pretty_color",
                "0",
                "--output_format_pretty_grid_charset",
                "ASCII",
                "--format",
                "TabSeparated",
            ]
        );
    }

    #[test]
    fn rolling_tags_support_formatting() {
        let settings = ClickHouseSettings::default();
        assert!(!settings.format_args("head", "TabSeparated").is_empty());
        assert!(!settings.format_args("latest-alpine", "TabSeparated").is_empty());
    }
}
