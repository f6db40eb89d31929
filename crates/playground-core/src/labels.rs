//! Container labels applied to every playground-created container.
//!
//! GC filters exclusively by the ownership label, so every code path that
//! creates a container MUST go through [`container_labels`].

use std::collections::HashMap;

/// Set to `"1"` on every container created by the playground.
pub const LABEL_OWNERSHIP: &str = "playground.ownership";

/// Label carrying the run id the container was created for.
pub const LABEL_RUN: &str = "playground.run";

/// Label carrying the requested database version.
pub const LABEL_VERSION: &str = "playground.version";

/// Label carrying the name of the runner that created the container.
pub const LABEL_RUNNER: &str = "playground.runner";

/// The `key=value` filter expression selecting owned containers.
pub const OWNED_FILTER: &str = "playground.ownership=1";

/// Labels for a new container.
pub fn container_labels(
    runner_name: &str,
    run_id: &str,
    version: &str,
) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_OWNERSHIP.to_string(), "1".to_string()),
        (LABEL_RUN.to_string(), run_id.to_string()),
        (LABEL_VERSION.to_string(), version.to_string()),
        (LABEL_RUNNER.to_string(), runner_name.to_string()),
    ])
}
