//! Per-request pipeline state.

use playground_core::run::Run;
use playground_core::settings::RunSettings;

/// State of one in-flight query request.
///
/// Owned exclusively by the request task until the request terminates.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    pub run_id: String,

    pub database: String,
    pub version: String,
    pub query: String,
    pub settings: Option<RunSettings>,

    /// `<repository>:<version>` — what the daemon pulls.
    pub image_tag: String,

    /// Digest-pinned local alias; the key of the prewarm pool.
    pub image_fqn: String,

    pub container_id: String,
}

impl RequestState {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            database: run.database.clone(),
            version: run.version.clone(),
            query: run.input.clone(),
            settings: run.settings.clone(),
            ..Default::default()
        }
    }
}
