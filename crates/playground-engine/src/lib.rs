//! playground-engine — typed adapter over the container daemon API.
//!
//! Wraps bollard with the narrow set of operations the playground needs:
//! image pull/tag/inspect/remove, container
//! create/start/exec/pause/unpause/remove/list/prune. Every list and prune
//! operation attaches the ownership-label filter so only
//! playground-created objects are visible, and daemon "not found" answers
//! are mapped into `Ok(None)` so callers can probe image presence without
//! error noise.

pub mod error;
pub mod provider;

pub use error::{EngineError, EngineResult};
pub use provider::{
    BindMount, ContainerInfo, ContainerSpec, EngineProvider, ExecOutput, ImageDetails,
    ImageSummaryInfo, PruneOutcome,
};
