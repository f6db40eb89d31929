//! playground-core — shared domain types for the query playground.
//!
//! Everything the subsystem crates agree on lives here: image descriptors
//! and the derived image names, container labels, the readiness probe,
//! version comparison, run settings, the `Run` model, and the
//! `QueryRunner` trait that the coordinator dispatches through.

pub mod image;
pub mod labels;
pub mod readiness;
pub mod run;
pub mod runner;
pub mod settings;
pub mod version;

pub use image::{playground_image_name, upstream_image_name, ImageDescriptor};
pub use labels::{container_labels, LABEL_OWNERSHIP, OWNED_FILTER};
pub use run::Run;
pub use runner::{ImageTagStorage, QueryRunner, RunnerError, RunnerStatus, RunnerType};
pub use settings::{ClickHouseSettings, RunSettings};
