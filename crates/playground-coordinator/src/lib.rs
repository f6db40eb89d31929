//! playground-coordinator — dispatch over a fleet of heterogeneous
//! runners.
//!
//! The coordinator keeps the set of configured runners, probes their
//! liveness, and dispatches each incoming query through the weighted
//! random balancer. Saturated or dead runners leave the balancer's set
//! and come back when they drain or recover.

pub mod balancer;
pub mod coordinator;
pub mod stub;

pub use balancer::{Balancer, RunnerHandle};
pub use coordinator::{Coordinator, CoordinatorConfig, DEFAULT_WEIGHT};
pub use stub::StubRunner;
