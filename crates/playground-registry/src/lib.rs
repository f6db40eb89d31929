//! playground-registry — the upstream image registry client and the
//! background-refreshing tag cache.
//!
//! The cache is the coherent view of "which database versions exist":
//! it merges the tag lists of several upstream repositories (first
//! repository wins on tag collision), filters them down to the configured
//! platform, and refreshes itself asynchronously so readers never block
//! on the network.

pub mod cache;
pub mod client;

pub use cache::{TagCache, TagCacheConfig};
pub use client::{PlatformImage, RegistryAuth, RegistryClient, RegistryError, TagEntry, UpstreamClient};
