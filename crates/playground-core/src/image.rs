//! Image descriptors and the two names derived from them.
//!
//! The upstream name (`<repository>:<tag>`) is what the daemon pulls.
//! The playground name (`chp-<repository>:<digest-hex>`) is a locally
//! added alias pinning the exact digest; it is the stable key used by the
//! prewarm pool and the `chp-` prefix is how GC recognizes owned images.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The prefix of locally aliased, playground-owned images.
pub const PLAYGROUND_IMAGE_PREFIX: &str = "chp-";

/// A single upstream image variant: one `(repository, tag)` pair on one
/// platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub repository: String,
    pub tag: String,

    pub os: String,
    pub architecture: String,
    pub digest: String,

    pub pushed_at: DateTime<Utc>,
}

/// The name used to pull the image from its upstream repository.
pub fn upstream_image_name(repository: &str, tag: &str) -> String {
    format!("{repository}:{tag}")
}

/// The digest-pinned local alias of an image.
///
/// The `sha256:` prefix of the digest is stripped so the tag part stays a
/// valid image tag.
pub fn playground_image_name(repository: &str, digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    format!("{PLAYGROUND_IMAGE_PREFIX}{repository}:{hex}")
}

/// Whether an image name was created by the playground.
pub fn is_playground_image_name(name: &str) -> bool {
    name.starts_with(PLAYGROUND_IMAGE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_name() {
        assert_eq!(
            upstream_image_name("clickhouse/clickhouse-server", "21.8"),
            "clickhouse/clickhouse-server:21.8"
        );
    }

    #[test]
    fn playground_name_strips_digest_prefix() {
        assert_eq!(
            playground_image_name("clickhouse/clickhouse-server", "sha256:edfee1"),
            "chp-clickhouse/clickhouse-server:edfee1"
        );
    }

    #[test]
    fn playground_name_without_digest_prefix() {
        assert_eq!(playground_image_name("repo", "abc123"), "chp-repo:abc123");
    }

    #[test]
    fn playground_prefix_detection() {
        assert!(is_playground_image_name("chp-repo:abc"));
        assert!(!is_playground_image_name("repo:abc"));
        assert!(!is_playground_image_name("clickhouse/chp-server:1"));
    }
}
