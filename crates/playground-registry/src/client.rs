//! Registry HTTP client: bearer auth plus paginated tag listing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_REGISTRY_URL: &str = "https://hub.docker.com/v2";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors talking to the upstream registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to acquire an access token: {0}")]
    Auth(String),

    #[error("unexpected registry response: {0}")]
    Decode(String),
}

/// Credentials for the registry's token endpoint.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub identifier: String,
    pub secret: String,
}

/// One page of the tag listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TagsPage {
    #[serde(default)]
    pub count: u64,
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<TagEntry>,
}

/// One upstream tag with its per-platform images.
#[derive(Debug, Clone, Deserialize)]
pub struct TagEntry {
    pub name: String,
    #[serde(default)]
    pub images: Vec<PlatformImage>,
    #[serde(default)]
    pub tag_last_pushed: Option<DateTime<Utc>>,
}

/// One platform variant of a tag.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformImage {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub last_pushed: Option<DateTime<Utc>>,
}

/// Read access to an upstream tag-listing service.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// All tags of the given repository.
    async fn get_tags(&self, repository: &str) -> RegistryResult<Vec<TagEntry>>;
}

/// Production client for the registry's REST API.
pub struct RegistryClient {
    base_url: String,
    auth: Option<RegistryAuth>,
    page_size: u32,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl RegistryClient {
    pub fn new(base_url: &str, auth: Option<RegistryAuth>, page_size: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            page_size,
            http: reqwest::Client::new(),
        }
    }

    /// Obtain a bearer token when credentials are configured.
    async fn access_token(&self) -> RegistryResult<Option<String>> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };

        let url = format!("{}/auth/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "identifier": auth.identifier,
                "secret": auth.secret,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RegistryError::Auth(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Auth(e.to_string()))?;

        Ok(Some(token.access_token))
    }

    async fn get_page(&self, url: &str, token: Option<&str>) -> RegistryResult<TagsPage> {
        let mut req = self.http.get(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Decode(format!(
                "{url} answered {}",
                response.status()
            )));
        }

        let page: TagsPage = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        for tag in &page.results {
            if tag.images.is_empty() {
                warn!(url, tag = tag.name, "tag arrived without images");
            }
        }

        Ok(page)
    }
}

#[async_trait]
impl UpstreamClient for RegistryClient {
    async fn get_tags(&self, repository: &str) -> RegistryResult<Vec<TagEntry>> {
        let token = self.access_token().await?;

        let mut next = format!(
            "{}/repositories/{}/tags?page_size={}",
            self.base_url, repository, self.page_size
        );

        let mut tags = Vec::new();
        let mut pages = 0u32;
        loop {
            pages += 1;
            let page = self.get_page(&next, token.as_deref()).await?;
            tags.extend(page.results);

            match page.next {
                Some(url) => next = url,
                None => break,
            }
        }

        debug!(repository, pages, count = tags.len(), "fetched upstream tags");

        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_page_decodes_registry_payload() {
        let body = r#"{
            "count": 2,
            "next": "https://registry.test/v2/repositories/a/ch/tags?page=2",
            "previous": null,
            "results": [
                {
                    "name": "21.8",
                    "tag_last_pushed": "2021-08-12T10:00:00Z",
                    "images": [
                        {
                            "architecture": "amd64",
                            "os": "linux",
                            "digest": "sha256:edfee1",
                            "last_pushed": "2021-08-12T09:59:00Z",
                            "size": 120
                        }
                    ]
                },
                {"name": "empty", "images": []}
            ]
        }"#;

        let page: TagsPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.count, 2);
        assert!(page.next.is_some());
        assert_eq!(page.results[0].name, "21.8");
        assert_eq!(
            page.results[0].images[0].digest.as_deref(),
            Some("sha256:edfee1")
        );
        assert!(page.results[1].images.is_empty());
    }

    #[test]
    fn platform_image_tolerates_missing_fields() {
        let img: PlatformImage = serde_json::from_str(r#"{"os": "linux"}"#).unwrap();
        assert_eq!(img.os, "linux");
        assert!(img.digest.is_none());
        assert!(img.last_pushed.is_none());
    }
}
