//! Client for the instance metadata server.
//!
//! Two kinds of reads are supported: one-shot attribute reads at instance or
//! project scope, and a long poll over the whole tree that blocks server-side
//! until the tree's ETag changes.

use reqwest::header::ETAG;
use serde::Deserialize;
use tracing::debug;

use common::{AttributeMap, MetadataDescriptor, METADATA_FLAVOR, METADATA_FLAVOR_VALUE};

use crate::config::MetadataConfig;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Instance,
    Project,
}

impl Scope {
    fn attributes_path(&self) -> &'static str {
        match self {
            Scope::Instance => "instance/attributes",
            Scope::Project => "project/attributes",
        }
    }
}

/// Result of one watch request.
#[derive(Debug, Clone)]
pub struct Watched {
    pub descriptor: MetadataDescriptor,
    pub etag: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    config: MetadataConfig,
}

impl MetadataClient {
    pub fn new(config: MetadataConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| AgentError::Transport {
                url: config.base_url.clone(),
                source,
            })?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str, query: &str) -> String {
        format!("{}/{}{}", self.config.base_url.trim_end_matches('/'), path, query)
    }

    async fn get(&self, url: &str, timeout: std::time::Duration) -> Result<reqwest::Response> {
        let res = self
            .http
            .get(url)
            .header(METADATA_FLAVOR, METADATA_FLAVOR_VALUE)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| AgentError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = res.status();
        if !status.is_success() {
            return Err(AgentError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(res)
    }

    async fn body(url: &str, res: reqwest::Response) -> Result<Vec<u8>> {
        res.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|source| AgentError::Transport {
                url: url.to_string(),
                source,
            })
    }

    /// Read the flat attribute map published at `scope`.
    pub async fn get_attributes(&self, scope: Scope) -> Result<AttributeMap> {
        let url = self.url(scope.attributes_path(), &self.config.attributes_query);
        let res = self.get(&url, self.config.request_timeout()).await?;
        let bytes = Self::body(&url, res).await?;
        serde_json::from_slice(&bytes).map_err(|source| AgentError::Parse {
            what: format!("{} attributes", scope.attributes_path()),
            source,
        })
    }

    fn watch_query(&self, etag: Option<&str>) -> String {
        let mut query = String::from("?recursive=true&alt=json");
        if self.config.watch_timeout_secs > 0 {
            query.push_str(&format!(
                "&wait_for_change=true&timeout_sec={}",
                self.config.watch_timeout_secs
            ));
            if let Some(tag) = etag {
                query.push_str("&last_etag=");
                query.push_str(tag);
            }
        }
        query
    }

    /// Fetch the whole tree, hanging until it differs from `etag` when the
    /// configured watch timeout is non-zero.
    pub async fn watch(&self, etag: Option<&str>) -> Result<Watched> {
        let url = self.url("", &self.watch_query(etag));
        debug!(url = %url, "polling metadata");
        let res = self.get(&url, self.config.watch_timeout()).await?;
        let etag = res
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = Self::body(&url, res).await?;
        let descriptor = serde_json::from_slice(&bytes).map_err(|source| AgentError::Parse {
            what: "metadata tree".to_string(),
            source,
        })?;
        Ok(Watched { descriptor, etag })
    }

    /// OAuth token of the instance's default service account.
    pub async fn access_token(&self) -> Result<String> {
        let url = self.url("instance/service-accounts/default/token", "");
        let res = self.get(&url, self.config.request_timeout()).await?;
        let bytes = Self::body(&url, res).await?;
        let token: TokenResponse =
            serde_json::from_slice(&bytes).map_err(|source| AgentError::Parse {
                what: "service account token".to_string(),
                source,
            })?;
        Ok(token.access_token)
    }
}

/// Config pointing at a mock server, with no query suffix and no hang.
#[cfg(test)]
pub(crate) fn test_config(base_url: &str) -> MetadataConfig {
    MetadataConfig {
        base_url: base_url.to_string(),
        attributes_query: String::new(),
        watch_timeout_secs: 0,
        request_timeout_secs: 5,
        backoff_min_ms: 1,
        backoff_max_ms: 10,
    }
}
