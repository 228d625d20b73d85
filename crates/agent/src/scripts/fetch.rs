use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::metadata::MetadataClient;

use super::uri::ResolvedReference;

/// Downloads script bodies from HTTP(S) URLs and object storage.
#[derive(Clone)]
pub struct ScriptFetcher {
    http: reqwest::Client,
    storage_endpoint: String,
    timeout: Duration,
    // Source of a bearer token for private objects; anonymous reads without it.
    metadata: Option<MetadataClient>,
}

impl ScriptFetcher {
    pub fn new(
        storage_endpoint: &str,
        timeout: Duration,
        metadata: Option<MetadataClient>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| AgentError::Transport {
                url: storage_endpoint.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            storage_endpoint: storage_endpoint.trim_end_matches('/').to_string(),
            timeout,
            metadata,
        })
    }

    async fn get(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>> {
        let mut req = self.http.get(url).timeout(self.timeout);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await.map_err(|source| AgentError::Transport {
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
        let bytes = res.bytes().await.map_err(|source| AgentError::Transport {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    /// Read an object, first through the JSON API (authenticated when a token
    /// is available), then through the public download URL.
    async fn fetch_storage(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        let token = match &self.metadata {
            Some(md) => match md.access_token().await {
                Ok(t) => Some(t),
                Err(e) => {
                    debug!(error = %e, "no service account token, reading object anonymously");
                    None
                }
            },
            None => None,
        };
        let api_url = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.storage_endpoint,
            bucket,
            object.replace('/', "%2F")
        );
        match self.get(&api_url, token.as_deref()).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                info!(bucket = %bucket, object = %object, error = %e, "storage API read failed, trying public URL");
                let public_url = format!("{}/{}/{}", self.storage_endpoint, bucket, object);
                self.get(&public_url, None).await
            }
        }
    }

    pub async fn fetch(&self, reference: &ResolvedReference) -> Result<Vec<u8>> {
        match reference {
            ResolvedReference::Local(path) => tokio::fs::read(path)
                .await
                .map_err(|e| AgentError::io(format!("read {}", path.display()), e)),
            ResolvedReference::Http(url) => self.get(url.as_str(), None).await,
            ResolvedReference::Storage { bucket, object } => self.fetch_storage(bucket, object).await,
        }
    }

    /// Fetch `reference` and write it to `dir/file_name`.
    pub async fn download_to(
        &self,
        reference: &ResolvedReference,
        dir: &Path,
        file_name: &str,
    ) -> Result<PathBuf> {
        let bytes = self.fetch(reference).await?;
        let dest = dir.join(file_name);
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| AgentError::io(format!("write {}", dest.display()), e))?;
        debug!(path = %dest.display(), bytes = bytes.len(), "script downloaded");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::metadata::test_config;

    #[tokio::test]
    async fn storage_read_uses_api_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/service-accounts/default/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"access_token":"tok"}"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/bucket/o/some.*object$"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("echo private"))
            .mount(&server)
            .await;

        let md = MetadataClient::new(test_config(&server.uri())).unwrap();
        let fetcher = ScriptFetcher::new(&server.uri(), Duration::from_secs(5), Some(md)).unwrap();
        let reference = ResolvedReference::Storage {
            bucket: "bucket".into(),
            object: "some/object".into(),
        };
        assert_eq!(fetcher.fetch(&reference).await.unwrap(), b"echo private");
    }

    #[tokio::test]
    async fn storage_read_falls_back_to_public_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/some/object"))
            .respond_with(ResponseTemplate::new(200).set_body_string("echo public"))
            .mount(&server)
            .await;

        let fetcher = ScriptFetcher::new(&server.uri(), Duration::from_secs(5), None).unwrap();
        let reference = ResolvedReference::Storage {
            bucket: "bucket".into(),
            object: "some/object".into(),
        };
        assert_eq!(fetcher.fetch(&reference).await.unwrap(), b"echo public");
    }

    #[tokio::test]
    async fn http_not_found_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let fetcher = ScriptFetcher::new(&server.uri(), Duration::from_secs(5), None).unwrap();
        let url = reqwest::Url::parse(&format!("{}/dne", server.uri())).unwrap();
        let err = fetcher.fetch(&ResolvedReference::Http(url)).await.unwrap_err();
        assert!(matches!(err, AgentError::Status { status: 404, .. }));
    }
}
