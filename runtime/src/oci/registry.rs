//! Registry v2 API client.
//!
//! Token authentication, manifest resolution (including multi-platform
//! indices), blob existence checks, streamed blob downloads and Docker Hub
//! search. Every call is made against an explicit [`RegistryEndpoint`] so
//! the pull orchestrator can walk the mirror list.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use andock_core::config::DaemonConfig;
use andock_core::digest::sha256_digest;
use andock_core::error::{AndockError, Result};
use andock_core::image::ImageConfigFile;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{header, Client, Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::manifest::{
    host_architecture, select_platform, ImageManifest, ManifestDocument, ACCEPT_MANIFEST,
    TARGET_OS,
};
use crate::mirror::RegistryEndpoint;

/// Token lifetime when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: u64 = 60;

const USER_AGENT: &str = concat!("andock/", env!("CARGO_PKG_VERSION"));

/// Timeouts and retry policy for registry calls.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub request_timeout: Duration,
    pub blob_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub search_url: String,
}

impl RegistryOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            blob_timeout: Duration::from_secs(config.blob_timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            search_url: config.search_url.clone(),
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

/// Token response from a registry auth service.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// `WWW-Authenticate: Bearer realm=..,service=..` challenge.
#[derive(Debug, Default, PartialEq, Eq)]
struct AuthChallenge {
    realm: String,
    service: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    /// `None` for registries that allow anonymous access.
    token: Option<String>,
    expires_at: Instant,
}

/// A manifest resolved to the host platform, with its config.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// Digest of the platform manifest.
    pub digest: String,
    pub manifest: ImageManifest,
    pub config: ImageConfigFile,
}

/// A blob download in progress.
pub struct BlobStream {
    /// From Content-Length, if sent.
    pub length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// One page of repository search results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub star_count: u64,
    #[serde(default)]
    pub pull_count: u64,
    #[serde(default)]
    pub is_official: bool,
    #[serde(default)]
    pub is_automated: bool,
}

/// Registry client shared by all pulls.
pub struct RegistryClient {
    client: Client,
    options: RegistryOptions,
    /// Keyed by (endpoint url, repository).
    tokens: Mutex<HashMap<(String, String), CachedToken>>,
}

impl RegistryClient {
    pub fn new(options: RegistryOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.request_timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| AndockError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            options,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Obtain a pull token for `repository` on `endpoint`.
    ///
    /// Returns `None` when the registry allows anonymous access.
    pub async fn authenticate(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
    ) -> Result<Option<String>> {
        if let Some(ref token) = endpoint.bearer_token {
            return Ok(Some(token.clone()));
        }

        let key = (endpoint.url.clone(), repository.to_string());
        if let Some(cached) = self.tokens.lock().get(&key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let ping_url = format!("{}/v2/", endpoint.url);
        let response = self
            .send_with_retry(&endpoint.url, || {
                self.client
                    .get(&ping_url)
                    .timeout(self.options.request_timeout)
            })
            .await?;

        let (token, ttl) = match response.status() {
            s if s.is_success() => (None, DEFAULT_TOKEN_TTL_SECS),
            StatusCode::UNAUTHORIZED => {
                let challenge = parse_challenge(&endpoint.url, response.headers())?;
                let (token, ttl) = self
                    .fetch_token(&endpoint.url, &challenge, repository)
                    .await?;
                (Some(token), ttl)
            }
            StatusCode::FORBIDDEN => {
                return Err(AndockError::Auth {
                    endpoint: endpoint.url.clone(),
                    message: "registry refused access".to_string(),
                })
            }
            s => {
                return Err(AndockError::Network {
                    endpoint: endpoint.url.clone(),
                    message: format!("unexpected status {} from /v2/", s),
                })
            }
        };

        self.tokens.lock().insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
        tracing::debug!(endpoint = %endpoint.url, repository, anonymous = token.is_none(), "Registry authenticated");
        Ok(token)
    }

    async fn fetch_token(
        &self,
        endpoint: &str,
        challenge: &AuthChallenge,
        repository: &str,
    ) -> Result<(String, u64)> {
        let scope = format!("repository:{}:pull", repository);
        let response = self
            .send_with_retry(endpoint, || {
                let mut request = self
                    .client
                    .get(&challenge.realm)
                    .timeout(self.options.request_timeout);
                if challenge.service.is_empty() {
                    request = request.query(&[("scope", scope.as_str())]);
                } else {
                    request = request.query(&[
                        ("service", challenge.service.as_str()),
                        ("scope", scope.as_str()),
                    ]);
                }
                request
            })
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AndockError::Auth {
                endpoint: endpoint.to_string(),
                message: format!("token request rejected with {}", status),
            });
        }
        if !status.is_success() {
            return Err(AndockError::Network {
                endpoint: endpoint.to_string(),
                message: format!("token request failed with {}", status),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| AndockError::Auth {
            endpoint: endpoint.to_string(),
            message: format!("invalid token response: {}", e),
        })?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AndockError::Auth {
                endpoint: endpoint.to_string(),
                message: "token response carried no token".to_string(),
            })?;

        Ok((token, body.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS)))
    }

    /// Resolve `reference` (tag or digest) to a single-platform manifest
    /// and fetch its config.
    pub async fn resolve_manifest(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        reference: &str,
    ) -> Result<ResolvedManifest> {
        let token = self.authenticate(endpoint, repository).await?;

        let (digest, document) = self
            .fetch_manifest(endpoint, repository, reference, token.as_deref())
            .await?;

        let (digest, manifest) = match document {
            ManifestDocument::Manifest(m) => (digest, m),
            ManifestDocument::Index(index) => {
                let arch = host_architecture();
                let entry = select_platform(&index, arch, TARGET_OS).ok_or_else(|| {
                    AndockError::NoMatchingPlatform {
                        reference: format!("{}:{}", repository, reference),
                        architecture: arch.to_string(),
                        os: TARGET_OS.to_string(),
                    }
                })?;
                tracing::debug!(repository, index = %digest, platform = %entry.digest, "Selected platform manifest");

                let (digest, document) = self
                    .fetch_manifest(endpoint, repository, &entry.digest, token.as_deref())
                    .await?;
                match document {
                    ManifestDocument::Manifest(m) => (digest, m),
                    ManifestDocument::Index(_) => {
                        return Err(AndockError::Serialization(format!(
                            "Nested manifest index for {}@{}",
                            repository, entry.digest
                        )))
                    }
                }
            }
        };

        let config_bytes = self
            .fetch_small_blob(endpoint, repository, &manifest.config.digest, token.as_deref())
            .await?;
        let config: ImageConfigFile = serde_json::from_slice(&config_bytes)?;

        Ok(ResolvedManifest {
            digest,
            manifest,
            config,
        })
    }

    async fn fetch_manifest(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        reference: &str,
        token: Option<&str>,
    ) -> Result<(String, ManifestDocument)> {
        let url = format!("{}/v2/{}/manifests/{}", endpoint.url, repository, reference);
        tracing::debug!(url = %url, "Fetching manifest");

        let response = self
            .send_with_retry(&endpoint.url, || {
                self.request(Method::GET, &url, token, self.options.request_timeout)
                    .header(header::ACCEPT, ACCEPT_MANIFEST)
            })
            .await?;
        let response = check_status(
            &endpoint.url,
            response,
            "manifest",
            &format!("{}:{}", repository, reference),
        )?;

        let content_type = header_str(response.headers(), header::CONTENT_TYPE.as_str());
        let header_digest = header_str(response.headers(), "docker-content-digest");
        let body = response.bytes().await.map_err(|e| network_error(&endpoint.url, e))?;

        let computed = sha256_digest(&body);
        if reference.starts_with("sha256:") && computed != reference {
            return Err(AndockError::DigestMismatch {
                expected: reference.to_string(),
                actual: computed,
            });
        }
        if !header_digest.is_empty() && header_digest != computed {
            return Err(AndockError::DigestMismatch {
                expected: header_digest,
                actual: computed,
            });
        }

        Ok((computed, ManifestDocument::parse(&content_type, &body)?))
    }

    /// Download a small blob fully into memory and verify it.
    async fn fetch_small_blob(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        digest: &str,
        token: Option<&str>,
    ) -> Result<Bytes> {
        let url = format!("{}/v2/{}/blobs/{}", endpoint.url, repository, digest);
        let response = self
            .send_with_retry(&endpoint.url, || {
                self.request(Method::GET, &url, token, self.options.request_timeout)
            })
            .await?;
        let response = check_status(&endpoint.url, response, "blob", digest)?;
        let body = response.bytes().await.map_err(|e| network_error(&endpoint.url, e))?;

        let actual = sha256_digest(&body);
        if actual != digest {
            return Err(AndockError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(body)
    }

    /// HEAD the blob.
    pub async fn blob_exists(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        digest: &str,
    ) -> Result<bool> {
        let token = self.authenticate(endpoint, repository).await?;
        let url = format!("{}/v2/{}/blobs/{}", endpoint.url, repository, digest);
        let response = self
            .send_with_retry(&endpoint.url, || {
                self.request(Method::HEAD, &url, token.as_deref(), self.options.request_timeout)
            })
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check_status(&endpoint.url, response, "blob", digest).map(|_| true),
        }
    }

    /// Start a blob download. The caller hashes the stream and verifies
    /// it against `digest`.
    pub async fn fetch_blob(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        digest: &str,
    ) -> Result<BlobStream> {
        let token = self.authenticate(endpoint, repository).await?;
        let url = format!("{}/v2/{}/blobs/{}", endpoint.url, repository, digest);
        tracing::debug!(url = %url, "Fetching blob");

        let response = self
            .send_with_retry(&endpoint.url, || {
                self.request(Method::GET, &url, token.as_deref(), self.options.blob_timeout)
            })
            .await?;
        let response = check_status(&endpoint.url, response, "blob", digest)?;

        let length = response.content_length();
        let endpoint_url = endpoint.url.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| network_error(&endpoint_url, e)))
            .boxed();

        Ok(BlobStream { length, stream })
    }

    /// Ping `{url}/v2/` once and return the round trip time. 200 and 401
    /// both count as a live registry.
    pub async fn ping(&self, endpoint: &RegistryEndpoint) -> Result<Duration> {
        let url = format!("{}/v2/", endpoint.url);
        let started = Instant::now();
        let response = self
            .request(Method::GET, &url, None, self.options.request_timeout)
            .send()
            .await
            .map_err(|e| network_error(&endpoint.url, e))?;

        match response.status() {
            StatusCode::OK | StatusCode::UNAUTHORIZED => Ok(started.elapsed()),
            status => Err(AndockError::Network {
                endpoint: endpoint.url.clone(),
                message: format!("health check returned {}", status),
            }),
        }
    }

    /// Query the repository search API.
    pub async fn search(&self, query: &str, page: u32, page_size: u32) -> Result<SearchPage> {
        let search_url = self.options.search_url.clone();
        let page = page.max(1).to_string();
        let page_size = page_size.clamp(1, 100).to_string();

        let response = self
            .send_with_retry(&search_url, || {
                self.client
                    .get(&search_url)
                    .timeout(self.options.request_timeout)
                    .query(&[
                        ("query", query),
                        ("page", page.as_str()),
                        ("page_size", page_size.as_str()),
                    ])
            })
            .await?;
        let response = check_status(&search_url, response, "search", query)?;

        response.json().await.map_err(|e| {
            AndockError::Serialization(format!("Invalid search response: {}", e))
        })
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Send a request, retrying transport errors and 5xx responses with
    /// exponential backoff.
    async fn send_with_retry<F>(&self, endpoint: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let error = match build().send().await {
                Ok(response) if response.status().is_server_error() => AndockError::Network {
                    endpoint: endpoint.to_string(),
                    message: format!("server error {}", response.status()),
                },
                Ok(response) => return Ok(response),
                Err(e) => network_error(endpoint, e),
            };

            if attempt >= self.options.max_retries {
                return Err(error);
            }
            let backoff = self.options.retry_backoff * 2u32.saturating_pow(attempt);
            tracing::debug!(endpoint, attempt, error = %error, "Retrying registry request");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn network_error(endpoint: &str, e: reqwest::Error) -> AndockError {
    let message = if e.is_timeout() {
        format!("timed out: {}", e)
    } else {
        e.to_string()
    };
    AndockError::Network {
        endpoint: endpoint.to_string(),
        message,
    }
}

/// Map a non-success response to the error taxonomy.
fn check_status(
    endpoint: &str,
    response: reqwest::Response,
    kind: &'static str,
    id: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    match status {
        s if s.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AndockError::Auth {
            endpoint: endpoint.to_string(),
            message: format!("{} {} rejected with {}", kind, id, status),
        }),
        StatusCode::NOT_FOUND => Err(AndockError::not_found(kind, id)),
        s => Err(AndockError::Network {
            endpoint: endpoint.to_string(),
            message: format!("{} {} failed with {}", kind, id, s),
        }),
    }
}

fn header_str(headers: &header::HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Parse a `Bearer realm="..",service=".."` challenge.
fn parse_challenge(endpoint: &str, headers: &header::HeaderMap) -> Result<AuthChallenge> {
    let value = header_str(headers, header::WWW_AUTHENTICATE.as_str());
    let params = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or_else(|| AndockError::Auth {
            endpoint: endpoint.to_string(),
            message: format!("unsupported auth challenge: {:?}", value),
        })?;

    let mut challenge = AuthChallenge::default();
    for part in params.split(',') {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        let val = val.trim_matches('"').to_string();
        match key {
            "realm" => challenge.realm = val,
            "service" => challenge.service = val,
            _ => {}
        }
    }

    if challenge.realm.is_empty() {
        return Err(AndockError::Auth {
            endpoint: endpoint.to_string(),
            message: "auth challenge without realm".to_string(),
        });
    }
    Ok(challenge)
}
