//! OCI distribution v2 registry client.
//!
//! Speaks the standard distribution protocol over reqwest: HEAD
//! resolution, blob and manifest GET/PUT, bearer-token auth negotiation,
//! and ranged blob reads where the registry advertises `Accept-Ranges`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncReadExt as _;
use tokio::sync::RwLock;
use tokio_util::io::{ReaderStream, StreamReader};

use kitops_core::oci::MEDIA_TYPE_IMAGE_MANIFEST;
use kitops_core::{ContentDigest, Descriptor, KitError, Result};

use super::{ByteReader, RemoteBlob, RemoteTarget, SeekableBlob, TagPage};

const TAGS_PAGE_SIZE: usize = 100;

/// Authentication credentials for a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous access (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `KITOPS_REGISTRY_USERNAME` / `KITOPS_REGISTRY_PASSWORD`,
    /// falling back to anonymous.
    pub fn from_env() -> Self {
        match (
            std::env::var("KITOPS_REGISTRY_USERNAME").ok(),
            std::env::var("KITOPS_REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }
}

/// Connection-level options for the registry transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Verify registry TLS certificates.
    pub tls_verify: bool,
    /// Use plain HTTP instead of HTTPS.
    pub plain_http: bool,
    /// Optional PEM-encoded client certificate + key.
    pub client_cert_pem: Option<Vec<u8>>,
    /// Optional proxy URL.
    pub proxy: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tls_verify: true,
            plain_http: false,
            client_cert_pem: None,
            proxy: None,
        }
    }
}

/// Idle-connection pool size scaled from CPU count.
fn pool_max_idle_per_host() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (10 + cpus.saturating_sub(4) * 2).min(200)
}

/// A client for one repository on one OCI registry.
pub struct Registry {
    client: reqwest::Client,
    base_url: String,
    repository: String,
    auth: RegistryAuth,
    bearer: RwLock<Option<String>>,
}

impl Registry {
    /// Create a client for `repository` on `registry` (host, optionally with port).
    pub fn new(registry: &str, repository: &str, auth: RegistryAuth, opts: &TransportOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(format!("kitops-cli/{}", kitops_core::VERSION))
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_max_idle_per_host())
            .danger_accept_invalid_certs(!opts.tls_verify);
        if let Some(pem) = &opts.client_cert_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| KitError::Transport(format!("failed to read certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        if let Some(proxy) = &opts.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| KitError::Transport(format!("invalid proxy URL: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| KitError::Transport(e.to_string()))?;

        let scheme = if opts.plain_http { "http" } else { "https" };
        Ok(Self {
            client,
            base_url: format!("{scheme}://{registry}"),
            repository: repository.to_string(),
            auth,
            bearer: RwLock::new(None),
        })
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{reference}", self.base_url, self.repository)
    }

    fn blob_url(&self, digest: &ContentDigest) -> String {
        format!("{}/v2/{}/blobs/{digest}", self.base_url, self.repository)
    }

    /// Send a request, negotiating a bearer token on the first 401.
    async fn send(&self, method: Method, url: &str, headers: HeaderMap) -> Result<Response> {
        let response = self
            .request(method.clone(), url, headers.clone())
            .await?
            .send()
            .await
            .map_err(|e| KitError::Transport(e.to_string()))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match challenge {
            Some(challenge) if challenge.trim_start().starts_with("Bearer") => {
                let token = self.fetch_token(&challenge).await?;
                *self.bearer.write().await = Some(token);
                let retried = self
                    .request(method, url, headers)
                    .await?
                    .send()
                    .await
                    .map_err(|e| KitError::Transport(e.to_string()))?;
                if retried.status() == StatusCode::UNAUTHORIZED {
                    return Err(KitError::Auth(format!("registry rejected credentials for {url}")));
                }
                Ok(retried)
            }
            _ => Err(KitError::Auth(format!("registry requires authentication for {url}"))),
        }
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
    ) -> Result<reqwest::RequestBuilder> {
        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(token) = self.bearer.read().await.as_ref() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        } else if let (Some(user), Some(pass)) = (&self.auth.username, &self.auth.password) {
            builder = builder.basic_auth(user, Some(pass));
        }
        Ok(builder)
    }

    /// Fetch a bearer token from the realm named in a WWW-Authenticate challenge.
    async fn fetch_token(&self, challenge: &str) -> Result<String> {
        let params = parse_bearer_challenge(challenge);
        let realm = params
            .iter()
            .find(|(k, _)| k == "realm")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| KitError::Auth("bearer challenge without realm".to_string()))?;

        let mut request = self.client.get(&realm);
        for (key, value) in &params {
            if key != "realm" {
                request = request.query(&[(key.as_str(), value.as_str())]);
            }
        }
        if !self.auth.is_anonymous() {
            request = request.basic_auth(
                self.auth.username.as_deref().unwrap_or_default(),
                self.auth.password.as_deref(),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| KitError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KitError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| KitError::Transport(e.to_string()))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| KitError::Auth("token endpoint returned no token".to_string()))
    }

    fn accept_manifest_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(MEDIA_TYPE_IMAGE_MANIFEST));
        headers
    }
}

fn parse_bearer_challenge(challenge: &str) -> Vec<(String, String)> {
    let rest = challenge.trim_start().trim_start_matches("Bearer").trim();
    rest.split(',')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

fn response_reader(response: Response) -> ByteReader {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    Box::new(StreamReader::new(stream))
}

/// Range-capable handle over a remote blob.
struct HttpSeekableBlob {
    registry: Arc<RegistryHandle>,
    url: String,
    digest: String,
    size: u64,
}

/// The subset of registry state a detached blob handle needs.
struct RegistryHandle {
    client: reqwest::Client,
    bearer: Option<String>,
    auth: RegistryAuth,
}

impl RegistryHandle {
    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(url);
        if let Some(token) = &self.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        } else if let (Some(user), Some(pass)) = (&self.auth.username, &self.auth.password) {
            builder = builder.basic_auth(user, Some(pass));
        }
        builder
    }
}

#[async_trait]
impl SeekableBlob for HttpSeekableBlob {
    async fn reader_at(&self, offset: u64, length: Option<u64>) -> Result<ByteReader> {
        // Range is inclusive: bytes=start-end
        let end = match length {
            Some(len) => (offset + len).min(self.size) - 1,
            None => self.size - 1,
        };
        let response = self
            .registry
            .request(&self.url)
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| KitError::Transport(e.to_string()))?;
        let reader = match response.status() {
            StatusCode::PARTIAL_CONTENT => response_reader(response),
            StatusCode::OK if offset == 0 => response_reader(response),
            // A 200 at a nonzero offset means the server ignored the Range
            StatusCode::OK => {
                return Err(KitError::NotSeekable {
                    digest: self.digest.clone(),
                })
            }
            status => {
                return Err(KitError::Transport(format!(
                    "range request for {} returned {status}",
                    self.url
                )))
            }
        };
        Ok(match length {
            Some(len) => Box::new(reader.take(len)),
            None => reader,
        })
    }
}

#[async_trait]
impl RemoteTarget for Registry {
    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        let url = self.manifest_url(reference);
        let response = self
            .send(Method::HEAD, &url, Self::accept_manifest_headers())
            .await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(KitError::NotFound(reference.to_string())),
            status => {
                return Err(KitError::Transport(format!(
                    "failed to resolve {reference}: registry returned {status}"
                )))
            }
        }

        let headers = response.headers();
        let digest = headers
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                KitError::Transport(format!("registry returned no digest for {reference}"))
            })?;
        let digest = ContentDigest::parse(digest)?;
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                KitError::Transport(format!("registry returned no size for {reference}"))
            })?;
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MEDIA_TYPE_IMAGE_MANIFEST)
            .to_string();
        Ok(Descriptor::new(media_type, digest, size))
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<RemoteBlob> {
        if desc.is_manifest() {
            let url = self.manifest_url(desc.digest.as_str());
            let response = self
                .send(Method::GET, &url, Self::accept_manifest_headers())
                .await?;
            return match response.status() {
                StatusCode::OK => Ok(RemoteBlob::Streaming(response_reader(response))),
                StatusCode::NOT_FOUND => Err(KitError::NotFound(desc.digest.to_string())),
                status => Err(KitError::Transport(format!(
                    "failed to fetch manifest {}: registry returned {status}",
                    desc.digest
                ))),
            };
        }

        // Probe range support with a HEAD before committing to a stream.
        let url = self.blob_url(&desc.digest);
        let head = self.send(Method::HEAD, &url, HeaderMap::new()).await?;
        match head.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(KitError::NotFound(desc.digest.to_string())),
            status => {
                return Err(KitError::Transport(format!(
                    "failed to fetch {}: registry returned {status}",
                    desc.digest
                )))
            }
        }
        let ranged = head
            .headers()
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        if ranged && desc.size > 0 {
            let handle = Arc::new(RegistryHandle {
                client: self.client.clone(),
                bearer: self.bearer.read().await.clone(),
                auth: self.auth.clone(),
            });
            return Ok(RemoteBlob::Seekable(Box::new(HttpSeekableBlob {
                registry: handle,
                url,
                digest: desc.digest.to_string(),
                size: desc.size,
            })));
        }

        let response = self.send(Method::GET, &url, HeaderMap::new()).await?;
        match response.status() {
            StatusCode::OK => Ok(RemoteBlob::Streaming(response_reader(response))),
            StatusCode::NOT_FOUND => Err(KitError::NotFound(desc.digest.to_string())),
            status => Err(KitError::Transport(format!(
                "failed to fetch {}: registry returned {status}",
                desc.digest
            ))),
        }
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        let url = if desc.is_manifest() {
            self.manifest_url(desc.digest.as_str())
        } else {
            self.blob_url(&desc.digest)
        };
        let response = self
            .send(Method::HEAD, &url, Self::accept_manifest_headers())
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(KitError::Transport(format!(
                "failed to check {}: registry returned {status}",
                desc.digest
            ))),
        }
    }

    async fn push(&self, desc: &Descriptor, content: ByteReader) -> Result<()> {
        if desc.is_manifest() {
            let mut buf = Vec::with_capacity(desc.size as usize);
            let mut reader = content;
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
                .await
                .map_err(KitError::Io)?;
            return self.push_manifest(desc.digest.as_str(), desc, buf).await;
        }

        // Two-step upload: session POST, then monolithic PUT.
        let start_url = format!("{}/v2/{}/blobs/uploads/", self.base_url, self.repository);
        let response = self.send(Method::POST, &start_url, HeaderMap::new()).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(KitError::Transport(format!(
                "failed to start upload for {}: registry returned {}",
                desc.digest,
                response.status()
            )));
        }
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                KitError::Transport(format!("upload session for {} has no location", desc.digest))
            })?;
        let location = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{location}", self.base_url)
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{separator}digest={}", desc.digest);

        let body = reqwest::Body::wrap_stream(ReaderStream::new(content));
        let response = self
            .request(Method::PUT, &put_url, HeaderMap::new())
            .await?
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, desc.size)
            .body(body)
            .send()
            .await
            .map_err(|e| KitError::Transport(e.to_string()))?;
        if response.status() != StatusCode::CREATED {
            return Err(KitError::Transport(format!(
                "failed to upload {}: registry returned {}",
                desc.digest,
                response.status()
            )));
        }
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &str,
        desc: &Descriptor,
        content: Vec<u8>,
    ) -> Result<()> {
        let url = self.manifest_url(reference);
        let response = self
            .request(Method::PUT, &url, HeaderMap::new())
            .await?
            .header(CONTENT_TYPE, desc.media_type.clone())
            .body(content)
            .send()
            .await
            .map_err(|e| KitError::Transport(e.to_string()))?;
        if response.status() != StatusCode::CREATED {
            return Err(KitError::Transport(format!(
                "failed to push manifest {reference}: registry returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn tags_page(&self, last: Option<String>) -> Result<TagPage> {
        let mut url = format!(
            "{}/v2/{}/tags/list?n={TAGS_PAGE_SIZE}",
            self.base_url, self.repository
        );
        if let Some(last) = &last {
            url.push_str(&format!("&last={last}"));
        }
        let response = self.send(Method::GET, &url, HeaderMap::new()).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(KitError::NotFound(self.repository.clone())),
            status => {
                return Err(KitError::Transport(format!(
                    "failed to list tags: registry returned {status}"
                )))
            }
        }

        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Vec<String>,
        }
        let body: TagList = response
            .json()
            .await
            .map_err(|e| KitError::Transport(e.to_string()))?;
        let next = if body.tags.len() == TAGS_PAGE_SIZE {
            body.tags.last().cloned()
        } else {
            None
        };
        Ok(TagPage {
            tags: body.tags,
            next,
        })
    }
}
