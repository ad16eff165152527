//! Docker Registry v2 API client and image source.
//!
//! Speaks the Distribution Spec: manifest negotiation via Accept headers,
//! platform selection over manifest lists and OCI indexes, and streamed
//! blob fetches. Layer downloads run on a bounded worker pool but are
//! emitted to the consumer strictly in manifest order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Method, StatusCode};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use occystrap_core::compression::{self, Compression, DecompressWriter};
use occystrap_core::element::{new_spool, Blob, Element, ImageSink, ImageSource};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::{
    self, config_diff_ids, Descriptor, ImageIndex, ImageManifest, Platform, PlatformManifest,
    SchemaFamily,
};
use occystrap_core::digest::{self, HashingWriter};
use occystrap_core::Result as CoreResult;

use crate::auth::{AuthScheme, Challenge, Credentials, TokenCache, TokenResponse};

/// Docker Hub's registry host is not its API host.
const DOCKER_HUB_URL: &str = "https://registry-1.docker.io";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

/// Attempts per request for transient failures.
const MAX_ATTEMPTS: u32 = 5;

/// Registry client shared by the source and the pusher.
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    host: String,
    credentials: Option<Credentials>,
    tokens: TokenCache,
}

impl RegistryClient {
    /// Creates a client for `host`. With `insecure` the registry is reached
    /// over plain HTTP.
    pub fn new(host: &str, insecure: bool, credentials: Option<Credentials>) -> Result<Self> {
        let base_url = match host {
            "docker.io" => DOCKER_HUB_URL.to_string(),
            h if h.starts_with("http://") || h.starts_with("https://") => h.to_string(),
            h if insecure => format!("http://{h}"),
            h => format!("https://{h}"),
        };

        let http = reqwest::Client::builder()
            .user_agent(concat!("occystrap/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS))
            .build()
            .map_err(|e| ImageError::Registry(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            host: host.to_string(),
            credentials,
            tokens: TokenCache::default(),
        })
    }

    /// The registry base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issues an authenticated request, handling 401 challenges and
    /// retrying transient failures with exponential backoff.
    ///
    /// `build` constructs the request; it is re-invoked for every attempt
    /// so streaming bodies get a fresh reader each time.
    pub(crate) async fn authed<F>(&self, scope: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> Result<reqwest::RequestBuilder> + Send + Sync,
    {
        let mut scheme = match self.tokens.get(scope).await {
            Some(token) => AuthScheme::Bearer(token),
            None => AuthScheme::None,
        };

        for round in 0..2 {
            let response = self.send_with_retry(&build, &scheme).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if round == 1 {
                return Err(match &self.credentials {
                    Some(_) => ImageError::AuthFailed(self.host.clone()),
                    None => ImageError::AuthRequired(self.host.clone()),
                });
            }
            self.tokens.invalidate(scope).await;
            scheme = self.answer_challenge(&response, scope).await?;
        }
        unreachable!("auth loop always returns within two rounds");
    }

    async fn send_with_retry<F>(&self, build: &F, scheme: &AuthScheme) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> Result<reqwest::RequestBuilder> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let mut builder = build(&self.http)?;
            builder = match scheme {
                AuthScheme::None => builder,
                AuthScheme::Bearer(token) => {
                    builder.header(header::AUTHORIZATION, format!("Bearer {token}"))
                }
                AuthScheme::Basic => {
                    let creds = self.credentials.as_ref().ok_or_else(|| {
                        ImageError::AuthRequired(self.host.clone())
                    })?;
                    builder.basic_auth(&creds.username, Some(&creds.password))
                }
            };

            match builder.send().await {
                Ok(response) if response.status().is_server_error() && attempt + 1 < MAX_ATTEMPTS => {
                    warn!(
                        status = %response.status(),
                        attempt = attempt + 1,
                        "transient registry error, retrying"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if is_transient_reqwest(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    warn!(error = %e, attempt = attempt + 1, "request failed, retrying");
                }
                Err(e) => return Err(ImageError::Registry(format!("request failed: {e}"))),
            }

            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            attempt += 1;
        }
    }

    /// Resolves a 401 into an auth scheme for the retry: fetch and cache a
    /// bearer token, or fall back to basic auth.
    async fn answer_challenge(
        &self,
        response: &reqwest::Response,
        scope: &str,
    ) -> Result<AuthScheme> {
        let header_value = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let challenge = Challenge::parse(header_value).ok_or_else(|| {
            ImageError::AuthFailed(format!(
                "{}: unparseable WWW-Authenticate challenge",
                self.host
            ))
        })?;

        match challenge {
            Challenge::Basic => {
                if self.credentials.is_none() {
                    return Err(ImageError::AuthRequired(self.host.clone()));
                }
                Ok(AuthScheme::Basic)
            }
            Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let scope_value = challenge_scope.unwrap_or_else(|| scope.to_string());
                let token = self.fetch_token(&realm, &service, &scope_value).await?;
                self.tokens.insert(scope, token.clone()).await;
                Ok(AuthScheme::Bearer(token))
            }
        }
    }

    async fn fetch_token(&self, realm: &str, service: &str, scope: &str) -> Result<String> {
        let mut url = format!("{realm}?service={service}&scope={scope}");
        if let Some(creds) = &self.credentials {
            url.push_str(&format!("&account={}", urlencoding::encode(&creds.username)));
        }
        debug!(url = %url, "requesting registry token");

        let mut request = self.http.get(&url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageError::AuthFailed(format!("token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ImageError::AuthFailed(format!(
                "{}: token request returned {}",
                self.host,
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ImageError::AuthFailed(format!("bad token response: {e}")))?;
        token
            .into_token()
            .ok_or_else(|| ImageError::AuthFailed(format!("{}: empty token response", self.host)))
    }

    /// Fetches and resolves a manifest, following one level of manifest
    /// list / index indirection to the entry matching `platform`.
    pub async fn resolve_manifest(
        &self,
        image: &str,
        reference: &str,
        platform: &Platform,
    ) -> Result<(ImageManifest, SchemaFamily)> {
        let scope = pull_scope(image);
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, image, reference);
        debug!(url = %url, "fetching manifest");

        let response = self
            .authed(&scope, |http| {
                Ok(http
                    .request(Method::GET, &url)
                    .header(header::ACCEPT, manifest::ACCEPT_MANIFEST))
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ImageError::NotFound(format!("{image}:{reference}")));
        }
        if !status.is_success() {
            return Err(ImageError::Registry(format!(
                "manifest fetch returned {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| ImageError::Registry(format!("manifest read failed: {e}")))?;

        if content_type.contains("manifest.list") || content_type.contains("image.index") {
            let index: ImageIndex = serde_json::from_slice(&body)?;
            let entry = select_platform(&index, platform)?;
            info!(
                platform = %platform,
                digest = %entry.digest,
                "selected manifest from index"
            );
            return Box::pin(self.resolve_manifest(image, &entry.digest, platform)).await;
        }

        let parsed: ImageManifest = serde_json::from_slice(&body)?;
        let family = if content_type.is_empty() {
            SchemaFamily::from_media_type(&parsed.media_type)
        } else {
            SchemaFamily::from_media_type(&content_type)
        };
        Ok((parsed, family))
    }

    /// Fetches and digest-verifies the config blob.
    pub async fn fetch_config(&self, image: &str, config: &Descriptor) -> Result<Bytes> {
        let scope = pull_scope(image);
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, image, config.digest);
        debug!(url = %url, "fetching config");

        let response = self
            .authed(&scope, |http| Ok(http.request(Method::GET, &url)))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ImageError::NotFound(format!("blob {}", config.digest)));
        }
        if !status.is_success() {
            return Err(ImageError::Registry(format!(
                "config fetch returned {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ImageError::Registry(format!("config read failed: {e}")))?;
        let computed = digest::sha256_hex(&body);
        let expected = digest::strip_prefix(&config.digest);
        if computed != expected {
            return Err(ImageError::DigestMismatch {
                name: config.digest.clone(),
                expected: expected.to_string(),
                computed,
            });
        }
        Ok(body)
    }

    /// Downloads one layer blob to a scratch file, stripping wire
    /// compression and verifying the compressed digest. Returns the spool
    /// together with the diffID hex of the decompressed tar, hashed while
    /// spooling. Retries the whole transfer on mid-stream failures.
    pub async fn fetch_layer(
        &self,
        image: &str,
        layer: &Descriptor,
        temp_dir: Option<&Path>,
    ) -> Result<(NamedTempFile, String)> {
        let mut attempt = 0;
        loop {
            match self.fetch_layer_once(image, layer, temp_dir).await {
                Ok(fetched) => return Ok(fetched),
                Err(ImageError::TransientNetwork(msg)) if attempt + 1 < MAX_ATTEMPTS => {
                    warn!(
                        layer = %layer.digest,
                        attempt = attempt + 1,
                        error = %msg,
                        "layer download failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_layer_once(
        &self,
        image: &str,
        layer: &Descriptor,
        temp_dir: Option<&Path>,
    ) -> Result<(NamedTempFile, String)> {
        let scope = pull_scope(image);
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, image, layer.digest);
        info!(digest = %layer.digest, size = layer.size, "fetching layer");

        let mut response = self
            .authed(&scope, |http| Ok(http.request(Method::GET, &url)))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ImageError::NotFound(format!("blob {}", layer.digest)));
        }
        if !status.is_success() {
            return Err(ImageError::Registry(format!(
                "layer fetch returned {status}"
            )));
        }

        // Media type first, then magic bytes; gzip as a last resort for
        // registries that report opaque blob types.
        let mut prefix: Vec<u8> = Vec::with_capacity(8);
        while prefix.len() < 4 {
            match next_chunk(&mut response).await? {
                Some(chunk) => prefix.extend_from_slice(&chunk),
                None => break,
            }
        }
        let mut compression = compression::from_media_type(&layer.media_type);
        if compression == Compression::Unknown {
            compression = compression::detect(&prefix);
        }
        if compression == Compression::Unknown {
            debug!(digest = %layer.digest, "cannot classify layer, assuming gzip");
            compression = Compression::Gzip;
        }

        // Hash both sides of the decompressor: the compressed stream
        // verifies against the manifest digest, the decompressed stream is
        // the layer's diffID and becomes the element name.
        let mut hasher = Sha256::new();
        let mut writer =
            DecompressWriter::new(compression, HashingWriter::new(new_spool(temp_dir)?))?;

        hasher.update(&prefix);
        std::io::Write::write_all(&mut writer, &prefix)?;
        while let Some(chunk) = next_chunk(&mut response).await? {
            hasher.update(&chunk);
            std::io::Write::write_all(&mut writer, &chunk)?;
        }
        let hashing = writer.finish()?;
        let (mut spool, diff_hex, _len) = hashing.finish();
        std::io::Write::flush(&mut spool)?;

        let computed = hex::encode(hasher.finalize());
        let expected = digest::strip_prefix(&layer.digest);
        if computed != expected {
            return Err(ImageError::DigestMismatch {
                name: layer.digest.clone(),
                expected: expected.to_string(),
                computed,
            });
        }
        Ok((spool, diff_hex))
    }
}

async fn next_chunk(response: &mut reqwest::Response) -> Result<Option<Bytes>> {
    response
        .chunk()
        .await
        .map_err(|e| ImageError::TransientNetwork(format!("blob stream failed: {e}")))
}

fn is_transient_reqwest(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

/// Pull scope for a repository.
pub(crate) fn pull_scope(image: &str) -> String {
    format!("repository:{image}:pull")
}

/// Pull+push scope for a repository.
pub(crate) fn push_scope(image: &str) -> String {
    format!("repository:{image}:pull,push")
}

fn select_platform<'a>(index: &'a ImageIndex, wanted: &Platform) -> Result<&'a PlatformManifest> {
    for entry in &index.manifests {
        let Some(platform) = &entry.platform else {
            continue;
        };
        debug!(platform = %platform, digest = %entry.digest, "index entry");
        if platform.matches(wanted) {
            return Ok(entry);
        }
    }
    let available = index
        .manifests
        .iter()
        .filter_map(|m| m.platform.as_ref())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Err(ImageError::NoMatchingPlatform {
        wanted: wanted.to_string(),
        available,
    })
}

/// An image source backed by a registry.
pub struct RegistrySource {
    client: Arc<RegistryClient>,
    image: String,
    tag: String,
    platform: Platform,
    max_workers: usize,
    temp_dir: Option<PathBuf>,
}

impl RegistrySource {
    /// Creates a source for `image:tag` on `client`.
    #[must_use]
    pub fn new(
        client: Arc<RegistryClient>,
        image: impl Into<String>,
        tag: impl Into<String>,
        platform: Platform,
        max_workers: usize,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            image: image.into(),
            tag: tag.into(),
            platform,
            max_workers: max_workers.max(1),
            temp_dir,
        }
    }
}

enum LayerJob {
    Fetch(Descriptor),
    Skip(String),
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn image(&self) -> &str {
        &self.image
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn deliver(&mut self, sink: &mut (dyn ImageSink + Send)) -> CoreResult<()> {
        let (manifest, family) = self
            .client
            .resolve_manifest(&self.image, &self.tag, &self.platform)
            .await?;

        let config_hex = digest::strip_prefix(&manifest.config.digest).to_string();
        let config = self.client.fetch_config(&self.image, &manifest.config).await?;

        // Layer elements are named by diffID (SHA-256 of the uncompressed
        // tar), not by the manifest's compressed blob digest. The config's
        // rootfs.diff_ids are index-aligned with the manifest layers and
        // let the admission check run before anything is downloaded.
        let diff_ids = config_diff_ids(&config);

        sink.process_element(Element::Config {
            name: format!("{config_hex}.json"),
            data: config,
            family,
        })
        .await?;

        info!(count = manifest.layers.len(), "image has layers");
        let jobs: Vec<LayerJob> = manifest
            .layers
            .iter()
            .enumerate()
            .map(|(idx, layer)| match diff_ids.get(idx) {
                Some(diff_hex) if !sink.wants_layer(diff_hex) => {
                    info!(digest = %layer.digest, "sink declined layer, skipping fetch");
                    LayerJob::Skip(diff_hex.clone())
                }
                _ => LayerJob::Fetch(layer.clone()),
            })
            .collect();

        // Downloads run concurrently but `buffered` releases results in
        // submission order, which is manifest (apply) order.
        let client = Arc::clone(&self.client);
        let image = self.image.clone();
        let temp_dir = self.temp_dir.clone();
        let results = futures::stream::iter(jobs.into_iter().map(|job| {
            let client = Arc::clone(&client);
            let image = image.clone();
            let temp_dir = temp_dir.clone();
            async move {
                match job {
                    LayerJob::Skip(hex) => Ok::<_, ImageError>((hex, None)),
                    LayerJob::Fetch(layer) => {
                        let (spool, diff_hex) = client
                            .fetch_layer(&image, &layer, temp_dir.as_deref())
                            .await?;
                        Ok((diff_hex, Some(Blob::from_spool(spool))))
                    }
                }
            }
        }))
        .buffered(self.max_workers);
        tokio::pin!(results);

        while let Some(result) = results.next().await {
            let (name, blob) = result?;
            sink.process_element(Element::Layer { name, blob }).await?;
        }

        info!("registry fetch complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_mapping() {
        let client = RegistryClient::new("docker.io", false, None).unwrap();
        assert_eq!(client.base_url(), "https://registry-1.docker.io");

        let client = RegistryClient::new("ghcr.io", false, None).unwrap();
        assert_eq!(client.base_url(), "https://ghcr.io");

        let client = RegistryClient::new("localhost:5000", true, None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000");

        let client = RegistryClient::new("http://localhost:5000", false, None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000");
    }

    #[test]
    fn test_scopes() {
        assert_eq!(pull_scope("library/busybox"), "repository:library/busybox:pull");
        assert_eq!(push_scope("a/b"), "repository:a/b:pull,push");
    }

    #[test]
    fn test_select_platform() {
        let index: ImageIndex = serde_json::from_str(
            r#"{
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": [
                    {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                     "digest": "sha256:amd", "size": 1,
                     "platform": {"architecture": "amd64", "os": "linux"}},
                    {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                     "digest": "sha256:armv8", "size": 1,
                     "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}}
                ]
            }"#,
        )
        .unwrap();

        let entry = select_platform(&index, &Platform::new("linux", "amd64", "")).unwrap();
        assert_eq!(entry.digest, "sha256:amd");

        let entry = select_platform(&index, &Platform::new("linux", "arm64", "v8")).unwrap();
        assert_eq!(entry.digest, "sha256:armv8");

        let err = select_platform(&index, &Platform::new("linux", "s390x", "")).unwrap_err();
        match err {
            ImageError::NoMatchingPlatform { wanted, available } => {
                assert_eq!(wanted, "linux/s390x");
                assert!(available.contains("linux/amd64"));
                assert!(available.contains("linux/arm64/v8"));
            }
            other => panic!("expected NoMatchingPlatform, got {other:?}"),
        }
    }
}
