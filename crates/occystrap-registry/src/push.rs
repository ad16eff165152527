//! Registry pusher sink.
//!
//! Each arriving layer is handed to a worker task that compresses it into
//! a scratch file, computes the compressed digest and uploads the blob
//! unless a HEAD probe says the registry already has it. Workers run
//! concurrently behind a semaphore; `finalize` collects their results in
//! submission order so the manifest's layer list preserves apply order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Method, StatusCode};
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use occystrap_core::compression::{self, Compression};
use occystrap_core::element::{Element, ImageSink};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::{Descriptor, ImageManifest, SchemaFamily};
use occystrap_core::digest;

use crate::client::{push_scope, RegistryClient};

/// Pushes an image to a registry.
pub struct RegistryPusher {
    client: Arc<RegistryClient>,
    image: String,
    tag: String,
    compression: Compression,
    temp_dir: Option<PathBuf>,
    workers: Arc<Semaphore>,
    family: Option<SchemaFamily>,
    config: Option<ConfigUpload>,
    layers: Vec<JoinHandle<Result<(String, u64)>>>,
}

struct ConfigUpload {
    digest: String,
    size: u64,
    task: JoinHandle<Result<()>>,
}

impl RegistryPusher {
    /// Creates a pusher for `image:tag` on `client`.
    #[must_use]
    pub fn new(
        client: Arc<RegistryClient>,
        image: impl Into<String>,
        tag: impl Into<String>,
        compression: Option<Compression>,
        max_workers: usize,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            image: image.into(),
            tag: tag.into(),
            compression: compression.unwrap_or(Compression::Gzip),
            temp_dir,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            family: None,
            config: None,
            layers: Vec::new(),
        }
    }
}

#[async_trait]
impl ImageSink for RegistryPusher {
    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { data, family, .. } => {
                self.family = Some(family);
                let digest = format!("sha256:{}", digest::sha256_hex(&data));
                let size = data.len() as u64;
                debug!(digest = %digest, size, "queueing config upload");

                let client = Arc::clone(&self.client);
                let image = self.image.clone();
                let task_digest = digest.clone();
                let task = tokio::spawn(async move {
                    upload_blob_if_missing(&client, &image, &task_digest, UploadBody::Bytes(data))
                        .await
                });
                self.config = Some(ConfigUpload { digest, size, task });
                Ok(())
            }
            Element::Layer { name, blob: Some(blob) } => {
                debug!(layer = %name, "queueing layer compress+upload");
                let client = Arc::clone(&self.client);
                let image = self.image.clone();
                let compression = self.compression;
                let temp_dir = self.temp_dir.clone();
                let workers = Arc::clone(&self.workers);

                self.layers.push(tokio::spawn(async move {
                    let _permit = workers
                        .acquire_owned()
                        .await
                        .map_err(|_| ImageError::Sink("worker pool closed".to_string()))?;

                    // Compression is CPU-bound; keep it off the async
                    // threads.
                    let (spool, hex, size) = tokio::task::spawn_blocking(move || {
                        let reader = blob.reader()?;
                        compression::compress_to_spool(reader, compression, temp_dir.as_deref())
                    })
                    .await
                    .map_err(|e| ImageError::Sink(format!("compression task failed: {e}")))??;

                    let digest = format!("sha256:{hex}");
                    upload_blob_if_missing(
                        &client,
                        &image,
                        &digest,
                        UploadBody::Spool(spool, size),
                    )
                    .await?;
                    Ok((digest, size))
                }));
                Ok(())
            }
            Element::Layer { name, blob: None } => Err(ImageError::Sink(format!(
                "registry pusher needs layer bytes for {name} but the layer was skipped"
            ))),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let config = self
            .config
            .take()
            .ok_or_else(|| ImageError::Sink("no config file was processed".to_string()))?;
        let family = self.family.unwrap_or(SchemaFamily::Docker);

        config
            .task
            .await
            .map_err(|e| ImageError::Sink(format!("config upload task failed: {e}")))??;
        info!(digest = %config.digest, "config uploaded");

        // Futures resolve in submission order, which preserves layer apply
        // order in the manifest regardless of upload completion order.
        let mut layers = Vec::with_capacity(self.layers.len());
        for task in self.layers.drain(..) {
            let (digest, size) = task
                .await
                .map_err(|e| ImageError::Sink(format!("layer upload task failed: {e}")))??;
            layers.push(Descriptor {
                media_type: family.layer_media_type(self.compression).to_string(),
                digest,
                size,
            });
        }
        info!(count = layers.len(), "all layers uploaded");

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: family.manifest_media_type().to_string(),
            config: Descriptor {
                media_type: family.config_media_type().to_string(),
                digest: config.digest,
                size: config.size,
            },
            layers,
        };
        let body = serde_json::to_vec(&manifest)?;

        let scope = push_scope(&self.image);
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.client.base_url(),
            self.image,
            self.tag
        );
        let body = Bytes::from(body);
        let response = self
            .client
            .authed(&scope, |http| {
                Ok(http
                    .request(Method::PUT, &url)
                    .header(header::CONTENT_TYPE, family.manifest_media_type())
                    .body(body.clone()))
            })
            .await?;
        let status = response.status();
        if !matches!(
            status,
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED
        ) {
            return Err(ImageError::Registry(format!(
                "manifest push returned {status}"
            )));
        }

        info!(image = %self.image, tag = %self.tag, "image pushed");
        Ok(())
    }
}

enum UploadBody {
    Bytes(Bytes),
    Spool(NamedTempFile, u64),
}

/// HEAD-probes for the blob and uploads it when absent: POST to open an
/// upload session, one streamed PATCH with the data, then a closing PUT
/// with the digest. A 200 on the HEAD means no PATCH or PUT happens at all.
async fn upload_blob_if_missing(
    client: &RegistryClient,
    image: &str,
    digest: &str,
    body: UploadBody,
) -> Result<()> {
    let scope = push_scope(image);
    let head_url = format!("{}/v2/{}/blobs/{}", client.base_url(), image, digest);
    let response = client
        .authed(&scope, |http| Ok(http.request(Method::HEAD, &head_url)))
        .await?;
    if response.status() == StatusCode::OK {
        info!(digest = %digest, "blob already present, skipping upload");
        return Ok(());
    }

    let size = match &body {
        UploadBody::Bytes(b) => b.len() as u64,
        UploadBody::Spool(_, size) => *size,
    };
    info!(digest = %digest, size, "uploading blob");

    let start_url = format!("{}/v2/{}/blobs/uploads/", client.base_url(), image);
    let response = client
        .authed(&scope, |http| Ok(http.request(Method::POST, &start_url)))
        .await?;
    if !matches!(response.status(), StatusCode::OK | StatusCode::ACCEPTED) {
        return Err(ImageError::Registry(format!(
            "blob upload initiation returned {}",
            response.status()
        )));
    }
    let location = upload_location(client, &response)?;

    let response = client
        .authed(&scope, |http| {
            let builder = http
                .request(Method::PATCH, &location)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, size);
            Ok(match &body {
                UploadBody::Bytes(b) => builder.body(b.clone()),
                UploadBody::Spool(spool, _) => {
                    let file = tokio::fs::File::from_std(spool.reopen()?);
                    let stream = tokio_util::io::ReaderStream::new(file);
                    builder.body(reqwest::Body::wrap_stream(stream))
                }
            })
        })
        .await?;
    if !matches!(
        response.status(),
        StatusCode::ACCEPTED | StatusCode::CREATED | StatusCode::NO_CONTENT
    ) {
        return Err(ImageError::Registry(format!(
            "blob data upload returned {}",
            response.status()
        )));
    }
    let location = upload_location(client, &response)?;

    let finish_url = if location.contains('?') {
        format!("{location}&digest={digest}")
    } else {
        format!("{location}?digest={digest}")
    };
    let response = client
        .authed(&scope, |http| {
            Ok(http
                .request(Method::PUT, &finish_url)
                .header(header::CONTENT_LENGTH, 0_u64))
        })
        .await?;
    if !matches!(
        response.status(),
        StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED
    ) {
        return Err(ImageError::Registry(format!(
            "blob upload completion returned {}",
            response.status()
        )));
    }

    debug!(digest = %digest, "blob uploaded");
    Ok(())
}

fn upload_location(client: &RegistryClient, response: &reqwest::Response) -> Result<String> {
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ImageError::Registry("upload response carried no Location header".to_string())
        })?;
    Ok(if location.starts_with("http") {
        location.to_string()
    } else {
        format!("{}{}", client.base_url(), location)
    })
}
