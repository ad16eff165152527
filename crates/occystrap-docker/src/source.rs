//! Image source backed by the Docker Engine API.
//!
//! The engine API only exposes whole-image export (`GET /images/<ref>/get`),
//! so this source stream-parses the `docker save` tar as it arrives. Both
//! Docker and Podman write `manifest.json` near the end of that stream; to
//! avoid buffering everything until then, the inspect API is called first:
//! its `Id` identifies the config and, for OCI-layout exports (Docker 25+),
//! `RootFS.Layers` pre-computes every layer path so blobs can be emitted as
//! soon as they are seen. Content-addressable exports (1.10-24.x) still
//! buffer layers to scratch files because their directory names cannot be
//! predicted from inspect data. Layer elements are named by diffID either
//! way, taken from inspect or computed from the spooled tar.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use occystrap_core::compression::decompress_to_spool;
use occystrap_core::digest;
use occystrap_core::element::{new_spool, Blob, Element, ImageSink, ImageSource};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::{SaveManifestEntry, SchemaFamily};

use crate::client::DaemonClient;

/// Subset of `GET /images/<ref>/json` this source uses.
#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id", default)]
    id: String,
    #[serde(rename = "RootFS", default)]
    root_fs: InspectRootFs,
}

#[derive(Debug, Default, Deserialize)]
struct InspectRootFs {
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// An image source reading from a local Docker or Podman daemon.
pub struct DaemonSource {
    client: DaemonClient,
    image: String,
    tag: String,
    temp_dir: Option<PathBuf>,
}

impl DaemonSource {
    /// Creates a source for `image:tag` on the daemon behind `client`.
    #[must_use]
    pub fn new(
        client: DaemonClient,
        image: impl Into<String>,
        tag: impl Into<String>,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            image: image.into(),
            tag: tag.into(),
            temp_dir,
        }
    }
}

#[async_trait]
impl ImageSource for DaemonSource {
    fn image(&self) -> &str {
        &self.image
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn deliver(&mut self, sink: &mut (dyn ImageSink + Send)) -> Result<()> {
        let reference = format!("{}:{}", self.image, self.tag);
        info!(
            image = %reference,
            socket = %self.client.socket_path().display(),
            "fetching image from daemon"
        );

        // Pre-compute what we can from inspect data so the tar stream can
        // be processed without waiting for manifest.json.
        let inspect: InspectResponse = self
            .client
            .get_json(&format!("/images/{reference}/json"))
            .await?;
        let pre = Precomputed::from_inspect(&inspect);
        if let Some(config) = &pre.config_hex {
            debug!(
                config = %config,
                layers = pre.diff_ids.len(),
                "pre-computed identities from inspect"
            );
        }

        let body = self
            .client
            .get_stream(&format!("/images/{reference}/get"))
            .await?;

        // The tar crate is synchronous; bridge the response body onto a
        // blocking task that feeds parsed elements back over a bounded
        // channel.
        let byte_stream = http_body_util::BodyStream::new(body).map(|res| match res {
            Ok(frame) => Ok(frame.into_data().unwrap_or_default()),
            Err(e) => Err(std::io::Error::other(e)),
        });
        let reader = tokio_util::io::SyncIoBridge::new(tokio_util::io::StreamReader::new(
            byte_stream,
        ));

        let (tx, mut rx) = mpsc::channel::<SaveItem>(2);
        let temp_dir = self.temp_dir.clone();
        let parser = tokio::task::spawn_blocking(move || {
            parse_save_stream(reader, pre, temp_dir.as_deref(), &tx)
        });

        while let Some(item) = rx.recv().await {
            match item {
                SaveItem::Config { name, data } => {
                    sink.process_element(Element::Config {
                        name,
                        data: data.into(),
                        family: SchemaFamily::Docker,
                    })
                    .await?;
                }
                SaveItem::Layer { digest, spool } => {
                    let blob = if sink.wants_layer(&digest) {
                        Some(Blob::from_spool(spool))
                    } else {
                        info!(digest = %digest, "sink declined layer");
                        None
                    };
                    sink.process_element(Element::Layer { name: digest, blob })
                        .await?;
                }
            }
        }

        parser
            .await
            .map_err(|e| ImageError::Daemon(format!("tar parser task failed: {e}")))??;
        info!("daemon fetch complete");
        Ok(())
    }
}

/// Identities recovered from the inspect API before streaming starts.
struct Precomputed {
    config_hex: Option<String>,
    diff_ids: Vec<String>,
}

impl Precomputed {
    fn from_inspect(inspect: &InspectResponse) -> Self {
        let config_hex = inspect
            .id
            .strip_prefix("sha256:")
            .map(ToString::to_string);
        let diff_ids = inspect
            .root_fs
            .layers
            .iter()
            .map(|d| d.strip_prefix("sha256:").unwrap_or(d).to_string())
            .collect();
        Self {
            config_hex,
            diff_ids,
        }
    }
}

enum SaveItem {
    Config { name: String, data: Vec<u8> },
    Layer { digest: String, spool: NamedTempFile },
}

/// Parses a `docker save` stream, emitting the config and then layers in
/// apply order.
///
/// Every regular file is spooled to a scratch file as it is read; a spooled
/// file is released to the channel the moment the manifest (actual or
/// pre-computed) says it is next.
fn parse_save_stream<R: Read>(
    reader: R,
    pre: Precomputed,
    temp_dir: Option<&Path>,
    tx: &mpsc::Sender<SaveItem>,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);

    let mut state = StreamState {
        config_name: None,
        expected_layers: Vec::new(),
        diff_ids: pre.diff_ids.clone(),
        manifest_known: false,
        precomputed: false,
        config_sent: false,
        next_layer: 0,
        buffered: HashMap::new(),
        saw_repositories: false,
    };
    let mut format_detected = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = name.trim_start_matches("./").to_string();

        if !format_detected {
            format_detected = true;
            state.detect_format(&name, &pre);
        }

        if !entry.header().entry_type().is_file() {
            debug!(entry = %name, "skipping non-file entry");
            continue;
        }

        if name == "repositories" {
            state.saw_repositories = true;
            continue;
        }

        if name == "manifest.json" {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            state.adopt_manifest(&data)?;
            state.flush_ready(tx)?;
            continue;
        }

        // Early config emission: the filename is known from inspect data
        // even before the manifest arrives.
        if !state.config_sent && state.config_name.as_deref() == Some(name.as_str()) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            debug!(config = %name, size = data.len(), "emitting config");
            send(tx, SaveItem::Config { name, data })?;
            state.config_sent = true;
            state.flush_ready(tx)?;
            continue;
        }

        // Spool the blob; layer blobs in OCI exports may be compressed.
        let spool = if name.starts_with("blobs/") {
            decompress_to_spool(&mut entry, temp_dir)?
        } else {
            let mut spool = new_spool(temp_dir)?;
            std::io::copy(&mut entry, &mut spool)?;
            spool
        };
        debug!(entry = %name, "buffered stream entry");
        state.buffered.insert(name, spool);
        state.flush_ready(tx)?;
    }

    if !state.manifest_known {
        if state.saw_repositories {
            return Err(ImageError::UnsupportedTarballFormat(
                "this image export uses the legacy pre-1.10 layout; convert it with \
                 'docker load' followed by 'docker save'"
                    .to_string(),
            ));
        }
        return Err(ImageError::UnsupportedTarballFormat(
            "no manifest.json or index.json found in image export".to_string(),
        ));
    }

    state.flush_ready(tx)?;
    if state.next_layer < state.expected_layers.len() {
        return Err(ImageError::Daemon(format!(
            "layer {} missing from image export",
            state.expected_layers[state.next_layer]
        )));
    }
    if !state.config_sent {
        return Err(ImageError::Daemon(
            "config blob missing from image export".to_string(),
        ));
    }
    Ok(())
}

struct StreamState {
    config_name: Option<String>,
    expected_layers: Vec<String>,
    /// DiffIDs from inspect, index-aligned with the manifest layers.
    diff_ids: Vec<String>,
    manifest_known: bool,
    precomputed: bool,
    config_sent: bool,
    next_layer: usize,
    buffered: HashMap<String, NamedTempFile>,
    saw_repositories: bool,
}

impl StreamState {
    /// Classifies the export layout from the first entry name. OCI-layout
    /// exports with inspect data get a fully pre-computed manifest; for
    /// content-addressable exports only the config filename is predictable.
    fn detect_format(&mut self, first_entry: &str, pre: &Precomputed) {
        if first_entry.starts_with("blobs/") || first_entry == "oci-layout" {
            if let Some(config_hex) = &pre.config_hex {
                if !pre.diff_ids.is_empty() {
                    self.config_name = Some(format!("blobs/sha256/{config_hex}"));
                    self.expected_layers = pre
                        .diff_ids
                        .iter()
                        .map(|d| format!("blobs/sha256/{d}"))
                        .collect();
                    self.manifest_known = true;
                    self.precomputed = true;
                    info!(
                        layers = self.expected_layers.len(),
                        "OCI export, manifest pre-computed from inspect"
                    );
                    return;
                }
            }
            info!("OCI export without inspect identities, waiting for manifest.json");
        } else if let Some(config_hex) = &pre.config_hex {
            self.config_name = Some(format!("{config_hex}.json"));
            info!(config = %config_hex, "content-addressable export");
        }
    }

    fn adopt_manifest(&mut self, data: &[u8]) -> Result<()> {
        let parsed: Vec<SaveManifestEntry> = serde_json::from_slice(data)?;
        let entry = parsed
            .into_iter()
            .next()
            .ok_or_else(|| ImageError::Daemon("empty manifest.json in export".to_string()))?;

        if self.precomputed {
            if entry.layers != self.expected_layers {
                warn!("pre-computed manifest disagrees with manifest.json, using the actual one");
            } else {
                debug!("pre-computed manifest verified against manifest.json");
                return Ok(());
            }
        }
        if let Some(previous) = &self.config_name {
            if previous != &entry.config {
                debug!(was = %previous, now = %entry.config, "config filename corrected");
            }
        }
        self.config_name = Some(entry.config);
        self.expected_layers = entry.layers;
        self.manifest_known = true;
        self.precomputed = false;
        Ok(())
    }

    /// Releases the config and any buffered layers that are next in apply
    /// order.
    fn flush_ready(&mut self, tx: &mpsc::Sender<SaveItem>) -> Result<()> {
        if !self.config_sent {
            let Some(config_name) = self.config_name.clone() else {
                return Ok(());
            };
            if let Some(spool) = self.buffered.remove(&config_name) {
                let data = std::fs::read(spool.path())?;
                debug!(config = %config_name, "emitting config from buffer");
                send(tx, SaveItem::Config {
                    name: config_name,
                    data,
                })?;
                self.config_sent = true;
            } else {
                return Ok(());
            }
        }

        while self.manifest_known && self.next_layer < self.expected_layers.len() {
            let layer_path = self.expected_layers[self.next_layer].clone();
            let Some(spool) = self.buffered.remove(&layer_path) else {
                break;
            };
            // Elements are named by diffID. Content-addressable exports
            // use unrelated layer directory names, so fall back to hashing
            // the spooled tar when inspect supplied no identities.
            let digest = match self.diff_ids.get(self.next_layer) {
                Some(diff_hex) => diff_hex.clone(),
                None => digest::sha256_hex_reader(&mut spool.reopen()?)?,
            };
            debug!(layer = %digest, "emitting layer");
            send(tx, SaveItem::Layer { digest, spool })?;
            self.next_layer += 1;
        }
        Ok(())
    }
}

fn send(tx: &mpsc::Sender<SaveItem>, item: SaveItem) -> Result<()> {
    tx.blocking_send(item)
        .map_err(|_| ImageError::Daemon("pipeline consumer went away".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    fn drain(rx: &mut mpsc::Receiver<SaveItem>) -> Vec<SaveItem> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn layer_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        entry(&mut builder, "etc/hosts", b"127.0.0.1 localhost\n");
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_content_addressable_stream() {
        // Config and layer arrive before manifest.json, as docker save
        // writes them.
        let layer = layer_tar();
        let mut builder = tar::Builder::new(Vec::new());
        entry(&mut builder, "aaaa.json", b"{\"config\":{}}");
        entry(&mut builder, "1111/layer.tar", &layer);
        let manifest =
            br#"[{"Config": "aaaa.json", "RepoTags": ["img:v1"], "Layers": ["1111/layer.tar"]}]"#;
        entry(&mut builder, "manifest.json", manifest);
        let stream = builder.into_inner().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let pre = Precomputed {
            config_hex: Some("aaaa".to_string()),
            diff_ids: vec![],
        };
        parse_save_stream(&stream[..], pre, None, &tx).unwrap();
        drop(tx);

        let items = drain(&mut rx);
        assert_eq!(items.len(), 2);
        match &items[0] {
            SaveItem::Config { name, data } => {
                assert_eq!(name, "aaaa.json");
                assert_eq!(data, b"{\"config\":{}}");
            }
            SaveItem::Layer { .. } => panic!("expected config first"),
        }
        match &items[1] {
            SaveItem::Layer { digest, spool } => {
                // The 1111 directory name is a save-format ID, not the
                // diffID; with no inspect identities the layer is named by
                // hashing the spooled tar.
                assert_eq!(*digest, digest::sha256_hex(&layer));
                assert_eq!(std::fs::read(spool.path()).unwrap(), layer);
            }
            SaveItem::Config { .. } => panic!("expected layer second"),
        }
    }

    #[test]
    fn test_content_addressable_stream_uses_inspect_diff_ids() {
        // When inspect supplied diffIDs, layers are named from them
        // without rehashing.
        let layer = layer_tar();
        let diff_hex = digest::sha256_hex(&layer);
        let mut builder = tar::Builder::new(Vec::new());
        entry(&mut builder, "aaaa.json", b"{}");
        entry(&mut builder, "1111/layer.tar", &layer);
        let manifest =
            br#"[{"Config": "aaaa.json", "RepoTags": ["img:v1"], "Layers": ["1111/layer.tar"]}]"#;
        entry(&mut builder, "manifest.json", manifest);
        let stream = builder.into_inner().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let pre = Precomputed {
            config_hex: Some("aaaa".to_string()),
            diff_ids: vec![diff_hex.clone()],
        };
        parse_save_stream(&stream[..], pre, None, &tx).unwrap();
        drop(tx);

        let items = drain(&mut rx);
        match items.last().unwrap() {
            SaveItem::Layer { digest, .. } => assert_eq!(*digest, diff_hex),
            SaveItem::Config { .. } => panic!("expected a layer"),
        }
    }

    #[test]
    fn test_oci_stream_precomputed_order() {
        // Layers arrive out of order; the pre-computed manifest restores
        // apply order without manifest.json having been seen yet.
        let layer_a = layer_tar();
        let mut layer_b = layer_tar();
        layer_b.extend_from_slice(&[0u8; 512]);

        let mut builder = tar::Builder::new(Vec::new());
        entry(&mut builder, "oci-layout", b"{\"imageLayoutVersion\":\"1.0.0\"}");
        entry(&mut builder, "blobs/sha256/bbbb", &layer_b);
        entry(&mut builder, "blobs/sha256/aaaa", &layer_a);
        entry(&mut builder, "blobs/sha256/conf", b"{}");
        let manifest = br#"[{"Config": "blobs/sha256/conf", "RepoTags": ["img:v1"], "Layers": ["blobs/sha256/aaaa", "blobs/sha256/bbbb"]}]"#;
        entry(&mut builder, "manifest.json", manifest);
        let stream = builder.into_inner().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let pre = Precomputed {
            config_hex: Some("conf".to_string()),
            diff_ids: vec!["aaaa".to_string(), "bbbb".to_string()],
        };
        parse_save_stream(&stream[..], pre, None, &tx).unwrap();
        drop(tx);

        let items = drain(&mut rx);
        let names: Vec<String> = items
            .iter()
            .map(|i| match i {
                SaveItem::Config { name, .. } => format!("config:{name}"),
                SaveItem::Layer { digest, .. } => format!("layer:{digest}"),
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "config:blobs/sha256/conf".to_string(),
                "layer:aaaa".to_string(),
                "layer:bbbb".to_string(),
            ]
        );
    }

    #[test]
    fn test_legacy_tarball_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        entry(&mut builder, "repositories", b"{}");
        entry(&mut builder, "1111/layer.tar", &layer_tar());
        let stream = builder.into_inner().unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let pre = Precomputed {
            config_hex: None,
            diff_ids: vec![],
        };
        let err = parse_save_stream(&stream[..], pre, None, &tx).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedTarballFormat(_)));
    }

    #[test]
    fn test_compressed_oci_blob_is_decompressed() {
        let layer = layer_tar();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&layer).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        entry(&mut builder, "blobs/sha256/conf", b"{}");
        entry(&mut builder, "blobs/sha256/aaaa", &compressed);
        let manifest = br#"[{"Config": "blobs/sha256/conf", "RepoTags": [], "Layers": ["blobs/sha256/aaaa"]}]"#;
        entry(&mut builder, "manifest.json", manifest);
        let stream = builder.into_inner().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let pre = Precomputed {
            config_hex: None,
            diff_ids: vec![],
        };
        parse_save_stream(&stream[..], pre, None, &tx).unwrap();
        drop(tx);

        let items = drain(&mut rx);
        match items.last().unwrap() {
            SaveItem::Layer { spool, .. } => {
                // The spooled layer is the uncompressed tar.
                assert_eq!(std::fs::read(spool.path()).unwrap(), layer);
            }
            SaveItem::Config { .. } => panic!("expected a layer"),
        }
    }
}
