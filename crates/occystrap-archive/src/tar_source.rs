//! Image source reading a saved tarball from disk.
//!
//! Accepts both layouts `docker save` has produced since 1.10: the
//! content-addressable layout (`<digest>/layer.tar`) and the OCI-compatible
//! layout of Docker 25+ (`blobs/sha256/<digest>`, where layer blobs may be
//! compressed). Emitted layer elements are named by diffID (the SHA-256 of
//! the uncompressed tar), not by the archive's internal layer paths. The
//! legacy pre-1.10 "parent chain" layout is rejected with a conversion
//! hint.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use occystrap_core::compression::decompress_to_spool;
use occystrap_core::digest;
use occystrap_core::element::{new_spool, Blob, Element, ImageSink, ImageSource};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::{config_diff_ids, SaveManifestEntry, SchemaFamily};

/// An image source backed by a `docker save` tarball on disk.
#[derive(Debug)]
pub struct TarballSource {
    path: PathBuf,
    entry: SaveManifestEntry,
    image: String,
    tag: String,
    temp_dir: Option<PathBuf>,
}

impl TarballSource {
    /// Opens a tarball, locating and parsing its `manifest.json`.
    pub fn open(path: impl Into<PathBuf>, temp_dir: Option<PathBuf>) -> Result<Self> {
        let path = path.into();
        info!(path = %path.display(), "opening saved tarball");

        let mut manifest_data: Option<Vec<u8>> = None;
        let mut saw_repositories = false;
        let mut archive = tar::Archive::new(File::open(&path)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            match name.trim_start_matches("./") {
                "manifest.json" => {
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data)?;
                    manifest_data = Some(data);
                }
                "repositories" => saw_repositories = true,
                _ => {}
            }
        }

        let Some(manifest_data) = manifest_data else {
            if saw_repositories {
                return Err(ImageError::UnsupportedTarballFormat(
                    "this tarball is in the legacy pre-1.10 layout; convert it with \
                     'docker load' followed by 'docker save'"
                        .to_string(),
                ));
            }
            return Err(ImageError::UnsupportedTarballFormat(
                "no manifest.json found; not a docker save tarball".to_string(),
            ));
        };

        let entries: Vec<SaveManifestEntry> = serde_json::from_slice(&manifest_data)?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            ImageError::UnsupportedTarballFormat("manifest.json lists no images".to_string())
        })?;

        // Image identity comes from RepoTags when present.
        let (image, tag) = match entry.repo_tags.first() {
            Some(repo_tag) => match repo_tag.rsplit_once(':') {
                Some((image, tag)) => (image.to_string(), tag.to_string()),
                None => (repo_tag.clone(), "latest".to_string()),
            },
            None => ("unknown".to_string(), "unknown".to_string()),
        };

        Ok(Self {
            path,
            entry,
            image,
            tag,
            temp_dir,
        })
    }

    /// Reads the config blob out of the archive.
    fn read_config(&self) -> Result<Vec<u8>> {
        let mut archive = tar::Archive::new(File::open(&self.path)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes())
                .trim_start_matches("./")
                .to_string();
            if name == self.entry.config {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                return Ok(data);
            }
        }
        Err(ImageError::UnsupportedTarballFormat(format!(
            "config {} missing from tarball",
            self.entry.config
        )))
    }
}

#[async_trait]
impl ImageSource for TarballSource {
    fn image(&self) -> &str {
        &self.image
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn deliver(&mut self, sink: &mut (dyn ImageSink + Send)) -> Result<()> {
        // The config comes out first: its rootfs.diff_ids name the layer
        // elements. Layer paths in the archive carry save-format IDs or
        // compressed blob digests, neither of which is the diffID the rest
        // of the pipeline keys on.
        let config_data = self.read_config()?;
        let diff_ids = config_diff_ids(&config_data);

        // Consult the admission check up front so undesired layers are not
        // spooled at all.
        let wanted: Vec<bool> = self
            .entry
            .layers
            .iter()
            .enumerate()
            .map(|(idx, _)| match diff_ids.get(idx) {
                Some(diff_hex) => sink.wants_layer(diff_hex),
                None => true,
            })
            .collect();

        let mut spooled: HashMap<String, NamedTempFile> = HashMap::new();
        let mut archive = tar::Archive::new(File::open(&self.path)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes())
                .trim_start_matches("./")
                .to_string();

            let Some(idx) = self.entry.layers.iter().position(|l| l == &name) else {
                continue;
            };
            if !wanted.get(idx).copied().unwrap_or(false) {
                continue;
            }

            debug!(layer = %name, "spooling layer");
            // OCI-layout blobs may be gzip or zstd compressed.
            let spool = if name.starts_with("blobs/") {
                decompress_to_spool(&mut entry, self.temp_dir.as_deref())?
            } else {
                let mut spool = new_spool(self.temp_dir.as_deref())?;
                std::io::copy(&mut entry, &mut spool)?;
                spool
            };
            spooled.insert(name, spool);
        }

        sink.process_element(Element::Config {
            name: self.entry.config.clone(),
            data: config_data.into(),
            family: SchemaFamily::Docker,
        })
        .await?;

        info!(count = self.entry.layers.len(), "image has layers");
        for (idx, layer_path) in self.entry.layers.iter().enumerate() {
            let element = if wanted.get(idx).copied().unwrap_or(false) {
                let spool = spooled.remove(layer_path.as_str()).ok_or_else(|| {
                    ImageError::UnsupportedTarballFormat(format!(
                        "layer {layer_path} missing from tarball"
                    ))
                })?;
                // The element name is the diffID of the (decompressed)
                // spooled bytes.
                let diff_hex = digest::sha256_hex_reader(&mut spool.reopen()?)?;
                Element::Layer {
                    name: diff_hex,
                    blob: Some(Blob::from_spool(spool)),
                }
            } else {
                // wants_layer was only consulted where a diffID was known.
                let diff_hex = diff_ids[idx].clone();
                info!(digest = %diff_hex, "sink declined layer");
                Element::Layer {
                    name: diff_hex,
                    blob: None,
                }
            };
            sink.process_element(element).await?;
        }

        info!("tarball read complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    fn write_tarball(dir: &std::path::Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            entry(&mut builder, name, data);
        }
        let data = builder.into_inner().unwrap();
        let path = dir.join("image.tar");
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_open_parses_repo_tags() {
        let dir = tempdir().unwrap();
        let manifest = br#"[{"Config": "abc.json", "RepoTags": ["registry.example/team/app:v2"], "Layers": []}]"#;
        let path = write_tarball(dir.path(), &[("manifest.json", manifest)]);

        let source = TarballSource::open(path, None).unwrap();
        assert_eq!(source.image(), "registry.example/team/app");
        assert_eq!(source.tag(), "v2");
    }

    #[test]
    fn test_legacy_rejected_with_hint() {
        let dir = tempdir().unwrap();
        let path = write_tarball(dir.path(), &[("repositories", b"{}")]);

        let err = TarballSource::open(path, None).unwrap_err();
        match err {
            ImageError::UnsupportedTarballFormat(msg) => {
                assert!(msg.contains("pre-1.10"));
                assert!(msg.contains("docker load"));
            }
            other => panic!("expected UnsupportedTarballFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_not_a_save_tarball() {
        let dir = tempdir().unwrap();
        let path = write_tarball(dir.path(), &[("random.txt", b"hi")]);
        assert!(matches!(
            TarballSource::open(path, None),
            Err(ImageError::UnsupportedTarballFormat(_))
        ));
    }

    fn layer_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        entry(&mut builder, "bin/true", b"#!/bin/sh\n");
        builder.into_inner().unwrap()
    }

    struct Collector {
        names: Vec<String>,
        layer_bytes: Vec<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl ImageSink for Collector {
        async fn process_element(&mut self, element: Element) -> Result<()> {
            match element {
                Element::Config { name, .. } => self.names.push(format!("config:{name}")),
                Element::Layer { name, blob } => {
                    self.names.push(format!("layer:{name}"));
                    self.layer_bytes
                        .push(blob.map(|b| b.to_vec().unwrap()));
                }
            }
            Ok(())
        }

        async fn finalize(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deliver_content_addressable() {
        let dir = tempdir().unwrap();
        let layer = layer_tar();
        // The save-format directory name (1111) is not the diffID.
        let manifest = br#"[{"Config": "abc.json", "RepoTags": ["app:v1"], "Layers": ["1111/layer.tar"]}]"#;
        let path = write_tarball(
            dir.path(),
            &[
                ("abc.json", b"{}"),
                ("1111/layer.tar", &layer),
                ("manifest.json", manifest),
            ],
        );

        let mut source = TarballSource::open(path, None).unwrap();
        let mut sink = Collector {
            names: vec![],
            layer_bytes: vec![],
        };
        source.deliver(&mut sink).await.unwrap();

        let diff_hex = digest::sha256_hex(&layer);
        assert_eq!(
            sink.names,
            vec!["config:abc.json".to_string(), format!("layer:{diff_hex}")]
        );
        assert_eq!(sink.layer_bytes[0].as_deref(), Some(layer.as_slice()));
    }

    #[tokio::test]
    async fn test_deliver_oci_layout_names_layers_by_diff_id() {
        let dir = tempdir().unwrap();
        let layer = layer_tar();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&layer).unwrap();
        let compressed = encoder.finish().unwrap();

        // The blob filename carries the compressed digest; the element
        // must be named by the diffID of the decompressed tar.
        let compressed_hex = digest::sha256_hex(&compressed);
        let diff_hex = digest::sha256_hex(&layer);
        assert_ne!(compressed_hex, diff_hex);

        let manifest = format!(
            r#"[{{"Config": "blobs/sha256/conf", "RepoTags": ["app:v1"], "Layers": ["blobs/sha256/{compressed_hex}"]}}]"#
        );
        let path = write_tarball(
            dir.path(),
            &[
                ("blobs/sha256/conf", b"{}"),
                (&format!("blobs/sha256/{compressed_hex}"), &compressed),
                ("manifest.json", manifest.as_bytes()),
            ],
        );

        let mut source = TarballSource::open(path, None).unwrap();
        let mut sink = Collector {
            names: vec![],
            layer_bytes: vec![],
        };
        source.deliver(&mut sink).await.unwrap();

        assert_eq!(
            sink.names,
            vec![
                "config:blobs/sha256/conf".to_string(),
                format!("layer:{diff_hex}")
            ]
        );
        // Emitted layer bytes are the decompressed tar.
        assert_eq!(sink.layer_bytes[0].as_deref(), Some(layer.as_slice()));
    }

    #[tokio::test]
    async fn test_deliver_skips_layer_by_diff_id() {
        let dir = tempdir().unwrap();
        let layer = layer_tar();
        let diff_hex = digest::sha256_hex(&layer);
        let config = format!(
            r#"{{"rootfs":{{"type":"layers","diff_ids":["sha256:{diff_hex}"]}}}}"#
        );
        let manifest = br#"[{"Config": "abc.json", "RepoTags": ["app:v1"], "Layers": ["1111/layer.tar"]}]"#;
        let path = write_tarball(
            dir.path(),
            &[
                ("abc.json", config.as_bytes()),
                ("1111/layer.tar", &layer),
                ("manifest.json", manifest),
            ],
        );

        struct Decliner {
            names: Vec<String>,
        }

        #[async_trait]
        impl ImageSink for Decliner {
            fn wants_layer(&self, _digest: &str) -> bool {
                false
            }

            async fn process_element(&mut self, element: Element) -> Result<()> {
                if let Element::Layer { name, blob } = element {
                    assert!(blob.is_none());
                    self.names.push(name);
                }
                Ok(())
            }

            async fn finalize(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut source = TarballSource::open(path, None).unwrap();
        let mut sink = Decliner { names: vec![] };
        source.deliver(&mut sink).await.unwrap();

        // The declined layer is still announced, named by its diffID from
        // the config.
        assert_eq!(sink.names, vec![diff_hex]);
    }
}
