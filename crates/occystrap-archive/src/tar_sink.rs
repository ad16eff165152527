//! Sink writing a docker-load compatible v1.2 tarball.

use std::fs::File;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use occystrap_core::element::{Element, ImageSink};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::SaveManifestEntry;

/// Writes an image to a `docker save` style tarball: the config JSON, one
/// `<digest>/layer.tar` per layer (uncompressed, streamed through as it
/// arrives), and a `manifest.json` written in finalize. The outer tarball
/// only ever holds digest-hex names, so it is always USTAR.
pub struct TarballSink {
    path: PathBuf,
    builder: tar::Builder<File>,
    manifest: SaveManifestEntry,
}

impl TarballSink {
    /// Creates the output tarball at `path`.
    pub fn create(
        image: impl Into<String>,
        tag: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let image = image.into();
        let tag = tag.into();
        info!(path = %path.display(), "writing image tarball");
        let builder = tar::Builder::new(File::create(&path)?);
        let manifest = SaveManifestEntry::new(&image, &tag);
        Ok(Self {
            path,
            builder,
            manifest,
        })
    }

    /// The output path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn append(&mut self, name: &str, size: u64, data: impl std::io::Read) -> Result<()> {
        let mut header = tar::Header::new_ustar();
        header.set_path(name)?;
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        self.builder.append(&header, data)?;
        Ok(())
    }
}

#[async_trait]
impl ImageSink for TarballSink {
    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data, .. } => {
                debug!(config = %name, "writing config to tarball");
                self.append(&name, data.len() as u64, &data[..])?;
                self.manifest.config = name;
                Ok(())
            }
            Element::Layer { name, blob: Some(blob) } => {
                debug!(layer = %name, "writing layer to tarball");
                let layer_path = format!("{name}/layer.tar");
                self.append(&layer_path, blob.len()?, blob.reader()?)?;
                self.manifest.layers.push(layer_path);
                Ok(())
            }
            Element::Layer { name, blob: None } => Err(ImageError::Sink(format!(
                "tarball sink needs layer bytes for {name} but the layer was skipped"
            ))),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        debug!("writing manifest to tarball");
        let manifest = serde_json::to_vec(&vec![self.manifest.clone()])?;
        self.append("manifest.json", manifest.len() as u64, &manifest[..])?;
        self.builder.finish()?;
        info!(path = %self.path.display(), "tarball complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use bytes::Bytes;
    use tempfile::tempdir;

    use occystrap_core::element::Blob;
    use occystrap_core::manifest::SchemaFamily;

    #[tokio::test]
    async fn test_v12_layout() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.tar");
        let mut sink = TarballSink::create("example/app", "latest", &out).unwrap();

        sink.process_element(Element::Config {
            name: "cfg.json".to_string(),
            data: Bytes::from_static(b"{}"),
            family: SchemaFamily::Docker,
        })
        .await
        .unwrap();
        sink.process_element(Element::Layer {
            name: "1111".to_string(),
            blob: Some(Blob::from_bytes(&b"layer-one"[..])),
        })
        .await
        .unwrap();
        sink.process_element(Element::Layer {
            name: "2222".to_string(),
            blob: Some(Blob::from_bytes(&b"layer-two"[..])),
        })
        .await
        .unwrap();
        sink.finalize().await.unwrap();

        let mut archive = tar::Archive::new(File::open(&out).unwrap());
        let mut names = Vec::new();
        let mut manifest_data = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name == "manifest.json" {
                entry.read_to_end(&mut manifest_data).unwrap();
            }
            names.push(name);
        }
        assert_eq!(
            names,
            vec!["cfg.json", "1111/layer.tar", "2222/layer.tar", "manifest.json"]
        );

        let manifest: Vec<SaveManifestEntry> = serde_json::from_slice(&manifest_data).unwrap();
        assert_eq!(manifest[0].config, "cfg.json");
        assert_eq!(manifest[0].repo_tags, vec!["app:latest"]);
        assert_eq!(
            manifest[0].layers,
            vec!["1111/layer.tar", "2222/layer.tar"]
        );
    }

    #[tokio::test]
    async fn test_skipped_layer_is_an_error() {
        let dir = tempdir().unwrap();
        let mut sink =
            TarballSink::create("app", "v1", dir.path().join("out.tar")).unwrap();
        let err = sink
            .process_element(Element::Layer {
                name: "1111".to_string(),
                blob: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Sink(_)));
    }
}
