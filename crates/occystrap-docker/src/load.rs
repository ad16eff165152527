//! Sink that loads an image into a local Docker or Podman daemon.
//!
//! Builds a docker-load compatible v1.2 tarball in a scratch file, then
//! streams it to `POST /images/load`. The outer tarball contains only
//! digest-hex names and small filenames, so it always fits USTAR.

use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use occystrap_core::element::{new_spool, Element, ImageSink};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::SaveManifestEntry;

use crate::client::DaemonClient;

/// Loads an image into the daemon behind a Unix socket.
pub struct DaemonLoader {
    client: DaemonClient,
    image: String,
    tag: String,
    spool: NamedTempFile,
    builder: tar::Builder<std::fs::File>,
    manifest: SaveManifestEntry,
}

impl DaemonLoader {
    /// Creates a loader for `image:tag`.
    pub fn new(
        client: DaemonClient,
        image: impl Into<String>,
        tag: impl Into<String>,
        temp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let image = image.into();
        let tag = tag.into();
        let spool = new_spool(temp_dir.as_deref())?;
        let builder = tar::Builder::new(spool.reopen()?);
        let manifest = SaveManifestEntry::new(&image, &tag);
        Ok(Self {
            client,
            image,
            tag,
            spool,
            builder,
            manifest,
        })
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
impl ImageSink for DaemonLoader {
    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data, .. } => {
                debug!(config = %name, "adding config to load tarball");
                self.append(&name, data.len() as u64, &data[..])?;
                self.manifest.config = name;
                Ok(())
            }
            Element::Layer { name, blob: Some(blob) } => {
                debug!(layer = %name, "adding layer to load tarball");
                let layer_path = format!("{name}/layer.tar");
                self.append(&layer_path, blob.len()?, blob.reader()?)?;
                self.manifest.layers.push(layer_path);
                Ok(())
            }
            Element::Layer { name, blob: None } => Err(ImageError::Sink(format!(
                "daemon loader needs layer bytes for {name} but the layer was skipped"
            ))),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        debug!("adding manifest to load tarball");
        let manifest = serde_json::to_vec(&vec![self.manifest.clone()])?;
        let mut header = tar::Header::new_ustar();
        header.set_path("manifest.json")?;
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        self.builder.append(&header, &manifest[..])?;
        self.builder.finish()?;

        let file = self.spool.reopen()?;
        let len = file.metadata()?.len();
        info!(
            image = %self.image,
            tag = %self.tag,
            bytes = len,
            "loading image into daemon"
        );
        self.client.post_tar_file("/images/load", file, len).await?;
        info!("image loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use bytes::Bytes;
    use occystrap_core::element::Blob;
    use occystrap_core::manifest::SchemaFamily;

    fn layer_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_path("etc/motd").unwrap();
        header.set_size(6);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"hello\n"[..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_load_tarball_layout() {
        let client = DaemonClient::new("/nonexistent/docker.sock");
        let mut loader = DaemonLoader::new(client, "example/app", "v1", None).unwrap();

        loader
            .process_element(Element::Config {
                name: "abc.json".to_string(),
                data: Bytes::from_static(b"{\"rootfs\":{}}"),
                family: SchemaFamily::Docker,
            })
            .await
            .unwrap();
        let layer = layer_tar();
        loader
            .process_element(Element::Layer {
                name: "def".to_string(),
                blob: Some(Blob::from_bytes(layer.clone())),
            })
            .await
            .unwrap();

        // Finalize fails (no daemon socket in tests) but only after the
        // tarball has been fully assembled.
        let manifest = serde_json::to_vec(&vec![loader.manifest.clone()]).unwrap();
        let err = loader.finalize().await.unwrap_err();
        assert!(matches!(err, ImageError::Daemon(_)));

        let mut names = Vec::new();
        let mut contents: Vec<Vec<u8>> = Vec::new();
        let mut archive = tar::Archive::new(loader.spool.reopen().unwrap());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            contents.push(data);
        }

        assert_eq!(names, vec!["abc.json", "def/layer.tar", "manifest.json"]);
        assert_eq!(contents[1], layer);
        // The manifest recorded before finalize matches what was written,
        // including the short repo tag convention.
        assert_eq!(contents[2], manifest);
        let written: Vec<SaveManifestEntry> = serde_json::from_slice(&contents[2]).unwrap();
        assert_eq!(written[0].config, "abc.json");
        assert_eq!(written[0].repo_tags, vec!["app:v1"]);
        assert_eq!(written[0].layers, vec!["def/layer.tar"]);
    }
}
