//! Sink extracting an image into a directory.
//!
//! Layout: the config JSON plus one `<digest>/layer.tar` per layer, tied
//! together by a manifest file written in finalize. Two options change the
//! shape:
//!
//! - `unique_names` stores the manifest as `manifest-<image>-<tag>.json`
//!   and records it in `catalog.json`, letting several images share one
//!   directory and deduplicate layer blobs by digest.
//! - `expand` additionally unpacks each layer literally into
//!   `<digest>/extracted/` and maintains a merged rootfs (whiteouts
//!   resolved) named after the manifest stem.
//!
//! Layer blobs are always stored verbatim; whiteouts are only ever
//! resolved in the merged view.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tracing::{debug, info};

use occystrap_core::element::{Element, ImageSink};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::SaveManifestEntry;

use crate::extract::{extract_literal, MergedTree};

/// image -> tag -> manifest filename.
type Catalog = BTreeMap<String, BTreeMap<String, String>>;

/// Writes an image into a directory.
pub struct DirectorySink {
    image: String,
    tag: String,
    root: PathBuf,
    unique_names: bool,
    expand: bool,
    manifest: SaveManifestEntry,
    merged: Option<MergedTree>,
}

impl DirectorySink {
    /// Creates the output directory (and merged tree when expanding).
    pub fn new(
        image: impl Into<String>,
        tag: impl Into<String>,
        root: impl Into<PathBuf>,
        unique_names: bool,
        expand: bool,
    ) -> Result<Self> {
        let image = image.into();
        let tag = tag.into();
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut manifest = SaveManifestEntry::new(&image, &tag);
        if unique_names {
            manifest.image_name = Some(image.clone());
        }

        let mut sink = Self {
            image,
            tag,
            root,
            unique_names,
            expand,
            manifest,
            merged: None,
        };
        if expand {
            let merged_root = sink.root.join(sink.merged_dir_name());
            sink.merged = Some(MergedTree::new(merged_root)?);
        }
        Ok(sink)
    }

    fn manifest_filename(&self) -> String {
        if self.unique_names {
            format!(
                "manifest-{}-{}.json",
                self.image.replace('/', "_"),
                self.tag.replace('/', "_")
            )
        } else {
            "manifest.json".to_string()
        }
    }

    /// The merged rootfs is named for the manifest, minus its extension.
    fn merged_dir_name(&self) -> String {
        self.manifest_filename()
            .trim_end_matches(".json")
            .to_string()
    }

    fn layer_file(&self, digest: &str) -> PathBuf {
        self.root.join(digest).join("layer.tar")
    }

    fn expand_layer(&mut self, digest: &str) -> Result<()> {
        let layer_file = self.layer_file(digest);

        let extracted = self.root.join(digest).join("extracted");
        if !extracted.exists() {
            debug!(layer = %digest, "expanding layer");
            extract_literal(File::open(&layer_file)?, &extracted)?;
        }

        if let Some(merged) = &mut self.merged {
            merged.apply_layer(File::open(&layer_file)?)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ImageSink for DirectorySink {
    fn wants_layer(&self, digest: &str) -> bool {
        // In a shared directory a blob that is already on disk does not
        // need to travel again.
        !(self.unique_names && self.layer_file(digest).exists())
    }

    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data, .. } => {
                debug!(config = %name, "writing config");
                let path = self.root.join(&name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Re-serialized pretty with sorted keys so the on-disk
                // copy is stable and diffable.
                let parsed: serde_json::Value = serde_json::from_slice(&data)?;
                fs::write(&path, serde_json::to_vec_pretty(&parsed)?)?;
                self.manifest.config = name;
                Ok(())
            }
            Element::Layer { name, blob } => {
                let layer_dir = self.root.join(&name);
                fs::create_dir_all(&layer_dir)?;
                let layer_path = format!("{name}/layer.tar");
                self.manifest.layers.push(layer_path);

                match blob {
                    Some(blob) => {
                        debug!(layer = %name, "writing layer");
                        let mut file = File::create(self.layer_file(&name))?;
                        std::io::copy(&mut blob.reader()?, &mut file)?;
                        file.flush()?;
                    }
                    None => {
                        // Declined via wants_layer: the blob is already in
                        // the shared directory.
                        if !self.layer_file(&name).exists() {
                            return Err(ImageError::Sink(format!(
                                "layer {name} was skipped but is not present in {}",
                                self.root.display()
                            )));
                        }
                        debug!(layer = %name, "layer already in directory");
                    }
                }

                if self.expand {
                    self.expand_layer(&name)?;
                }
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let manifest_filename = self.manifest_filename();
        let manifest_path = self.root.join(&manifest_filename);
        fs::write(
            &manifest_path,
            serde_json::to_vec_pretty(&vec![self.manifest.clone()])?,
        )?;

        update_catalog(&self.root, &self.image, &self.tag, &manifest_filename)?;
        info!(
            path = %self.root.display(),
            manifest = %manifest_filename,
            "directory write complete"
        );
        Ok(())
    }
}

/// Records `image:tag -> manifest file` in the directory's `catalog.json`.
///
/// The read-modify-write runs under an exclusive OS file lock so that
/// concurrent occystrap processes targeting the same shared directory do
/// not lose updates.
pub(crate) fn update_catalog(
    root: &Path,
    image: &str,
    tag: &str,
    manifest_filename: &str,
) -> Result<()> {
    let lock = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(root.join(".catalog.lock"))?;
    lock.lock_exclusive()?;

    let catalog_path = root.join("catalog.json");
    let mut catalog: Catalog = match fs::read(&catalog_path) {
        Ok(data) => serde_json::from_slice(&data)?,
        Err(_) => Catalog::new(),
    };
    catalog
        .entry(image.to_string())
        .or_default()
        .insert(tag.to_string(), manifest_filename.to_string());
    fs::write(&catalog_path, serde_json::to_vec_pretty(&catalog)?)?;

    lock.unlock()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tempfile::tempdir;

    use occystrap_core::manifest::SchemaFamily;

    fn test_layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    async fn write_image(sink: &mut DirectorySink, layers: &[(&str, Vec<u8>)]) {
        sink.process_element(Element::Config {
            name: "cfg.json".to_string(),
            data: Bytes::from_static(b"{\"rootfs\":{\"type\":\"layers\",\"diff_ids\":[]}}"),
            family: SchemaFamily::Docker,
        })
        .await
        .unwrap();
        for (digest, data) in layers {
            sink.process_element(Element::Layer {
                name: (*digest).to_string(),
                blob: Some(occystrap_core::element::Blob::from_bytes(data.clone())),
            })
            .await
            .unwrap();
        }
        sink.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_basic_layout() {
        let dir = tempdir().unwrap();
        let mut sink = DirectorySink::new("app", "v1", dir.path(), false, false).unwrap();
        let layer = test_layer(&[("etc/motd", b"hi")]);
        write_image(&mut sink, &[("1111", layer.clone())]).await;

        assert!(dir.path().join("cfg.json").exists());
        assert_eq!(fs::read(dir.path().join("1111/layer.tar")).unwrap(), layer);

        let manifest: Vec<SaveManifestEntry> =
            serde_json::from_slice(&fs::read(dir.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest[0].layers, vec!["1111/layer.tar"]);
    }

    #[tokio::test]
    async fn test_expand_whiteout_semantics() {
        let dir = tempdir().unwrap();
        let mut sink = DirectorySink::new("app", "v1", dir.path(), false, true).unwrap();

        let lower = test_layer(&[("foo", b"data"), ("bar", b"other")]);
        let upper = test_layer(&[(".wh.foo", b"")]);
        write_image(&mut sink, &[("1111", lower), ("2222", upper)]).await;

        // Per-layer views retain their literal contents, whiteouts included.
        assert!(dir.path().join("1111/extracted/foo").exists());
        assert!(dir.path().join("2222/extracted/.wh.foo").exists());

        // The merged view resolves the deletion.
        let merged = dir.path().join("manifest");
        assert!(merged.join("bar").exists());
        assert!(!merged.join("foo").exists());
        assert!(!merged.join(".wh.foo").exists());
    }

    #[tokio::test]
    async fn test_unique_names_shares_layers_and_updates_catalog() {
        let dir = tempdir().unwrap();
        let layer = test_layer(&[("shared", b"blob")]);

        let mut first = DirectorySink::new("team/app", "v1", dir.path(), true, false).unwrap();
        write_image(&mut first, &[("1111", layer.clone())]).await;

        let mut second = DirectorySink::new("team/app", "v2", dir.path(), true, false).unwrap();
        // The shared blob is already on disk, so the second image should
        // not ask for it again.
        assert!(!second.wants_layer("1111"));
        second
            .process_element(Element::Config {
                name: "cfg2.json".to_string(),
                data: Bytes::from_static(b"{}"),
                family: SchemaFamily::Docker,
            })
            .await
            .unwrap();
        second
            .process_element(Element::Layer {
                name: "1111".to_string(),
                blob: None,
            })
            .await
            .unwrap();
        second.finalize().await.unwrap();

        assert!(dir.path().join("manifest-team_app-v1.json").exists());
        assert!(dir.path().join("manifest-team_app-v2.json").exists());

        let catalog: Catalog =
            serde_json::from_slice(&fs::read(dir.path().join("catalog.json")).unwrap()).unwrap();
        assert_eq!(
            catalog["team/app"]["v1"],
            "manifest-team_app-v1.json".to_string()
        );
        assert_eq!(
            catalog["team/app"]["v2"],
            "manifest-team_app-v2.json".to_string()
        );

        // The skipped layer is still listed in the second manifest.
        let manifest: Vec<SaveManifestEntry> = serde_json::from_slice(
            &fs::read(dir.path().join("manifest-team_app-v2.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest[0].layers, vec!["1111/layer.tar"]);
        assert_eq!(manifest[0].image_name.as_deref(), Some("team/app"));
    }

    #[tokio::test]
    async fn test_skipped_layer_without_blob_on_disk_fails() {
        let dir = tempdir().unwrap();
        let mut sink = DirectorySink::new("app", "v1", dir.path(), true, false).unwrap();
        let err = sink
            .process_element(Element::Layer {
                name: "9999".to_string(),
                blob: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Sink(_)));
    }
}
