//! Sink producing overlayfs-ready layer directories.
//!
//! Each layer is stored as `<digest>/layer.tar` plus an extracted
//! `<digest>/layer/` directory where whiteouts are translated into the
//! metadata overlayfs expects: an opaque marker becomes the
//! `trusted.overlay.opaque=y` xattr on its directory, and a `.wh.<name>`
//! marker becomes a 0:0 character device node. The resulting directories
//! can be stacked directly with `mount -t overlay -o lowerdir=...`.
//!
//! Writing device nodes and trusted xattrs requires root.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use occystrap_core::element::{Blob, Element, ImageSink};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::SaveManifestEntry;

use crate::dir_sink::update_catalog;
use crate::extract::{sanitize_path, unpack_entry, WHITEOUT_OPAQUE, WHITEOUT_PREFIX};

/// Writes an image as overlay-mountable layer directories.
pub struct MountsSink {
    image: String,
    tag: String,
    root: PathBuf,
    manifest: SaveManifestEntry,
}

impl MountsSink {
    /// Creates the output directory.
    pub fn new(
        image: impl Into<String>,
        tag: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let image = image.into();
        let tag = tag.into();
        let root = root.into();
        fs::create_dir_all(&root)?;
        let manifest = SaveManifestEntry::new(&image, &tag);
        Ok(Self {
            image,
            tag,
            root,
            manifest,
        })
    }

    fn layer_file(&self, digest: &str) -> PathBuf {
        self.root.join(digest).join("layer.tar")
    }

    /// Extracts a layer with whiteouts rewritten as overlayfs metadata.
    fn extract_overlay_layer(&self, digest: &str, blob: &Blob) -> Result<()> {
        let layer_root = self.root.join(digest).join("layer");
        fs::create_dir_all(&layer_root)?;

        let mut archive = tar::Archive::new(blob.reader()?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(rel) = sanitize_path(&entry.path_bytes()) else {
                continue;
            };
            let file_name = rel
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();

            if file_name == WHITEOUT_OPAQUE {
                // Deleted directory contents, but only for layers below
                // this one.
                let dir = match rel.parent() {
                    Some(parent) => layer_root.join(parent),
                    None => layer_root.clone(),
                };
                fs::create_dir_all(&dir)?;
                debug!(dir = %dir.display(), "marking directory opaque");
                set_opaque_xattr(&dir)?;
            } else if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                // A single deleted path, which might not be a file.
                let node = match rel.parent() {
                    Some(parent) => layer_root.join(parent).join(target),
                    None => layer_root.join(target),
                };
                if let Some(parent) = node.parent() {
                    fs::create_dir_all(parent)?;
                }
                debug!(node = %node.display(), "writing whiteout device node");
                make_whiteout_node(&node)?;
            } else {
                unpack_entry(&mut entry, &layer_root, &rel)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageSink for MountsSink {
    fn wants_layer(&self, digest: &str) -> bool {
        !self.layer_file(digest).exists()
    }

    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data, .. } => {
                let parsed: serde_json::Value = serde_json::from_slice(&data)?;
                fs::write(
                    self.root.join(&name),
                    serde_json::to_vec_pretty(&parsed)?,
                )?;
                self.manifest.config = name;
                Ok(())
            }
            Element::Layer { name, blob } => {
                let layer_path = format!("{name}/layer.tar");
                self.manifest.layers.push(layer_path);

                match blob {
                    Some(blob) => {
                        debug!(layer = %name, "writing overlay layer");
                        fs::create_dir_all(self.root.join(&name))?;
                        let mut file = File::create(self.layer_file(&name))?;
                        std::io::copy(&mut blob.reader()?, &mut file)?;
                        file.flush()?;
                        self.extract_overlay_layer(&name, &blob)?;
                    }
                    None => {
                        debug!(layer = %name, "layer already in output directory");
                    }
                }
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        fs::write(
            self.root.join("manifest.json"),
            serde_json::to_vec_pretty(&vec![self.manifest.clone()])?,
        )?;
        update_catalog(&self.root, &self.image, &self.tag, "manifest.json")?;
        info!(path = %self.root.display(), "mounts write complete");
        Ok(())
    }
}

#[cfg(unix)]
fn set_opaque_xattr(dir: &Path) -> Result<()> {
    rustix::fs::setxattr(
        dir,
        "trusted.overlay.opaque",
        b"y",
        rustix::fs::XattrFlags::empty(),
    )
    .map_err(|e| ImageError::Sink(format!("setxattr on {}: {e}", dir.display())))
}

#[cfg(unix)]
fn make_whiteout_node(node: &Path) -> Result<()> {
    use rustix::fs::{mknodat, FileType, Mode, CWD};
    mknodat(
        CWD,
        node,
        FileType::CharacterDevice,
        Mode::from_raw_mode(0o600),
        rustix::fs::makedev(0, 0),
    )
    .map_err(|e| ImageError::Sink(format!("mknod at {}: {e}", node.display())))
}

#[cfg(not(unix))]
fn set_opaque_xattr(_dir: &Path) -> Result<()> {
    Err(ImageError::Sink(
        "mounts output requires a unix platform".to_string(),
    ))
}

#[cfg(not(unix))]
fn make_whiteout_node(_node: &Path) -> Result<()> {
    Err(ImageError::Sink(
        "mounts output requires a unix platform".to_string(),
    ))
}
