//! Layer extraction.
//!
//! Two views of a layer exist on disk: the *literal* view, where every tar
//! member including whiteout files is written out exactly as stored, and
//! the *merged* view, where layers stack and whiteouts delete content from
//! the layers below them.
//!
//! Whiteout convention: a member whose basename starts with `.wh.` marks
//! the rest of its name deleted from lower layers; the literal basename
//! `.wh..wh..opq` marks its directory opaque (all lower-layer content
//! hidden).

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use occystrap_core::error::Result;

/// Whiteout prefix for deleted paths.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Opaque directory marker.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// A merged rootfs built by stacking layers in apply order.
pub struct MergedTree {
    root: PathBuf,
    layers_applied: usize,
}

impl MergedTree {
    /// Creates (or reuses) the merged tree root.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            layers_applied: 0,
        })
    }

    /// The merged tree root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Applies one layer tar on top of the tree, resolving whiteouts.
    ///
    /// Deletions happen before the rest of the member is considered, which
    /// preserves apply-order semantics when a layer both deletes a path and
    /// recreates it.
    pub fn apply_layer<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(rel) = sanitize_path(&entry.path_bytes()) else {
                warn!(
                    path = %String::from_utf8_lossy(&entry.path_bytes()),
                    "ignoring layer member with unsafe path"
                );
                continue;
            };

            let file_name = rel
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();

            if file_name == WHITEOUT_OPAQUE {
                if let Some(parent) = rel.parent() {
                    let dir = self.root.join(parent);
                    debug!(dir = %dir.display(), "opaque directory marker");
                    if dir.exists() {
                        clear_directory(&dir)?;
                    }
                }
                continue;
            }

            if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                let target_rel = rel
                    .parent()
                    .map(|p| p.join(target_name))
                    .unwrap_or_else(|| PathBuf::from(target_name));
                let target = self.root.join(&target_rel);
                debug!(target = %target.display(), "whiteout");
                remove_existing(&target)?;
                continue;
            }

            unpack_entry(&mut entry, &self.root, &rel)?;
        }
        self.layers_applied += 1;
        Ok(())
    }

    /// Number of layers applied so far.
    #[must_use]
    pub fn layers_applied(&self) -> usize {
        self.layers_applied
    }
}

/// Extracts a layer literally: whiteout files stay on disk as ordinary
/// files, nothing is deleted.
pub fn extract_literal<R: Read>(reader: R, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(rel) = sanitize_path(&entry.path_bytes()) else {
            warn!(
                path = %String::from_utf8_lossy(&entry.path_bytes()),
                "ignoring layer member with unsafe path"
            );
            continue;
        };
        unpack_entry(&mut entry, dest, &rel)?;
    }
    Ok(())
}

/// Rejects absolute paths and anything containing `..`.
pub(crate) fn sanitize_path(path_bytes: &[u8]) -> Option<PathBuf> {
    let path = PathBuf::from(String::from_utf8_lossy(path_bytes).into_owned());
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Writes one tar member under `root`, replacing whatever was there.
pub(crate) fn unpack_entry<R: Read>(
    entry: &mut tar::Entry<R>,
    root: &Path,
    rel: &Path,
) -> Result<()> {
    let dest = root.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let entry_type = entry.header().entry_type();
    match entry_type {
        tar::EntryType::Directory => {
            if dest.exists() && !dest.is_dir() {
                fs::remove_file(&dest)?;
            }
            fs::create_dir_all(&dest)?;
            set_mode(&dest, entry.header().mode().unwrap_or(0o755));
        }
        tar::EntryType::Regular | tar::EntryType::Continuous => {
            remove_existing(&dest)?;
            let mut file = File::create(&dest)?;
            std::io::copy(entry, &mut file)?;
            set_mode(&dest, entry.header().mode().unwrap_or(0o644));
        }
        tar::EntryType::Symlink => {
            if let Some(target) = entry.link_name()? {
                remove_existing(&dest)?;
                #[cfg(unix)]
                std::os::unix::fs::symlink(&target, &dest)?;
            }
        }
        tar::EntryType::Link => {
            if let Some(target) = entry.link_name()? {
                let source = root.join(target.as_ref());
                if source.exists() {
                    remove_existing(&dest)?;
                    fs::hard_link(&source, &dest)?;
                }
            }
        }
        tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
            // Creating these needs privileges the extractor usually lacks.
            debug!(path = %rel.display(), ?entry_type, "skipping special file");
        }
        _ => {
            debug!(path = %rel.display(), ?entry_type, "skipping unsupported entry type");
        }
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

fn clear_directory(dir: &Path) -> Result<()> {
    for child in fs::read_dir(dir)? {
        let path = child?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

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

    #[test]
    fn test_merged_simple_layer() {
        let dir = tempdir().unwrap();
        let mut tree = MergedTree::new(dir.path().join("rootfs")).unwrap();

        let layer = test_layer(&[("file1.txt", b"hello"), ("dir/file2.txt", b"world")]);
        tree.apply_layer(&layer[..]).unwrap();

        assert!(tree.root().join("file1.txt").exists());
        assert_eq!(
            fs::read_to_string(tree.root().join("dir/file2.txt")).unwrap(),
            "world"
        );
        assert_eq!(tree.layers_applied(), 1);
    }

    #[test]
    fn test_merged_whiteout_deletes_lower_content() {
        let dir = tempdir().unwrap();
        let mut tree = MergedTree::new(dir.path().join("rootfs")).unwrap();

        let lower = test_layer(&[("keep.txt", b"keep"), ("gone.txt", b"gone")]);
        let upper = test_layer(&[(".wh.gone.txt", b"")]);
        tree.apply_layer(&lower[..]).unwrap();
        tree.apply_layer(&upper[..]).unwrap();

        assert!(tree.root().join("keep.txt").exists());
        assert!(!tree.root().join("gone.txt").exists());
        // The marker itself never appears in the merged view.
        assert!(!tree.root().join(".wh.gone.txt").exists());
    }

    #[test]
    fn test_merged_opaque_clears_directory() {
        let dir = tempdir().unwrap();
        let mut tree = MergedTree::new(dir.path().join("rootfs")).unwrap();

        let lower = test_layer(&[("app/old1", b"x"), ("app/old2", b"y")]);
        let upper = test_layer(&[("app/.wh..wh..opq", b""), ("app/new", b"z")]);
        tree.apply_layer(&lower[..]).unwrap();
        tree.apply_layer(&upper[..]).unwrap();

        assert!(!tree.root().join("app/old1").exists());
        assert!(!tree.root().join("app/old2").exists());
        assert!(tree.root().join("app/new").exists());
    }

    #[test]
    fn test_merged_whiteout_then_recreate_in_later_layer() {
        let dir = tempdir().unwrap();
        let mut tree = MergedTree::new(dir.path().join("rootfs")).unwrap();

        let first = test_layer(&[("data.txt", b"old")]);
        let second = test_layer(&[(".wh.data.txt", b"")]);
        let third = test_layer(&[("data.txt", b"new")]);
        tree.apply_layer(&first[..]).unwrap();
        tree.apply_layer(&second[..]).unwrap();
        tree.apply_layer(&third[..]).unwrap();

        assert_eq!(
            fs::read_to_string(tree.root().join("data.txt")).unwrap(),
            "new"
        );
    }

    #[test]
    fn test_literal_extraction_keeps_whiteouts() {
        let dir = tempdir().unwrap();
        let layer = test_layer(&[("real.txt", b"data"), (".wh.deleted", b"")]);
        extract_literal(&layer[..], dir.path()).unwrap();

        assert!(dir.path().join("real.txt").exists());
        assert!(dir.path().join(".wh.deleted").exists());
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        assert!(sanitize_path(b"/etc/passwd").is_none());
        assert!(sanitize_path(b"../escape").is_none());
        assert!(sanitize_path(b"a/../../escape").is_none());
        assert_eq!(
            sanitize_path(b"./usr/bin/env").unwrap(),
            PathBuf::from("usr/bin/env")
        );
    }
}
