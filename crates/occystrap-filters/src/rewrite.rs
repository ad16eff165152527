//! The layer rewrite engine shared by mutating filters.
//!
//! Rewriting a layer changes its bytes, which invalidates its
//! content-address: the rewritten tar is hashed as it is written, the
//! element is renamed to the new digest, and the old→new mapping is
//! remembered so the image config's `rootfs.diff_ids` can be patched
//! before it reaches the sink. Mutating filters therefore buffer the
//! config element until every layer has been seen and emit the patched
//! config last.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use bytes::Bytes;
use tracing::debug;

use occystrap_core::digest::{self, HashingWriter};
use occystrap_core::element::{new_spool, Blob, Element};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::SchemaFamily;
use occystrap_core::tarformat::{
    needs_pax, select_format, TarFormat, USTAR_MAX_ID, USTAR_MAX_LINKNAME, USTAR_MAX_NAME,
    USTAR_MAX_PATH, USTAR_MAX_SIZE,
};

/// A rewritten layer: the new bytes, their digest hex, and how many
/// members were kept or dropped.
pub struct RewrittenLayer {
    pub blob: Blob,
    pub digest_hex: String,
    pub members_kept: usize,
    pub members_dropped: usize,
}

/// Re-tars a layer through a member-wise transform.
///
/// `skip` drops members; `edit` mutates the header of kept members. The
/// output format is chosen by pre-scanning the kept members: USTAR when
/// everything fits, PAX otherwise.
pub fn rewrite_layer(
    blob: &Blob,
    temp_dir: Option<&Path>,
    mut skip: impl FnMut(&str) -> bool,
    mut edit: impl FnMut(&mut tar::Header),
) -> Result<RewrittenLayer> {
    let format = select_format(blob.reader()?, &mut skip)?;
    debug!(?format, "rewriting layer");

    let spool = new_spool(temp_dir)?;
    let mut builder = tar::Builder::new(HashingWriter::new(spool));

    let mut members_kept = 0usize;
    let mut members_dropped = 0usize;
    let mut archive = tar::Archive::new(blob.reader()?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if skip(&path) {
            members_dropped += 1;
            continue;
        }
        members_kept += 1;

        let link = entry
            .link_name_bytes()
            .map(|l| String::from_utf8_lossy(&l).into_owned());
        let mut header = entry.header().clone();
        edit(&mut header);
        append_member(&mut builder, format, &header, &path, link.as_deref(), &mut entry)?;
    }

    let hashing = builder
        .into_inner()
        .map_err(|e| ImageError::Filter(format!("failed to finish rewritten layer: {e}")))?;
    let (mut spool, digest_hex, _len) = hashing.finish();
    std::io::Write::flush(&mut spool)?;

    Ok(RewrittenLayer {
        blob: Blob::from_spool(spool),
        digest_hex,
        members_kept,
        members_dropped,
    })
}

/// Appends one member, emitting PAX extended records for any field USTAR
/// cannot hold. Members that fit USTAR are written as plain USTAR headers
/// even inside a PAX archive.
fn append_member<W: std::io::Write, R: Read>(
    builder: &mut tar::Builder<W>,
    format: TarFormat,
    src: &tar::Header,
    path: &str,
    link: Option<&str>,
    data: &mut R,
) -> Result<()> {
    let size = src.size()?;
    let uid = src.uid()?;
    let gid = src.gid()?;

    let mut out = tar::Header::new_ustar();
    out.set_entry_type(src.entry_type());
    out.set_mode(src.mode()?);
    out.set_mtime(src.mtime()?);
    out.set_size(size);
    if let Ok(Some(major)) = src.device_major() {
        let _ = out.set_device_major(major);
    }
    if let Ok(Some(minor)) = src.device_minor() {
        let _ = out.set_device_minor(minor);
    }
    if let Ok(Some(user)) = src.username() {
        let _ = out.set_username(user);
    }
    if let Ok(Some(group)) = src.groupname() {
        let _ = out.set_groupname(group);
    }

    if format == TarFormat::Pax && needs_pax(path, link, size, uid, gid) {
        let mut records: Vec<(&str, Vec<u8>)> = Vec::new();

        if !path_fits_ustar(path) {
            records.push(("path", path.as_bytes().to_vec()));
            out.set_path(tail_ascii(path, USTAR_MAX_NAME))?;
        } else {
            out.set_path(path)?;
        }
        if let Some(link) = link {
            if !link.is_ascii() || link.len() > USTAR_MAX_LINKNAME {
                records.push(("linkpath", link.as_bytes().to_vec()));
                out.set_link_name(tail_ascii(link, USTAR_MAX_LINKNAME))?;
            } else {
                out.set_link_name(link)?;
            }
        }
        if size > USTAR_MAX_SIZE {
            records.push(("size", size.to_string().into_bytes()));
        }
        if uid > USTAR_MAX_ID {
            records.push(("uid", uid.to_string().into_bytes()));
            out.set_uid(0);
        } else {
            out.set_uid(uid);
        }
        if gid > USTAR_MAX_ID {
            records.push(("gid", gid.to_string().into_bytes()));
            out.set_gid(0);
        } else {
            out.set_gid(gid);
        }

        builder.append_pax_extensions(records.iter().map(|(k, v)| (*k, v.as_slice())))?;
        out.set_cksum();
        builder.append(&out, data)?;
    } else {
        out.set_uid(uid);
        out.set_gid(gid);
        out.set_path(path)?;
        if let Some(link) = link {
            out.set_link_name(link)?;
        }
        out.set_cksum();
        builder.append(&out, data)?;
    }
    Ok(())
}

fn path_fits_ustar(path: &str) -> bool {
    path.is_ascii() && path.len() <= USTAR_MAX_PATH && !needs_pax(path, None, 0, 0, 0)
}

/// Replaces non-ASCII bytes and keeps the trailing `max` bytes, which is
/// the most recognizable part of a truncated path. The PAX record carries
/// the real value.
fn tail_ascii(s: &str, max: usize) -> String {
    let ascii: String = s
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    if ascii.len() <= max {
        ascii
    } else {
        ascii[ascii.len() - max..].to_string()
    }
}

/// Buffers the config element and patches it once every layer rewrite is
/// known.
#[derive(Default)]
pub struct ConfigPatcher {
    mapping: HashMap<String, String>,
    timestamp: Option<i64>,
    pending: Option<(String, Bytes, SchemaFamily)>,
}

impl ConfigPatcher {
    /// A patcher that only remaps diff-IDs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A patcher that also rewrites each `history[].created` to
    /// `timestamp`.
    #[must_use]
    pub fn with_timestamp(timestamp: i64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }

    /// Records a layer rewrite.
    pub fn record(&mut self, old_hex: &str, new_hex: &str) {
        self.mapping
            .insert(old_hex.to_string(), new_hex.to_string());
    }

    /// Buffers the config element until layers are done.
    pub fn buffer(&mut self, name: String, data: Bytes, family: SchemaFamily) {
        self.pending = Some((name, data, family));
    }

    /// Patches and returns the buffered config, renamed to its new digest.
    /// Unknown config fields survive the rewrite untouched.
    pub fn take_patched(&mut self) -> Result<Option<Element>> {
        let Some((name, data, family)) = self.pending.take() else {
            return Ok(None);
        };

        let mut config: serde_json::Value = serde_json::from_slice(&data)?;

        if let Some(diff_ids) = config
            .pointer_mut("/rootfs/diff_ids")
            .and_then(|v| v.as_array_mut())
        {
            for diff_id in diff_ids {
                let Some(old) = diff_id.as_str() else {
                    continue;
                };
                let old_hex = digest::strip_prefix(old);
                if let Some(new_hex) = self.mapping.get(old_hex) {
                    *diff_id = serde_json::Value::String(format!("sha256:{new_hex}"));
                }
            }
        }

        if let Some(timestamp) = self.timestamp {
            let created = chrono::DateTime::from_timestamp(timestamp, 0)
                .ok_or_else(|| {
                    ImageError::Filter(format!("timestamp {timestamp} out of range"))
                })?
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            if let Some(history) = config
                .pointer_mut("/history")
                .and_then(|v| v.as_array_mut())
            {
                for entry in history {
                    if entry.get("created").is_some() {
                        entry["created"] = serde_json::Value::String(created.clone());
                    }
                }
            }
        }

        let bytes = serde_json::to_vec(&config)?;
        let new_hex = digest::sha256_hex(&bytes);
        Ok(Some(Element::Config {
            name: rename_like(&name, &new_hex),
            data: bytes.into(),
            family,
        }))
    }
}

/// Renames an element to a new digest, keeping the old naming style:
/// `blobs/sha256/<hex>` stays path-shaped, `<hex>.json` keeps its suffix.
#[must_use]
pub fn rename_like(old_name: &str, new_hex: &str) -> String {
    if let Some(idx) = old_name.rfind('/') {
        format!("{}/{}", &old_name[..idx], new_hex)
    } else if old_name.ends_with(".json") {
        format!("{new_hex}.json")
    } else {
        new_hex.to_string()
    }
}
