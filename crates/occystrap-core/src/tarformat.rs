//! Tar format selection for rewritten layers.
//!
//! USTAR is preferred when rewriting a layer: every PAX extended header
//! costs roughly a kilobyte, which adds up to tens of megabytes across a
//! large layer full of long paths. USTAR cannot represent everything
//! though, so a rewriter pre-scans the members it will keep and falls back
//! to PAX on the first member USTAR cannot hold. Outer tarballs produced by
//! sinks contain only short digest-hex names and always use USTAR without
//! scanning.

use std::io::Read;

use crate::error::Result;

/// USTAR field limits (POSIX.1-1988).
///
/// USTAR stores a path split at a `/` into a 155-byte prefix and a 100-byte
/// name, so paths up to 256 bytes fit when such a split exists.
pub const USTAR_MAX_PATH: usize = 256;
pub const USTAR_MAX_NAME: usize = 100;
pub const USTAR_MAX_PREFIX: usize = 155;
pub const USTAR_MAX_LINKNAME: usize = 100;
/// 8 GiB - 1, the largest value a 12-byte octal size field can hold.
pub const USTAR_MAX_SIZE: u64 = 8 * 1024 * 1024 * 1024 - 1;
/// 2^21 - 1, the largest value an 8-byte octal uid/gid field can hold.
pub const USTAR_MAX_ID: u64 = 0o777_7777;

/// The tar header format a rewriter should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarFormat {
    Ustar,
    Pax,
}

/// Whether a member with these attributes requires PAX extended headers.
#[must_use]
pub fn needs_pax(path: &str, linkname: Option<&str>, size: u64, uid: u64, gid: u64) -> bool {
    if !path.is_ascii() || linkname.is_some_and(|l| !l.is_ascii()) {
        return true;
    }
    if path.len() > USTAR_MAX_PATH {
        return true;
    }
    if path.len() > USTAR_MAX_NAME && !splits_for_ustar(path) {
        return true;
    }
    if linkname.is_some_and(|l| l.len() > USTAR_MAX_LINKNAME) {
        return true;
    }
    if size > USTAR_MAX_SIZE {
        return true;
    }
    if uid > USTAR_MAX_ID || gid > USTAR_MAX_ID {
        return true;
    }
    false
}

/// Whether `path` can be split at a `/` into a prefix of at most 155 bytes
/// and a name of at most 100 bytes.
fn splits_for_ustar(path: &str) -> bool {
    // Any split point works, not just the final component boundary. Scan
    // from the right so the longest name that still fits is tried first.
    for (idx, byte) in path.bytes().enumerate().rev() {
        if byte != b'/' {
            continue;
        }
        let prefix = idx;
        let name = path.len() - idx - 1;
        if prefix <= USTAR_MAX_PREFIX && name <= USTAR_MAX_NAME && name > 0 {
            return true;
        }
    }
    false
}

/// Scans a layer tar and picks the narrowest format that can represent
/// every member the rewriter will keep.
///
/// `skip` receives each member path and returns `true` for members the
/// rewrite will drop; those are not considered. Short-circuits to PAX at
/// the first disqualifying member.
pub fn select_format<R: Read>(reader: R, mut skip: impl FnMut(&str) -> bool) -> Result<TarFormat> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let entry = entry?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if skip(&path) {
            continue;
        }

        let link = entry
            .link_name_bytes()
            .map(|l| String::from_utf8_lossy(&l).into_owned());
        let header = entry.header();
        let uid = header.uid().unwrap_or(u64::MAX);
        let gid = header.gid().unwrap_or(u64::MAX);
        // Raw bytes that failed UTF-8 conversion come out of the lossy
        // conversion as replacement characters, which are non-ASCII and
        // correctly force PAX.
        if needs_pax(&path, link.as_deref(), entry.size(), uid, gid) {
            tracing::debug!(member = %path, "layer requires PAX format");
            return Ok(TarFormat::Pax);
        }
    }
    tracing::debug!("layer fits USTAR format");
    Ok(TarFormat::Ustar)
}
