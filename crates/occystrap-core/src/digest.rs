//! SHA-256 digest helpers.
//!
//! Everything in a pipeline is content-addressed: layer names are digest
//! hex, configs are named for their digest, and the registry pusher keys
//! deduplication on compressed digests. These helpers keep the hashing
//! inline with the I/O so blobs are never re-read just to be hashed.

use std::io::{Read, Write};

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Computes the SHA-256 of a byte slice, returned as lowercase hex.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes the SHA-256 of everything readable from `reader`.
pub fn sha256_hex_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Strips an optional `sha256:` prefix.
#[must_use]
pub fn strip_prefix(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Adds the `sha256:` prefix if not already present.
#[must_use]
pub fn with_prefix(digest: &str) -> String {
    if digest.starts_with("sha256:") {
        digest.to_string()
    } else {
        format!("sha256:{digest}")
    }
}

/// A writer that hashes everything written through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Unwraps, returning the inner writer, the hex digest and the byte
    /// count of everything written.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Known vector: sha256("hello world").
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"hello world"), HELLO);
    }

    #[test]
    fn test_sha256_hex_reader() {
        let mut cursor = std::io::Cursor::new(b"hello world".to_vec());
        assert_eq!(sha256_hex_reader(&mut cursor).unwrap(), HELLO);
    }

    #[test]
    fn test_hashing_writer() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (inner, digest, written) = w.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(digest, HELLO);
        assert_eq!(written, 11);
    }

    #[test]
    fn test_prefix_helpers() {
        assert_eq!(strip_prefix("sha256:abc"), "abc");
        assert_eq!(strip_prefix("abc"), "abc");
        assert_eq!(with_prefix("abc"), "sha256:abc");
        assert_eq!(with_prefix("sha256:abc"), "sha256:abc");
    }
}
