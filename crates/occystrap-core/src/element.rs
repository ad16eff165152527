//! The pipeline element model and consumer traits.
//!
//! A pipeline moves an image from one source to one sink, optionally
//! through a chain of filters. The unit of flow is the [`Element`]: either
//! the image config (one JSON document) or a layer (an uncompressed tar).
//! Sinks and filters share the [`ImageSink`] trait so chains compose by
//! construction; sources implement [`ImageSource`] and push elements
//! through the chain.

use std::io::{Cursor, Read, Seek};
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;

use crate::error::Result;
use crate::manifest::SchemaFamily;

/// A byte payload, held in memory or spooled to a scratch file.
///
/// Layer payloads always hold the uncompressed tar; any wire compression is
/// stripped by the source. Each call to [`Blob::reader`] yields an
/// independent reader positioned at the start, so two consumers (say, an
/// expand extraction and a merged-view extraction) can each walk the layer.
pub struct Blob {
    inner: BlobInner,
}

enum BlobInner {
    Memory(Bytes),
    Spooled(NamedTempFile),
}

impl Blob {
    /// Wraps an in-memory payload.
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            inner: BlobInner::Memory(data.into()),
        }
    }

    /// Wraps a scratch file. The file is deleted when the blob is dropped.
    #[must_use]
    pub fn from_spool(file: NamedTempFile) -> Self {
        Self {
            inner: BlobInner::Spooled(file),
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> Result<u64> {
        match &self.inner {
            BlobInner::Memory(b) => Ok(b.len() as u64),
            BlobInner::Spooled(f) => Ok(f.as_file().metadata()?.len()),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns an independent reader over the payload, positioned at the
    /// start.
    pub fn reader(&self) -> Result<BlobReader> {
        match &self.inner {
            BlobInner::Memory(b) => Ok(BlobReader::Memory(Cursor::new(b.clone()))),
            BlobInner::Spooled(f) => Ok(BlobReader::File(f.reopen()?)),
        }
    }

    /// Reads the entire payload into memory. Intended for configs and test
    /// fixtures, not layers.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Reader over a [`Blob`].
pub enum BlobReader {
    Memory(Cursor<Bytes>),
    File(std::fs::File),
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Memory(c) => c.read(buf),
            Self::File(f) => f.read(buf),
        }
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::Memory(c) => c.seek(pos),
            Self::File(f) => f.seek(pos),
        }
    }
}

/// One streamed unit of an image.
pub enum Element {
    /// The image configuration.
    Config {
        /// Filename the config should occupy in the output, usually
        /// `<hex>.json` or `blobs/sha256/<hex>`.
        name: String,
        /// Raw config JSON.
        data: Bytes,
        /// Schema family of the manifest this config came from.
        family: SchemaFamily,
    },
    /// One filesystem layer.
    Layer {
        /// The layer's diffID hex: the SHA-256 of its uncompressed tar,
        /// matching the config's `rootfs.diff_ids` entry. Sources compute
        /// it while stripping any wire compression.
        name: String,
        /// Uncompressed layer tar, or `None` when the sink's admission
        /// check declined the layer (the sink still records it in its
        /// manifest).
        blob: Option<Blob>,
    },
}

impl Element {
    /// The element's name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Config { name, .. } | Self::Layer { name, .. } => name,
        }
    }
}

/// The uniform consumer contract shared by sinks and filters.
///
/// Sources call [`wants_layer`](Self::wants_layer) before fetching each
/// layer, then [`process_element`](Self::process_element) for every element.
/// Elements arrive serially; layers arrive in apply order. The config may
/// arrive before, between or after layers — consumers that need it at a
/// particular point buffer it.
#[async_trait]
pub trait ImageSink: Send {
    /// Layer admission check: returning `false` lets the source skip the
    /// transfer when the sink already holds the blob.
    fn wants_layer(&self, _digest: &str) -> bool {
        true
    }

    /// Consumes one element.
    async fn process_element(&mut self, element: Element) -> Result<()>;

    /// Completes the output. Called exactly once, after the last element.
    /// Filters flush buffered elements into the wrapped consumer, delegate
    /// inward, then do their own reporting.
    async fn finalize(&mut self) -> Result<()>;
}

/// An image source: something that can push an image's elements into a
/// consumer chain.
#[async_trait]
pub trait ImageSource: Send {
    /// The image name.
    fn image(&self) -> &str;

    /// The image tag.
    fn tag(&self) -> &str;

    /// Pushes every element into `sink`, layers in apply order.
    async fn deliver(&mut self, sink: &mut (dyn ImageSink + Send)) -> Result<()>;
}

/// Drives a pipeline: delivers every element, then finalizes the chain.
///
/// Errors abort immediately; partial sink output is left on disk for
/// inspection.
pub async fn run_pipeline(
    source: &mut (dyn ImageSource + Send),
    sink: &mut (dyn ImageSink + Send),
) -> Result<()> {
    source.deliver(sink).await?;
    sink.finalize().await
}

/// Creates a scratch file in `temp_dir` (or the system default).
pub fn new_spool(temp_dir: Option<&Path>) -> Result<NamedTempFile> {
    Ok(match temp_dir {
        Some(dir) => NamedTempFile::new_in(dir)?,
        None => NamedTempFile::new()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_blob_independent_readers() {
        let blob = Blob::from_bytes(&b"payload"[..]);
        let mut a = String::new();
        let mut b = String::new();
        blob.reader().unwrap().read_to_string(&mut a).unwrap();
        blob.reader().unwrap().read_to_string(&mut b).unwrap();
        assert_eq!(a, "payload");
        assert_eq!(b, "payload");
    }

    #[test]
    fn test_spooled_blob_reader_starts_at_zero() {
        let mut spool = NamedTempFile::new().unwrap();
        spool.write_all(b"spooled data").unwrap();
        spool.flush().unwrap();

        let blob = Blob::from_spool(spool);
        assert_eq!(blob.len().unwrap(), 12);

        let mut out = String::new();
        blob.reader().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "spooled data");

        // A second reader is independent of the first.
        let mut again = String::new();
        blob.reader().unwrap().read_to_string(&mut again).unwrap();
        assert_eq!(again, "spooled data");
    }

    #[test]
    fn test_element_name() {
        let config = Element::Config {
            name: "abc.json".to_string(),
            data: Bytes::new(),
            family: SchemaFamily::Docker,
        };
        assert_eq!(config.name(), "abc.json");

        let layer = Element::Layer {
            name: "def".to_string(),
            blob: None,
        };
        assert_eq!(layer.name(), "def");
    }
}
