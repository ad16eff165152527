//! Timestamp normalization filter.
//!
//! Rewrites every tar member's mtime to a fixed value (default 0) so the
//! same source image always produces byte-identical output, regardless of
//! when its files were built. The rewrite changes layer digests, so the
//! config is buffered, its `rootfs.diff_ids` and `history[].created`
//! patched, and the patched config emitted after the last layer.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use occystrap_core::element::{Element, ImageSink};
use occystrap_core::error::Result;

use crate::rewrite::{rewrite_layer, ConfigPatcher};

/// Normalizes layer timestamps for reproducible output.
pub struct TimestampNormalizer {
    inner: Box<dyn ImageSink>,
    timestamp: u64,
    temp_dir: Option<PathBuf>,
    patcher: ConfigPatcher,
}

impl TimestampNormalizer {
    /// Wraps `inner`, normalizing every member mtime to `timestamp`.
    #[must_use]
    pub fn new(inner: Box<dyn ImageSink>, timestamp: u64, temp_dir: Option<PathBuf>) -> Self {
        Self {
            inner,
            timestamp,
            temp_dir,
            patcher: ConfigPatcher::with_timestamp(timestamp as i64),
        }
    }
}

#[async_trait]
impl ImageSink for TimestampNormalizer {
    fn wants_layer(&self, _digest: &str) -> bool {
        // The rewrite needs the bytes, and downstream dedup keys on the
        // post-rewrite digest which does not exist yet.
        true
    }

    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data, family } => {
                self.patcher.buffer(name, data, family);
                Ok(())
            }
            Element::Layer { name, blob: Some(blob) } => {
                info!(layer = %name, timestamp = self.timestamp, "normalizing timestamps");
                let timestamp = self.timestamp;
                let rewritten = rewrite_layer(
                    &blob,
                    self.temp_dir.as_deref(),
                    |_| false,
                    |header| header.set_mtime(timestamp),
                )?;
                self.patcher.record(&name, &rewritten.digest_hex);
                self.inner
                    .process_element(Element::Layer {
                        name: rewritten.digest_hex.clone(),
                        blob: Some(rewritten.blob),
                    })
                    .await
            }
            passthrough => self.inner.process_element(passthrough).await,
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(config) = self.patcher.take_patched()? {
            self.inner.process_element(config).await?;
        }
        self.inner.finalize().await
    }
}
