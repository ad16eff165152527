//! Path exclusion filter.
//!
//! Drops tar members whose paths match any of a list of glob patterns
//! (double-star supported). Useful for stripping `.git` directories,
//! bytecode caches and similar content in flight. Like any mutating
//! filter it recomputes layer digests and patches the config before it
//! reaches the sink.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use occystrap_core::element::{Element, ImageSink};
use occystrap_core::error::{ImageError, Result};

use crate::rewrite::{rewrite_layer, ConfigPatcher};

/// Excludes members matching glob patterns from every layer.
pub struct ExcludeFilter {
    inner: Box<dyn ImageSink>,
    patterns: Vec<glob::Pattern>,
    temp_dir: Option<PathBuf>,
    patcher: ConfigPatcher,
}

impl std::fmt::Debug for ExcludeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExcludeFilter")
            .field("patterns", &self.patterns)
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

impl ExcludeFilter {
    /// Wraps `inner`, excluding members matching any of `patterns`.
    pub fn new(
        inner: Box<dyn ImageSink>,
        patterns: &[String],
        temp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| ImageError::Filter(format!("bad exclude pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner,
            patterns,
            temp_dir,
            patcher: ConfigPatcher::new(),
        })
    }

    fn excluded(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

#[async_trait]
impl ImageSink for ExcludeFilter {
    fn wants_layer(&self, _digest: &str) -> bool {
        true
    }

    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data, family } => {
                self.patcher.buffer(name, data, family);
                Ok(())
            }
            Element::Layer { name, blob: Some(blob) } => {
                let rewritten = rewrite_layer(
                    &blob,
                    self.temp_dir.as_deref(),
                    |path| self.excluded(path),
                    |_| {},
                )?;
                if rewritten.members_dropped > 0 {
                    info!(
                        layer = %name,
                        dropped = rewritten.members_dropped,
                        kept = rewritten.members_kept,
                        "excluded members from layer"
                    );
                }
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
