//! Layer content search.
//!
//! Scans tar member names in every layer against a glob or regex and
//! reports the matches once the pipeline completes. A pure passthrough:
//! with a wrapped consumer it searches while the image flows to its
//! destination, without one it terminates a search-only pipeline.

use std::io::Write;

use async_trait::async_trait;
use tracing::{debug, warn};

use occystrap_core::element::{Blob, Element, ImageSink};
use occystrap_core::error::{ImageError, Result};

/// How member names are matched.
enum SearchPattern {
    /// Glob, matched against the full path and the basename, so `*bash`
    /// finds `/bin/bash`.
    Glob(glob::Pattern),
    Regex(regex::Regex),
}

/// One search hit.
struct Match {
    layer: String,
    path: String,
}

/// Searches layers for members matching a pattern.
pub struct SearchFilter {
    inner: Option<Box<dyn ImageSink>>,
    pattern: SearchPattern,
    image: String,
    tag: String,
    script_friendly: bool,
    results: Vec<Match>,
}

impl SearchFilter {
    /// Wraps `inner` (or `None` for search-only pipelines).
    pub fn new(
        inner: Option<Box<dyn ImageSink>>,
        pattern: &str,
        use_regex: bool,
        image: impl Into<String>,
        tag: impl Into<String>,
        script_friendly: bool,
    ) -> Result<Self> {
        let pattern = if use_regex {
            SearchPattern::Regex(
                regex::Regex::new(pattern)
                    .map_err(|e| ImageError::Filter(format!("bad search regex: {e}")))?,
            )
        } else {
            SearchPattern::Glob(
                glob::Pattern::new(pattern)
                    .map_err(|e| ImageError::Filter(format!("bad search pattern: {e}")))?,
            )
        };
        Ok(Self {
            inner,
            pattern,
            image: image.into(),
            tag: tag.into(),
            script_friendly,
            results: Vec::new(),
        })
    }

    fn matches(&self, path: &str) -> bool {
        match &self.pattern {
            SearchPattern::Glob(pattern) => {
                let basename = path.rsplit('/').next().unwrap_or(path);
                pattern.matches(path) || pattern.matches(basename)
            }
            SearchPattern::Regex(regex) => regex.is_match(path),
        }
    }

    fn scan_layer(&mut self, layer: &str, blob: &Blob) -> Result<()> {
        debug!(layer = %layer, "searching layer");
        let mut archive = tar::Archive::new(blob.reader()?);
        let entries = match archive.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(layer = %layer, error = %e, "failed to read layer, skipping search");
                return Ok(());
            }
        };
        for entry in entries {
            let entry = entry?;
            let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            if !self.matches(&path) {
                continue;
            }
            self.results.push(Match {
                layer: layer.to_string(),
                path,
            });
        }
        Ok(())
    }

    fn report(&self, out: &mut impl Write) -> std::io::Result<()> {
        for hit in &self.results {
            if self.script_friendly {
                // image:tag:layer:path, one line per match.
                writeln!(
                    out,
                    "{}:{}:{}:{}",
                    self.image, self.tag, hit.layer, hit.path
                )?;
            } else {
                writeln!(out, "{} {}", hit.layer, hit.path)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageSink for SearchFilter {
    fn wants_layer(&self, _digest: &str) -> bool {
        // Searching needs the bytes even if the wrapped sink does not.
        true
    }

    async fn process_element(&mut self, element: Element) -> Result<()> {
        if let Element::Layer {
            name,
            blob: Some(blob),
        } = &element
        {
            let name = name.clone();
            self.scan_layer(&name, blob)?;
        }
        match &mut self.inner {
            Some(inner) => inner.process_element(element).await,
            None => Ok(()),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(inner) = &mut self.inner {
            inner.finalize().await?;
        }
        let stdout = std::io::stdout();
        self.report(&mut stdout.lock())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::layer_blob;

    fn filter(pattern: &str, use_regex: bool, script: bool) -> SearchFilter {
        SearchFilter::new(None, pattern, use_regex, "app", "v1", script).unwrap()
    }

    #[tokio::test]
    async fn test_glob_matches_basename_and_path() {
        let mut search = filter("*.pyc", false, false);
        let blob = layer_blob(
            &[
                ("usr/lib/python/mod.pyc", b"x"),
                ("usr/lib/python/mod.py", b"y"),
            ],
            0,
        );
        search
            .process_element(Element::Layer {
                name: "1111".to_string(),
                blob: Some(blob),
            })
            .await
            .unwrap();

        assert_eq!(search.results.len(), 1);
        assert_eq!(search.results[0].path, "usr/lib/python/mod.pyc");
        assert_eq!(search.results[0].layer, "1111");
    }

    #[tokio::test]
    async fn test_regex_matching() {
        let mut search = filter(r"bin/(ba)?sh$", true, false);
        let blob = layer_blob(
            &[("bin/bash", b"x"), ("bin/sh", b"y"), ("bin/dash", b"z")],
            0,
        );
        search
            .process_element(Element::Layer {
                name: "1111".to_string(),
                blob: Some(blob),
            })
            .await
            .unwrap();

        let paths: Vec<&str> = search.results.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["bin/bash", "bin/sh"]);
    }

    #[tokio::test]
    async fn test_report_formats() {
        let mut search = filter("*", false, false);
        let blob = layer_blob(&[("etc/issue", b"hello")], 0);
        search
            .process_element(Element::Layer {
                name: "2222".to_string(),
                blob: Some(blob),
            })
            .await
            .unwrap();

        let mut out = Vec::new();
        search.report(&mut out).unwrap();
        // One line per match: <layer-digest> <member-path>.
        assert_eq!(String::from_utf8(out).unwrap(), "2222 etc/issue\n");

        search.script_friendly = true;
        let mut out = Vec::new();
        search.report(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "app:v1:2222:etc/issue\n");
    }

    #[tokio::test]
    async fn test_no_matches_is_not_an_error() {
        let mut search = filter("*.nothing", false, false);
        let blob = layer_blob(&[("etc/issue", b"hello")], 0);
        search
            .process_element(Element::Layer {
                name: "1111".to_string(),
                blob: Some(blob),
            })
            .await
            .unwrap();
        search.finalize().await.unwrap();
        assert!(search.results.is_empty());
    }
}
