//! Layer metadata inspection.
//!
//! A pure passthrough that records each layer's digest and size, together
//! with the `created_by` history entries from the config, and appends one
//! JSON line per image to a file in finalize. Placing inspect filters
//! before and after a mutating filter measures its effect.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use occystrap_core::element::{Element, ImageSink};
use occystrap_core::error::Result;
use occystrap_core::manifest::{History, ImageConfig};

/// Appends per-layer metadata to a JSONL file.
pub struct InspectFilter {
    inner: Option<Box<dyn ImageSink>>,
    output_file: PathBuf,
    image: String,
    tag: String,
    /// History entries for members that produced a filesystem layer.
    history: Vec<History>,
    /// (digest, size) per layer, in apply order.
    layers: Vec<(String, u64)>,
}

impl InspectFilter {
    /// Wraps `inner`, appending records to `output_file`.
    #[must_use]
    pub fn new(
        inner: Option<Box<dyn ImageSink>>,
        output_file: impl Into<PathBuf>,
        image: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            output_file: output_file.into(),
            image: image.into(),
            tag: tag.into(),
            history: Vec::new(),
            layers: Vec::new(),
        }
    }

    fn record_config(&mut self, data: &[u8]) {
        // The config's history has entries for every Dockerfile step; only
        // the ones that created a layer line up with diff_ids.
        match serde_json::from_slice::<ImageConfig>(data) {
            Ok(config) => {
                self.history = config
                    .history
                    .into_iter()
                    .filter(|h| !h.empty_layer.unwrap_or(false))
                    .collect();
            }
            Err(e) => warn!(error = %e, "failed to parse image config"),
        }
    }

    /// Builds layer records newest-first, matching `docker history`
    /// conventions, with the topmost layer carrying the repo tag.
    fn layer_records(&self) -> Vec<serde_json::Value> {
        let image_tag = format!("{}:{}", self.image, self.tag);
        let mut records: Vec<serde_json::Value> = self
            .layers
            .iter()
            .enumerate()
            .map(|(idx, (digest, size))| {
                let history = self.history.get(idx);
                let created = history
                    .and_then(|h| h.created.as_deref())
                    .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
                    .map_or(0, |dt| dt.timestamp());
                json!({
                    "Id": format!("sha256:{}", digest.strip_prefix("sha256:").unwrap_or(digest)),
                    "Size": size,
                    "Created": created,
                    "CreatedBy": history.and_then(|h| h.created_by.clone()).unwrap_or_default(),
                    "Comment": history.and_then(|h| h.comment.clone()).unwrap_or_default(),
                    "Tags": serde_json::Value::Null,
                })
            })
            .collect();
        records.reverse();
        if let Some(top) = records.first_mut() {
            top["Tags"] = json!([image_tag]);
        }
        records
    }

    fn write_record(&self) -> Result<()> {
        let record = json!({
            "name": format!("{}:{}", self.image, self.tag),
            "layers": self.layer_records(),
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_file)?;
        writeln!(file, "{record}")?;
        info!(
            file = %self.output_file.display(),
            layers = self.layers.len(),
            "wrote inspect record"
        );
        Ok(())
    }
}

#[async_trait]
impl ImageSink for InspectFilter {
    async fn process_element(&mut self, element: Element) -> Result<()> {
        match &element {
            Element::Config { data, .. } => self.record_config(data),
            Element::Layer { name, blob } => {
                let size = match blob {
                    Some(blob) => blob.len()?,
                    None => 0,
                };
                self.layers.push((name.clone(), size));
            }
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
        self.write_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tempfile::tempdir;

    use occystrap_core::manifest::SchemaFamily;

    use crate::testutil::layer_blob;

    const CONFIG: &str = r#"{
        "rootfs": {"type": "layers", "diff_ids": ["sha256:a", "sha256:b"]},
        "history": [
            {"created": "2022-01-01T00:00:00Z", "created_by": "ADD rootfs.tar /"},
            {"created": "2022-01-01T00:00:01Z", "created_by": "CMD [\"sh\"]", "empty_layer": true},
            {"created": "2022-01-02T00:00:00Z", "created_by": "RUN apt-get install"}
        ]
    }"#;

    #[tokio::test]
    async fn test_inspect_record_layout() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("inspect.jsonl");
        let mut filter = InspectFilter::new(None, &out, "example/app", "v3");

        filter
            .process_element(Element::Config {
                name: "cfg.json".to_string(),
                data: Bytes::from_static(CONFIG.as_bytes()),
                family: SchemaFamily::Docker,
            })
            .await
            .unwrap();
        for digest in ["aaaa", "bbbb"] {
            filter
                .process_element(Element::Layer {
                    name: digest.to_string(),
                    blob: Some(layer_blob(&[("f", b"data")], 0)),
                })
                .await
                .unwrap();
        }
        filter.finalize().await.unwrap();

        let content = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);

        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["name"], "example/app:v3");
        let layers = record["layers"].as_array().unwrap();
        assert_eq!(layers.len(), 2);
        // Newest first; the top layer carries the tag and the second
        // (non-empty) history entry.
        assert_eq!(layers[0]["Id"], "sha256:bbbb");
        assert_eq!(layers[0]["CreatedBy"], "RUN apt-get install");
        assert_eq!(layers[0]["Tags"], json!(["example/app:v3"]));
        assert_eq!(layers[1]["Id"], "sha256:aaaa");
        assert_eq!(layers[1]["Tags"], serde_json::Value::Null);
        // RFC3339 converted to a Unix timestamp.
        assert_eq!(layers[1]["Created"], 1_640_995_200);
    }

    #[tokio::test]
    async fn test_inspect_appends() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("inspect.jsonl");

        for tag in ["v1", "v2"] {
            let mut filter = InspectFilter::new(None, &out, "app", tag);
            filter
                .process_element(Element::Layer {
                    name: "aaaa".to_string(),
                    blob: None,
                })
                .await
                .unwrap();
            filter.finalize().await.unwrap();
        }

        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content.lines().count(), 2);
        // A skipped layer records size zero.
        let first: serde_json::Value =
            serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["layers"][0]["Size"], 0);
    }
}
