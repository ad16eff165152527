//! # occystrap-filters
//!
//! Pipeline filters. A filter implements the same consumer contract as a
//! sink and wraps another consumer, so chains compose by construction:
//!
//! ```text
//! source -> normalize-timestamps -> exclude -> sink
//! ```
//!
//! Mutating filters ([`TimestampNormalizer`], [`ExcludeFilter`]) rewrite
//! layer bytes through the shared [`rewrite`] engine, which recomputes
//! content addresses and patches the image config. Observing filters
//! ([`SearchFilter`], [`InspectFilter`]) pass elements through untouched.

pub mod exclude;
pub mod inspect;
pub mod normalize;
pub mod rewrite;
pub mod search;

pub use exclude::ExcludeFilter;
pub use inspect::InspectFilter;
pub use normalize::TimestampNormalizer;
pub use search::SearchFilter;

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use occystrap_core::element::{Blob, Element, ImageSink};
    use occystrap_core::error::Result;

    /// What a [`CollectingSink`] saw, with blob payloads materialized.
    pub enum CollectedElement {
        Config { name: String, data: Vec<u8> },
        Layer { name: String, data: Option<Vec<u8>> },
    }

    /// Records every element; finalize appends a `finalized` marker so
    /// ordering against buffered emissions can be asserted.
    pub struct CollectingSink {
        seen: Arc<Mutex<Vec<CollectedElement>>>,
    }

    impl CollectingSink {
        pub fn new() -> (Self, Arc<Mutex<Vec<CollectedElement>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (Self { seen: seen.clone() }, seen)
        }
    }

    #[async_trait]
    impl ImageSink for CollectingSink {
        async fn process_element(&mut self, element: Element) -> Result<()> {
            let collected = match element {
                Element::Config { name, data, .. } => CollectedElement::Config {
                    name,
                    data: data.to_vec(),
                },
                Element::Layer { name, blob } => CollectedElement::Layer {
                    name,
                    data: blob.map(|b| b.to_vec()).transpose()?,
                },
            };
            self.seen.lock().unwrap().push(collected);
            Ok(())
        }

        async fn finalize(&mut self) -> Result<()> {
            self.seen.lock().unwrap().push(CollectedElement::Config {
                name: "finalized".to_string(),
                data: Vec::new(),
            });
            Ok(())
        }
    }

    /// Builds an in-memory layer tar with every member at `mtime`.
    pub fn layer_blob(entries: &[(&str, &[u8])], mtime: u64) -> Blob {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        Blob::from_bytes(builder.into_inner().unwrap())
    }
}
