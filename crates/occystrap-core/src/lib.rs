//! # occystrap-core
//!
//! The element model and shared machinery for the occystrap image
//! pipeline: sources push config and layer elements through a chain of
//! consumers, each of which may transform, inspect or store them.
//!
//! This crate holds:
//!
//! - The [`Element`]/[`Blob`] model and the [`ImageSource`]/[`ImageSink`]
//!   traits that sources, filters and sinks implement
//! - Manifest and image-config wire types for both the Docker and OCI
//!   schema families
//! - SHA-256 digest helpers
//! - Streaming gzip/zstd detection and codecs
//! - The USTAR/PAX tar format selector used when layers are rewritten

pub mod compression;
pub mod digest;
pub mod element;
pub mod error;
pub mod manifest;
pub mod tarformat;

pub use element::{run_pipeline, Blob, BlobReader, Element, ImageSink, ImageSource};
pub use error::{ImageError, Result};
pub use manifest::{
    Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform, PlatformManifest,
    SaveManifestEntry, SchemaFamily,
};
