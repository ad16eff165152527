//! # occystrap-archive
//!
//! On-disk image representations: a [`TarballSource`] for `docker save`
//! tarballs, a [`TarballSink`] producing the docker-load v1.2 layout, a
//! [`DirectorySink`] with shared-directory deduplication and expanded
//! per-layer/merged views, an [`OciBundleSink`] producing runnable OCI
//! runtime bundles, and a [`MountsSink`] producing overlayfs-ready layer
//! directories.

pub mod bundle;
pub mod dir_sink;
pub mod extract;
pub mod mounts;
pub mod tar_sink;
pub mod tar_source;

pub use bundle::OciBundleSink;
pub use dir_sink::DirectorySink;
pub use extract::MergedTree;
pub use mounts::MountsSink;
pub use tar_sink::TarballSink;
pub use tar_source::TarballSource;
