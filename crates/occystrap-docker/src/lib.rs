//! # occystrap-docker
//!
//! Docker Engine API integration: a [`DaemonSource`] that stream-parses
//! `docker save` exports out of a local daemon (using the inspect API to
//! pre-compute the manifest and avoid buffering), and a [`DaemonLoader`]
//! sink that builds a v1.2 tarball and `docker load`s it back in. Both
//! speak HTTP over a Unix domain socket and work against Podman's
//! docker-compatible service too.

pub mod client;
pub mod load;
pub mod source;

pub use client::{DaemonClient, DEFAULT_SOCKET_PATH};
pub use load::DaemonLoader;
pub use source::DaemonSource;
