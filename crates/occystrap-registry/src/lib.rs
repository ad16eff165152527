//! # occystrap-registry
//!
//! Docker Registry HTTP API V2 client code: an [`RegistrySource`] that
//! pulls images (manifest negotiation, platform selection, parallel layer
//! downloads with ordered emission) and a [`RegistryPusher`] sink that
//! uploads them (parallel compression and upload with blob deduplication).
//! Both share one authenticated [`RegistryClient`].

pub mod auth;
pub mod client;
pub mod push;

pub use auth::Credentials;
pub use client::{RegistryClient, RegistrySource};
pub use push::RegistryPusher;
