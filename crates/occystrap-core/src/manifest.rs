//! Manifest and image configuration types.
//!
//! Two wire formats flow through a pipeline: the registry/OCI manifest
//! (media-typed JSON with `config` and `layers[]` descriptors) and the
//! docker-save v1.2 manifest (a flat JSON array with `Config`, `RepoTags`
//! and `Layers`). Sources consume either; sinks produce the one matching
//! their destination.

use serde::{Deserialize, Serialize};

use crate::compression::Compression;

// Docker manifest media types.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_DOCKER_LAYER_ZSTD: &str =
    "application/vnd.docker.image.rootfs.diff.tar.zstd";

// OCI manifest media types.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Accept header value for manifest negotiation.
pub const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.index.v1+json"
);

/// Which manifest schema family an image uses.
///
/// Occystrap never converts between the two; whatever family the source
/// produced is what the registry pusher emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFamily {
    /// Docker distribution manifest v2.2.
    Docker,
    /// OCI image manifest v1.
    Oci,
}

impl SchemaFamily {
    /// Classifies a manifest media type. Unknown types are treated as Docker
    /// for compatibility with registries that omit the header.
    #[must_use]
    pub fn from_media_type(media_type: &str) -> Self {
        if media_type.contains("vnd.oci.") {
            Self::Oci
        } else {
            Self::Docker
        }
    }

    /// Media type for a manifest in this family.
    #[must_use]
    pub const fn manifest_media_type(self) -> &'static str {
        match self {
            Self::Docker => MEDIA_TYPE_DOCKER_MANIFEST,
            Self::Oci => MEDIA_TYPE_OCI_MANIFEST,
        }
    }

    /// Media type for a config blob in this family.
    #[must_use]
    pub const fn config_media_type(self) -> &'static str {
        match self {
            Self::Docker => MEDIA_TYPE_DOCKER_CONFIG,
            Self::Oci => MEDIA_TYPE_OCI_CONFIG,
        }
    }

    /// Media type for a layer compressed with `compression` in this family.
    #[must_use]
    pub const fn layer_media_type(self, compression: Compression) -> &'static str {
        match (self, compression) {
            (Self::Docker, Compression::Zstd) => MEDIA_TYPE_DOCKER_LAYER_ZSTD,
            (Self::Docker, _) => MEDIA_TYPE_DOCKER_LAYER_GZIP,
            (Self::Oci, Compression::Zstd) => MEDIA_TYPE_OCI_LAYER_ZSTD,
            (Self::Oci, Compression::None) => MEDIA_TYPE_OCI_LAYER_TAR,
            (Self::Oci, _) => MEDIA_TYPE_OCI_LAYER_GZIP,
        }
    }
}

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Content digest (`sha256:<hex>`).
    pub digest: String,
    /// Content size in bytes.
    pub size: u64,
}

/// Registry/OCI image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (always 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, in apply order.
    pub layers: Vec<Descriptor>,
}

/// Multi-platform manifest list / OCI index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (always 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Per-platform manifest entries.
    pub manifests: Vec<PlatformManifest>,
}

/// One entry in a manifest list / index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    /// Media type of the referenced manifest.
    #[serde(default)]
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size.
    pub size: u64,
    /// Platform this manifest applies to. Attestation entries omit it.
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// A platform selector: (os, architecture, variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture (e.g. "amd64", "arm64").
    pub architecture: String,
    /// Operating system (e.g. "linux").
    pub os: String,
    /// Architecture variant (e.g. "v8"). Empty and absent are equivalent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Creates a platform selector. An empty variant matches entries with no
    /// variant.
    #[must_use]
    pub fn new(os: impl Into<String>, architecture: impl Into<String>, variant: &str) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: if variant.is_empty() {
                None
            } else {
                Some(variant.to_string())
            },
        }
    }

    /// Whether this platform satisfies a request for `wanted`.
    #[must_use]
    pub fn matches(&self, wanted: &Platform) -> bool {
        self.os == wanted.os
            && self.architecture == wanted.architecture
            && self.variant.as_deref().unwrap_or("") == wanted.variant.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// The parts of an image configuration occystrap reads. Config blobs are
/// carried through pipelines as raw bytes; this type is only used to peek at
/// them, never to rewrite them (rewrites go through `serde_json::Value` so
/// unknown fields survive).
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    /// Root filesystem description.
    pub rootfs: RootFs,
    /// Build history, one entry per Dockerfile step.
    #[serde(default)]
    pub history: Vec<History>,
    /// Runtime defaults.
    #[serde(default)]
    pub config: RuntimeDefaults,
}

/// Root filesystem specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    /// Always "layers".
    #[serde(rename = "type")]
    pub fs_type: String,
    /// SHA-256 of each layer's uncompressed tar, in apply order.
    pub diff_ids: Vec<String>,
}

/// Image history entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Runtime defaults from the image config, used when synthesizing an OCI
/// runtime bundle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeDefaults {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// One entry of a docker-save v1.2 `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveManifestEntry {
    /// Config filename within the archive.
    #[serde(rename = "Config")]
    pub config: String,
    /// `image:tag` references for this image.
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    /// Layer filenames in apply order.
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
    /// Full image name, recorded by directory sinks in unique-names mode.
    #[serde(rename = "ImageName", default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
}

impl SaveManifestEntry {
    /// Creates an entry with no config or layers yet. The repo tag follows
    /// `docker save` convention: the final path component of the image name.
    #[must_use]
    pub fn new(image: &str, tag: &str) -> Self {
        let short = image.rsplit('/').next().unwrap_or(image);
        Self {
            config: String::new(),
            repo_tags: vec![format!("{short}:{tag}")],
            layers: Vec::new(),
            image_name: None,
        }
    }
}

/// Extracts the diffID hexes from a raw config blob, in apply order.
///
/// These are what layer elements are named after. A config without
/// `rootfs.diff_ids` (or one that fails to parse) yields an empty list;
/// callers treat that as "identities unknown".
#[must_use]
pub fn config_diff_ids(config: &[u8]) -> Vec<String> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(config) else {
        return Vec::new();
    };
    value
        .pointer("/rootfs/diff_ids")
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|d| d.as_str())
                .map(|d| crate::digest::strip_prefix(d).to_string())
                .collect()
        })
        .unwrap_or_default()
}
