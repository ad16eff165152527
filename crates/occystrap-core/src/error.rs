//! Error types shared across the occystrap crates.

use thiserror::Error;

/// Result type alias for image pipeline operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors that can occur while moving an image through a pipeline.
#[derive(Debug, Error)]
pub enum ImageError {
    /// A source/destination URI or filter specification could not be parsed.
    /// The CLI translates this to exit code 2.
    #[error("invalid specification: {0}")]
    UriParse(String),

    /// The registry demanded credentials and none were supplied.
    #[error("authentication required by {0}")]
    AuthRequired(String),

    /// The registry rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A manifest list/index had no entry for the requested platform.
    #[error("no manifest for {wanted}; available platforms: {available}")]
    NoMatchingPlatform {
        /// The requested (os, architecture, variant) triple.
        wanted: String,
        /// Comma-separated platforms present in the index.
        available: String,
    },

    /// A blob's computed digest did not match its declared digest.
    /// This is an integrity failure and is never retried.
    #[error("digest mismatch for {name}: expected {expected}, computed {computed}")]
    DigestMismatch {
        name: String,
        expected: String,
        computed: String,
    },

    /// A saved tarball is in a format we do not understand, most commonly
    /// the pre-1.10 "parent chain" layout.
    #[error("unsupported tarball format: {0}")]
    UnsupportedTarballFormat(String),

    /// Image or blob not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A network failure worth retrying: 5xx, connection reset, timeout.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Registry protocol error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Docker Engine API error.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// A filter failed mid-layer. Partial sink output is left in place.
    #[error("filter error: {0}")]
    Filter(String),

    /// A sink failed to write its output.
    #[error("sink error: {0}")]
    Sink(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
