//! Pipeline construction from parsed URIs and filter specs.
//!
//! Wires sources, sinks and filters together: the destination sink is
//! built first, then wrapped by filters in reverse order so the first
//! `-f` on the command line is the first consumer the source talks to.

use std::path::PathBuf;
use std::sync::Arc;

use occystrap_archive::{DirectorySink, MountsSink, OciBundleSink, TarballSink, TarballSource};
use occystrap_core::compression::Compression;
use occystrap_core::element::{run_pipeline, ImageSink, ImageSource};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::Platform;
use occystrap_docker::{DaemonClient, DaemonLoader, DaemonSource};
use occystrap_filters::{ExcludeFilter, InspectFilter, SearchFilter, TimestampNormalizer};
use occystrap_registry::{Credentials, RegistryClient, RegistryPusher, RegistrySource};

use crate::uri::{
    parse_docker_uri, parse_filter, parse_registry_uri, parse_uri, FilterSpec, UriSpec,
};

/// Options shared by every pipeline component, from global CLI flags and
/// their environment fallbacks.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub os: String,
    pub architecture: String,
    pub variant: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: bool,
    pub compression: Option<Compression>,
    pub parallel: usize,
    pub temp_dir: Option<PathBuf>,
}

impl GlobalOptions {
    /// The platform selector for a URI: query options win over global
    /// flags.
    fn platform(&self, spec: &UriSpec) -> Platform {
        let os = spec
            .options
            .get("os")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.os);
        let arch = spec
            .options
            .get("arch")
            .or_else(|| spec.options.get("architecture"))
            .and_then(|v| v.as_str())
            .unwrap_or(&self.architecture);
        let variant = spec
            .options
            .get("variant")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.variant);
        Platform::new(os, arch, variant)
    }

    fn insecure(&self, spec: &UriSpec) -> bool {
        spec.options
            .get("insecure")
            .and_then(|v| v.as_bool())
            .unwrap_or(self.insecure)
    }

    fn max_workers(&self, spec: &UriSpec) -> usize {
        spec.options
            .get("max_workers")
            .and_then(|v| v.as_int())
            .map_or(self.parallel, |n| n.max(1) as usize)
    }

    fn compression(&self, spec: &UriSpec) -> Result<Option<Compression>> {
        match spec.options.get("compression").and_then(|v| v.as_str()) {
            Some(value) => Ok(Some(value.parse()?)),
            None => Ok(self.compression),
        }
    }

    /// Credentials for a registry URI: userinfo, then query options, then
    /// global flags (which carry the env-var fallbacks).
    fn credentials(
        &self,
        uri_user: Option<String>,
        uri_pass: Option<String>,
        spec: &UriSpec,
    ) -> Option<Credentials> {
        let username = uri_user
            .or_else(|| {
                spec.options
                    .get("username")
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
            })
            .or_else(|| self.username.clone());
        let password = uri_pass
            .or_else(|| {
                spec.options
                    .get("password")
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
            })
            .or_else(|| self.password.clone());
        match (username, password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        }
    }
}

/// Builds an image source from a parsed URI.
pub fn build_source(spec: &UriSpec, opts: &GlobalOptions) -> Result<Box<dyn ImageSource + Send>> {
    match spec.scheme.as_str() {
        "registry" => {
            let parts = parse_registry_uri(spec)?;
            let credentials = opts.credentials(parts.username, parts.password, spec);
            let client = Arc::new(RegistryClient::new(
                &parts.host,
                opts.insecure(spec),
                credentials,
            )?);
            Ok(Box::new(RegistrySource::new(
                client,
                parts.image,
                parts.tag,
                opts.platform(spec),
                opts.max_workers(spec),
                opts.temp_dir.clone(),
            )))
        }
        "docker" => {
            let (image, tag, socket) = parse_docker_uri(spec)?;
            Ok(Box::new(DaemonSource::new(
                DaemonClient::new(socket),
                image,
                tag,
                opts.temp_dir.clone(),
            )))
        }
        "tar" => {
            if spec.rest.is_empty() {
                return Err(ImageError::UriParse(
                    "tar:// source needs a path".to_string(),
                ));
            }
            Ok(Box::new(TarballSource::open(
                &spec.rest,
                opts.temp_dir.clone(),
            )?))
        }
        other => Err(ImageError::UriParse(format!(
            "'{other}://' is not a source scheme"
        ))),
    }
}

/// Builds an image sink from a parsed URI.
pub fn build_sink(
    spec: &UriSpec,
    image: &str,
    tag: &str,
    opts: &GlobalOptions,
) -> Result<Box<dyn ImageSink + Send>> {
    let path_required = |what: &str| -> Result<&str> {
        if spec.rest.is_empty() {
            Err(ImageError::UriParse(format!("{what} needs a path")))
        } else {
            Ok(spec.rest.as_str())
        }
    };

    match spec.scheme.as_str() {
        "tar" => Ok(Box::new(TarballSink::create(
            image,
            tag,
            path_required("tar:// destination")?,
        )?)),
        "dir" => {
            let unique_names = spec
                .options
                .get("unique_names")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let expand = spec
                .options
                .get("expand")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(Box::new(DirectorySink::new(
                image,
                tag,
                path_required("dir:// destination")?,
                unique_names,
                expand,
            )?))
        }
        "oci" => Ok(Box::new(OciBundleSink::new(path_required(
            "oci:// destination",
        )?)?)),
        "mounts" => Ok(Box::new(MountsSink::new(
            image,
            tag,
            path_required("mounts:// destination")?,
        )?)),
        "docker" => {
            let (_, _, socket) = parse_docker_uri(spec)?;
            Ok(Box::new(DaemonLoader::new(
                DaemonClient::new(socket),
                image,
                tag,
                opts.temp_dir.clone(),
            )?))
        }
        "registry" => {
            let parts = parse_registry_uri(spec)?;
            let credentials = opts.credentials(parts.username, parts.password, spec);
            let client = Arc::new(RegistryClient::new(
                &parts.host,
                opts.insecure(spec),
                credentials,
            )?);
            Ok(Box::new(RegistryPusher::new(
                client,
                parts.image,
                parts.tag,
                opts.compression(spec)?,
                opts.max_workers(spec),
                opts.temp_dir.clone(),
            )))
        }
        other => Err(ImageError::UriParse(format!(
            "'{other}://' is not a destination scheme"
        ))),
    }
}

/// Wraps a sink with filters, last spec innermost, so elements flow
/// through filters in command-line order.
pub fn wrap_filters(
    mut sink: Box<dyn ImageSink + Send>,
    specs: &[FilterSpec],
    image: &str,
    tag: &str,
    opts: &GlobalOptions,
) -> Result<Box<dyn ImageSink + Send>> {
    for spec in specs.iter().rev() {
        sink = build_filter(spec, sink, image, tag, opts)?;
    }
    Ok(sink)
}

fn build_filter(
    spec: &FilterSpec,
    inner: Box<dyn ImageSink + Send>,
    image: &str,
    tag: &str,
    opts: &GlobalOptions,
) -> Result<Box<dyn ImageSink + Send>> {
    match spec.name.as_str() {
        "normalize-timestamps" => {
            let timestamp = spec
                .options
                .get("ts")
                .or_else(|| spec.options.get("timestamp"))
                .and_then(|v| v.as_int())
                .unwrap_or(0);
            if timestamp < 0 {
                return Err(ImageError::UriParse(
                    "normalize-timestamps needs a non-negative timestamp".to_string(),
                ));
            }
            Ok(Box::new(TimestampNormalizer::new(
                inner,
                timestamp as u64,
                opts.temp_dir.clone(),
            )))
        }
        "exclude" => {
            let patterns: Vec<String> = spec
                .options
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ImageError::UriParse("exclude filter needs a pattern option".to_string())
                })?
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            Ok(Box::new(ExcludeFilter::new(
                inner,
                &patterns,
                opts.temp_dir.clone(),
            )?))
        }
        "search" => {
            let pattern = spec
                .options
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ImageError::UriParse("search filter needs a pattern option".to_string())
                })?;
            let use_regex = spec
                .options
                .get("regex")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let script_friendly = spec
                .options
                .get("script_friendly")
                .or_else(|| spec.options.get("script-friendly"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(Box::new(SearchFilter::new(
                Some(inner),
                pattern,
                use_regex,
                image,
                tag,
                script_friendly,
            )?))
        }
        "inspect" => {
            let file = spec
                .options
                .get("file")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ImageError::UriParse("inspect filter needs a file option".to_string())
                })?;
            Ok(Box::new(InspectFilter::new(Some(inner), file, image, tag)))
        }
        other => Err(ImageError::UriParse(format!("unknown filter '{other}'"))),
    }
}

/// Runs a `process SOURCE DEST [-f FILTER]...` pipeline.
pub async fn run_process(
    source_uri: &str,
    dest_uri: &str,
    filters: &[String],
    opts: &GlobalOptions,
) -> Result<()> {
    let source_spec = parse_uri(source_uri)?;
    let dest_spec = parse_uri(dest_uri)?;
    let filter_specs = filters
        .iter()
        .map(|f| parse_filter(f))
        .collect::<Result<Vec<_>>>()?;

    let mut source = build_source(&source_spec, opts)?;
    let sink = build_sink(&dest_spec, source.image(), source.tag(), opts)?;
    let mut chain = wrap_filters(sink, &filter_specs, source.image(), source.tag(), opts)?;

    run_pipeline(&mut *source, &mut *chain).await
}

/// Runs a search-only pipeline: no destination, results on stdout.
pub async fn run_search(
    source_uri: &str,
    pattern: &str,
    use_regex: bool,
    script_friendly: bool,
    opts: &GlobalOptions,
) -> Result<()> {
    let source_spec = parse_uri(source_uri)?;
    let mut source = build_source(&source_spec, opts)?;
    let mut search = SearchFilter::new(
        None,
        pattern,
        use_regex,
        source.image(),
        source.tag(),
        script_friendly,
    )?;
    run_pipeline(&mut *source, &mut search).await
}
