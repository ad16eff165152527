//! Sink producing an OCI runtime bundle.
//!
//! A bundle holds a single image: the merged rootfs goes in `rootfs/` and
//! a synthesized runtime `config.json` sits beside it, ready for
//! `runc run`. The image's own configuration is preserved as
//! `container-config.json` (not part of the OCI spec, but convenient).

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, info};

use occystrap_core::element::{Element, ImageSink};
use occystrap_core::error::{ImageError, Result};
use occystrap_core::manifest::ImageConfig;

use crate::extract::MergedTree;

/// Writes an image as an OCI runtime bundle.
pub struct OciBundleSink {
    root: PathBuf,
    rootfs: MergedTree,
    config: Option<Bytes>,
}

impl OciBundleSink {
    /// Creates the bundle directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let rootfs = MergedTree::new(root.join("rootfs"))?;
        Ok(Self {
            root,
            rootfs,
            config: None,
        })
    }
}

#[async_trait]
impl ImageSink for OciBundleSink {
    async fn process_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { data, .. } => {
                self.config = Some(data);
                Ok(())
            }
            Element::Layer { name, blob: Some(blob) } => {
                debug!(layer = %name, "applying layer to bundle rootfs");
                self.rootfs.apply_layer(blob.reader()?)?;
                Ok(())
            }
            Element::Layer { name, blob: None } => Err(ImageError::Sink(format!(
                "bundle sink needs layer bytes for {name} but the layer was skipped"
            ))),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let config = self
            .config
            .take()
            .ok_or_else(|| ImageError::Sink("no config file was processed".to_string()))?;

        // Keep the image config around, pretty-printed.
        let parsed: serde_json::Value = serde_json::from_slice(&config)?;
        fs::write(
            self.root.join("container-config.json"),
            serde_json::to_vec_pretty(&parsed)?,
        )?;

        let image_config: ImageConfig = serde_json::from_slice(&config)?;
        let spec = runtime_spec(&image_config);
        fs::write(
            self.root.join("config.json"),
            serde_json::to_vec_pretty(&spec)?,
        )?;

        info!(
            path = %self.root.display(),
            layers = self.rootfs.layers_applied(),
            "bundle complete"
        );
        Ok(())
    }
}

/// Builds a runc-compatible runtime spec from the image configuration.
fn runtime_spec(config: &ImageConfig) -> serde_json::Value {
    let mut args: Vec<String> = config
        .config
        .entrypoint
        .clone()
        .unwrap_or_default();
    args.extend(config.config.cmd.clone().unwrap_or_default());
    if args.is_empty() {
        args.push("sh".to_string());
    }

    let env = config.config.env.clone().unwrap_or_else(|| {
        vec![
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "TERM=xterm".to_string(),
        ]
    });

    let cwd = match config.config.working_dir.as_deref() {
        None | Some("") => "/",
        Some(dir) => dir,
    };

    let caps = json!(["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"]);

    json!({
        "ociVersion": "1.0.2-dev",
        "process": {
            // terminal = false passes through existing file descriptors.
            "terminal": false,
            "user": {"uid": 0, "gid": 0},
            "args": args,
            "env": env,
            "cwd": cwd,
            "capabilities": {
                "bounding": caps.clone(),
                "effective": caps.clone(),
                "inheritable": caps.clone(),
                "permitted": caps.clone(),
                "ambient": caps,
            },
            "rlimits": [
                {"type": "RLIMIT_NOFILE", "hard": 1024, "soft": 1024}
            ],
            "noNewPrivileges": true,
        },
        "root": {"path": "rootfs", "readonly": true},
        "hostname": "occystrap",
        "mounts": [
            {"destination": "/proc", "type": "proc", "source": "proc"},
            {"destination": "/dev", "type": "tmpfs", "source": "tmpfs",
             "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]},
            {"destination": "/dev/pts", "type": "devpts", "source": "devpts",
             "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666",
                         "mode=0620", "gid=5"]},
            {"destination": "/dev/shm", "type": "tmpfs", "source": "shm",
             "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]},
            {"destination": "/dev/mqueue", "type": "mqueue", "source": "mqueue",
             "options": ["nosuid", "noexec", "nodev"]},
            {"destination": "/sys", "type": "sysfs", "source": "sysfs",
             "options": ["nosuid", "noexec", "nodev", "ro"]},
            {"destination": "/sys/fs/cgroup", "type": "cgroup", "source": "cgroup",
             "options": ["nosuid", "noexec", "nodev", "relatime", "ro"]}
        ],
        "linux": {
            "resources": {
                "devices": [{"allow": false, "access": "rwm"}]
            },
            "namespaces": [
                {"type": "pid"},
                {"type": "network"},
                {"type": "ipc"},
                {"type": "uts"},
                {"type": "mount"},
                {"type": "cgroup"}
            ],
            "maskedPaths": [
                "/proc/acpi", "/proc/asound", "/proc/kcore", "/proc/keys",
                "/proc/latency_stats", "/proc/timer_list", "/proc/timer_stats",
                "/proc/sched_debug", "/sys/firmware", "/proc/scsi"
            ],
            "readonlyPaths": [
                "/proc/bus", "/proc/fs", "/proc/irq", "/proc/sys",
                "/proc/sysrq-trigger"
            ]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use occystrap_core::manifest::SchemaFamily;

    const CONFIG: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Entrypoint": ["/entry.sh"],
            "Cmd": ["--serve"],
            "Env": ["PATH=/bin", "APP=1"],
            "WorkingDir": "/srv"
        },
        "rootfs": {"type": "layers", "diff_ids": ["sha256:abcd"]},
        "history": []
    }"#;

    fn test_layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_bundle_layout_and_runtime_spec() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        let mut sink = OciBundleSink::new(&bundle).unwrap();

        sink.process_element(Element::Config {
            name: "cfg.json".to_string(),
            data: Bytes::from(CONFIG.as_bytes().to_vec()),
            family: SchemaFamily::Docker,
        })
        .await
        .unwrap();
        let layer = test_layer(&[("entry.sh", b"#!/bin/sh\n"), ("srv/app", b"bin")]);
        sink.process_element(Element::Layer {
            name: "1111".to_string(),
            blob: Some(occystrap_core::element::Blob::from_bytes(layer)),
        })
        .await
        .unwrap();
        sink.finalize().await.unwrap();

        assert!(bundle.join("rootfs/entry.sh").exists());
        assert!(bundle.join("container-config.json").exists());

        let spec: serde_json::Value =
            serde_json::from_slice(&fs::read(bundle.join("config.json")).unwrap()).unwrap();
        assert_eq!(spec["root"]["path"], "rootfs");
        assert_eq!(spec["process"]["cwd"], "/srv");
        assert_eq!(
            spec["process"]["args"],
            json!(["/entry.sh", "--serve"])
        );
        assert_eq!(spec["process"]["env"], json!(["PATH=/bin", "APP=1"]));
    }

    #[tokio::test]
    async fn test_defaults_when_config_is_sparse() {
        let config = r#"{"config": {}, "rootfs": {"type": "layers", "diff_ids": []}}"#;
        let parsed: ImageConfig = serde_json::from_str(config).unwrap();
        let spec = runtime_spec(&parsed);
        assert_eq!(spec["process"]["args"], json!(["sh"]));
        assert_eq!(spec["process"]["cwd"], "/");
    }
}
