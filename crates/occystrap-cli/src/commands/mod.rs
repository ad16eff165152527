//! CLI command definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod process;
pub mod search;

/// Move container images between registries, daemons and on-disk formats.
#[derive(Parser)]
#[command(name = "occystrap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Operating system to select from multi-platform images
    #[arg(long, global = true, default_value = "linux")]
    pub os: String,

    /// Architecture to select from multi-platform images
    #[arg(long, global = true, default_value_t = default_architecture())]
    pub architecture: String,

    /// Architecture variant (e.g. v8)
    #[arg(long, global = true, default_value = "")]
    pub variant: String,

    /// Registry username
    #[arg(long, global = true, env = "OCCYSTRAP_USERNAME")]
    pub username: Option<String>,

    /// Registry password
    #[arg(long, global = true, env = "OCCYSTRAP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Talk to registries over plain HTTP
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Layer compression for registry pushes (gzip or zstd)
    #[arg(long, global = true, env = "OCCYSTRAP_COMPRESSION")]
    pub compression: Option<String>,

    /// Worker pool size for parallel transfers
    #[arg(long, global = true, default_value_t = 4)]
    pub parallel: usize,

    /// Directory for scratch files (defaults to the system temp dir)
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Move an image from SOURCE to DEST, optionally through filters
    Process(process::ProcessArgs),

    /// Search an image's layers for files matching a pattern
    Search(search::SearchArgs),
}

/// The host architecture in Docker/OCI spelling.
fn default_architecture() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
    .to_string()
}
