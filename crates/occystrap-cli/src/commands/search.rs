//! The search command: scan an image's layers for matching paths.

use anyhow::Result;
use clap::Args;

use crate::pipeline::{run_search, GlobalOptions};

/// Arguments for the search command.
#[derive(Args)]
pub struct SearchArgs {
    /// Source URI (registry://, docker://, tar://)
    pub source: String,

    /// Glob to match member paths against (or a regex with --regex)
    pub pattern: String,

    /// Treat the pattern as a regular expression
    #[arg(long)]
    pub regex: bool,

    /// Emit machine-parseable image:tag:layer:path lines
    #[arg(long)]
    pub script_friendly: bool,
}

/// Executes the search command. Finding no matches is still success.
pub async fn execute(args: SearchArgs, opts: GlobalOptions) -> Result<()> {
    run_search(
        &args.source,
        &args.pattern,
        args.regex,
        args.script_friendly,
        &opts,
    )
    .await?;
    Ok(())
}
