//! The process command: run a source -> filters -> sink pipeline.

use anyhow::Result;
use clap::Args;

use crate::pipeline::{run_process, GlobalOptions};

/// Arguments for the process command.
#[derive(Args)]
pub struct ProcessArgs {
    /// Source URI (registry://, docker://, tar://)
    pub source: String,

    /// Destination URI (tar://, dir://, oci://, mounts://, docker://, registry://)
    pub dest: String,

    /// Filter to apply, repeatable; elements flow through filters in the
    /// order given (name[:opt=val,...])
    #[arg(short = 'f', long = "filter")]
    pub filters: Vec<String>,
}

/// Executes the process command.
pub async fn execute(args: ProcessArgs, opts: GlobalOptions) -> Result<()> {
    run_process(&args.source, &args.dest, &args.filters, &opts).await?;
    Ok(())
}
