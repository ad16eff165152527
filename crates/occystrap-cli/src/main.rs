//! occystrap - move container images between registries, local daemons
//! and on-disk representations, optionally transforming them in flight.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use occystrap_cli::commands::{self, Cli, Commands};
use occystrap_cli::pipeline::GlobalOptions;
use occystrap_core::error::ImageError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "occystrap=debug"
    } else {
        "occystrap=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let opts = match global_options(&cli) {
        Ok(opts) => opts,
        Err(e) => exit_with(e.into()),
    };

    let result = match cli.command {
        Commands::Process(args) => commands::process::execute(args, opts).await,
        Commands::Search(args) => commands::search::execute(args, opts).await,
    };

    if let Err(e) = result {
        exit_with(e);
    }
}

fn global_options(cli: &Cli) -> Result<GlobalOptions, ImageError> {
    let compression = cli
        .compression
        .as_deref()
        .map(str::parse)
        .transpose()?;
    Ok(GlobalOptions {
        os: cli.os.clone(),
        architecture: cli.architecture.clone(),
        variant: cli.variant.clone(),
        username: cli.username.clone(),
        password: cli.password.clone(),
        insecure: cli.insecure,
        compression,
        parallel: cli.parallel.max(1),
        temp_dir: cli.temp_dir.clone(),
    })
}

/// Exit 2 for specification errors, 1 for pipeline failures.
fn exit_with(error: anyhow::Error) -> ! {
    eprintln!("occystrap: {error:#}");
    let code = match error.downcast_ref::<ImageError>() {
        Some(ImageError::UriParse(_)) => 2,
        _ => 1,
    };
    std::process::exit(code);
}
