mod commands;
mod report;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nightforge", about = "Build, deploy, and rotate container images for nightly and release channels")]
#[command(version)]
struct Cli {
    /// Configuration document (JSON)
    #[arg(long, short, global = true, default_value = "nightforge.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every configured application, deliver the images, and report
    Build {
        /// Limit the run to these application names
        apps: Vec<String>,
        /// Rotate images older than N days after the build pass
        #[arg(long, value_name = "N")]
        rotate: Option<i64>,
        /// Keep the per-run temporary directory for inspection
        #[arg(long)]
        keep_temp: bool,
        /// Build images without the layer cache
        #[arg(long)]
        no_cache: bool,
        /// Stream container build output to the terminal
        #[arg(long)]
        verbose: bool,
    },
    /// Remove build images older than N days
    Rotate {
        #[arg(long, value_name = "N")]
        days: i64,
    },
    /// Check that docker, git, the configuration, and the templates are usable
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            apps,
            rotate,
            keep_temp,
            no_cache,
            verbose,
        } => {
            let overrides = commands::BuildOverrides {
                rotate_after: rotate,
                keep_temp,
                no_cache,
                verbose,
            };
            commands::build(&cli.config, &apps, overrides, &report::StdoutSink).await?
        }
        Commands::Rotate { days } => commands::rotate(days).await?,
        Commands::Doctor => commands::doctor(&cli.config).await?,
    }

    Ok(())
}
