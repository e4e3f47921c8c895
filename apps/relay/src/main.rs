use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use streamrelay::{config::Config, supervisor, worker};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/streamrelay/config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Internal: run as worker process N (spawned by the supervisor)
    #[arg(long, hide = true)]
    worker: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let (config, config_path) = if args.config.exists() {
        (Config::load(&args.config)?, Some(args.config.clone()))
    } else {
        info!(path = %args.config.display(), "no configuration file, using defaults");
        (Config::default(), None)
    };

    match args.worker {
        Some(worker_id) => worker::run(config, worker_id),
        None => {
            info!("streamrelay v{}", env!("CARGO_PKG_VERSION"));
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(supervisor::run(config, config_path, args.debug))
        }
    }
}
