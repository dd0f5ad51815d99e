use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use runbox::config::loader::load_config;
use runbox::error::Result;

mod app;
mod execute;

#[derive(Parser, Debug)]
#[clap(name = "runbox-server")]
#[clap(version, about = "HTTP execution server for runbox")]
pub struct Cli {
    /// Configuration file path
    #[clap(short, long, env = "RUNBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address override
    #[clap(short, long)]
    pub bind: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());

    let state = app::AppState::new(Arc::new(config))?;
    let router = app::router(state);

    info!(bind = %bind, "Starting execution server");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
