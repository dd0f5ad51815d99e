use clap::Parser;

use runbox::cli::args::{Cli, Commands};
use runbox::cli::commands;
use runbox::config::loader::load_config;
use runbox::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    // Load configuration (file + CLI overrides)
    let config = load_config(cli.global_opts.config.as_deref())?;
    let format = cli.global_opts.format.clone();

    // Dispatch to subcommand handler
    let exit_code = match cli.command {
        Commands::Exec(args) => commands::exec(args, config, format).await?,
        Commands::Remote(args) => commands::remote(args, config, format).await?,
        Commands::Check(args) => commands::check(args, config, format).await?,
        Commands::Config(args) => commands::config(args, config).await?,
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
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
