use anyhow::Result;
use clap::Parser;

use hardenctl::cli::{self, Cli, Commands};
use hardenctl::engine::UnitOperation;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    init_logging(&cli);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Units(args) => cli::units::run(args, config_path),
        Commands::Apply(args) => cli::run::run(UnitOperation::Apply, args, config_path).await,
        Commands::Verify(args) => cli::run::run(UnitOperation::Verify, args, config_path).await,
        Commands::Remove(args) => cli::run::run(UnitOperation::Remove, args, config_path).await,
        Commands::Config(args) => cli::config::run(args, config_path),
        Commands::Audit(args) => cli::audit::run(args, config_path),
        Commands::Paths => cli::paths::run(config_path),
    }
}

/// `RUST_LOG` wins, then `--verbose`, then `logging.level` from the config.
fn init_logging(cli: &Cli) {
    let logging = cli::load_config(cli.config.as_deref())
        .map(|c| c.logging)
        .unwrap_or_default();
    let log_level = if cli.verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
