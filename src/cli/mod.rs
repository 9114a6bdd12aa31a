pub mod audit;
pub mod config;
pub mod paths;
pub mod run;
pub mod units;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::engine::{
    Category, CommandChannel, CommandCipherSuites, DefinitionLoader, DeviceIntent, EngineContext,
    EngineOptions, HostServices, InMemoryAccessor, PolicyAccessor, ProcessCommandChannel,
    SnapshotAccessor, UnitFilter,
};
use crate::units::builtin_sources;

#[derive(Parser)]
#[command(name = "hardenctl")]
#[command(author, version, about = "Apply, verify and remove Windows hardening policies")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "HARDENCTL_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List and inspect policy units
    Units(units::UnitsArgs),

    /// Apply the selected units
    Apply(run::RunArgs),

    /// Verify the selected units
    Verify(run::RunArgs),

    /// Remove the selected units (restore baseline)
    Remove(run::RunArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Hardening journal
    Audit(audit::AuditArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Unit selection shared by listing and bulk commands.
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Restrict to a category (repeatable)
    #[arg(long = "category", value_parser = parse_category)]
    pub categories: Vec<Category>,

    /// Restrict to units relevant for a device intent
    #[arg(long, value_parser = parse_intent)]
    pub intent: Option<DeviceIntent>,

    /// Case-insensitive substring match on name, category or sub-category
    #[arg(long)]
    pub search: Option<String>,
}

impl SelectionArgs {
    pub fn filter(&self, config: &Config) -> UnitFilter {
        let mut filter = UnitFilter::all();
        for category in &self.categories {
            filter = filter.category(*category);
        }
        if let Some(intent) = self.intent.or(config.filters.default_intent) {
            filter = filter.intent(intent);
        }
        if let Some(query) = &self.search {
            filter = filter.query(query.clone());
        }
        filter
    }
}

fn parse_category(s: &str) -> Result<Category, String> {
    s.parse()
}

fn parse_intent(s: &str) -> Result<DeviceIntent, String> {
    s.parse()
}

/// Load the config named by `--config`, else the default location.
pub fn load_config(cli_path: Option<&str>) -> Result<Config> {
    match cli_path {
        Some(path) => Config::load_from(std::path::Path::new(path))
            .with_context(|| format!("Failed to load config from {}", path)),
        None => Config::load(),
    }
}

/// Wire the engine to the backends the config names.
pub fn engine_context(config: &Config) -> Result<EngineContext> {
    let accessor: Arc<dyn PolicyAccessor> = match config.engine.accessor.as_str() {
        "memory" => Arc::new(InMemoryAccessor::new()),
        "snapshot" => {
            let path = config.snapshot_path();
            Arc::new(
                SnapshotAccessor::open(path.clone())
                    .with_context(|| format!("Failed to open policy snapshot {}", path.display()))?,
            )
        }
        other => anyhow::bail!("Unknown accessor '{}': expected snapshot or memory", other),
    };

    let helper_path = PathBuf::from(&config.engine.helper_path);
    let commands: Arc<dyn CommandChannel> = Arc::new(ProcessCommandChannel::new(
        Duration::from_secs(config.engine.command_timeout_secs),
    ));
    let host = HostServices {
        accessor,
        commands: commands.clone(),
        cipher_suites: Arc::new(CommandCipherSuites::new(commands, helper_path.clone())),
        helper_path,
    };

    let loader = match config.definitions_override() {
        Some(dir) => DefinitionLoader::with_override_dir(dir),
        None => DefinitionLoader::bundled(),
    };

    Ok(EngineContext::new(host, loader)
        .with_options(EngineOptions {
            verify_after_apply: config.engine.verify_after_apply,
        })
        .with_sources(builtin_sources(config.firewall.country_blocks.clone())))
}
