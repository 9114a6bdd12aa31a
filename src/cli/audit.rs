use anyhow::Result;
use clap::{Args, Subcommand};

use super::load_config;
use crate::audit::{read_journal, verify_chain};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show the most recent journal entries
    Show {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Check the hash chain of the journal
    Verify,
}

pub fn run(args: AuditArgs, config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let journal = config.paths.audit_log();

    match args.command {
        AuditCommands::Show { limit } => {
            let entries = read_journal(&journal)?;
            if entries.is_empty() {
                println!("No journal entries at {}", journal.display());
                return Ok(());
            }
            let skip = entries.len().saturating_sub(limit);
            for entry in &entries[skip..] {
                let action = serde_json::to_value(entry.action)?;
                println!(
                    "{}  {:<15} {:>4} units  {}",
                    entry.ts,
                    action.as_str().unwrap_or_default(),
                    entry.unit_count,
                    entry.detail.as_deref().unwrap_or("")
                );
            }
        }
        AuditCommands::Verify => {
            let broken = verify_chain(&journal)?;
            if broken.is_empty() {
                println!("Journal chain intact ({})", journal.display());
            } else {
                let lines: Vec<String> = broken.iter().map(|i| (i + 1).to_string()).collect();
                anyhow::bail!("Journal chain broken at line(s) {}", lines.join(", "));
            }
        }
    }

    Ok(())
}
