use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use super::{SelectionArgs, engine_context, load_config};
use crate::engine::PolicyUnit;

#[derive(Args)]
pub struct UnitsArgs {
    #[command(subcommand)]
    pub command: UnitsCommands,
}

#[derive(Subcommand)]
pub enum UnitsCommands {
    /// List units matching the selection
    List {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one unit and its current compliance
    Show {
        /// Unit id or exact name
        unit: String,
    },
}

pub fn run(args: UnitsArgs, config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let ctx = engine_context(&config)?;

    match args.command {
        UnitsCommands::List { selection, json } => {
            let units = ctx.select(&selection.filter(&config))?;
            if json {
                let rows: Vec<_> = units.iter().map(|u| unit_json(u)).collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for unit in &units {
                    println!("{}  {:<36}  {}", unit.id(), unit.category(), unit.name());
                }
                println!("\n{} units", units.len());
            }
        }
        UnitsCommands::Show { unit } => {
            let unit = ctx.lookup(&unit)?;
            let outcome = ctx.verify_unit(&unit);

            println!("{}", unit.name());
            println!("  id:           {}", unit.id());
            println!("  category:     {}", unit.category());
            if let Some(sub) = unit.sub_category() {
                println!("  sub-category: {}", sub);
            }
            let intents: Vec<String> = unit.intents().iter().map(|i| i.to_string()).collect();
            println!("  intents:      {}", intents.join(", "));
            if let Some(binding) = unit.binding() {
                println!("  policy:       {} {}", binding.store, binding.key);
                println!("  expected:     {}", binding.expected);
            }
            if let Some(url) = unit.url() {
                println!("  docs:         {}", url);
            }
            println!("  status:       {}", outcome.status);
            if let Some(e) = outcome.error {
                println!("  note:         {}", e);
            }
        }
    }

    Ok(())
}

fn unit_json(unit: &PolicyUnit) -> serde_json::Value {
    json!({
        "id": unit.id(),
        "category": unit.category(),
        "sub_category": unit.sub_category(),
        "name": unit.name(),
        "url": unit.url(),
        "intents": unit.intents(),
        "policy": unit.binding().map(|b| json!({
            "store": b.store,
            "key": b.key.to_string(),
            "expected": b.expected,
        })),
    })
}
