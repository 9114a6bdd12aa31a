//! `hardenctl apply|verify|remove`

use anyhow::{Context, Result};
use clap::Args;
use std::sync::{Arc, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use super::{SelectionArgs, engine_context, load_config};
use crate::audit::{self, JournalAction};
use crate::concurrency::RunLock;
use crate::config::Config;
use crate::engine::{
    BulkEvent, BulkOperationCoordinator, BulkReport, BulkState, CancellationToken, EngineContext,
    PolicyUnit, UnitFilter, UnitOperation, run_blocking_task, run_single,
};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Target a single unit by id or exact name (repeatable)
    #[arg(long = "unit")]
    pub units: Vec<String>,

    /// Print one row per unit after the summary
    #[arg(long)]
    pub details: bool,
}

pub async fn run(operation: UnitOperation, args: RunArgs, config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let ctx = Arc::new(engine_context(&config)?);

    let units = select_units(&ctx, &args, &config)?;
    if units.is_empty() {
        println!("No units match the selection.");
        return Ok(());
    }

    // Verify only reads; apply and remove must not overlap with another run
    let _guard = match operation {
        UnitOperation::Verify => None,
        _ => {
            let lock = RunLock::new(&config.paths)?;
            Some(lock.try_acquire()?.context(
                "Another hardenctl run is in progress; wait for it to finish and retry",
            )?)
        }
    };

    if args.units.len() == 1 {
        return run_one(operation, ctx, units[0].clone(), &config).await;
    }

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling after the current unit...");
                cancel.cancel();
            }
        })
    };

    let (tx, rx) = mpsc::channel();
    let progress = std::thread::spawn(move || print_progress(rx));

    let report = {
        let ctx = ctx.clone();
        let units = units.clone();
        let cancel = cancel.clone();
        run_blocking_task(move || {
            BulkOperationCoordinator::new(ctx)
                .with_progress(tx)
                .run(operation, &units, &cancel)
        })
        .await?
    };
    watcher.abort();
    let _ = progress.join();

    if config.audit.enabled
        && let Err(e) = audit::record_bulk(&config.paths.audit_log(), &report, "cli")
    {
        warn!("Failed to write audit journal: {:#}", e);
    }

    print_summary(&report, args.details);
    info!("{} finished: {}", operation, report.state);

    if report.state == BulkState::Failed {
        anyhow::bail!("{} of {} units failed", report.errors, report.outcomes.len());
    }
    Ok(())
}

/// A single `--unit` runs on its own: no progress stream and no dependents.
async fn run_one(
    operation: UnitOperation,
    ctx: Arc<EngineContext>,
    unit: Arc<PolicyUnit>,
    config: &Config,
) -> Result<()> {
    let outcome = {
        let unit = unit.clone();
        run_blocking_task(move || Ok(run_single(&ctx, operation, &unit))).await?
    };

    if config.audit.enabled
        && let Err(e) = audit::append_entry(
            &config.paths.audit_log(),
            JournalAction::single(operation),
            &[unit.id()],
            "cli",
            outcome.error.as_deref(),
        )
    {
        warn!("Failed to write audit journal: {:#}", e);
    }

    let status = outcome
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{} {}: {}", operation, unit.name(), status);
    info!("{} finished for {}: {}", operation, unit.name(), status);

    match outcome.error {
        Some(e) if operation != UnitOperation::Verify => {
            anyhow::bail!("{} failed for {}: {}", operation, unit.name(), e)
        }
        Some(e) => {
            println!("  note: {}", e);
            Ok(())
        }
        None => Ok(()),
    }
}

fn select_units(
    ctx: &EngineContext,
    args: &RunArgs,
    config: &Config,
) -> Result<Vec<Arc<PolicyUnit>>> {
    if args.units.is_empty() {
        return Ok(ctx.select(&args.selection.filter(config))?);
    }

    // Explicit units still honour any category/intent/search narrowing
    let mut filter: UnitFilter = args.selection.filter(config);
    if args.selection.intent.is_none() {
        filter.intent = None;
    }
    let mut ids: Vec<Uuid> = Vec::with_capacity(args.units.len());
    for needle in &args.units {
        let id = ctx.lookup(needle)?.id();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    filter.ids = ids;
    Ok(ctx.select(&filter)?)
}

fn print_progress(rx: mpsc::Receiver<BulkEvent>) {
    for event in rx {
        match event {
            BulkEvent::Started { operation, total } => {
                eprintln!("{} {} units", operation, total);
            }
            BulkEvent::UnitFinished {
                index,
                total,
                outcome,
            } => {
                let status = outcome
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                eprintln!("[{}/{}] {:<13} {}", index + 1, total, status, outcome.name);
            }
            BulkEvent::Finished { .. } => break,
        }
    }
}

fn print_summary(report: &BulkReport, details: bool) {
    println!();
    println!("{} {} in {:.1?}", report.operation, report.state, report.elapsed);
    println!("  applied:      {}", report.applied);
    println!("  not applied:  {}", report.not_applied);
    println!("  undetermined: {}", report.undetermined);
    println!("  errors:       {}", report.errors);
    if report.cancelled {
        println!("  unprocessed:  {}", report.unprocessed());
    }

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        println!();
        for outcome in failures {
            println!(
                "  ! {} [{}]: {}",
                outcome.name,
                outcome
                    .failure
                    .map(|k| k.to_string())
                    .unwrap_or_default(),
                outcome.error.as_deref().unwrap_or("")
            );
        }
    }

    if details {
        println!();
        for outcome in &report.outcomes {
            let status = match (outcome.processed, outcome.status) {
                (false, _) => "skipped".to_string(),
                (true, Some(s)) => s.to_string(),
                (true, None) => "-".to_string(),
            };
            println!(
                "  {}  {:<13} {:<36} {}",
                outcome.id, status, outcome.category, outcome.name
            );
        }
    }
}
