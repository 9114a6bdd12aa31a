//! Apply-all / verify-all / remove-all.
//!
//! Units run one after another in the order given. A failing unit is
//! recorded and the run continues; cancellation is checked before each
//! unit and leaves the remaining units unprocessed. Nothing is rolled back.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::EngineContext;
use super::error::{EngineError, EngineResult, FailureKind};
use super::types::{Category, ComplianceStatus, ExecutionTiming, PolicyKey, UnitOperation};
use super::unit::PolicyUnit;

/// Cooperative cancellation flag shared between the caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl std::fmt::Display for BulkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BulkState::Idle => "idle",
            BulkState::Running => "running",
            BulkState::Completed => "completed",
            BulkState::Cancelled => "cancelled",
            BulkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened to one unit during a run.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub id: Uuid,
    pub name: String,
    pub category: Category,
    /// False when the run was cancelled before reaching this unit
    pub processed: bool,
    pub status: Option<ComplianceStatus>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl UnitOutcome {
    fn pending(unit: &PolicyUnit) -> Self {
        Self {
            id: unit.id(),
            name: unit.name().to_string(),
            category: unit.category(),
            processed: false,
            status: None,
            error: None,
            failure: None,
        }
    }

    fn finished(unit: &PolicyUnit, status: ComplianceStatus) -> Self {
        Self {
            processed: true,
            status: Some(status),
            ..Self::pending(unit)
        }
    }

    fn failed(unit: &PolicyUnit, error: &EngineError) -> Self {
        Self {
            processed: true,
            status: Some(ComplianceStatus::Undetermined),
            error: Some(error.to_string()),
            failure: Some(error.kind()),
            ..Self::pending(unit)
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkReport {
    pub operation: UnitOperation,
    pub state: BulkState,
    pub applied: usize,
    pub not_applied: usize,
    pub undetermined: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub outcomes: Vec<UnitOutcome>,
    pub elapsed: Duration,
}

impl BulkReport {
    pub fn processed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.processed).count()
    }

    pub fn unprocessed(&self) -> usize {
        self.outcomes.len() - self.processed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }
}

/// Progress notifications for a running bulk operation.
#[derive(Debug, Clone)]
pub enum BulkEvent {
    Started {
        operation: UnitOperation,
        total: usize,
    },
    UnitFinished {
        index: usize,
        total: usize,
        outcome: UnitOutcome,
    },
    Finished {
        state: BulkState,
        errors: usize,
    },
}

pub struct BulkOperationCoordinator {
    ctx: Arc<EngineContext>,
    state: Mutex<BulkState>,
    progress: Option<Sender<BulkEvent>>,
}

impl BulkOperationCoordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(BulkState::Idle),
            progress: None,
        }
    }

    pub fn with_progress(mut self, sender: Sender<BulkEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn state(&self) -> BulkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` over `units` in order.
    ///
    /// Returns `Busy` if this coordinator is already running. Per-unit
    /// failures never abort the run; they are counted in the report.
    pub fn run(
        &self,
        operation: UnitOperation,
        units: &[Arc<PolicyUnit>],
        cancel: &CancellationToken,
    ) -> EngineResult<BulkReport> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == BulkState::Running {
                return Err(EngineError::Busy);
            }
            *state = BulkState::Running;
        }

        let started = Instant::now();
        let total = units.len();
        info!("Starting bulk {} over {} units", operation, total);
        self.emit(BulkEvent::Started { operation, total });

        let batch: HashSet<PolicyKey> = units
            .iter()
            .filter_map(|u| u.policy_key().cloned())
            .collect();
        let mut dependents_done: HashSet<Uuid> = HashSet::new();

        let mut report = BulkReport {
            operation,
            state: BulkState::Running,
            applied: 0,
            not_applied: 0,
            undetermined: 0,
            errors: 0,
            cancelled: false,
            outcomes: Vec::with_capacity(total),
            elapsed: Duration::ZERO,
        };

        for (index, unit) in units.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Bulk {} cancelled after {} of {} units", operation, index, total);
                report.cancelled = true;
                report
                    .outcomes
                    .extend(units[index..].iter().map(|u| UnitOutcome::pending(u)));
                break;
            }

            let outcome = self.run_unit(operation, unit, &batch, &mut dependents_done);
            match (&outcome.error, outcome.status) {
                (Some(_), _) if operation != UnitOperation::Verify => report.errors += 1,
                (_, Some(ComplianceStatus::Applied)) => report.applied += 1,
                (_, Some(ComplianceStatus::NotApplied)) => report.not_applied += 1,
                _ => report.undetermined += 1,
            }
            self.emit(BulkEvent::UnitFinished {
                index,
                total,
                outcome: outcome.clone(),
            });
            report.outcomes.push(outcome);
        }

        report.state = if report.cancelled {
            BulkState::Cancelled
        } else if report.errors > 0 {
            BulkState::Failed
        } else {
            BulkState::Completed
        };
        report.elapsed = started.elapsed();

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = report.state;
        self.emit(BulkEvent::Finished {
            state: report.state,
            errors: report.errors,
        });
        info!(
            "Bulk {} {}: {} applied, {} not applied, {} undetermined, {} errors in {:?}",
            operation,
            report.state,
            report.applied,
            report.not_applied,
            report.undetermined,
            report.errors,
            report.elapsed
        );
        Ok(report)
    }

    fn run_unit(
        &self,
        operation: UnitOperation,
        unit: &PolicyUnit,
        batch: &HashSet<PolicyKey>,
        dependents_done: &mut HashSet<Uuid>,
    ) -> UnitOutcome {
        if operation == UnitOperation::Verify {
            return run_single(&self.ctx, operation, unit);
        }

        self.run_dependents(operation, unit, ExecutionTiming::Before, batch, dependents_done);
        let outcome = run_single(&self.ctx, operation, unit);
        if outcome.error.is_none() {
            self.run_dependents(operation, unit, ExecutionTiming::After, batch, dependents_done);
        }
        outcome
    }

    /// Bring dependent units along. A failing dependent is logged and
    /// does not fail the primary unit. Each dependent runs at most once
    /// per batch, however many primaries share it.
    fn run_dependents(
        &self,
        operation: UnitOperation,
        unit: &PolicyUnit,
        timing: ExecutionTiming,
        batch: &HashSet<PolicyKey>,
        dependents_done: &mut HashSet<Uuid>,
    ) {
        let dependents = match self.ctx.dependency_units(unit, operation, timing, batch) {
            Ok(deps) => deps,
            Err(e) => {
                warn!("Could not resolve dependencies of {}: {}", unit.name(), e);
                return;
            }
        };
        for dependent in dependents {
            if !dependents_done.insert(dependent.id()) {
                debug!("Dependent {} already handled in this batch", dependent.name());
                continue;
            }
            debug!("{} dependent {} of {}", operation, dependent.name(), unit.name());
            let result = match operation {
                UnitOperation::Apply => self.ctx.apply_unit(&dependent),
                _ => self.ctx.remove_unit(&dependent),
            };
            if let Err(e) = result {
                warn!(
                    "Dependent {} of {} failed during {}: {}",
                    dependent.name(),
                    unit.name(),
                    operation,
                    e
                );
            }
        }
    }

    fn emit(&self, event: BulkEvent) {
        if let Some(tx) = &self.progress {
            // A dropped receiver only means nobody is watching
            let _ = tx.send(event);
        }
    }
}

/// Run one unit on its own. Dependents are left alone; only bulk runs
/// bring them along.
pub fn run_single(ctx: &EngineContext, operation: UnitOperation, unit: &PolicyUnit) -> UnitOutcome {
    let result = match operation {
        UnitOperation::Apply => ctx.apply_unit(unit),
        UnitOperation::Remove => ctx.remove_unit(unit),
        UnitOperation::Verify => {
            let verified = ctx.verify_unit(unit);
            return match verified.error {
                Some(e) => UnitOutcome::failed(unit, &e),
                None => UnitOutcome::finished(unit, verified.status),
            };
        }
    };
    match result {
        Ok(status) => UnitOutcome::finished(unit, status),
        Err(e) => {
            warn!("{} failed for {}: {}", operation, unit.name(), e);
            UnitOutcome::failed(unit, &e)
        }
    }
}

/// Run blocking engine work off the async runtime's worker threads.
pub async fn run_blocking_task<T, F>(task: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| EngineError::Panicked(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::definitions::DefinitionLoader;
    use crate::engine::error::AccessorError;
    use crate::engine::memory::InMemoryAccessor;
    use crate::engine::registry::DependencyType;
    use crate::engine::strategy::{DefaultApply, DefaultRemove, DefaultVerify};
    use crate::engine::test_host;
    use crate::engine::types::{PolicyStore, PolicyValue};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn context() -> Arc<EngineContext> {
        Arc::new(EngineContext::new(
            test_host(Arc::new(InMemoryAccessor::new())),
            DefinitionLoader::bundled(),
        ))
    }

    /// Five units; the one at `failing` (1-based) errors on apply. Every
    /// apply bumps `attempts`.
    fn five_units(failing: Option<usize>, attempts: Arc<AtomicUsize>) -> Vec<Arc<PolicyUnit>> {
        (1..=5)
            .map(|n| {
                let attempts = attempts.clone();
                Arc::new(
                    PolicyUnit::builder(Category::MiscellaneousConfigurations, format!("Unit {}", n))
                        .apply(DefaultApply::new(move || {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            if Some(n) == failing {
                                return Err(AccessorError::PermissionDenied("HKLM".into()).into());
                            }
                            Ok(())
                        }))
                        .verify(DefaultVerify::new(|| Ok(true)))
                        .remove(DefaultRemove::new(|| Ok(())))
                        .build(),
                )
            })
            .collect()
    }

    #[test]
    fn failure_is_isolated() {
        let ctx = context();
        let attempts = Arc::new(AtomicUsize::new(0));
        let units = five_units(Some(3), attempts.clone());
        let coordinator = BulkOperationCoordinator::new(ctx.clone());

        let report = coordinator
            .run(UnitOperation::Apply, &units, &CancellationToken::new())
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert_eq!(report.errors, 1);
        assert_eq!(report.applied, 4);
        assert_eq!(report.state, BulkState::Failed);
        assert_eq!(coordinator.state(), BulkState::Failed);

        let failed: Vec<_> = report.failures().map(|o| o.name.as_str()).collect();
        assert_eq!(failed, vec!["Unit 3"]);
        assert_eq!(report.outcomes[2].failure, Some(FailureKind::AccessorFailure));
        assert_eq!(ctx.status().get(units[2].id()), ComplianceStatus::Undetermined);
        assert_eq!(ctx.status().get(units[3].id()), ComplianceStatus::Applied);
    }

    #[test]
    fn cancellation_leaves_rest_unprocessed() {
        let ctx = context();
        let cancel = CancellationToken::new();
        let applied = Arc::new(AtomicUsize::new(0));

        let units: Vec<Arc<PolicyUnit>> = (1..=5)
            .map(|n| {
                let cancel = cancel.clone();
                let applied = applied.clone();
                Arc::new(
                    PolicyUnit::builder(Category::WindowsFirewall, format!("Rule {}", n))
                        .apply(DefaultApply::new(move || {
                            applied.fetch_add(1, Ordering::SeqCst);
                            if n == 2 {
                                cancel.cancel();
                            }
                            Ok(())
                        }))
                        .verify(DefaultVerify::new(|| Ok(true)))
                        .remove(DefaultRemove::new(|| Ok(())))
                        .build(),
                )
            })
            .collect();

        let report = BulkOperationCoordinator::new(ctx.clone())
            .run(UnitOperation::Apply, &units, &cancel)
            .unwrap();

        assert_eq!(report.state, BulkState::Cancelled);
        assert!(report.cancelled);
        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert_eq!(report.processed(), 2);
        assert_eq!(report.unprocessed(), 3);
        assert!(report.outcomes[..2].iter().all(|o| o.processed));
        assert!(report.outcomes[2..].iter().all(|o| !o.processed && o.status.is_none()));
        // Unprocessed units keep their previous status
        assert_eq!(ctx.status().get(units[4].id()), ComplianceStatus::Undetermined);
    }

    #[test]
    fn cancelled_before_start_processes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let units = five_units(None, Arc::new(AtomicUsize::new(0)));
        let report = BulkOperationCoordinator::new(context())
            .run(UnitOperation::Apply, &units, &cancel)
            .unwrap();
        assert_eq!(report.processed(), 0);
        assert_eq!(report.state, BulkState::Cancelled);
    }

    #[test]
    fn coordinator_can_run_again_after_finishing() {
        let coordinator = BulkOperationCoordinator::new(context());
        let units = five_units(None, Arc::new(AtomicUsize::new(0)));
        let first = coordinator
            .run(UnitOperation::Apply, &units, &CancellationToken::new())
            .unwrap();
        assert_eq!(first.state, BulkState::Completed);

        let second = coordinator
            .run(UnitOperation::Remove, &units, &CancellationToken::new())
            .unwrap();
        assert_eq!(second.not_applied, 5);
        assert_eq!(coordinator.state(), BulkState::Completed);
    }

    #[test]
    fn busy_while_running() {
        let ctx = context();
        let coordinator = Arc::new(BulkOperationCoordinator::new(ctx));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let blocker = Arc::new(
            PolicyUnit::builder(Category::WindowsFirewall, "Slow")
                .apply(DefaultApply::new(move || {
                    let _ = entered_tx.send(());
                    let _ = release_rx.lock().unwrap().recv();
                    Ok(())
                }))
                .verify(DefaultVerify::new(|| Ok(true)))
                .remove(DefaultRemove::new(|| Ok(())))
                .build(),
        );

        let runner = coordinator.clone();
        let units = vec![blocker];
        let handle = std::thread::spawn(move || {
            runner.run(UnitOperation::Apply, &units, &CancellationToken::new())
        });

        entered_rx.recv().unwrap();
        assert_eq!(coordinator.state(), BulkState::Running);
        assert!(matches!(
            coordinator.run(UnitOperation::Verify, &[], &CancellationToken::new()),
            Err(EngineError::Busy)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(handle.join().unwrap().unwrap().state, BulkState::Completed);
    }

    #[test]
    fn verify_counts_statuses_without_failing() {
        let ctx = context();
        let units: Vec<Arc<PolicyUnit>> = [Ok(true), Ok(false), Err(())]
            .into_iter()
            .enumerate()
            .map(|(i, result)| {
                Arc::new(
                    PolicyUnit::builder(Category::DeviceGuard, format!("Check {}", i))
                        .apply(DefaultApply::new(|| Ok(())))
                        .verify(DefaultVerify::new(move || {
                            result.map_err(|_| EngineError::indeterminate("unreadable"))
                        }))
                        .remove(DefaultRemove::new(|| Ok(())))
                        .build(),
                )
            })
            .collect();

        let report = BulkOperationCoordinator::new(ctx)
            .run(UnitOperation::Verify, &units, &CancellationToken::new())
            .unwrap();
        assert_eq!(
            (report.applied, report.not_applied, report.undetermined, report.errors),
            (1, 1, 1, 0)
        );
        assert_eq!(report.state, BulkState::Completed);
        assert_eq!(
            report.outcomes[2].failure,
            Some(FailureKind::VerificationIndeterminate)
        );
    }

    #[test]
    fn progress_events_are_sent() {
        let (tx, rx) = mpsc::channel();
        let units = five_units(None, Arc::new(AtomicUsize::new(0)));
        BulkOperationCoordinator::new(context())
            .with_progress(tx)
            .run(UnitOperation::Apply, &units, &CancellationToken::new())
            .unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 7);
        assert!(matches!(events[0], BulkEvent::Started { total: 5, .. }));
        assert!(matches!(
            events[6],
            BulkEvent::Finished {
                state: BulkState::Completed,
                errors: 0
            }
        ));
    }

    #[test]
    fn dependents_follow_their_primary() {
        let accessor = Arc::new(InMemoryAccessor::new());
        let ctx = Arc::new(EngineContext::new(
            test_host(accessor.clone()),
            DefinitionLoader::bundled(),
        ));
        let primary = ctx.lookup("Disable TLS 1.0 server").unwrap();
        let dependent = ctx.lookup("Disable TLS 1.0 client").unwrap();
        ctx.dependencies().register(
            primary.policy_key().unwrap().clone(),
            dependent.policy_key().unwrap().clone(),
            DependencyType::Both,
            ExecutionTiming::After,
        );

        let report = BulkOperationCoordinator::new(ctx.clone())
            .run(UnitOperation::Apply, &[primary.clone()], &CancellationToken::new())
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(
            accessor.get(PolicyStore::Registry, dependent.policy_key().unwrap()),
            Some(PolicyValue::Dword(0))
        );
        assert_eq!(ctx.status().get(dependent.id()), ComplianceStatus::Applied);

        BulkOperationCoordinator::new(ctx.clone())
            .run(UnitOperation::Remove, &[primary], &CancellationToken::new())
            .unwrap();
        assert_eq!(accessor.get(PolicyStore::Registry, dependent.policy_key().unwrap()), None);
    }

    #[test]
    fn shared_dependent_runs_once_per_batch() {
        let accessor = Arc::new(InMemoryAccessor::new());
        let ctx = Arc::new(EngineContext::new(
            test_host(accessor.clone()),
            DefinitionLoader::bundled(),
        ));
        let servers = [
            ctx.lookup("Disable TLS 1.0 server").unwrap(),
            ctx.lookup("Disable TLS 1.1 server").unwrap(),
        ];
        let shared = ctx.lookup("Disable TLS 1.0 client").unwrap();
        for server in &servers {
            ctx.dependencies().register(
                server.policy_key().unwrap().clone(),
                shared.policy_key().unwrap().clone(),
                DependencyType::Both,
                ExecutionTiming::After,
            );
        }

        let report = BulkOperationCoordinator::new(ctx.clone())
            .run(UnitOperation::Apply, &servers, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.applied, 2);
        // Two primaries plus the shared dependent, one write each
        assert_eq!(accessor.write_count(), 3);
    }

    #[test]
    fn single_unit_leaves_dependents_alone() {
        let accessor = Arc::new(InMemoryAccessor::new());
        let ctx = EngineContext::new(test_host(accessor.clone()), DefinitionLoader::bundled());
        let primary = ctx.lookup("Disable TLS 1.0 server").unwrap();
        let dependent = ctx.lookup("Disable TLS 1.0 client").unwrap();
        ctx.dependencies().register(
            primary.policy_key().unwrap().clone(),
            dependent.policy_key().unwrap().clone(),
            DependencyType::Both,
            ExecutionTiming::Before,
        );

        let outcome = run_single(&ctx, UnitOperation::Apply, &primary);
        assert_eq!(outcome.status, Some(ComplianceStatus::Applied));
        assert!(outcome.error.is_none());
        assert_eq!(accessor.get(PolicyStore::Registry, dependent.policy_key().unwrap()), None);
        assert_eq!(accessor.write_count(), 1);
    }

    #[tokio::test]
    async fn blocking_task_runs_off_runtime() {
        let ctx = context();
        let units = five_units(None, Arc::new(AtomicUsize::new(0)));
        let report = run_blocking_task(move || {
            BulkOperationCoordinator::new(ctx).run(
                UnitOperation::Apply,
                &units,
                &CancellationToken::new(),
            )
        })
        .await
        .unwrap();
        assert_eq!(report.applied, 5);
    }
}
