//! Policy unit engine.
//!
//! Units live in per-category catalogs owned by an [`EngineContext`]. Each
//! unit carries an apply, a verify and a remove strategy; verification may
//! be overridden per policy through the [`SpecializedStrategyRegistry`].
//! Bulk runs go through the [`BulkOperationCoordinator`].

pub mod accessor;
pub mod bulk;
pub mod catalog;
pub mod command;
pub mod context;
pub mod definitions;
pub mod error;
pub mod filter;
pub mod memory;
pub mod registry;
pub mod snapshot;
pub mod status;
pub mod strategy;
pub mod types;
pub mod unit;
pub mod wmi;

pub use accessor::{
    CipherSuiteSource, CommandChannel, CommandCipherSuites, HostServices, PolicyAccessor,
    StaticCipherSuites,
};
pub use bulk::{
    BulkEvent, BulkOperationCoordinator, BulkReport, BulkState, CancellationToken, UnitOutcome,
    run_blocking_task, run_single,
};
pub use catalog::Catalog;
pub use command::{ProcessCommandChannel, ScriptedCommandChannel};
pub use context::{BuildScope, CategorySource, DEFAULT_SEARCH_LIMIT, EngineContext, EngineOptions};
pub use definitions::DefinitionLoader;
pub use error::{AccessorError, EngineError, EngineResult, FailureKind};
pub use filter::UnitFilter;
pub use memory::InMemoryAccessor;
pub use registry::{DependencyRegistry, DependencyType, SpecializedStrategyRegistry};
pub use snapshot::SnapshotAccessor;
pub use status::StatusBoard;
pub use strategy::{
    ApplyStrategy, DefaultApply, DefaultRemove, DefaultVerify, HookFn, NoOp, PolicyEntry,
    PolicyEntryApply, PolicyEntryRemove, PolicyEntryVerify, RemoveStrategy, SpecializedHook,
    SpecializedVerification, SpecializedVerify, Unverifiable, VerifyStrategy,
};
pub use types::{
    Category, ComplianceStatus, DeviceIntent, ExecutionTiming, PolicyKey, PolicyStore,
    PolicyValue, UnitOperation,
};
pub use unit::{PolicyUnit, VerifyOutcome};

/// Host services over `accessor` with a scripted helper that answers
/// nothing and no cipher suites.
#[cfg(test)]
pub(crate) fn test_host(accessor: std::sync::Arc<dyn PolicyAccessor>) -> HostServices {
    scripted_host(accessor, std::sync::Arc::new(ScriptedCommandChannel::new()))
}

#[cfg(test)]
pub(crate) fn scripted_host(
    accessor: std::sync::Arc<dyn PolicyAccessor>,
    commands: std::sync::Arc<ScriptedCommandChannel>,
) -> HostServices {
    HostServices {
        accessor,
        commands,
        cipher_suites: std::sync::Arc::new(StaticCipherSuites::default()),
        helper_path: std::path::PathBuf::from("hardenctl-helper"),
    }
}
