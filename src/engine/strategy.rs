//! Apply / verify / remove strategies.
//!
//! A unit owns exactly one strategy of each kind. Hand-authored units wrap
//! closures (`DefaultApply` etc.), declarative units use the policy-entry
//! strategies which write through a [`PolicyAccessor`].

use std::sync::Arc;
use tracing::debug;

use super::accessor::PolicyAccessor;
use super::error::{AccessorError, EngineError, EngineResult};
use super::types::{ExecutionTiming, PolicyKey, PolicyStore, PolicyValue};

pub trait ApplyStrategy: Send + Sync {
    fn apply(&self) -> EngineResult<()>;
}

pub trait VerifyStrategy: Send + Sync {
    /// `Ok(true)` when the policy is in effect.
    fn verify(&self) -> EngineResult<bool>;
}

pub trait RemoveStrategy: Send + Sync {
    fn remove(&self) -> EngineResult<()>;
}

type Action = Box<dyn Fn() -> EngineResult<()> + Send + Sync>;
type Check = Box<dyn Fn() -> EngineResult<bool> + Send + Sync>;

pub struct DefaultApply(Action);

impl DefaultApply {
    pub fn new(f: impl Fn() -> EngineResult<()> + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

impl ApplyStrategy for DefaultApply {
    fn apply(&self) -> EngineResult<()> {
        (self.0)()
    }
}

pub struct DefaultVerify(Check);

impl DefaultVerify {
    pub fn new(f: impl Fn() -> EngineResult<bool> + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

impl VerifyStrategy for DefaultVerify {
    fn verify(&self) -> EngineResult<bool> {
        (self.0)()
    }
}

pub struct DefaultRemove(Action);

impl DefaultRemove {
    pub fn new(f: impl Fn() -> EngineResult<()> + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

impl RemoveStrategy for DefaultRemove {
    fn remove(&self) -> EngineResult<()> {
        (self.0)()
    }
}

/// Explicit "nothing to do" for apply or remove.
pub struct NoOp;

impl ApplyStrategy for NoOp {
    fn apply(&self) -> EngineResult<()> {
        Ok(())
    }
}

impl RemoveStrategy for NoOp {
    fn remove(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Verification for units whose state cannot be read back.
pub struct Unverifiable;

impl VerifyStrategy for Unverifiable {
    fn verify(&self) -> EngineResult<bool> {
        Err(EngineError::indeterminate("unit has no verification"))
    }
}

/// One value a declarative unit manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub store: PolicyStore,
    pub key: PolicyKey,
    /// Hardened value
    pub value: PolicyValue,
    /// Value restored on remove. `None` deletes the value instead.
    pub baseline: Option<PolicyValue>,
}

/// Numeric values compare by magnitude so `Dword(1)` matches a `"1"` string
/// read back from a store that only knows text.
pub fn values_match(expected: &PolicyValue, actual: &PolicyValue) -> bool {
    if expected == actual {
        return true;
    }
    match (expected.as_u64(), actual.as_u64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub struct PolicyEntryApply {
    accessor: Arc<dyn PolicyAccessor>,
    entries: Arc<[PolicyEntry]>,
}

impl PolicyEntryApply {
    pub fn new(accessor: Arc<dyn PolicyAccessor>, entries: Arc<[PolicyEntry]>) -> Self {
        Self { accessor, entries }
    }
}

impl ApplyStrategy for PolicyEntryApply {
    fn apply(&self) -> EngineResult<()> {
        for entry in self.entries.iter() {
            debug!("Writing {} = {} ({})", entry.key, entry.value, entry.store);
            self.accessor.write(entry.store, &entry.key, &entry.value)?;
        }
        Ok(())
    }
}

pub struct PolicyEntryVerify {
    accessor: Arc<dyn PolicyAccessor>,
    entries: Arc<[PolicyEntry]>,
}

impl PolicyEntryVerify {
    pub fn new(accessor: Arc<dyn PolicyAccessor>, entries: Arc<[PolicyEntry]>) -> Self {
        Self { accessor, entries }
    }
}

impl VerifyStrategy for PolicyEntryVerify {
    fn verify(&self) -> EngineResult<bool> {
        for entry in self.entries.iter() {
            if !self.entry_matches(entry.store, entry)? {
                // Group policy may be missing from the POL file while the
                // effective registry value is already hardened
                if entry.store != PolicyStore::GroupPolicy
                    || !self.entry_matches(PolicyStore::Registry, entry)?
                {
                    return Ok(false);
                }
                debug!("{} satisfied by the registry", entry.key);
            }
        }
        Ok(true)
    }
}

impl PolicyEntryVerify {
    fn entry_matches(&self, store: PolicyStore, entry: &PolicyEntry) -> EngineResult<bool> {
        match self.accessor.read(store, &entry.key)? {
            Some(actual) if values_match(&entry.value, &actual) => Ok(true),
            Some(actual) => {
                debug!("{} is {} in {}, expected {}", entry.key, actual, store, entry.value);
                Ok(false)
            }
            None => {
                debug!("{} is not set in {}", entry.key, store);
                Ok(false)
            }
        }
    }
}

pub struct PolicyEntryRemove {
    accessor: Arc<dyn PolicyAccessor>,
    entries: Arc<[PolicyEntry]>,
}

impl PolicyEntryRemove {
    pub fn new(accessor: Arc<dyn PolicyAccessor>, entries: Arc<[PolicyEntry]>) -> Self {
        Self { accessor, entries }
    }
}

impl RemoveStrategy for PolicyEntryRemove {
    fn remove(&self) -> EngineResult<()> {
        for entry in self.entries.iter() {
            match &entry.baseline {
                Some(baseline) => self.accessor.write(entry.store, &entry.key, baseline)?,
                None => match self.accessor.delete(entry.store, &entry.key) {
                    // Already absent is the removed state
                    Ok(()) | Err(AccessorError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }
}

/// Alternate verification consulted instead of a unit's own strategy.
///
/// `target` is the concrete expected value when the caller knows it (for
/// example the configured cipher-suite list).
pub trait SpecializedVerification: Send + Sync {
    fn verify(&self, target: Option<&PolicyValue>) -> EngineResult<bool>;
}

type TargetCheck = Box<dyn Fn(Option<&PolicyValue>) -> EngineResult<bool> + Send + Sync>;

pub struct SpecializedVerify(TargetCheck);

impl SpecializedVerify {
    pub fn new(
        f: impl Fn(Option<&PolicyValue>) -> EngineResult<bool> + Send + Sync + 'static,
    ) -> Self {
        Self(Box::new(f))
    }
}

impl SpecializedVerification for SpecializedVerify {
    fn verify(&self, target: Option<&PolicyValue>) -> EngineResult<bool> {
        (self.0)(target)
    }
}

/// Extra work attached to a policy's apply or remove, run before or after
/// the unit's own strategy.
pub trait SpecializedHook: Send + Sync {
    /// Hooks are de-duplicated by name per policy key.
    fn name(&self) -> &str;
    fn timing(&self) -> ExecutionTiming;
    fn run(&self) -> EngineResult<()>;
}

pub struct HookFn {
    name: String,
    timing: ExecutionTiming,
    action: Action,
}

impl HookFn {
    pub fn new(
        name: impl Into<String>,
        timing: ExecutionTiming,
        action: impl Fn() -> EngineResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            timing,
            action: Box::new(action),
        }
    }
}

impl SpecializedHook for HookFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn timing(&self) -> ExecutionTiming {
        self.timing
    }

    fn run(&self) -> EngineResult<()> {
        (self.action)()
    }
}
