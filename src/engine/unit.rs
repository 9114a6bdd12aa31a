//! The policy unit: one independently applicable, verifiable and removable
//! configuration item.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::accessor::PolicyAccessor;
use super::definitions::PolicyDefinition;
use super::error::{EngineError, EngineResult};
use super::registry::SpecializedStrategyRegistry;
use super::strategy::{
    ApplyStrategy, PolicyEntry, PolicyEntryApply, PolicyEntryRemove, PolicyEntryVerify,
    RemoveStrategy, VerifyStrategy,
};
use super::types::{
    Category, ComplianceStatus, DeviceIntent, ExecutionTiming, PolicyKey, PolicyStore, PolicyValue,
};

/// Namespace for deriving stable unit ids from `category|name`.
const UNIT_NAMESPACE: Uuid = Uuid::from_u128(0x5b2e_91c4_7d3a_4f0e_a8c1_2f6d_0e9b_4a17);

/// The policy a unit manages, used for specialized lookups and as the
/// default verification target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBinding {
    pub store: PolicyStore,
    pub key: PolicyKey,
    pub expected: PolicyValue,
}

pub struct PolicyUnit {
    id: Uuid,
    category: Category,
    sub_category: Option<String>,
    name: String,
    url: Option<String>,
    intents: Vec<DeviceIntent>,
    binding: Option<PolicyBinding>,
    apply: Box<dyn ApplyStrategy>,
    verify: Box<dyn VerifyStrategy>,
    remove: Box<dyn RemoveStrategy>,
}

/// Result of a verification. `error` is set only when the unit's own
/// strategy failed and the status is `Undetermined`.
#[derive(Debug)]
pub struct VerifyOutcome {
    pub status: ComplianceStatus,
    pub error: Option<EngineError>,
}

impl VerifyOutcome {
    fn determined(applied: bool) -> Self {
        Self {
            status: applied.into(),
            error: None,
        }
    }
}

/// Marker for a strategy slot the builder has not been given yet.
pub struct Missing;

/// Builder for [`PolicyUnit`]. `build` only exists once all three
/// strategies are set.
pub struct UnitBuilder<A, V, R> {
    category: Category,
    name: String,
    sub_category: Option<String>,
    url: Option<String>,
    intents: Vec<DeviceIntent>,
    binding: Option<PolicyBinding>,
    apply: A,
    verify: V,
    remove: R,
}

impl<A, V, R> UnitBuilder<A, V, R> {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn sub_category(mut self, sub_category: impl Into<String>) -> Self {
        self.sub_category = Some(sub_category.into());
        self
    }

    pub fn intents(mut self, intents: impl IntoIterator<Item = DeviceIntent>) -> Self {
        self.intents = intents.into_iter().collect();
        self
    }

    pub fn binding(mut self, store: PolicyStore, key: PolicyKey, expected: PolicyValue) -> Self {
        self.binding = Some(PolicyBinding {
            store,
            key,
            expected,
        });
        self
    }
}

impl<V, R> UnitBuilder<Missing, V, R> {
    pub fn apply(self, strategy: impl ApplyStrategy + 'static) -> UnitBuilder<Box<dyn ApplyStrategy>, V, R> {
        UnitBuilder {
            category: self.category,
            name: self.name,
            sub_category: self.sub_category,
            url: self.url,
            intents: self.intents,
            binding: self.binding,
            apply: Box::new(strategy),
            verify: self.verify,
            remove: self.remove,
        }
    }
}

impl<A, R> UnitBuilder<A, Missing, R> {
    pub fn verify(self, strategy: impl VerifyStrategy + 'static) -> UnitBuilder<A, Box<dyn VerifyStrategy>, R> {
        UnitBuilder {
            category: self.category,
            name: self.name,
            sub_category: self.sub_category,
            url: self.url,
            intents: self.intents,
            binding: self.binding,
            apply: self.apply,
            verify: Box::new(strategy),
            remove: self.remove,
        }
    }
}

impl<A, V> UnitBuilder<A, V, Missing> {
    pub fn remove(self, strategy: impl RemoveStrategy + 'static) -> UnitBuilder<A, V, Box<dyn RemoveStrategy>> {
        UnitBuilder {
            category: self.category,
            name: self.name,
            sub_category: self.sub_category,
            url: self.url,
            intents: self.intents,
            binding: self.binding,
            apply: self.apply,
            verify: self.verify,
            remove: Box::new(strategy),
        }
    }
}

impl UnitBuilder<Box<dyn ApplyStrategy>, Box<dyn VerifyStrategy>, Box<dyn RemoveStrategy>> {
    pub fn build(self) -> PolicyUnit {
        let id = Uuid::new_v5(
            &UNIT_NAMESPACE,
            format!("{}|{}", self.category.as_str(), self.name).as_bytes(),
        );
        PolicyUnit {
            id,
            category: self.category,
            sub_category: self.sub_category,
            name: self.name,
            url: self.url,
            intents: self.intents,
            binding: self.binding,
            apply: self.apply,
            verify: self.verify,
            remove: self.remove,
        }
    }
}

impl PolicyUnit {
    pub fn builder(category: Category, name: impl Into<String>) -> UnitBuilder<Missing, Missing, Missing> {
        UnitBuilder {
            category,
            name: name.into(),
            sub_category: None,
            url: None,
            intents: Vec::new(),
            binding: None,
            apply: Missing,
            verify: Missing,
            remove: Missing,
        }
    }

    /// Build a unit from a declarative definition. The three strategies
    /// share one entry list so they always address the same policy.
    pub fn from_definition(
        definition: &PolicyDefinition,
        accessor: Arc<dyn PolicyAccessor>,
    ) -> EngineResult<Self> {
        let entry = definition.to_entry()?;
        let category: Category = definition
            .category
            .parse()
            .map_err(EngineError::Definition)?;
        let binding = (entry.store, entry.key.clone(), entry.value.clone());
        let entries: Arc<[PolicyEntry]> = vec![entry].into();

        let mut builder = PolicyUnit::builder(category, definition.friendly_name.clone())
            .intents(definition.device_intents.iter().copied())
            .binding(binding.0, binding.1, binding.2)
            .apply(PolicyEntryApply::new(accessor.clone(), entries.clone()))
            .verify(PolicyEntryVerify::new(accessor.clone(), entries.clone()))
            .remove(PolicyEntryRemove::new(accessor, entries));
        if let Some(url) = &definition.url {
            builder = builder.url(url.clone());
        }
        if let Some(sub) = &definition.sub_category {
            builder = builder.sub_category(sub.clone());
        }
        Ok(builder.build())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn sub_category(&self) -> Option<&str> {
        self.sub_category.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn intents(&self) -> &[DeviceIntent] {
        &self.intents
    }

    pub fn binding(&self) -> Option<&PolicyBinding> {
        self.binding.as_ref()
    }

    pub fn policy_key(&self) -> Option<&PolicyKey> {
        self.binding.as_ref().map(|b| &b.key)
    }

    /// Units tagged `All` match every intent; filtering by `All` matches
    /// every unit.
    pub fn matches_intent(&self, intent: DeviceIntent) -> bool {
        intent == DeviceIntent::All
            || self
                .intents
                .iter()
                .any(|i| *i == intent || *i == DeviceIntent::All)
    }

    /// Case-insensitive substring match over name, category, sub-category
    /// and policy key.
    pub fn matches_query(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        let haystacks = [
            Some(self.name.to_lowercase()),
            Some(self.category.as_str().to_lowercase()),
            self.sub_category.as_ref().map(|s| s.to_lowercase()),
            self.policy_key().map(|k| k.to_string().to_lowercase()),
        ];
        haystacks.iter().flatten().any(|h| h.contains(&needle))
    }

    /// Apply the unit: Before hooks, the apply strategy, After hooks.
    pub fn apply(&self, registry: &SpecializedStrategyRegistry) -> EngineResult<()> {
        debug!("Applying {}", self.name);
        guarded(|| {
            if let Some(key) = self.policy_key() {
                for hook in registry.apply_hooks(key, ExecutionTiming::Before) {
                    hook.run()?;
                }
            }
            self.apply.apply()?;
            if let Some(key) = self.policy_key() {
                for hook in registry.apply_hooks(key, ExecutionTiming::After) {
                    hook.run()?;
                }
            }
            Ok(())
        })
    }

    pub fn verify(&self, registry: &SpecializedStrategyRegistry) -> VerifyOutcome {
        self.verify_with_target(registry, None)
    }

    /// Verify the unit. A registered specialized verification for the
    /// unit's policy replaces the unit's own strategy and fails closed.
    pub fn verify_with_target(
        &self,
        registry: &SpecializedStrategyRegistry,
        target: Option<&PolicyValue>,
    ) -> VerifyOutcome {
        if let Some(key) = self.policy_key()
            && let Some(specialized) = registry.resolve(key)
        {
            let target = target.or(self.binding.as_ref().map(|b| &b.expected));
            return match guarded(|| specialized.verify(target)) {
                Ok(applied) => VerifyOutcome::determined(applied),
                Err(e) => {
                    warn!(
                        "Specialized verification for {} failed, treating as not applied: {}",
                        key, e
                    );
                    VerifyOutcome::determined(false)
                }
            };
        }

        match guarded(|| self.verify.verify()) {
            Ok(applied) => VerifyOutcome::determined(applied),
            Err(e) => {
                debug!("Verification of {} is undetermined: {}", self.name, e);
                VerifyOutcome {
                    status: ComplianceStatus::Undetermined,
                    error: Some(e),
                }
            }
        }
    }

    /// Remove the unit, restoring its baseline.
    pub fn remove(&self, registry: &SpecializedStrategyRegistry) -> EngineResult<()> {
        debug!("Removing {}", self.name);
        guarded(|| {
            if let Some(key) = self.policy_key() {
                for hook in registry.remove_hooks(key, ExecutionTiming::Before) {
                    hook.run()?;
                }
            }
            self.remove.remove()?;
            if let Some(key) = self.policy_key() {
                for hook in registry.remove_hooks(key, ExecutionTiming::After) {
                    hook.run()?;
                }
            }
            Ok(())
        })
    }
}

impl fmt::Debug for PolicyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyUnit")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("name", &self.name)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Run a strategy, turning a panic into an error so it cannot unwind into
/// the caller.
fn guarded<T>(f: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(EngineError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::AccessorError;
    use crate::engine::memory::InMemoryAccessor;
    use crate::engine::strategy::{
        DefaultApply, DefaultRemove, DefaultVerify, HookFn, NoOp, SpecializedVerify, Unverifiable,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn telemetry_key() -> PolicyKey {
        PolicyKey::new(
            "Software\\Policies\\Microsoft\\Windows\\DataCollection",
            "AllowTelemetry",
        )
    }

    fn declarative_unit(accessor: Arc<InMemoryAccessor>) -> PolicyUnit {
        let entries: Arc<[PolicyEntry]> = vec![PolicyEntry {
            store: PolicyStore::GroupPolicy,
            key: telemetry_key(),
            value: PolicyValue::Dword(1),
            baseline: Some(PolicyValue::Dword(3)),
        }]
        .into();
        PolicyUnit::builder(Category::MicrosoftDefender, "Telemetry")
            .intents([DeviceIntent::Business])
            .binding(PolicyStore::GroupPolicy, telemetry_key(), PolicyValue::Dword(1))
            .apply(PolicyEntryApply::new(accessor.clone(), entries.clone()))
            .verify(PolicyEntryVerify::new(accessor.clone(), entries.clone()))
            .remove(PolicyEntryRemove::new(accessor, entries))
            .build()
    }

    #[test]
    fn ids_are_stable_and_distinct() {
        let a = PolicyUnit::builder(Category::LockScreen, "A")
            .apply(NoOp)
            .verify(Unverifiable)
            .remove(NoOp)
            .build();
        let a2 = PolicyUnit::builder(Category::LockScreen, "A")
            .apply(NoOp)
            .verify(Unverifiable)
            .remove(NoOp)
            .build();
        let b = PolicyUnit::builder(Category::LockScreen, "B")
            .apply(NoOp)
            .verify(Unverifiable)
            .remove(NoOp)
            .build();
        assert_eq!(a.id(), a2.id());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn apply_verify_remove_cycle() {
        let registry = SpecializedStrategyRegistry::new();
        let accessor = Arc::new(InMemoryAccessor::new());
        let unit = declarative_unit(accessor.clone());

        assert_eq!(unit.verify(&registry).status, ComplianceStatus::NotApplied);
        unit.apply(&registry).unwrap();
        assert_eq!(unit.verify(&registry).status, ComplianceStatus::Applied);

        // Idempotent
        unit.apply(&registry).unwrap();
        assert_eq!(unit.verify(&registry).status, ComplianceStatus::Applied);

        unit.remove(&registry).unwrap();
        assert_eq!(unit.verify(&registry).status, ComplianceStatus::NotApplied);
    }

    #[test]
    fn specialized_verification_overrides_default() {
        let registry = SpecializedStrategyRegistry::new();
        let accessor = Arc::new(InMemoryAccessor::new());
        let unit = declarative_unit(accessor);

        // Default says NotApplied (nothing written), specialized says Applied
        registry.register_verification(
            telemetry_key(),
            Arc::new(SpecializedVerify::new(|_: Option<&PolicyValue>| Ok(true))),
        );
        assert_eq!(unit.verify(&registry).status, ComplianceStatus::Applied);
    }

    #[test]
    fn specialized_verification_receives_target() {
        let registry = SpecializedStrategyRegistry::new();
        let unit = declarative_unit(Arc::new(InMemoryAccessor::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.register_verification(
            telemetry_key(),
            Arc::new(SpecializedVerify::new(move |target: Option<&PolicyValue>| {
                sink.lock().unwrap().push(target.cloned());
                Ok(true)
            })),
        );

        unit.verify(&registry);
        unit.verify_with_target(&registry, Some(&PolicyValue::Dword(9)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Some(PolicyValue::Dword(1)));
        assert_eq!(seen[1], Some(PolicyValue::Dword(9)));
    }

    #[test]
    fn specialized_verification_fails_closed() {
        let registry = SpecializedStrategyRegistry::new();
        let unit = declarative_unit(Arc::new(InMemoryAccessor::new()));
        registry.register_verification(
            telemetry_key(),
            Arc::new(SpecializedVerify::new(|_: Option<&PolicyValue>| {
                Err(AccessorError::Channel("helper gone".into()).into())
            })),
        );

        let outcome = unit.verify(&registry);
        assert_eq!(outcome.status, ComplianceStatus::NotApplied);
        assert!(outcome.error.is_none());

        registry.register_verification(
            telemetry_key(),
            Arc::new(SpecializedVerify::new(|_: Option<&PolicyValue>| -> EngineResult<bool> {
                panic!("bad parse")
            })),
        );
        assert_eq!(unit.verify(&registry).status, ComplianceStatus::NotApplied);
    }

    #[test]
    fn verify_error_is_undetermined() {
        let registry = SpecializedStrategyRegistry::new();
        let accessor = Arc::new(InMemoryAccessor::new());
        accessor.fail_on(telemetry_key(), AccessorError::PermissionDenied("HKLM".into()));
        let unit = declarative_unit(accessor);

        let outcome = unit.verify(&registry);
        assert_eq!(outcome.status, ComplianceStatus::Undetermined);
        assert!(matches!(outcome.error, Some(EngineError::Accessor(_))));
    }

    #[test]
    fn panicking_apply_becomes_error() {
        let registry = SpecializedStrategyRegistry::new();
        let unit = PolicyUnit::builder(Category::MiscellaneousConfigurations, "Explodes")
            .apply(DefaultApply::new(|| panic!("kaboom")))
            .verify(DefaultVerify::new(|| Ok(false)))
            .remove(DefaultRemove::new(|| Ok(())))
            .build();

        match unit.apply(&registry) {
            Err(EngineError::Panicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[test]
    fn hooks_run_around_strategy() {
        let registry = SpecializedStrategyRegistry::new();
        let accessor = Arc::new(InMemoryAccessor::new());
        let unit = declarative_unit(accessor.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        let before = order.clone();
        let observer = accessor.clone();
        registry.register_apply_hook(
            telemetry_key(),
            Arc::new(HookFn::new("pre", ExecutionTiming::Before, move || {
                let written = observer.get(PolicyStore::GroupPolicy, &telemetry_key()).is_some();
                before.lock().unwrap().push(("pre", written));
                Ok(())
            })),
        );
        let after = order.clone();
        let observer = accessor.clone();
        registry.register_apply_hook(
            telemetry_key(),
            Arc::new(HookFn::new("post", ExecutionTiming::After, move || {
                let written = observer.get(PolicyStore::GroupPolicy, &telemetry_key()).is_some();
                after.lock().unwrap().push(("post", written));
                Ok(())
            })),
        );

        unit.apply(&registry).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![("pre", false), ("post", true)]);
    }

    #[test]
    fn failing_before_hook_stops_apply() {
        let registry = SpecializedStrategyRegistry::new();
        let accessor = Arc::new(InMemoryAccessor::new());
        let unit = declarative_unit(accessor.clone());
        registry.register_apply_hook(
            telemetry_key(),
            Arc::new(HookFn::new("precheck", ExecutionTiming::Before, || {
                Err(EngineError::indeterminate("prerequisite missing"))
            })),
        );

        assert!(unit.apply(&registry).is_err());
        assert_eq!(accessor.get(PolicyStore::GroupPolicy, &telemetry_key()), None);
    }

    #[test]
    fn intent_and_query_matching() {
        let unit = declarative_unit(Arc::new(InMemoryAccessor::new()));
        assert!(unit.matches_intent(DeviceIntent::Business));
        assert!(unit.matches_intent(DeviceIntent::All));
        assert!(!unit.matches_intent(DeviceIntent::Gaming));

        assert!(unit.matches_query("telemetry"));
        assert!(unit.matches_query("DATACOLLECTION"));
        assert!(unit.matches_query("defender"));
        assert!(!unit.matches_query("bitlocker"));

        let everywhere = PolicyUnit::builder(Category::LockScreen, "Everywhere")
            .intents([DeviceIntent::All])
            .apply(NoOp)
            .verify(Unverifiable)
            .remove(NoOp)
            .build();
        assert!(everywhere.matches_intent(DeviceIntent::Gaming));
    }

    #[test]
    fn closure_strategies_share_state() {
        let registry = SpecializedStrategyRegistry::new();
        let flag = Arc::new(AtomicBool::new(false));
        let (a, v, r) = (flag.clone(), flag.clone(), flag.clone());
        let unit = PolicyUnit::builder(Category::WindowsFirewall, "Flag")
            .apply(DefaultApply::new(move || {
                a.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .verify(DefaultVerify::new(move || Ok(v.load(Ordering::SeqCst))))
            .remove(DefaultRemove::new(move || {
                r.store(false, Ordering::SeqCst);
                Ok(())
            }))
            .build();

        unit.apply(&registry).unwrap();
        assert_eq!(unit.verify(&registry).status, ComplianceStatus::Applied);
        unit.remove(&registry).unwrap();
        assert_eq!(unit.verify(&registry).status, ComplianceStatus::NotApplied);
    }
}
