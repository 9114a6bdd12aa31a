//! Registries populated during catalog construction.
//!
//! Writes happen while a catalog is being built (under the catalog's
//! once-cell); reads happen from any thread during verification. Both maps
//! sit behind `RwLock` so readers tolerate a concurrent first population.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use super::strategy::{SpecializedHook, SpecializedVerification};
use super::types::{ExecutionTiming, PolicyKey, UnitOperation};

type HookMap = HashMap<PolicyKey, Vec<Arc<dyn SpecializedHook>>>;

/// Specialized verifications and apply/remove hooks, keyed by policy.
#[derive(Default)]
pub struct SpecializedStrategyRegistry {
    verifications: RwLock<HashMap<PolicyKey, Arc<dyn SpecializedVerification>>>,
    apply_hooks: RwLock<HookMap>,
    remove_hooks: RwLock<HookMap>,
}

impl SpecializedStrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the specialized verification for `key`.
    /// Last registration wins.
    pub fn register_verification(&self, key: PolicyKey, strategy: Arc<dyn SpecializedVerification>) {
        debug!("Registering specialized verification for {}", key);
        self.verifications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, strategy);
    }

    pub fn resolve(&self, key: &PolicyKey) -> Option<Arc<dyn SpecializedVerification>> {
        self.verifications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn verification_count(&self) -> usize {
        self.verifications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn register_apply_hook(&self, key: PolicyKey, hook: Arc<dyn SpecializedHook>) {
        upsert_hook(&self.apply_hooks, key, hook);
    }

    pub fn register_remove_hook(&self, key: PolicyKey, hook: Arc<dyn SpecializedHook>) {
        upsert_hook(&self.remove_hooks, key, hook);
    }

    pub fn apply_hooks(&self, key: &PolicyKey, timing: ExecutionTiming) -> Vec<Arc<dyn SpecializedHook>> {
        hooks_for(&self.apply_hooks, key, timing)
    }

    pub fn remove_hooks(&self, key: &PolicyKey, timing: ExecutionTiming) -> Vec<Arc<dyn SpecializedHook>> {
        hooks_for(&self.remove_hooks, key, timing)
    }
}

fn upsert_hook(map: &RwLock<HookMap>, key: PolicyKey, hook: Arc<dyn SpecializedHook>) {
    debug!("Registering {:?} hook '{}' for {}", hook.timing(), hook.name(), key);
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    let hooks = map.entry(key).or_default();
    match hooks.iter_mut().find(|h| h.name() == hook.name()) {
        Some(existing) => *existing = hook,
        None => hooks.push(hook),
    }
}

fn hooks_for(map: &RwLock<HookMap>, key: &PolicyKey, timing: ExecutionTiming) -> Vec<Arc<dyn SpecializedHook>> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
        .map(|hooks| hooks.iter().filter(|h| h.timing() == timing).cloned().collect())
        .unwrap_or_default()
}

/// Which operations a dependency applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyType {
    Apply,
    Remove,
    Both,
}

impl DependencyType {
    fn covers(self, operation: UnitOperation) -> bool {
        matches!(
            (self, operation),
            (DependencyType::Both, UnitOperation::Apply | UnitOperation::Remove)
                | (DependencyType::Apply, UnitOperation::Apply)
                | (DependencyType::Remove, UnitOperation::Remove)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Dependency {
    dependent: PolicyKey,
    kind: DependencyType,
    timing: ExecutionTiming,
}

/// Links between policies that must be applied or removed together.
#[derive(Default)]
pub struct DependencyRegistry {
    links: RwLock<HashMap<PolicyKey, Vec<Dependency>>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register that `dependent` accompanies `primary`. Identical
    /// registrations are ignored.
    pub fn register(
        &self,
        primary: PolicyKey,
        dependent: PolicyKey,
        kind: DependencyType,
        timing: ExecutionTiming,
    ) {
        let link = Dependency {
            dependent,
            kind,
            timing,
        };
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        let deps = links.entry(primary).or_default();
        if !deps.contains(&link) {
            deps.push(link);
        }
    }

    /// Direct dependents of `primary` for an operation and timing.
    pub fn dependents(
        &self,
        primary: &PolicyKey,
        operation: UnitOperation,
        timing: ExecutionTiming,
    ) -> Vec<PolicyKey> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(primary)
            .map(|deps| {
                deps.iter()
                    .filter(|d| d.timing == timing && d.kind.covers(operation))
                    .map(|d| d.dependent.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transitive dependents in execution order.
    ///
    /// Keys in `skip` (units already part of the batch) are left out, and
    /// each key is visited once so cycles terminate. Nested dependents are
    /// placed around their own primary according to their timing.
    pub fn resolve(
        &self,
        primary: &PolicyKey,
        operation: UnitOperation,
        timing: ExecutionTiming,
        skip: &HashSet<PolicyKey>,
    ) -> Vec<PolicyKey> {
        let mut visited = HashSet::new();
        visited.insert(primary.clone());
        let mut out = Vec::new();
        self.collect(primary, operation, timing, skip, &mut visited, &mut out);
        out
    }

    fn collect(
        &self,
        key: &PolicyKey,
        operation: UnitOperation,
        timing: ExecutionTiming,
        skip: &HashSet<PolicyKey>,
        visited: &mut HashSet<PolicyKey>,
        out: &mut Vec<PolicyKey>,
    ) {
        for dependent in self.dependents(key, operation, timing) {
            if !visited.insert(dependent.clone()) {
                debug!("Dependency cycle or repeat at {}, skipping", dependent);
                continue;
            }
            self.collect(&dependent, operation, ExecutionTiming::Before, skip, visited, out);
            if !skip.contains(&dependent) {
                out.push(dependent.clone());
            }
            self.collect(&dependent, operation, ExecutionTiming::After, skip, visited, out);
        }
    }
}
