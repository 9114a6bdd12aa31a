//! In-memory policy store.
//!
//! Backs tests and offline runs. Models the one OS ordering rule units
//! depend on: the lockout observation window (`ResetLockoutCount`) may not
//! exceed `LockoutDuration`, and cannot be set before a duration exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use super::accessor::PolicyAccessor;
use super::error::{AccessorError, LOCKOUT_SEQUENCING_CODE};
use super::types::{PolicyKey, PolicyStore, PolicyValue};

type StoreKey = (PolicyStore, PolicyKey);

#[derive(Default)]
pub struct InMemoryAccessor {
    values: RwLock<HashMap<StoreKey, PolicyValue>>,
    failures: RwLock<HashMap<PolicyKey, AccessorError>>,
    writes: AtomicUsize,
}

impl InMemoryAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: impl IntoIterator<Item = (PolicyStore, PolicyKey, PolicyValue)>) -> Self {
        let accessor = Self::new();
        for (store, key, value) in values {
            accessor.set(store, key, value);
        }
        accessor
    }

    /// Make every operation on `key` fail with `error` until cleared.
    pub fn fail_on(&self, key: PolicyKey, error: AccessorError) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, error);
    }

    pub fn clear_failure(&self, key: &PolicyKey) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Direct lookup that bypasses injected failures.
    pub fn get(&self, store: PolicyStore, key: &PolicyKey) -> Option<PolicyValue> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(store, key.clone()))
            .cloned()
    }

    /// Direct insert that bypasses ordering rules and failures.
    pub fn set(&self, store: PolicyStore, key: PolicyKey, value: PolicyValue) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((store, key), value);
    }

    /// Direct removal that bypasses failures.
    pub fn unset(&self, store: PolicyStore, key: &PolicyKey) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(store, key.clone()));
    }

    /// Every stored value, sorted by store then key for stable output.
    pub fn entries(&self) -> Vec<(PolicyStore, PolicyKey, PolicyValue)> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = values
            .iter()
            .map(|((store, key), value)| (*store, key.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| {
            (a.0 as u8, a.1.path.to_ascii_lowercase(), a.1.value_name.to_ascii_lowercase()).cmp(&(
                b.0 as u8,
                b.1.path.to_ascii_lowercase(),
                b.1.value_name.to_ascii_lowercase(),
            ))
        });
        entries
    }

    /// Number of successful writes and deletes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, key: &PolicyKey) -> Result<(), AccessorError> {
        match self
            .failures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl PolicyAccessor for InMemoryAccessor {
    fn read(
        &self,
        store: PolicyStore,
        key: &PolicyKey,
    ) -> Result<Option<PolicyValue>, AccessorError> {
        self.injected_failure(key)?;
        Ok(self.get(store, key))
    }

    fn write(
        &self,
        store: PolicyStore,
        key: &PolicyKey,
        value: &PolicyValue,
    ) -> Result<(), AccessorError> {
        self.injected_failure(key)?;
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if store == PolicyStore::SecurityPolicy {
            check_lockout_ordering(&values, key, value)?;
        }
        values.insert((store, key.clone()), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, store: PolicyStore, key: &PolicyKey) -> Result<(), AccessorError> {
        self.injected_failure(key)?;
        let removed = self
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(store, key.clone()));
        match removed {
            Some(_) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(AccessorError::NotFound(key.to_string())),
        }
    }
}

fn check_lockout_ordering(
    values: &HashMap<StoreKey, PolicyValue>,
    key: &PolicyKey,
    value: &PolicyValue,
) -> Result<(), AccessorError> {
    let sibling = |name: &str| {
        values
            .get(&(PolicyStore::SecurityPolicy, PolicyKey::new(key.path.clone(), name)))
            .and_then(PolicyValue::as_u64)
    };
    let Some(new_value) = value.as_u64() else {
        return Ok(());
    };

    if key.value_name.eq_ignore_ascii_case("ResetLockoutCount") {
        match sibling("LockoutDuration") {
            None => {
                return Err(AccessorError::Os {
                    code: LOCKOUT_SEQUENCING_CODE,
                    message: "LockoutDuration is not configured".to_string(),
                });
            }
            Some(duration) if new_value > duration => {
                return Err(AccessorError::Os {
                    code: LOCKOUT_SEQUENCING_CODE,
                    message: format!(
                        "observation window {} exceeds lockout duration {}",
                        new_value, duration
                    ),
                });
            }
            Some(_) => {}
        }
    } else if key.value_name.eq_ignore_ascii_case("LockoutDuration")
        && let Some(window) = sibling("ResetLockoutCount")
        && window > new_value
    {
        return Err(AccessorError::Os {
            code: LOCKOUT_SEQUENCING_CODE,
            message: format!(
                "lockout duration {} is shorter than observation window {}",
                new_value, window
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockout(name: &str) -> PolicyKey {
        PolicyKey::new("System Access", name)
    }

    #[test]
    fn read_write_delete() {
        let store = InMemoryAccessor::new();
        let key = PolicyKey::new("Software\\Policies\\Test", "Value");

        assert_eq!(store.read(PolicyStore::Registry, &key).unwrap(), None);
        store
            .write(PolicyStore::Registry, &key, &PolicyValue::Dword(1))
            .unwrap();
        assert_eq!(
            store.read(PolicyStore::Registry, &key).unwrap(),
            Some(PolicyValue::Dword(1))
        );
        // Same key in another store is a different value
        assert_eq!(store.read(PolicyStore::GroupPolicy, &key).unwrap(), None);

        store.delete(PolicyStore::Registry, &key).unwrap();
        assert!(matches!(
            store.delete(PolicyStore::Registry, &key),
            Err(AccessorError::NotFound(_))
        ));
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn injected_failures_apply_until_cleared() {
        let store = InMemoryAccessor::new();
        let key = PolicyKey::new("HKLM\\Broken", "Value");
        store.fail_on(key.clone(), AccessorError::PermissionDenied("nope".into()));

        assert!(store.read(PolicyStore::Registry, &key).is_err());
        assert!(
            store
                .write(PolicyStore::Registry, &key, &PolicyValue::Dword(1))
                .is_err()
        );

        store.clear_failure(&key);
        assert!(store.read(PolicyStore::Registry, &key).is_ok());
    }

    #[test]
    fn reset_count_requires_duration() {
        let store = InMemoryAccessor::new();
        let err = store
            .write(
                PolicyStore::SecurityPolicy,
                &lockout("ResetLockoutCount"),
                &PolicyValue::Dword(1440),
            )
            .unwrap_err();
        assert!(matches!(err, AccessorError::Os { code: 87, .. }));
        assert_eq!(store.get(PolicyStore::SecurityPolicy, &lockout("ResetLockoutCount")), None);
    }

    #[test]
    fn reset_count_may_not_exceed_duration() {
        let store = InMemoryAccessor::new();
        store
            .write(
                PolicyStore::SecurityPolicy,
                &lockout("LockoutDuration"),
                &PolicyValue::Dword(10),
            )
            .unwrap();
        assert!(
            store
                .write(
                    PolicyStore::SecurityPolicy,
                    &lockout("ResetLockoutCount"),
                    &PolicyValue::Dword(1440),
                )
                .is_err()
        );
        store
            .write(
                PolicyStore::SecurityPolicy,
                &lockout("ResetLockoutCount"),
                &PolicyValue::Dword(10),
            )
            .unwrap();

        // Shrinking the duration below the window is rejected too
        assert!(
            store
                .write(
                    PolicyStore::SecurityPolicy,
                    &lockout("LockoutDuration"),
                    &PolicyValue::Dword(5),
                )
                .is_err()
        );
    }

    #[test]
    fn entries_are_sorted() {
        let store = InMemoryAccessor::with_values([
            (PolicyStore::Registry, PolicyKey::new("b", "x"), PolicyValue::Dword(1)),
            (PolicyStore::GroupPolicy, PolicyKey::new("z", "x"), PolicyValue::Dword(2)),
            (PolicyStore::Registry, PolicyKey::new("a", "x"), PolicyValue::Dword(3)),
        ]);
        let entries = store.entries();
        assert_eq!(entries[0].0, PolicyStore::GroupPolicy);
        assert_eq!(entries[1].1.path, "a");
        assert_eq!(entries[2].1.path, "b");
    }
}
