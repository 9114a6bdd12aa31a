//! Account lockout overrides on top of the security baseline.
//!
//! The three values live in the local security policy's `System Access`
//! section. The OS rejects an observation window (`ResetLockoutCount`)
//! longer than the lockout duration, so every write that can cross that
//! line goes in an order the OS accepts.

use std::sync::Arc;

use crate::engine::{
    CategorySource, Category, DefaultApply, DefaultRemove, DefaultVerify, DeviceIntent,
    EngineResult, HostServices, PolicyAccessor, PolicyKey, PolicyStore, PolicyUnit, PolicyValue,
};

const SECTION: &str = "System Access";
const DOCS_URL: &str = "https://learn.microsoft.com/windows/security/threat-protection/security-policy-settings/account-lockout-policy";

pub const HARDENED_THRESHOLD: u32 = 5;
pub const HARDENED_MINUTES: u32 = 1440;
/// What remove restores for all three values
pub const BASELINE: u32 = 10;

fn key(name: &str) -> PolicyKey {
    PolicyKey::new(SECTION, name)
}

pub fn bad_count_key() -> PolicyKey {
    key("LockoutBadCount")
}

pub fn duration_key() -> PolicyKey {
    key("LockoutDuration")
}

pub fn reset_count_key() -> PolicyKey {
    key("ResetLockoutCount")
}

fn read_number(accessor: &dyn PolicyAccessor, key: &PolicyKey) -> EngineResult<Option<u64>> {
    Ok(accessor
        .read(PolicyStore::SecurityPolicy, key)?
        .and_then(|v| v.as_u64()))
}

fn write_number(accessor: &dyn PolicyAccessor, key: &PolicyKey, value: u32) -> EngineResult<()> {
    accessor.write(PolicyStore::SecurityPolicy, key, &PolicyValue::Dword(value))?;
    Ok(())
}

pub struct LockoutPolicies;

impl CategorySource for LockoutPolicies {
    fn category(&self) -> Category {
        Category::BaselineOverrides
    }

    fn hand_authored(&self, host: &HostServices) -> EngineResult<Vec<PolicyUnit>> {
        Ok(vec![
            bad_count_unit(host.accessor.clone()),
            duration_unit(host.accessor.clone()),
            reset_count_unit(host.accessor.clone()),
        ])
    }
}

/// Threshold of 5 bad attempts. Any stricter threshold also counts as
/// hardened, and so does 0.
fn bad_count_unit(accessor: Arc<dyn PolicyAccessor>) -> PolicyUnit {
    let (a, v, r) = (accessor.clone(), accessor.clone(), accessor);
    PolicyUnit::builder(Category::BaselineOverrides, "Account lockout threshold")
        .sub_category("AccountLockout")
        .url(DOCS_URL)
        .intents([DeviceIntent::All])
        .binding(
            PolicyStore::SecurityPolicy,
            bad_count_key(),
            PolicyValue::Dword(HARDENED_THRESHOLD),
        )
        .apply(DefaultApply::new(move || {
            write_number(a.as_ref(), &bad_count_key(), HARDENED_THRESHOLD)
        }))
        .verify(DefaultVerify::new(move || {
            Ok(read_number(v.as_ref(), &bad_count_key())?
                .is_some_and(|count| count <= u64::from(HARDENED_THRESHOLD)))
        }))
        .remove(DefaultRemove::new(move || {
            write_number(r.as_ref(), &bad_count_key(), BASELINE)
        }))
        .build()
}

fn duration_unit(accessor: Arc<dyn PolicyAccessor>) -> PolicyUnit {
    let (a, v, r) = (accessor.clone(), accessor.clone(), accessor);
    PolicyUnit::builder(Category::BaselineOverrides, "Account lockout duration")
        .sub_category("AccountLockout")
        .url(DOCS_URL)
        .intents([DeviceIntent::All])
        .binding(
            PolicyStore::SecurityPolicy,
            duration_key(),
            PolicyValue::Dword(HARDENED_MINUTES),
        )
        .apply(DefaultApply::new(move || {
            write_number(a.as_ref(), &duration_key(), HARDENED_MINUTES)
        }))
        .verify(DefaultVerify::new(move || {
            Ok(read_number(v.as_ref(), &duration_key())? == Some(u64::from(HARDENED_MINUTES)))
        }))
        .remove(DefaultRemove::new(move || {
            // Shrink the window first or the shorter duration is rejected
            if read_number(r.as_ref(), &reset_count_key())?.is_some_and(|w| w > u64::from(BASELINE)) {
                write_number(r.as_ref(), &reset_count_key(), BASELINE)?;
            }
            write_number(r.as_ref(), &duration_key(), BASELINE)
        }))
        .build()
}

fn reset_count_unit(accessor: Arc<dyn PolicyAccessor>) -> PolicyUnit {
    let (a, v, r) = (accessor.clone(), accessor.clone(), accessor);
    PolicyUnit::builder(Category::BaselineOverrides, "Reset account lockout counter after")
        .sub_category("AccountLockout")
        .url(DOCS_URL)
        .intents([DeviceIntent::All])
        .binding(
            PolicyStore::SecurityPolicy,
            reset_count_key(),
            PolicyValue::Dword(HARDENED_MINUTES),
        )
        .apply(DefaultApply::new(move || {
            // The window may not exceed the duration, so the duration goes first
            write_number(a.as_ref(), &duration_key(), HARDENED_MINUTES)?;
            write_number(a.as_ref(), &reset_count_key(), HARDENED_MINUTES)
        }))
        .verify(DefaultVerify::new(move || {
            Ok(read_number(v.as_ref(), &reset_count_key())? == Some(u64::from(HARDENED_MINUTES)))
        }))
        .remove(DefaultRemove::new(move || {
            write_number(r.as_ref(), &reset_count_key(), BASELINE)
        }))
        .build()
}
