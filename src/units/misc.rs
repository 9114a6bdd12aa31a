use std::sync::Arc;

use crate::engine::{
    BuildScope, Category, CategorySource, DeviceIntent, EngineResult, ExecutionTiming, HookFn,
    HostServices, PolicyEntry, PolicyEntryApply, PolicyEntryRemove, PolicyEntryVerify, PolicyKey,
    PolicyStore, PolicyUnit, PolicyValue,
};

/// Group policies that leave their registry value behind when set back to
/// not configured. Remove follows up by zeroing the value directly.
const TATTOOED: &[(&str, &str)] = &[
    ("System\\CurrentControlSet\\Control\\SCMConfig", "EnableSvchostMitigationPolicy"),
    ("System\\CurrentControlSet\\Control\\FileSystem", "LongPathsEnabled"),
];

/// Success and failure auditing
const AUDIT_SUCCESS_AND_FAILURE: u32 = 3;
const AUDIT_NONE: u32 = 0;

pub fn other_logon_events_key() -> PolicyKey {
    PolicyKey::new("Logon/Logoff", "{0CCE921C-69AE-11D9-BED3-505054503030}")
}

pub struct MiscellaneousConfigurations;

impl CategorySource for MiscellaneousConfigurations {
    fn category(&self) -> Category {
        Category::MiscellaneousConfigurations
    }

    fn register(&self, scope: &BuildScope<'_>) -> EngineResult<()> {
        for (path, value_name) in TATTOOED {
            let key = PolicyKey::new(*path, *value_name);
            let accessor = scope.host.accessor.clone();
            let target = key.clone();
            scope.specialized.register_remove_hook(
                key,
                Arc::new(HookFn::new(
                    format!("{}-cleanup", value_name),
                    ExecutionTiming::After,
                    move || {
                        accessor.write(PolicyStore::Registry, &target, &PolicyValue::Dword(0))?;
                        Ok(())
                    },
                )),
            );
        }
        Ok(())
    }

    fn hand_authored(&self, host: &HostServices) -> EngineResult<Vec<PolicyUnit>> {
        let entries: Arc<[PolicyEntry]> = vec![PolicyEntry {
            store: PolicyStore::AuditPolicy,
            key: other_logon_events_key(),
            value: PolicyValue::Dword(AUDIT_SUCCESS_AND_FAILURE),
            baseline: Some(PolicyValue::Dword(AUDIT_NONE)),
        }]
        .into();

        Ok(vec![
            PolicyUnit::builder(
                Category::MiscellaneousConfigurations,
                "Audit Other Logon/Logoff Events",
            )
            .sub_category("AuditPolicies")
            .url("https://learn.microsoft.com/windows/security/threat-protection/auditing/audit-other-logonlogoff-events")
            .intents([DeviceIntent::All])
            .binding(
                PolicyStore::AuditPolicy,
                other_logon_events_key(),
                PolicyValue::Dword(AUDIT_SUCCESS_AND_FAILURE),
            )
            .apply(PolicyEntryApply::new(host.accessor.clone(), entries.clone()))
            .verify(PolicyEntryVerify::new(host.accessor.clone(), entries.clone()))
            .remove(PolicyEntryRemove::new(host.accessor.clone(), entries))
            .build(),
        ])
    }
}
