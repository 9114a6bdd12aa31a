//! Microsoft Defender preferences set over WMI, plus the Smart App Control
//! telemetry prerequisites.

use crate::engine::{
    BuildScope, Category, CategorySource, DefaultApply, DefaultRemove, DefaultVerify,
    DependencyType, DeviceIntent, EngineResult, ExecutionTiming, HostServices, PolicyKey,
    PolicyUnit,
};

pub const DEFENDER_NAMESPACE: &str = "ROOT\\Microsoft\\Windows\\Defender";
pub const PREFERENCE_CLASS: &str = "MSFT_MpPreference";

pub fn smart_app_control_key() -> PolicyKey {
    PolicyKey::new(
        "SYSTEM\\CurrentControlSet\\Control\\CI\\Policy",
        "VerifiedAndReputablePolicyState",
    )
}

const DATA_COLLECTION_PATH: &str = "Software\\Policies\\Microsoft\\Windows\\DataCollection";

/// A boolean `MSFT_MpPreference` property.
struct PreferenceToggle {
    name: &'static str,
    property: &'static str,
    /// Value written on apply; remove writes the opposite
    hardened: bool,
    url: Option<&'static str>,
    intents: &'static [DeviceIntent],
}

const TOGGLES: &[PreferenceToggle] = &[
    PreferenceToggle {
        name: "Enable restore point scanning",
        property: "DisableRestorePoint",
        hardened: false,
        url: Some("https://learn.microsoft.com/powershell/module/defender/set-mppreference"),
        intents: &[DeviceIntent::All],
    },
    PreferenceToggle {
        name: "Allow switching to asynchronous inspection",
        property: "AllowSwitchToAsyncInspection",
        hardened: true,
        url: None,
        intents: &[DeviceIntent::All],
    },
    PreferenceToggle {
        name: "Convert warn verdicts to block",
        property: "EnableConvertWarnToBlock",
        hardened: true,
        url: None,
        intents: &[
            DeviceIntent::Business,
            DeviceIntent::SpecializedAccessWorkstation,
            DeviceIntent::PrivilegedAccessWorkstation,
        ],
    },
    PreferenceToggle {
        name: "Block brute-force attempts from the local network",
        property: "BruteForceProtectionLocalNetworkBlocking",
        hardened: true,
        url: None,
        intents: &[DeviceIntent::All],
    },
];

fn set_command(property: &str, value: bool) -> String {
    format!(
        "wmi bool {} {} Set {} {}",
        DEFENDER_NAMESPACE, PREFERENCE_CLASS, property, value
    )
}

fn get_command(property: &str) -> String {
    crate::engine::wmi::wmi_get_command(DEFENDER_NAMESPACE, PREFERENCE_CLASS, property)
}

impl PreferenceToggle {
    fn unit(&self, host: &HostServices) -> PolicyUnit {
        let (a, v, r) = (host.clone(), host.clone(), host.clone());
        let (property, hardened) = (self.property, self.hardened);

        let mut builder = PolicyUnit::builder(Category::MicrosoftDefender, self.name)
            .sub_category("Preferences")
            .intents(self.intents.iter().copied())
            .apply(DefaultApply::new(move || {
                a.helper(&set_command(property, hardened)).map(|_| ())
            }))
            .verify(DefaultVerify::new(move || {
                // Older platforms do not expose every preference
                if !v.wmi_property_available(DEFENDER_NAMESPACE, PREFERENCE_CLASS, property) {
                    return Ok(false);
                }
                Ok(v.helper_bool(&get_command(property))? == hardened)
            }))
            .remove(DefaultRemove::new(move || {
                r.helper(&set_command(property, !hardened)).map(|_| ())
            }));
        if let Some(url) = self.url {
            builder = builder.url(url);
        }
        builder.build()
    }
}

pub struct MicrosoftDefender;

impl CategorySource for MicrosoftDefender {
    fn category(&self) -> Category {
        Category::MicrosoftDefender
    }

    /// Smart App Control only evaluates with optional diagnostic data
    /// enabled, so both telemetry policies follow it on apply and remove.
    fn register(&self, scope: &BuildScope<'_>) -> EngineResult<()> {
        for value_name in ["AllowTelemetry", "DisableTelemetryOptInSettingsUx"] {
            scope.dependencies.register(
                smart_app_control_key(),
                PolicyKey::new(DATA_COLLECTION_PATH, value_name),
                DependencyType::Both,
                ExecutionTiming::After,
            );
        }
        Ok(())
    }

    fn hand_authored(&self, host: &HostServices) -> EngineResult<Vec<PolicyUnit>> {
        Ok(TOGGLES.iter().map(|t| t.unit(host)).collect())
    }
}
