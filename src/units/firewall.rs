use crate::engine::{
    Category, CategorySource, DefaultApply, DefaultRemove, DefaultVerify, DeviceIntent,
    EngineResult, HostServices, PolicyUnit,
};

const WORKSTATION_INTENTS: [DeviceIntent; 3] = [
    DeviceIntent::Business,
    DeviceIntent::SpecializedAccessWorkstation,
    DeviceIntent::PrivilegedAccessWorkstation,
];

/// A firewall setting driven entirely by helper commands whose status
/// command prints a boolean.
struct HelperToggle {
    name: &'static str,
    apply: &'static str,
    status: &'static str,
    remove: &'static str,
    url: &'static str,
}

const TOGGLES: [HelperToggle; 2] = [
    HelperToggle {
        name: "Block inbound mDNS",
        apply: "firewallmdns set false",
        status: "firewallmdns status",
        remove: "firewallmdns set true",
        url: "https://techcommunity.microsoft.com/t5/networking-blog/mdns-in-the-enterprise/ba-p/3275777",
    },
    HelperToggle {
        name: "Set all network locations to public",
        apply: "networkprofiles set 0",
        status: "networkprofiles status",
        remove: "networkprofiles set 1",
        url: "https://support.microsoft.com/windows/make-a-wi-fi-network-public-or-private-in-windows-0460117d-8d3e-a7ac-f003-7a0da607448d",
    },
];

impl HelperToggle {
    fn unit(&self, host: &HostServices) -> PolicyUnit {
        let (a, v, r) = (host.clone(), host.clone(), host.clone());
        let (apply, status, remove) = (self.apply, self.status, self.remove);
        PolicyUnit::builder(Category::WindowsFirewall, self.name)
            .url(self.url)
            .intents(WORKSTATION_INTENTS)
            .apply(DefaultApply::new(move || a.helper(apply).map(|_| ())))
            .verify(DefaultVerify::new(move || v.helper_bool(status)))
            .remove(DefaultRemove::new(move || r.helper(remove).map(|_| ())))
            .build()
    }
}

pub struct WindowsFirewall;

impl CategorySource for WindowsFirewall {
    fn category(&self) -> Category {
        Category::WindowsFirewall
    }

    fn hand_authored(&self, host: &HostServices) -> EngineResult<Vec<PolicyUnit>> {
        Ok(TOGGLES.iter().map(|t| t.unit(host)).collect())
    }
}
