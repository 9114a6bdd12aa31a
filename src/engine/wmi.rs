//! Specialized verifications that read a WMI property through the helper.

use super::accessor::HostServices;
use super::definitions::WmiVerificationDefinition;
use super::error::EngineResult;
use super::strategy::SpecializedVerification;
use super::types::PolicyValue;

/// Passes when `get <namespace> <class> <property>` returns one of the
/// desired values, compared case-insensitively. A property the system does
/// not expose fails. The target value is ignored; the desired set comes
/// from the definition.
pub struct WmiVerification {
    host: HostServices,
    definition: WmiVerificationDefinition,
}

impl WmiVerification {
    pub fn new(host: HostServices, definition: WmiVerificationDefinition) -> Self {
        Self { host, definition }
    }

    fn command(&self) -> String {
        wmi_get_command(
            &self.definition.namespace,
            &self.definition.class,
            &self.definition.property,
        )
    }
}

impl SpecializedVerification for WmiVerification {
    fn verify(&self, _target: Option<&PolicyValue>) -> EngineResult<bool> {
        let d = &self.definition;
        if !self.host.wmi_property_available(&d.namespace, &d.class, &d.property) {
            return Ok(false);
        }
        let actual = self.host.helper(&self.command())?;
        Ok(self
            .definition
            .desired
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&actual)))
    }
}

pub fn wmi_get_command(namespace: &str, class: &str, property: &str) -> String {
    format!("get {} {} {}", namespace, class, property)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::accessor::{MockCommandChannel, StaticCipherSuites};
    use crate::engine::error::AccessorError;
    use crate::engine::memory::InMemoryAccessor;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn sac_definition() -> WmiVerificationDefinition {
        WmiVerificationDefinition {
            key_name: "SYSTEM\\CurrentControlSet\\Control\\CI\\Policy".into(),
            value_name: "VerifiedAndReputablePolicyState".into(),
            namespace: "ROOT\\Microsoft\\Windows\\Defender".into(),
            class: "MSFT_MpComputerStatus".into(),
            property: "SmartAppControlState".into(),
            desired: vec!["On".into()],
        }
    }

    fn host(commands: MockCommandChannel) -> HostServices {
        HostServices {
            accessor: Arc::new(InMemoryAccessor::new()),
            commands: Arc::new(commands),
            cipher_suites: Arc::new(StaticCipherSuites::default()),
            helper_path: PathBuf::from("helper"),
        }
    }

    fn available(commands: &mut MockCommandChannel, answer: &'static str) {
        commands
            .expect_run_command()
            .withf(|_, args| args.starts_with("getavailability "))
            .returning(move |_, _| Ok(answer.to_string()));
    }

    #[test]
    fn matches_desired_value_ignoring_case() {
        let mut commands = MockCommandChannel::new();
        available(&mut commands, "True");
        commands
            .expect_run_command()
            .withf(|_, args| {
                args == "get ROOT\\Microsoft\\Windows\\Defender MSFT_MpComputerStatus SmartAppControlState"
            })
            .returning(|_, _| Ok("on\n".to_string()));

        let verification = WmiVerification::new(host(commands), sac_definition());
        assert!(verification.verify(None).unwrap());
    }

    #[test]
    fn other_values_do_not_match() {
        let mut commands = MockCommandChannel::new();
        available(&mut commands, "true");
        commands
            .expect_run_command()
            .withf(|_, args| args.starts_with("get "))
            .returning(|_, _| Ok("Evaluation".to_string()));

        let verification = WmiVerification::new(host(commands), sac_definition());
        assert!(!verification.verify(None).unwrap());
    }

    #[test]
    fn unavailable_property_fails_without_reading() {
        let mut commands = MockCommandChannel::new();
        available(&mut commands, "false");
        commands
            .expect_run_command()
            .withf(|_, args| args.starts_with("get "))
            .never();

        let verification = WmiVerification::new(host(commands), sac_definition());
        assert!(!verification.verify(None).unwrap());
    }

    #[test]
    fn read_errors_propagate() {
        let mut commands = MockCommandChannel::new();
        available(&mut commands, "true");
        commands
            .expect_run_command()
            .withf(|_, args| args.starts_with("get "))
            .returning(|_, _| Err(AccessorError::Channel("no helper".into())));

        let verification = WmiVerification::new(host(commands), sac_definition());
        assert!(verification.verify(None).is_err());
    }
}
