//! Capabilities the engine needs from the host system.
//!
//! The engine never talks to the registry, LSA or the privileged helper
//! directly. Everything goes through these traits so units stay testable
//! and the OS bindings can live elsewhere.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{AccessorError, EngineError, EngineResult};
use super::types::{PolicyKey, PolicyStore, PolicyValue};

/// Read/write capability over OS policy stores.
pub trait PolicyAccessor: Send + Sync {
    /// Read a value. `Ok(None)` means the value is absent.
    fn read(&self, store: PolicyStore, key: &PolicyKey)
    -> Result<Option<PolicyValue>, AccessorError>;

    fn write(
        &self,
        store: PolicyStore,
        key: &PolicyKey,
        value: &PolicyValue,
    ) -> Result<(), AccessorError>;

    fn delete(&self, store: PolicyStore, key: &PolicyKey) -> Result<(), AccessorError>;
}

/// Channel to the out-of-process privileged helper.
///
/// The result is an opaque string; callers parse it (bool, equality, lists).
#[cfg_attr(test, mockall::automock)]
pub trait CommandChannel: Send + Sync {
    fn run_command(&self, executable: &Path, args: &str) -> Result<String, AccessorError>;
}

/// Native enumeration of the cipher suites the TLS stack currently offers,
/// in priority order.
pub trait CipherSuiteSource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<String>, AccessorError>;
}

/// Fixed cipher-suite list, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCipherSuites(pub Vec<String>);

impl CipherSuiteSource for StaticCipherSuites {
    fn enumerate(&self) -> Result<Vec<String>, AccessorError> {
        Ok(self.0.clone())
    }
}

/// Enumerates cipher suites by asking the privileged helper (`tls list`).
pub struct CommandCipherSuites {
    commands: Arc<dyn CommandChannel>,
    helper_path: PathBuf,
}

impl CommandCipherSuites {
    pub fn new(commands: Arc<dyn CommandChannel>, helper_path: PathBuf) -> Self {
        Self {
            commands,
            helper_path,
        }
    }
}

impl CipherSuiteSource for CommandCipherSuites {
    fn enumerate(&self) -> Result<Vec<String>, AccessorError> {
        let output = self.commands.run_command(&self.helper_path, "tls list")?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Bundle of host capabilities handed to hand-authored units.
#[derive(Clone)]
pub struct HostServices {
    pub accessor: Arc<dyn PolicyAccessor>,
    pub commands: Arc<dyn CommandChannel>,
    pub cipher_suites: Arc<dyn CipherSuiteSource>,
    /// Path of the privileged helper executable
    pub helper_path: PathBuf,
}

impl HostServices {
    /// Run a helper command and return its trimmed output.
    pub fn helper(&self, args: &str) -> EngineResult<String> {
        let output = self.commands.run_command(&self.helper_path, args)?;
        Ok(output.trim().to_string())
    }

    /// Run a helper command whose output is a boolean literal.
    pub fn helper_bool(&self, args: &str) -> EngineResult<bool> {
        let output = self.helper(args)?;
        parse_bool(&output).ok_or_else(|| {
            EngineError::indeterminate(format!("expected a boolean from '{}', got '{}'", args, output))
        })
    }

    /// Whether a WMI property exists on this system. Older builds lack some
    /// Defender preferences; units treat a missing property as not applicable.
    pub fn wmi_property_available(&self, namespace: &str, class: &str, property: &str) -> bool {
        match self.helper_bool(&format!("getavailability {} {} {}", namespace, class, property)) {
            Ok(available) => {
                if !available {
                    tracing::debug!("WMI property {} not available on {}", property, class);
                }
                available
            }
            Err(e) => {
                tracing::warn!("Could not check WMI property {}: {}", property, e);
                false
            }
        }
    }

    pub fn read(&self, store: PolicyStore, key: &PolicyKey) -> EngineResult<Option<PolicyValue>> {
        Ok(self.accessor.read(store, key)?)
    }

    pub fn write(&self, store: PolicyStore, key: &PolicyKey, value: PolicyValue) -> EngineResult<()> {
        Ok(self.accessor.write(store, key, &value)?)
    }
}

/// Case-insensitive boolean parse of helper output.
pub fn parse_bool(s: &str) -> Option<bool> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        Some(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::InMemoryAccessor;

    fn host_with(commands: MockCommandChannel) -> HostServices {
        HostServices {
            accessor: Arc::new(InMemoryAccessor::new()),
            commands: Arc::new(commands),
            cipher_suites: Arc::new(StaticCipherSuites::default()),
            helper_path: PathBuf::from("/opt/helper"),
        }
    }

    #[test]
    fn helper_bool_parses_case_insensitively() {
        let mut commands = MockCommandChannel::new();
        commands
            .expect_run_command()
            .withf(|exe, args| exe == Path::new("/opt/helper") && args == "firewallmdns status")
            .returning(|_, _| Ok("True\r\n".to_string()));

        let host = host_with(commands);
        assert!(host.helper_bool("firewallmdns status").unwrap());
    }

    #[test]
    fn helper_bool_rejects_garbage() {
        let mut commands = MockCommandChannel::new();
        commands
            .expect_run_command()
            .returning(|_, _| Ok("maybe".to_string()));

        let host = host_with(commands);
        let err = host.helper_bool("networkprofiles status").unwrap_err();
        assert!(matches!(err, EngineError::Indeterminate(_)));
    }

    #[test]
    fn wmi_availability_is_false_on_channel_error() {
        let mut commands = MockCommandChannel::new();
        commands
            .expect_run_command()
            .returning(|_, _| Err(AccessorError::Channel("helper missing".into())));

        let host = host_with(commands);
        assert!(!host.wmi_property_available(
            "ROOT\\Microsoft\\Windows\\Defender",
            "MSFT_MpPreference",
            "DisableRestorePoint"
        ));
    }

    #[test]
    fn command_cipher_suites_splits_lines() {
        let mut commands = MockCommandChannel::new();
        commands
            .expect_run_command()
            .withf(|_, args| args == "tls list")
            .returning(|_, _| Ok("TLS_AES_256_GCM_SHA384\n\nTLS_AES_128_GCM_SHA256\n".to_string()));

        let source = CommandCipherSuites::new(Arc::new(commands), PathBuf::from("helper"));
        assert_eq!(
            source.enumerate().unwrap(),
            vec!["TLS_AES_256_GCM_SHA384", "TLS_AES_128_GCM_SHA256"]
        );
    }
}
