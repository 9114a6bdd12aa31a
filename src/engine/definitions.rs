//! Declarative policy definitions.
//!
//! Each category may ship a `policies/<Category>.json` file listing
//! registry-backed policies. Every record becomes one unit whose strategies
//! are the policy-entry strategies. Bundled files are compiled into the
//! binary; a directory configured in `engine.definitions_dir` overrides
//! them file by file.

use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use super::error::{EngineError, EngineResult};
use super::strategy::PolicyEntry;
use super::types::{Category, DeviceIntent, PolicyKey, PolicyStore, PolicyValue};

#[derive(RustEmbed)]
#[folder = "resources/"]
struct BundledDefinitions;

const WMI_VERIFICATIONS_FILE: &str = "wmi_verifications.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefinitionSource {
    GroupPolicy,
    Registry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryValueKind {
    #[serde(rename = "REG_DWORD")]
    Dword,
    #[serde(rename = "REG_QWORD")]
    Qword,
    #[serde(rename = "REG_SZ")]
    String,
    #[serde(rename = "REG_MULTI_SZ")]
    MultiString,
    #[serde(rename = "REG_BINARY")]
    Binary,
}

/// One declarative policy record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDefinition {
    pub source: DefinitionSource,
    pub key_name: String,
    pub value_name: String,
    #[serde(rename = "Type")]
    pub kind: RegistryValueKind,
    pub reg_value: String,
    /// Value restored on remove; absent means the value is deleted
    #[serde(default)]
    pub default_reg_value: Option<String>,
    pub friendly_name: String,
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
    pub category: String,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub device_intents: Vec<DeviceIntent>,
}

impl PolicyDefinition {
    pub fn store(&self) -> PolicyStore {
        match self.source {
            DefinitionSource::GroupPolicy => PolicyStore::GroupPolicy,
            DefinitionSource::Registry => PolicyStore::Registry,
        }
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.key_name.clone(), self.value_name.clone())
    }

    pub fn to_entry(&self) -> EngineResult<PolicyEntry> {
        let baseline = match &self.default_reg_value {
            Some(raw) => Some(parse_value(self.kind, raw)?),
            None => None,
        };
        Ok(PolicyEntry {
            store: self.store(),
            key: self.key(),
            value: parse_value(self.kind, &self.reg_value)?,
            baseline,
        })
    }

    fn validate(&self, category: Category) -> EngineResult<()> {
        let declared: Category = self.category.parse().map_err(EngineError::Definition)?;
        if declared != category {
            return Err(EngineError::Definition(format!(
                "{} is declared under {} but listed in the {} file",
                self.key(),
                declared,
                category
            )));
        }
        if self.device_intents.is_empty() {
            return Err(EngineError::Definition(format!(
                "{} has no device intents",
                self.key()
            )));
        }
        self.to_entry().map(|_| ())
    }
}

/// Parse a textual registry value according to its kind.
pub fn parse_value(kind: RegistryValueKind, raw: &str) -> EngineResult<PolicyValue> {
    let trimmed = raw.trim();
    let bad = |what: &str| EngineError::Definition(format!("invalid {} value '{}'", what, raw));
    match kind {
        RegistryValueKind::Dword => parse_number(trimmed)
            .and_then(|v| u32::try_from(v).ok())
            .map(PolicyValue::Dword)
            .ok_or_else(|| bad("REG_DWORD")),
        RegistryValueKind::Qword => parse_number(trimmed)
            .map(PolicyValue::Qword)
            .ok_or_else(|| bad("REG_QWORD")),
        RegistryValueKind::String => Ok(PolicyValue::String(raw.to_string())),
        RegistryValueKind::MultiString => Ok(PolicyValue::MultiString(
            raw.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        RegistryValueKind::Binary => {
            if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) || trimmed.len() % 2 != 0 {
                return Err(bad("REG_BINARY"));
            }
            trimmed
                .as_bytes()
                .chunks(2)
                .map(|pair| {
                    std::str::from_utf8(pair)
                        .ok()
                        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                        .ok_or_else(|| bad("REG_BINARY"))
                })
                .collect::<EngineResult<Vec<u8>>>()
                .map(PolicyValue::Binary)
        }
    }
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Specialized verification backed by a WMI property read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WmiVerificationDefinition {
    pub key_name: String,
    pub value_name: String,
    pub namespace: String,
    pub class: String,
    pub property: String,
    /// Accepted values, compared case-insensitively
    pub desired: Vec<String>,
}

impl WmiVerificationDefinition {
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.key_name.clone(), self.value_name.clone())
    }
}

/// Loads definition files, preferring an override directory when set.
#[derive(Debug, Clone, Default)]
pub struct DefinitionLoader {
    override_dir: Option<PathBuf>,
}

impl DefinitionLoader {
    pub fn bundled() -> Self {
        Self { override_dir: None }
    }

    pub fn with_override_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            override_dir: Some(dir.into()),
        }
    }

    /// Definitions for one category, in file order. A category without a
    /// file has no declarative units.
    pub fn load(&self, category: Category) -> EngineResult<Vec<PolicyDefinition>> {
        let name = format!("policies/{}.json", category.as_str());
        let Some(content) = self.read_resource(&name)? else {
            return Ok(Vec::new());
        };

        let definitions: Vec<PolicyDefinition> = serde_json::from_str(&content)
            .map_err(|e| EngineError::Definition(format!("{}: {}", name, e)))?;
        for definition in &definitions {
            definition.validate(category)?;
        }
        debug!("Loaded {} definitions for {}", definitions.len(), category);
        Ok(definitions)
    }

    pub fn load_wmi_verifications(&self) -> EngineResult<Vec<WmiVerificationDefinition>> {
        let Some(content) = self.read_resource(WMI_VERIFICATIONS_FILE)? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Definition(format!("{}: {}", WMI_VERIFICATIONS_FILE, e)))
    }

    fn read_resource(&self, name: &str) -> EngineResult<Option<String>> {
        if let Some(dir) = &self.override_dir {
            let path = dir.join(name);
            if path.exists() {
                debug!("Using definition override {}", path.display());
                let content = fs::read_to_string(&path).map_err(|e| {
                    EngineError::Definition(format!("cannot read {}: {}", path.display(), e))
                })?;
                return Ok(Some(content));
            }
        }

        match BundledDefinitions::get(name) {
            Some(file) => String::from_utf8(file.data.into_owned())
                .map(Some)
                .map_err(|e| EngineError::Definition(format!("{}: {}", name, e))),
            None => Ok(None),
        }
    }
}
