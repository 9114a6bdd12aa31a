//! Value types shared by every layer of the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// The OS policy store a value lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyStore {
    /// Registry-backed group policy (written through the local GPO)
    GroupPolicy,
    /// Plain registry value outside the policy hive
    Registry,
    /// Local security policy: account lockout, password policy
    SecurityPolicy,
    /// Advanced audit policy subcategories
    AuditPolicy,
}

impl fmt::Display for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyStore::GroupPolicy => "group-policy",
            PolicyStore::Registry => "registry",
            PolicyStore::SecurityPolicy => "security-policy",
            PolicyStore::AuditPolicy => "audit-policy",
        };
        f.write_str(s)
    }
}

/// Identity of a single policy value: store path plus value name.
///
/// Comparison and hashing ignore ASCII case, matching how Windows treats
/// registry paths and value names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyKey {
    pub path: String,
    pub value_name: String,
}

impl PolicyKey {
    pub fn new(path: impl Into<String>, value_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value_name: value_name.into(),
        }
    }
}

impl PartialEq for PolicyKey {
    fn eq(&self, other: &Self) -> bool {
        self.path.eq_ignore_ascii_case(&other.path)
            && self.value_name.eq_ignore_ascii_case(&other.value_name)
    }
}

impl Eq for PolicyKey {}

impl Hash for PolicyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.path.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        // Separator so ("ab", "c") and ("a", "bc") hash differently
        state.write_u8(0xff);
        for b in self.value_name.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.path, self.value_name)
    }
}

/// A typed policy value as read from or written to a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PolicyValue {
    Dword(u32),
    Qword(u64),
    String(String),
    MultiString(Vec<String>),
    Binary(Vec<u8>),
}

impl PolicyValue {
    /// Numeric view of the value. Strings are parsed leniently.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PolicyValue::Dword(v) => Some(u64::from(*v)),
            PolicyValue::Qword(v) => Some(*v),
            PolicyValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PolicyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Items of a list-like value. A comma separated string counts as a list.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            PolicyValue::MultiString(items) => items.clone(),
            PolicyValue::String(s) => s
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyValue::Dword(v) => write!(f, "{}", v),
            PolicyValue::Qword(v) => write!(f, "{}", v),
            PolicyValue::String(s) => f.write_str(s),
            PolicyValue::MultiString(items) => f.write_str(&items.join(";")),
            PolicyValue::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Tri-state compliance of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Applied,
    NotApplied,
    #[default]
    Undetermined,
}

impl From<Option<bool>> for ComplianceStatus {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => ComplianceStatus::Applied,
            Some(false) => ComplianceStatus::NotApplied,
            None => ComplianceStatus::Undetermined,
        }
    }
}

impl From<bool> for ComplianceStatus {
    fn from(value: bool) -> Self {
        Some(value).into()
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComplianceStatus::Applied => "applied",
            ComplianceStatus::NotApplied => "not applied",
            ComplianceStatus::Undetermined => "undetermined",
        };
        f.write_str(s)
    }
}

/// The three operations every unit supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOperation {
    Apply,
    Verify,
    Remove,
}

impl fmt::Display for UnitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitOperation::Apply => "apply",
            UnitOperation::Verify => "verify",
            UnitOperation::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// Whether a hook or dependent runs before or after the main operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionTiming {
    Before,
    After,
}

/// Deployment profile a unit is relevant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceIntent {
    All,
    Business,
    SpecializedAccessWorkstation,
    PrivilegedAccessWorkstation,
    School,
    Development,
    Gaming,
}

impl DeviceIntent {
    pub const ALL: [DeviceIntent; 7] = [
        DeviceIntent::All,
        DeviceIntent::Business,
        DeviceIntent::SpecializedAccessWorkstation,
        DeviceIntent::PrivilegedAccessWorkstation,
        DeviceIntent::School,
        DeviceIntent::Development,
        DeviceIntent::Gaming,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceIntent::All => "All",
            DeviceIntent::Business => "Business",
            DeviceIntent::SpecializedAccessWorkstation => "SpecializedAccessWorkstation",
            DeviceIntent::PrivilegedAccessWorkstation => "PrivilegedAccessWorkstation",
            DeviceIntent::School => "School",
            DeviceIntent::Development => "Development",
            DeviceIntent::Gaming => "Gaming",
        }
    }
}

impl fmt::Display for DeviceIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_token(s);
        match wanted.as_str() {
            "saw" => return Ok(DeviceIntent::SpecializedAccessWorkstation),
            "paw" => return Ok(DeviceIntent::PrivilegedAccessWorkstation),
            _ => {}
        }
        DeviceIntent::ALL
            .into_iter()
            .find(|intent| normalize_token(intent.as_str()) == wanted)
            .ok_or_else(|| format!("Unknown device intent: {}", s))
    }
}

/// Category a unit belongs to. Each category has its own catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    MicrosoftSecurityBaseline,
    BaselineOverrides,
    MicrosoftDefender,
    AttackSurfaceReductionRules,
    BitLockerSettings,
    DeviceGuard,
    TlsSecurity,
    LockScreen,
    UserAccountControl,
    WindowsFirewall,
    WindowsNetworking,
    MiscellaneousConfigurations,
    WindowsUpdateConfigurations,
    EdgeBrowserConfigurations,
    CountryIpBlocking,
}

impl Category {
    pub const ALL: [Category; 15] = [
        Category::MicrosoftSecurityBaseline,
        Category::BaselineOverrides,
        Category::MicrosoftDefender,
        Category::AttackSurfaceReductionRules,
        Category::BitLockerSettings,
        Category::DeviceGuard,
        Category::TlsSecurity,
        Category::LockScreen,
        Category::UserAccountControl,
        Category::WindowsFirewall,
        Category::WindowsNetworking,
        Category::MiscellaneousConfigurations,
        Category::WindowsUpdateConfigurations,
        Category::EdgeBrowserConfigurations,
        Category::CountryIpBlocking,
    ];

    /// Canonical name, also the stem of the category's definition file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::MicrosoftSecurityBaseline => "MicrosoftSecurityBaseline",
            Category::BaselineOverrides => "MSFTSecBaselines_OptionalOverrides",
            Category::MicrosoftDefender => "MicrosoftDefender",
            Category::AttackSurfaceReductionRules => "AttackSurfaceReductionRules",
            Category::BitLockerSettings => "BitLockerSettings",
            Category::DeviceGuard => "DeviceGuard",
            Category::TlsSecurity => "TLSSecurity",
            Category::LockScreen => "LockScreen",
            Category::UserAccountControl => "UserAccountControl",
            Category::WindowsFirewall => "WindowsFirewall",
            Category::WindowsNetworking => "WindowsNetworking",
            Category::MiscellaneousConfigurations => "MiscellaneousConfigurations",
            Category::WindowsUpdateConfigurations => "WindowsUpdateConfigurations",
            Category::EdgeBrowserConfigurations => "EdgeBrowserConfigurations",
            Category::CountryIpBlocking => "CountryIPBlocking",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_token(s);
        Category::ALL
            .into_iter()
            .find(|c| {
                normalize_token(c.as_str()) == wanted || normalize_token(&format!("{:?}", c)) == wanted
            })
            .ok_or_else(|| format!("Unknown category: {}", s))
    }
}

/// Lowercase and strip separators so `tls-security`, `TLS_Security` and
/// `TLSSecurity` all compare equal.
fn normalize_token(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}
