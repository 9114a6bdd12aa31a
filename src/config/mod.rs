use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::engine::DeviceIntent;
use crate::paths::Paths;
use crate::units::CountryList;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Policy store backend: "snapshot" (JSON file) or "memory"
    #[serde(default = "default_accessor")]
    pub accessor: String,

    /// Snapshot file for the "snapshot" backend. Empty = state_dir default
    #[serde(default)]
    pub snapshot_file: String,

    /// Privileged helper executable
    #[serde(default = "default_helper_path")]
    pub helper_path: String,

    /// Seconds before a helper command is killed
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Re-verify each unit after applying it
    #[serde(default)]
    pub verify_after_apply: bool,

    /// Directory whose definition files override the bundled ones
    #[serde(default)]
    pub definitions_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Intent used when a command does not pass --intent
    #[serde(default)]
    pub default_intent: Option<DeviceIntent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Extra countries to offer blocking units for
    #[serde(default)]
    pub country_blocks: Vec<CountryList>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_accessor() -> String {
    "snapshot".to_string()
}
fn default_helper_path() -> String {
    "hardenctl-helper".to_string()
}
fn default_command_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accessor: default_accessor(),
            snapshot_file: String::new(),
            helper_path: default_helper_path(),
            command_timeout_secs: default_command_timeout(),
            verify_after_apply: false,
            definitions_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        Self::load_with_paths(paths)
    }

    /// Load from an explicit file, e.g. `--config`.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    pub fn load_with_paths(paths: Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would leave the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.engine.command_timeout_secs == 0 {
            anyhow::bail!("engine.command_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    fn expand_env_vars(&mut self) {
        self.engine.helper_path = expand_path(&self.engine.helper_path);
        self.engine.snapshot_file = expand_path(&self.engine.snapshot_file);
        if let Some(dir) = &self.engine.definitions_dir {
            self.engine.definitions_dir = Some(expand_path(dir));
        }
    }

    /// Snapshot file in effect: the configured one, else the state_dir default.
    pub fn snapshot_path(&self) -> PathBuf {
        if self.engine.snapshot_file.is_empty() {
            self.paths.snapshot_file()
        } else {
            PathBuf::from(&self.engine.snapshot_file)
        }
    }

    /// Definition override directory, if one is configured or present under data_dir.
    pub fn definitions_override(&self) -> Option<PathBuf> {
        match &self.engine.definitions_dir {
            Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
            _ => Some(self.paths.definitions_dir()).filter(|dir| dir.is_dir()),
        }
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["engine", "accessor"] => Ok(self.engine.accessor.clone()),
            ["engine", "snapshot_file"] => Ok(self.engine.snapshot_file.clone()),
            ["engine", "helper_path"] => Ok(self.engine.helper_path.clone()),
            ["engine", "command_timeout_secs"] => Ok(self.engine.command_timeout_secs.to_string()),
            ["engine", "verify_after_apply"] => Ok(self.engine.verify_after_apply.to_string()),
            ["engine", "definitions_dir"] => {
                Ok(self.engine.definitions_dir.clone().unwrap_or_default())
            }
            ["filters", "default_intent"] => Ok(self
                .filters
                .default_intent
                .map(|i| i.to_string())
                .unwrap_or_default()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            ["audit", "enabled"] => Ok(self.audit.enabled.to_string()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["engine", "accessor"] => match value {
                "snapshot" | "memory" => self.engine.accessor = value.to_string(),
                _ => anyhow::bail!("Unknown accessor '{}': expected snapshot or memory", value),
            },
            ["engine", "snapshot_file"] => self.engine.snapshot_file = value.to_string(),
            ["engine", "helper_path"] => self.engine.helper_path = value.to_string(),
            ["engine", "command_timeout_secs"] => match value.parse::<u64>()? {
                0 => anyhow::bail!("engine.command_timeout_secs must be at least 1"),
                secs => self.engine.command_timeout_secs = secs,
            },
            ["engine", "verify_after_apply"] => self.engine.verify_after_apply = value.parse()?,
            ["engine", "definitions_dir"] => {
                self.engine.definitions_dir = Some(value.to_string()).filter(|v| !v.is_empty())
            }
            ["filters", "default_intent"] => {
                self.filters.default_intent = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().map_err(anyhow::Error::msg)?)
                }
            }
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => match value {
                "text" | "json" => self.logging.format = value.to_string(),
                _ => anyhow::bail!("Unknown log format '{}': expected text or json", value),
            },
            ["audit", "enabled"] => self.audit.enabled = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

/// `${VAR}` / `$VAR` for a whole value, then `~`.
fn expand_path(s: &str) -> String {
    let expanded = expand_env(s);
    shellexpand::tilde(&expanded).to_string()
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# hardenctl configuration
# Auto-created on first run. Edit as needed.

[engine]
# Policy store backend: "snapshot" keeps values in a JSON file, "memory"
# forgets them on exit
accessor = "snapshot"
# snapshot_file = "~/.local/state/hardenctl/policy-snapshot.json"

# Privileged helper used for WMI, firewall and TLS commands
helper_path = "hardenctl-helper"
command_timeout_secs = 30

# Re-verify each unit after applying it instead of assuming success
verify_after_apply = false

# Directory with definition files that replace the bundled ones
# definitions_dir = "/etc/hardenctl/definitions"

[filters]
# Device intent used when --intent is not given
# default_intent = "Business"

# Extra countries to block by IP range
# [[firewall.country_blocks]]
# name = "Atlantis"
# ipv4_url = "https://example.org/atlantis-v4.txt"
# ipv6_url = "https://example.org/atlantis-v6.txt"

[logging]
level = "info"
# text | json
format = "text"

[audit]
enabled = true
"#;
