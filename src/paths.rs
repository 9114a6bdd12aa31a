//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. hardenctl-specific env var (HARDENCTL_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::getuid;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "hardenctl";

/// Resolved directory paths for the entire application.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Data directory: definition overrides
    pub data_dir: PathBuf,

    /// State directory: policy snapshot, audit journal, logs
    pub state_dir: PathBuf,

    /// Runtime directory: run lock.
    /// None if no suitable runtime directory is available.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "HARDENCTL_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });

        let data_dir = env_or(&env_fn, "HARDENCTL_DATA_DIR", || {
            strategy.data_dir().join(APP_DIR)
        });

        let state_dir = env_or(&env_fn, "HARDENCTL_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join(APP_DIR)
        });

        let runtime_dir = resolve_runtime_dir(&env_fn);

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
            runtime_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Audit journal: state_dir/hardenctl.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("hardenctl.audit.jsonl")
    }

    /// Default policy snapshot: state_dir/policy-snapshot.json
    pub fn snapshot_file(&self) -> PathBuf {
        self.state_dir.join("policy-snapshot.json")
    }

    /// Definition overrides: data_dir/definitions
    pub fn definitions_dir(&self) -> PathBuf {
        self.data_dir.join("definitions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Run lock file (in runtime_dir, falls back to state_dir)
    pub fn run_lock(&self) -> PathBuf {
        self.runtime_dir
            .as_ref()
            .unwrap_or(&self.state_dir)
            .join("run.lock")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }

        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                data_dir: home.join(".local").join("share").join(APP_DIR),
                state_dir: home.join(".local").join("state").join(APP_DIR),
                runtime_dir: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join(APP_DIR));
        }
    }

    // Fallback: $TMPDIR/hardenctl-$UID on Unix
    #[cfg(unix)]
    {
        let uid = unsafe { getuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        Some(PathBuf::from(tmpdir).join(format!("{}-{}", APP_DIR, uid)))
    }

    #[cfg(not(unix))]
    {
        env_fn("TEMP").ok().map(|t| {
            let user = env_fn("USERNAME").unwrap_or_else(|_| "user".into());
            PathBuf::from(t).join(format!("{}-{}", APP_DIR, user))
        })
    }
}

/// Create a directory with mode 0700 per XDG spec.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_end_in_app_dir() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(paths.config_dir.ends_with("hardenctl"));
        assert!(paths.data_dir.ends_with("hardenctl"));
        assert!(paths.state_dir.ends_with("hardenctl"));
    }

    #[test]
    fn env_vars_override_xdg() {
        let env = HashMap::from([
            ("HARDENCTL_CONFIG_DIR", "/custom/config"),
            ("HARDENCTL_DATA_DIR", "/custom/data"),
            ("HARDENCTL_STATE_DIR", "/custom/state"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(paths.run_lock(), PathBuf::from("/run/user/1000/hardenctl/run.lock"));
    }

    #[test]
    fn relative_and_empty_values_are_ignored() {
        let env = HashMap::from([("HARDENCTL_CONFIG_DIR", "relative/path"), ("HARDENCTL_STATE_DIR", "")]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
    }

    #[test]
    fn file_accessors() {
        let env = HashMap::from([
            ("HARDENCTL_STATE_DIR", "/s"),
            ("HARDENCTL_DATA_DIR", "/d"),
        ]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_file().ends_with("config.toml"));
        assert_eq!(paths.audit_log(), PathBuf::from("/s/hardenctl.audit.jsonl"));
        assert_eq!(paths.snapshot_file(), PathBuf::from("/s/policy-snapshot.json"));
        assert_eq!(paths.logs_dir(), PathBuf::from("/s/logs"));
        assert_eq!(paths.definitions_dir(), PathBuf::from("/d/definitions"));
    }

    #[cfg(unix)]
    #[test]
    fn ensure_dirs_sets_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().to_string();
        let (c, d, s) = (
            format!("{}/c", root),
            format!("{}/d", root),
            format!("{}/s", root),
        );
        let env = HashMap::from([
            ("HARDENCTL_CONFIG_DIR", c.as_str()),
            ("HARDENCTL_DATA_DIR", d.as_str()),
            ("HARDENCTL_STATE_DIR", s.as_str()),
            ("TMPDIR", root.as_str()),
        ]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        paths.ensure_dirs().unwrap();

        let mode = std::fs::metadata(&paths.state_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
