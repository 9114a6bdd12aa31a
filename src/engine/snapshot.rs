//! File-backed policy store used by the CLI when no OS bindings are wired in.
//!
//! Values live in memory and are written back to a JSON snapshot after
//! every mutation (temp file + rename), so runs are inspectable and
//! repeatable.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use super::accessor::PolicyAccessor;
use super::error::AccessorError;
use super::memory::InMemoryAccessor;
use super::types::{PolicyKey, PolicyStore, PolicyValue};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    #[serde(default)]
    records: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    store: PolicyStore,
    path: String,
    value_name: String,
    value: PolicyValue,
}

pub struct SnapshotAccessor {
    inner: InMemoryAccessor,
    path: PathBuf,
    persist: Mutex<()>,
}

impl SnapshotAccessor {
    /// Open a snapshot, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AccessorError> {
        let path = path.into();
        let inner = InMemoryAccessor::new();

        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                AccessorError::Malformed(format!("cannot read {}: {}", path.display(), e))
            })?;
            let file: SnapshotFile = serde_json::from_str(&content).map_err(|e| {
                AccessorError::Malformed(format!("cannot parse {}: {}", path.display(), e))
            })?;
            if file.version != SNAPSHOT_VERSION {
                return Err(AccessorError::Malformed(format!(
                    "unsupported snapshot version {} in {}",
                    file.version,
                    path.display()
                )));
            }
            for record in file.records {
                inner.set(
                    record.store,
                    PolicyKey::new(record.path, record.value_name),
                    record.value,
                );
            }
            debug!("Loaded policy snapshot from {}", path.display());
        }

        Ok(Self {
            inner,
            path,
            persist: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run one mutation and write the snapshot. If the file cannot be
    /// written the in-memory value is restored, so reads never report a
    /// change that is not on disk.
    fn mutate(
        &self,
        store: PolicyStore,
        key: &PolicyKey,
        change: impl FnOnce(&InMemoryAccessor) -> Result<(), AccessorError>,
    ) -> Result<(), AccessorError> {
        let _guard = self.persist.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self.inner.get(store, key);
        change(&self.inner)?;
        if let Err(e) = self.persist() {
            match previous {
                Some(value) => self.inner.set(store, key.clone(), value),
                None => self.inner.unset(store, key),
            }
            warn!("Policy snapshot not saved, change to {} rolled back: {}", key, e);
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), AccessorError> {
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            records: self
                .inner
                .entries()
                .into_iter()
                .map(|(store, key, value)| SnapshotRecord {
                    store,
                    path: key.path,
                    value_name: key.value_name,
                    value,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| AccessorError::Malformed(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))?;
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> AccessorError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        AccessorError::PermissionDenied(path.display().to_string())
    } else {
        AccessorError::Os {
            code: e.raw_os_error().map(|c| c as u32).unwrap_or(0),
            message: format!("{}: {}", path.display(), e),
        }
    }
}

impl PolicyAccessor for SnapshotAccessor {
    fn read(
        &self,
        store: PolicyStore,
        key: &PolicyKey,
    ) -> Result<Option<PolicyValue>, AccessorError> {
        self.inner.read(store, key)
    }

    fn write(
        &self,
        store: PolicyStore,
        key: &PolicyKey,
        value: &PolicyValue,
    ) -> Result<(), AccessorError> {
        self.mutate(store, key, |inner| inner.write(store, key, value))
    }

    fn delete(&self, store: PolicyStore, key: &PolicyKey) -> Result<(), AccessorError> {
        self.mutate(store, key, |inner| inner.delete(store, key))
    }
}
