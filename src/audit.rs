//! Append-only, hash-chained hardening journal.
//!
//! Every apply, verify and remove issued from the CLI leaves one JSONL line
//! in `state_dir/hardenctl.audit.jsonl`. Each entry carries the SHA-256 of
//! the previous line, so edits to the history break the chain.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `applied`, `bulk_removed`, `chain_recovery`, ... |
//! | `units_sha256` | SHA-256 over the sorted ids of the affected units |
//! | `unit_count` | Number of affected units |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line |
//! | `source` | Who triggered it (`cli`, `audit_system`) |
//! | `detail` | Optional summary, e.g. run counts |
//!
//! The first entry links to 64 zeros.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::engine::{BulkReport, BulkState, UnitOperation};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts: String,
    pub action: JournalAction,
    pub units_sha256: String,
    #[serde(default)]
    pub unit_count: usize,
    pub prev_entry_sha256: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalAction {
    Applied,
    Removed,
    Verified,
    BulkApplied,
    BulkRemoved,
    BulkVerified,
    /// A bulk run stopped early on request
    BulkCancelled,
    /// Previous entry corrupted, new chain segment started
    ChainRecovery,
}

impl JournalAction {
    pub fn single(operation: UnitOperation) -> Self {
        match operation {
            UnitOperation::Apply => JournalAction::Applied,
            UnitOperation::Remove => JournalAction::Removed,
            UnitOperation::Verify => JournalAction::Verified,
        }
    }

    pub fn bulk(operation: UnitOperation, state: BulkState) -> Self {
        if state == BulkState::Cancelled {
            return JournalAction::BulkCancelled;
        }
        match operation {
            UnitOperation::Apply => JournalAction::BulkApplied,
            UnitOperation::Remove => JournalAction::BulkRemoved,
            UnitOperation::Verify => JournalAction::BulkVerified,
        }
    }
}

/// Append an entry, chaining it to the last line of the journal.
///
/// A corrupted last line gets a `ChainRecovery` entry first so the break
/// point stays visible.
pub fn append_entry(
    path: &Path,
    action: JournalAction,
    unit_ids: &[Uuid],
    source: &str,
    detail: Option<&str>,
) -> Result<()> {
    let prev_hash = match last_line(path)? {
        Some(line) if serde_json::from_str::<JournalEntry>(&line).is_ok() => {
            sha256_hex(line.as_bytes())
        }
        Some(line) => {
            let recovery = JournalEntry {
                ts: chrono::Utc::now().to_rfc3339(),
                action: JournalAction::ChainRecovery,
                units_sha256: String::new(),
                unit_count: 0,
                prev_entry_sha256: sha256_hex(line.as_bytes()),
                source: "audit_system".to_string(),
                detail: Some(format!(
                    "Previous entry corrupted ({} bytes), new chain segment",
                    line.len()
                )),
            };
            let recovery_json =
                serde_json::to_string(&recovery).context("Failed to serialize recovery entry")?;
            append_line(path, &recovery_json)?;
            sha256_hex(recovery_json.as_bytes())
        }
        None => GENESIS_HASH.to_string(),
    };

    let entry = JournalEntry {
        ts: chrono::Utc::now().to_rfc3339(),
        action,
        units_sha256: units_digest(unit_ids),
        unit_count: unit_ids.len(),
        prev_entry_sha256: prev_hash,
        source: source.to_string(),
        detail: detail.map(str::to_string),
    };

    let json = serde_json::to_string(&entry).context("Failed to serialize journal entry")?;
    append_line(path, &json)
}

/// Record a finished bulk run.
pub fn record_bulk(path: &Path, report: &BulkReport, source: &str) -> Result<()> {
    let ids: Vec<Uuid> = report
        .outcomes
        .iter()
        .filter(|o| o.processed)
        .map(|o| o.id)
        .collect();
    let detail = format!(
        "{}: applied={} not_applied={} undetermined={} errors={} unprocessed={}",
        report.operation,
        report.applied,
        report.not_applied,
        report.undetermined,
        report.errors,
        report.unprocessed()
    );
    append_entry(
        path,
        JournalAction::bulk(report.operation, report.state),
        &ids,
        source,
        Some(&detail),
    )
}

fn last_line(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).context("Failed to read audit journal")?;
    Ok(content
        .lines()
        .last()
        .filter(|l| !l.is_empty())
        .map(str::to_string))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit journal")?;
    writeln!(file, "{}", line).context("Failed to write journal entry")?;
    Ok(())
}

/// All readable entries. Corrupted lines are skipped.
pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit journal")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Indices of lines whose chain link does not match. Empty means intact.
pub fn verify_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit journal")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<JournalEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = match i {
            0 => GENESIS_HASH.to_string(),
            _ => sha256_hex(lines[i - 1].as_bytes()),
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }

    Ok(broken)
}

/// Order-independent digest of a set of unit ids.
pub fn units_digest(ids: &[Uuid]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for id in &sorted {
        hasher.update(id.as_bytes());
    }
    hex(&hasher.finalize())
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
