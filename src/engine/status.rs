use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use super::types::ComplianceStatus;

/// Last known compliance status per unit. Units never hold their own
/// status; this board is updated by single-unit and bulk actions and is
/// never treated as ground truth.
#[derive(Debug, Default)]
pub struct StatusBoard {
    statuses: RwLock<HashMap<Uuid, ComplianceStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of a unit, `Undetermined` when it was never touched.
    pub fn get(&self, id: Uuid) -> ComplianceStatus {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&self, id: Uuid, status: ComplianceStatus) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, status);
    }

    pub fn clear(&self) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
