//! In-process operation history (spec §6: "not persisted beyond transaction
//! logs"). Useful when hyperclone is embedded as a library in a long-lived
//! host process where `status` can be answered from memory instead of
//! re-reading the audit log from disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use super::outcome::{CloneOutcome, OperationKind, OperationProgress, OperationState, OperationStatus};

fn now() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Shared, cloneable handle onto the process-wide operation table.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    inner: Arc<Mutex<HashMap<String, OperationStatus>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, operation_id: &str, kind: OperationKind) {
        let status = OperationStatus {
            operation_id: operation_id.to_string(),
            operation_kind: kind,
            state: OperationState::Pending,
            progress: None,
            created: now(),
            started: None,
            completed: None,
            result: None,
        };
        self.inner.lock().unwrap().insert(operation_id.to_string(), status);
    }

    pub fn mark_running(&self, operation_id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(operation_id) {
            entry.state = OperationState::Running;
            entry.started = Some(now());
        }
    }

    pub fn update_progress(&self, operation_id: &str, progress: OperationProgress) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(operation_id) {
            entry.progress = Some(progress);
        }
    }

    pub fn mark_completed(&self, operation_id: &str, result: CloneOutcome) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(operation_id) {
            entry.state = OperationState::Completed;
            entry.completed = Some(now());
            entry.result = Some(result);
        }
    }

    pub fn mark_failed(&self, operation_id: &str, result: Option<CloneOutcome>) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(operation_id) {
            entry.state = OperationState::Failed;
            entry.completed = Some(now());
            entry.result = result;
        }
    }

    pub fn mark_cancelled(&self, operation_id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(operation_id) {
            entry.state = OperationState::Cancelled;
            entry.completed = Some(now());
        }
    }

    pub fn get(&self, operation_id: &str) -> Option<OperationStatus> {
        self.inner.lock().unwrap().get(operation_id).cloned()
    }

    pub fn list(&self, active_only: bool) -> Vec<OperationStatus> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|s| !active_only || matches!(s.state, OperationState::Pending | OperationState::Running))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_update_state() {
        let registry = OperationRegistry::new();
        registry.create("op-1", OperationKind::Clone);
        assert_eq!(registry.get("op-1").unwrap().state, OperationState::Pending);

        registry.mark_running("op-1");
        assert_eq!(registry.get("op-1").unwrap().state, OperationState::Running);

        registry.update_progress(
            "op-1",
            OperationProgress {
                bytes_transferred: 10,
                total_bytes: 100,
                speed_bytes_per_sec: 5.0,
                eta_seconds: Some(18.0),
            },
        );
        assert_eq!(registry.get("op-1").unwrap().progress.unwrap().bytes_transferred, 10);
    }

    #[test]
    fn list_active_excludes_terminal_operations() {
        let registry = OperationRegistry::new();
        registry.create("op-1", OperationKind::Clone);
        registry.create("op-2", OperationKind::Sync);
        registry.mark_cancelled("op-2");

        let active = registry.list(true);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].operation_id, "op-1");
    }
}
