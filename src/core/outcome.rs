use std::time::Duration;

use super::diagnostics::Diagnostic;
use super::events::Event;
use super::model::{RunState, VmDescriptor};

/// Result wrapper returned by every `core::operations` function.
pub type OperationResult<T> = crate::error::Result<OperationOutput<T>>;

/// Envelope for successful operation outcomes.
#[derive(Debug)]
pub struct OperationOutput<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
    pub events: Vec<Event>,
}

impl<T> OperationOutput<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            diagnostics: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }
}

/// Outcome of `clone` and `sync` (spec §6 `CloneResult`). Sync reuses this
/// shape rather than defining its own, per the shared transactional
/// envelope decided in the open-questions note.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub operation_id: String,
    pub success: bool,
    pub vm_name: String,
    pub new_vm_name: String,
    pub source_host: String,
    pub dest_host: String,
    pub duration: Duration,
    pub bytes_transferred: u64,
    pub error: Option<String>,
    pub error_code: Option<u32>,
    pub warnings: Vec<String>,
    pub timestamp: String,
}

/// One row of a `list` result.
#[derive(Debug, Clone)]
pub struct VmSummary {
    pub host: String,
    pub name: String,
    pub state: RunState,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disk_count: usize,
}

impl From<&VmDescriptor> for VmSummary {
    fn from(d: &VmDescriptor) -> Self {
        Self {
            host: d.host.clone(),
            name: d.name.clone(),
            state: d.state,
            memory_mib: d.memory_mib,
            vcpus: d.vcpus,
            disk_count: d.disks.len(),
        }
    }
}

/// Outcome of `list`.
#[derive(Debug, Clone)]
pub struct ListOutcome {
    pub vms: Vec<VmSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Clone,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Progress snapshot surfaced by `status` (spec §3 `OperationHandle`).
#[derive(Debug, Clone)]
pub struct OperationProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<f64>,
}

/// One entry of a `status` result (spec §6 `OperationStatus`).
#[derive(Debug, Clone)]
pub struct OperationStatus {
    pub operation_id: String,
    pub operation_kind: OperationKind,
    pub state: OperationState,
    pub progress: Option<OperationProgress>,
    pub created: String,
    pub started: Option<String>,
    pub completed: Option<String>,
    pub result: Option<CloneOutcome>,
}

/// Outcome of `status`.
#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub operations: Vec<OperationStatus>,
}
