use std::time::Duration;

use super::diagnostics::Severity;
use super::transaction::ResourceKind;

/// Structured event emitted during a long-running operation.
#[derive(Debug, Clone)]
pub enum Event {
    /// A textual progress update with a severity level.
    Message { severity: Severity, text: String },

    /// A connection to a host was established.
    Connected { host: String },

    /// A connection to a host was closed.
    Disconnected { host: String },

    /// A remote command was dispatched (already through the command builder).
    CommandExecuted {
        host: String,
        command: String,
        exit_code: i32,
    },

    /// An existing destination VM was removed before cloning (idempotent/force mode).
    DestinationCleaned { host: String, vm: String },

    /// A resource was recorded in the active transaction.
    ResourceStaged {
        kind: ResourceKind,
        identifier: String,
        host: String,
    },

    /// Progress tick for a single disk transfer.
    TransferProgress {
        disk: String,
        bytes_transferred: u64,
        total_bytes: u64,
        speed_bytes_per_sec: f64,
    },

    /// A disk transfer completed.
    TransferCompleted {
        disk: String,
        bytes_transferred: u64,
        duration: Duration,
        checksum: Option<String>,
    },

    /// The destination VM definition was materialized.
    VmDefined { host: String, vm: String },

    /// The transaction committed: staged files moved to their final paths.
    TransactionCommitted { operation_id: String },

    /// The transaction rolled back; `ok` is false if any undo step failed.
    TransactionRolledBack { operation_id: String, ok: bool },

    /// An advisory lock was acquired or reclaimed for `(dest_host, vm_name)`.
    LockAcquired {
        dest_host: String,
        vm_name: String,
        reclaimed_stale: bool,
    },
}
