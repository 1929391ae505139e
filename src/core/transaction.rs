//! Transaction Manager (C5).
//!
//! Tracks every resource an operation creates on a remote host so that a
//! failure partway through a clone can be undone deterministically. Undo
//! order is strict LIFO and best-effort: a failing undo step is recorded as
//! a diagnostic but never aborts the rest of the rollback, mirroring the
//! `RollbackPlan`/`RollbackStep` pattern used for cross-node clones in the
//! reference migration tooling this was grounded on.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};

use super::command;
use super::diagnostics::{Diagnostic, Severity};
use super::events::Event;
use super::reporter::Reporter;
use super::transport::{Connection, Transport};

/// The kind of resource a `ResourceRecord` tracks, used both for rollback
/// dispatch and for the audit log written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    StagingDirectory,
    TemporaryDiskFile,
    FinalDiskFile,
    VmDefinition,
    Custom,
}

/// One resource created during an operation, enough information to undo it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub identifier: String,
    pub host: String,
    /// For `TemporaryDiskFile`, the final path it would be renamed to on
    /// commit. Unused by other kinds.
    pub final_path: Option<String>,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, identifier: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            host: host.into(),
            final_path: None,
        }
    }

    pub fn with_final_path(mut self, final_path: impl Into<String>) -> Self {
        self.final_path = Some(final_path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RollingBack,
    RolledBack,
}

/// Durable record of a transaction's lifecycle, written to
/// `{state_dir}/transactions/{operation_id}.json` for audit (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionAudit {
    pub operation_id: String,
    pub status: TransactionStatus,
    pub records: Vec<ResourceRecord>,
    pub started: String,
    pub ended: Option<String>,
}

/// Tracks resources staged by an in-flight operation and commits or rolls
/// them back as a unit. A `Transaction` is not `Clone`: it owns the single
/// authoritative ledger for one operation id.
pub struct Transaction {
    pub operation_id: String,
    pub staging_dir: String,
    pub dest_host: String,
    records: Vec<ResourceRecord>,
    status: TransactionStatus,
    started: OffsetDateTime,
}

impl Transaction {
    pub fn begin(operation_id: impl Into<String>, dest_host: impl Into<String>, staging_dir: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            dest_host: dest_host.into(),
            staging_dir: staging_dir.into(),
            records: Vec::new(),
            status: TransactionStatus::Active,
            started: now(),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn records(&self) -> &[ResourceRecord] {
        &self.records
    }

    /// Register a resource that now exists and must be undone on rollback.
    /// Records are appended in creation order; rollback walks them in
    /// reverse (LIFO).
    pub fn stage(&mut self, record: ResourceRecord, reporter: &mut dyn Reporter) {
        reporter.report(Event::ResourceStaged {
            kind: record.kind,
            identifier: record.identifier.clone(),
            host: record.host.clone(),
        });
        self.records.push(record);
    }

    /// Move every `TemporaryDiskFile` to its `final_path` and mark the
    /// transaction committed. Once committed, rollback is a no-op: a
    /// committed transaction's resources belong to the destination VM, not
    /// to this operation's undo log.
    pub fn commit(
        &mut self,
        transport: &Transport<'_>,
        conn: &Connection,
        base_dir: &Path,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        if self.status != TransactionStatus::Active {
            return Err(Error::General {
                message: format!("cannot commit transaction in state {:?}", self.status),
            });
        }
        for record in &mut self.records {
            if record.kind != ResourceKind::TemporaryDiskFile {
                continue;
            }
            let Some(final_path) = &record.final_path else {
                continue;
            };
            let argv = command::move_file(&record.identifier, final_path, base_dir)?;
            let cancel = std::sync::atomic::AtomicBool::new(false);
            let output = transport.execute(conn, &argv, None, &cancel)?;
            if !output.success() {
                return Err(Error::Transfer {
                    path: record.identifier.clone(),
                    message: format!("commit rename failed: {}", output.stderr.trim()),
                });
            }
            record.kind = ResourceKind::FinalDiskFile;
            record.identifier = final_path.clone();
        }
        for record in &self.records {
            if record.kind != ResourceKind::StagingDirectory {
                continue;
            }
            let argv = command::rm_directory(&record.identifier, base_dir)?;
            let cancel = std::sync::atomic::AtomicBool::new(false);
            let _ = transport.execute(conn, &argv, None, &cancel)?;
        }
        self.status = TransactionStatus::Committed;
        reporter.report(Event::TransactionCommitted {
            operation_id: self.operation_id.clone(),
        });
        Ok(())
    }

    /// Undo every staged resource in reverse order. Best-effort: a failing
    /// undo step is captured as a `Diagnostic` and rollback continues to
    /// the next record rather than stopping, so one unreachable host never
    /// leaves the rest of the cleanup undone.
    pub fn rollback(
        &mut self,
        transport: &Transport<'_>,
        conn: &Connection,
        base_dir: &Path,
        reporter: &mut dyn Reporter,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        if self.status == TransactionStatus::Committed || self.status == TransactionStatus::RolledBack {
            return;
        }
        self.status = TransactionStatus::RollingBack;
        let mut all_ok = true;
        let cancel = std::sync::atomic::AtomicBool::new(false);

        for record in self.records.iter().rev() {
            let undo = match record.kind {
                ResourceKind::StagingDirectory => command::rm_directory(&record.identifier, base_dir),
                ResourceKind::TemporaryDiskFile | ResourceKind::FinalDiskFile => {
                    command::rm_file(&record.identifier, base_dir)
                }
                ResourceKind::VmDefinition => command::virsh_undefine(&record.identifier),
                ResourceKind::Custom => continue,
            };
            let argv = match undo {
                Ok(argv) => argv,
                Err(err) => {
                    all_ok = false;
                    diagnostics.push(Diagnostic::new(
                        Severity::Warning,
                        format!("rollback skipped for `{}`: {err}", record.identifier),
                    ));
                    continue;
                }
            };
            match transport.execute(conn, &argv, None, &cancel) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    all_ok = false;
                    diagnostics.push(Diagnostic::new(
                        Severity::Warning,
                        format!(
                            "rollback step for `{}` exited nonzero: {}",
                            record.identifier,
                            output.stderr.trim()
                        ),
                    ));
                }
                Err(err) => {
                    all_ok = false;
                    diagnostics.push(Diagnostic::new(
                        Severity::Warning,
                        format!("rollback step for `{}` failed: {err}", record.identifier),
                    ));
                }
            }
        }

        self.status = TransactionStatus::RolledBack;
        reporter.report(Event::TransactionRolledBack {
            operation_id: self.operation_id.clone(),
            ok: all_ok,
        });
    }

    pub fn to_audit(&self) -> TransactionAudit {
        TransactionAudit {
            operation_id: self.operation_id.clone(),
            status: self.status,
            records: self.records.clone(),
            started: format_time(self.started),
            ended: if self.status == TransactionStatus::Active {
                None
            } else {
                Some(format_time(now()))
            },
        }
    }

    /// Persist the current audit state to `{state_dir}/transactions/{id}.json`.
    pub fn write_audit(&self, state_dir: &Path) -> Result<()> {
        let dir = state_dir.join("transactions");
        fs::create_dir_all(&dir).map_err(|source| Error::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{}.json", self.operation_id));
        let audit = self.to_audit();
        let body = serde_json::to_string_pretty(&audit).map_err(|source| Error::General {
            message: format!("failed to serialize transaction audit: {source}"),
        })?;
        fs::write(&path, body).map_err(|source| Error::Io { path, source })
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn format_time(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| t.to_string())
}

pub fn audit_path(state_dir: &Path, operation_id: &str) -> PathBuf {
    state_dir.join("transactions").join(format!("{operation_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{CommandRunner, ConnectArgs, EnvOverrides, ExecOutput};
    use std::cell::RefCell;
    use std::sync::Mutex;

    struct FakeRunner {
        calls: Mutex<RefCell<Vec<Vec<String>>>>,
        fail_next: bool,
    }

    impl FakeRunner {
        fn new(fail_next: bool) -> Self {
            Self {
                calls: Mutex::new(RefCell::new(Vec::new())),
                fail_next,
            }
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, argv: &[String], _timeout: Option<std::time::Duration>) -> Result<ExecOutput> {
            self.calls.lock().unwrap().borrow_mut().push(argv.to_vec());
            Ok(ExecOutput {
                exit_code: if self.fail_next { 1 } else { 0 },
                stdout: String::new(),
                stderr: if self.fail_next { "boom".to_string() } else { String::new() },
            })
        }
    }

    fn conn() -> Connection {
        super::super::transport::resolve(
            "dest",
            &ConnectArgs::default(),
            None,
            &EnvOverrides::default(),
        )
        .unwrap()
    }

    #[test]
    fn rollback_is_lifo_and_best_effort() {
        let runner = FakeRunner::new(false);
        let transport = Transport::new(&runner);
        let c = conn();
        let base = PathBuf::from("/var/lib/hyperclone");
        let mut txn = Transaction::begin("op-1", "dest", "/var/lib/hyperclone/staging/op-1");
        let mut events: Vec<Event> = Vec::new();

        txn.stage(
            ResourceRecord::new(ResourceKind::StagingDirectory, "/var/lib/hyperclone/staging/op-1", "dest"),
            &mut events,
        );
        txn.stage(
            ResourceRecord::new(ResourceKind::TemporaryDiskFile, "/var/lib/hyperclone/staging/op-1/disk.qcow2", "dest"),
            &mut events,
        );

        let mut diagnostics = Vec::new();
        txn.rollback(&transport, &c, &base, &mut events, &mut diagnostics);

        let calls = runner.calls.lock().unwrap();
        let calls = calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].iter().any(|a| a.contains("disk.qcow2")));
        assert!(calls[1].iter().any(|a| a.contains("staging/op-1")));
        assert_eq!(txn.status(), TransactionStatus::RolledBack);
    }

    #[test]
    fn rollback_continues_after_a_failing_step() {
        let runner = FakeRunner::new(true);
        let transport = Transport::new(&runner);
        let c = conn();
        let base = PathBuf::from("/var/lib/hyperclone");
        let mut txn = Transaction::begin("op-2", "dest", "/var/lib/hyperclone/staging/op-2");
        let mut events: Vec<Event> = Vec::new();
        txn.stage(
            ResourceRecord::new(ResourceKind::TemporaryDiskFile, "/a/disk.qcow2", "dest"),
            &mut events,
        );
        txn.stage(
            ResourceRecord::new(ResourceKind::StagingDirectory, "/a", "dest"),
            &mut events,
        );

        let mut diagnostics = Vec::new();
        txn.rollback(&transport, &c, &base, &mut events, &mut diagnostics);

        assert_eq!(diagnostics.len(), 2);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.borrow().len(), 2);
        assert!(matches!(
            events.last(),
            Some(Event::TransactionRolledBack { ok: false, .. })
        ));
    }

    #[test]
    fn commit_renames_temporary_disks_to_final_paths() {
        let runner = FakeRunner::new(false);
        let transport = Transport::new(&runner);
        let c = conn();
        let base = PathBuf::from("/var/lib/hyperclone");
        let mut txn = Transaction::begin("op-3", "dest", "/staging/op-3");
        let mut events: Vec<Event> = Vec::new();
        txn.stage(
            ResourceRecord::new(ResourceKind::TemporaryDiskFile, "/staging/op-3/disk.qcow2", "dest")
                .with_final_path("/var/lib/libvirt/images/clone-disk.qcow2"),
            &mut events,
        );

        txn.commit(&transport, &c, &base, &mut events).unwrap();

        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert_eq!(txn.records()[0].kind, ResourceKind::FinalDiskFile);
        assert_eq!(
            txn.records()[0].identifier,
            "/var/lib/libvirt/images/clone-disk.qcow2"
        );
        assert!(matches!(events.last(), Some(Event::TransactionCommitted { .. })));
    }

    #[test]
    fn rollback_after_commit_is_a_no_op() {
        let runner = FakeRunner::new(false);
        let transport = Transport::new(&runner);
        let c = conn();
        let base = PathBuf::from("/var/lib/hyperclone");
        let mut txn = Transaction::begin("op-4", "dest", "/staging/op-4");
        let mut events: Vec<Event> = Vec::new();
        txn.commit(&transport, &c, &base, &mut events).unwrap();

        let mut diagnostics = Vec::new();
        txn.rollback(&transport, &c, &base, &mut events, &mut diagnostics);
        assert!(diagnostics.is_empty());
        assert_eq!(txn.status(), TransactionStatus::Committed);
    }
}
