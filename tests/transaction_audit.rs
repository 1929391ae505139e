use hyperclone::core::reporter::Reporter;
use hyperclone::core::transaction::{ResourceKind, ResourceRecord, Transaction, TransactionStatus, audit_path};
use tempfile::tempdir;

struct NullReporter;
impl Reporter for NullReporter {
    fn report(&mut self, _event: hyperclone::core::events::Event) {}
}

#[test]
fn write_audit_persists_staged_records_and_is_readable_back() {
    let dir = tempdir().unwrap();
    let state_dir = dir.path();
    let mut reporter = NullReporter;

    let mut txn = Transaction::begin("op-1", "dest-host", "/var/lib/libvirt/images/.staging/op-1");
    assert_eq!(txn.status(), TransactionStatus::Active);

    txn.stage(
        ResourceRecord::new(ResourceKind::StagingDirectory, "/var/lib/libvirt/images/.staging/op-1", "dest-host"),
        &mut reporter,
    );
    txn.stage(
        ResourceRecord::new(ResourceKind::TemporaryDiskFile, "/staging/disk.qcow2", "dest-host")
            .with_final_path("/var/lib/libvirt/images/web01_clone_disk.qcow2"),
        &mut reporter,
    );
    txn.write_audit(state_dir).unwrap();

    let path = audit_path(state_dir, "op-1");
    assert!(path.exists());

    let contents = std::fs::read_to_string(&path).unwrap();
    let audit: hyperclone::core::transaction::TransactionAudit = serde_json::from_str(&contents).unwrap();

    assert_eq!(audit.operation_id, "op-1");
    assert_eq!(audit.status, TransactionStatus::Active);
    assert_eq!(audit.records.len(), 2);
    assert!(audit.ended.is_none());
    assert_eq!(audit.records[1].final_path.as_deref(), Some("/var/lib/libvirt/images/web01_clone_disk.qcow2"));
}

#[test]
fn audit_path_is_scoped_under_the_transactions_subdirectory() {
    let dir = tempdir().unwrap();
    let path = audit_path(dir.path(), "abc-123");
    assert_eq!(path, dir.path().join("transactions").join("abc-123.json"));
}
