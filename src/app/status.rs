use std::fs;
use std::path::PathBuf;

use crate::Result;
use crate::cli::StatusArgs;
use crate::core::transaction::TransactionAudit;
use crate::error::Error;

/// A fresh CLI invocation never shares an `OperationRegistry` with the
/// process that ran the clone/sync, so `status` reads the durable
/// transaction log instead of the in-memory registry (spec §6: "Operation
/// history: in-memory for the current process; not persisted beyond
/// transaction logs").
pub fn handle_status(args: StatusArgs) -> Result<()> {
    let state_dir = crate::config::default_state_dir();
    let transactions_dir = state_dir.join("transactions");

    match &args.operation_id {
        Some(id) => {
            let audit = read_audit(&state_dir, id)?;
            print_audit(&audit);
        }
        None => {
            let mut audits = list_audits(&transactions_dir)?;
            if args.active {
                audits.retain(|a| matches!(a.status, crate::core::transaction::TransactionStatus::Active | crate::core::transaction::TransactionStatus::RollingBack));
            }
            if audits.is_empty() {
                println!("No tracked operations.");
            }
            for audit in &audits {
                print_audit(audit);
                println!();
            }
        }
    }

    Ok(())
}

fn read_audit(state_dir: &PathBuf, operation_id: &str) -> Result<TransactionAudit> {
    let path = crate::core::transaction::audit_path(state_dir, operation_id);
    let contents = fs::read_to_string(&path).map_err(|_| Error::OperationNotFound {
        operation_id: operation_id.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|source| Error::Io {
        path,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, source.to_string()),
    })
}

fn list_audits(transactions_dir: &PathBuf) -> Result<Vec<TransactionAudit>> {
    let mut audits = Vec::new();
    let entries = match fs::read_dir(transactions_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(audits),
    };
    for entry in entries.flatten() {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(contents) = fs::read_to_string(entry.path()) {
            if let Ok(audit) = serde_json::from_str(&contents) {
                audits.push(audit);
            }
        }
    }
    Ok(audits)
}

fn print_audit(audit: &TransactionAudit) {
    println!("Operation: {}", audit.operation_id);
    println!("Status:    {:?}", audit.status);
    println!("Started:   {}", audit.started);
    if let Some(ended) = &audit.ended {
        println!("Ended:     {ended}");
    }
    println!("Resources staged: {}", audit.records.len());
}
