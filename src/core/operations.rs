//! Top-level operation entry points (spec §3/§6).
//!
//! Each function here owns the envelope: it buffers diagnostics and events,
//! optionally forwards events live to a caller-supplied `Reporter`, updates
//! the process-wide `OperationRegistry` through the pending → running →
//! terminal lifecycle, and returns an `OperationResult<T>`. Lower-level
//! modules (`orchestrator`, `hypervisor`) never see the registry or the
//! `Option`-wrapped reporter; they take a bare `&mut dyn Reporter`.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use uuid::Uuid;

use super::diagnostics::Diagnostic;
use super::events::Event;
use super::hypervisor;
use super::options::{CloneOptions, ListOptions, StatusOptions, SyncOptions};
use super::outcome::{
    CloneOutcome, ListOutcome, OperationKind, OperationOutput, OperationResult, StatusOutcome,
    VmSummary,
};
use super::orchestrator;
use super::registry::OperationRegistry;
use super::reporter::Reporter;
use super::transport::{CommandRunner, Connection, ConnectArgs, EnvOverrides, Transport};
use crate::error::Result;

/// Buffers events into the caller's `Vec<Event>` and, if present, forwards
/// each one live to a delegate reporter.
struct ReporterProxy<'a, 'b> {
    delegate: Option<&'a mut dyn Reporter>,
    events: &'b mut Vec<Event>,
}

impl<'a, 'b> ReporterProxy<'a, 'b> {
    fn new(delegate: Option<&'a mut dyn Reporter>, events: &'b mut Vec<Event>) -> Self {
        Self { delegate, events }
    }

    fn emit(&mut self, event: Event) {
        self.events.push(event.clone());
        if let Some(reporter) = &mut self.delegate {
            reporter.report(event);
        }
    }
}

impl Reporter for ReporterProxy<'_, '_> {
    fn report(&mut self, event: Event) {
        self.emit(event);
    }
}

/// Clone a VM from `options.source_host` to `options.dest_host` (spec §4.6).
pub fn clone(
    runner: &dyn CommandRunner,
    base_dir: &Path,
    state_dir: &Path,
    options: &CloneOptions,
    cancel: &AtomicBool,
    registry: Option<&OperationRegistry>,
    reporter: Option<&mut dyn Reporter>,
) -> OperationResult<CloneOutcome> {
    let mut diagnostics = Vec::new();
    let mut events = Vec::new();
    let operation_id = Uuid::new_v4().to_string();

    if let Some(registry) = registry {
        registry.create(&operation_id, OperationKind::Clone);
        registry.mark_running(&operation_id);
    }

    let result = {
        let mut reporter_proxy = ReporterProxy::new(reporter, &mut events);
        orchestrator::clone(runner, base_dir, state_dir, options, cancel, &mut diagnostics, &mut reporter_proxy)
    };

    finish(registry, &operation_id, result, diagnostics, events)
}

/// Refresh an existing destination VM's disks from the source (spec §4.7).
pub fn sync(
    runner: &dyn CommandRunner,
    base_dir: &Path,
    state_dir: &Path,
    options: &SyncOptions,
    cancel: &AtomicBool,
    registry: Option<&OperationRegistry>,
    reporter: Option<&mut dyn Reporter>,
) -> OperationResult<CloneOutcome> {
    let mut diagnostics = Vec::new();
    let mut events = Vec::new();
    let operation_id = Uuid::new_v4().to_string();

    if let Some(registry) = registry {
        registry.create(&operation_id, OperationKind::Sync);
        registry.mark_running(&operation_id);
    }

    let result = {
        let mut reporter_proxy = ReporterProxy::new(reporter, &mut events);
        orchestrator::sync(runner, base_dir, state_dir, options, cancel, &mut diagnostics, &mut reporter_proxy)
    };

    finish(registry, &operation_id, result, diagnostics, events)
}

fn finish(
    registry: Option<&OperationRegistry>,
    operation_id: &str,
    result: Result<CloneOutcome>,
    diagnostics: Vec<Diagnostic>,
    events: Vec<Event>,
) -> OperationResult<CloneOutcome> {
    match result {
        Ok(mut outcome) => {
            outcome.operation_id = operation_id.to_string();
            if let Some(registry) = registry {
                registry.mark_completed(operation_id, outcome.clone());
            }
            Ok(OperationOutput::new(outcome).with_diagnostics(diagnostics).with_events(events))
        }
        Err(err) => {
            if let Some(registry) = registry {
                if matches!(err, crate::error::Error::OperationCancelled) {
                    registry.mark_cancelled(operation_id);
                } else {
                    registry.mark_failed(operation_id, None);
                }
            }
            Err(err)
        }
    }
}

/// List VMs across one or more hosts (spec §4.3 `list_vms`, exposed at the
/// operation layer so the CLI never talks to the Hypervisor Adapter
/// directly).
pub fn list(
    runner: &dyn CommandRunner,
    options: &ListOptions,
    cancel: &AtomicBool,
    reporter: Option<&mut dyn Reporter>,
) -> OperationResult<ListOutcome> {
    let mut diagnostics = Vec::new();
    let mut events = Vec::new();
    let transport = Transport::new(runner);

    let state_filter = match options.status {
        super::options::StatusFilter::All => None,
        super::options::StatusFilter::Running => Some(super::model::RunState::Running),
        super::options::StatusFilter::Stopped => Some(super::model::RunState::Stopped),
        super::options::StatusFilter::Paused => Some(super::model::RunState::Paused),
    };

    let mut vms = Vec::new();
    {
        let mut reporter_proxy = ReporterProxy::new(reporter, &mut events);
        for host in &options.hosts {
            let env_overrides = EnvOverrides::from_process_env()?;
            let conn: Connection = super::transport::resolve(host, &ConnectArgs::default(), None, &env_overrides)?;
            transport.open(&conn, cancel, &mut diagnostics)?;
            reporter_proxy.emit(Event::Connected { host: host.clone() });

            let descriptors = hypervisor::list_vms(&transport, &conn, state_filter)?;
            vms.extend(descriptors.iter().map(VmSummary::from));

            reporter_proxy.emit(Event::Disconnected { host: host.clone() });
        }
    }

    Ok(OperationOutput::new(ListOutcome { vms }).with_diagnostics(diagnostics).with_events(events))
}

/// Report the in-process status of one or all tracked operations (spec §3
/// `OperationHandle`, §6 `OperationStatus`).
pub fn status(registry: &OperationRegistry, options: &StatusOptions) -> OperationResult<StatusOutcome> {
    let operations = match &options.operation_id {
        Some(id) => match registry.get(id) {
            Some(status) => vec![status],
            None => {
                return Err(crate::error::Error::OperationNotFound { operation_id: id.clone() });
            }
        },
        None => registry.list(options.active),
    };

    Ok(OperationOutput::new(StatusOutcome { operations }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_of_unknown_operation_id_fails() {
        let registry = OperationRegistry::new();
        let options = StatusOptions {
            operation_id: Some("missing".to_string()),
            all: false,
            active: false,
            follow: false,
        };
        let result = status(&registry, &options);
        assert!(result.is_err());
    }

    #[test]
    fn status_with_no_id_lists_all_tracked_operations() {
        let registry = OperationRegistry::new();
        registry.create("op-1", OperationKind::Clone);
        let options = StatusOptions::default();
        let output = status(&registry, &options).unwrap();
        assert_eq!(output.value.operations.len(), 1);
    }
}
