use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use crate::Result;
use crate::cli::SyncArgs;
use crate::config::AppConfig;
use crate::core::command;
use crate::core::diagnostics::Severity;
use crate::core::events::Event;
use crate::core::operations;
use crate::core::options::SyncOptions;
use crate::core::outcome::CloneOutcome;
use crate::core::registry::OperationRegistry;
use crate::core::transport::ProcessRunner;

use super::common::{emit_diagnostics, load_effective_config};

pub fn handle_sync(args: SyncArgs, config_override: Option<&PathBuf>) -> Result<CloneOutcome> {
    let cfg = load_effective_config(config_override)?;
    let options = build_options(&args, &cfg)?;

    let runner = ProcessRunner;
    let base_dir = PathBuf::from(&cfg.libvirt.storage_dir);
    let state_dir = crate::config::default_state_dir();
    std::fs::create_dir_all(&state_dir).map_err(|source| crate::Error::Io { path: state_dir.clone(), source })?;
    let cancel = AtomicBool::new(false);
    let registry = OperationRegistry::new();

    let output = operations::sync(&runner, &base_dir, &state_dir, &options, &cancel, Some(&registry), None)?;

    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);

    Ok(output.value)
}

fn render_events(events: &[Event]) {
    for event in events {
        match event {
            Event::Message { severity, text } => match severity {
                Severity::Info => println!("{text}"),
                Severity::Warning => eprintln!("Warning: {text}"),
                Severity::Error => eprintln!("Error: {text}"),
            },
            Event::Connected { host } => println!("→ connected to {host}"),
            Event::Disconnected { host } => println!("→ disconnected from {host}"),
            Event::ResourceStaged { kind, identifier, .. } => {
                println!("→ staged {kind:?} `{identifier}`");
            }
            Event::TransferProgress { disk, bytes_transferred, total_bytes, speed_bytes_per_sec } => {
                println!(
                    "→ {disk}: {bytes_transferred}/{total_bytes} bytes ({:.1} MiB/s)",
                    speed_bytes_per_sec / (1024.0 * 1024.0)
                );
            }
            Event::TransferCompleted { disk, bytes_transferred, duration, checksum } => {
                print!("→ {disk}: transferred {bytes_transferred} bytes in {:.1}s", duration.as_secs_f64());
                match checksum {
                    Some(sum) => println!(" (checksum {sum})"),
                    None => println!(),
                }
            }
            Event::TransactionCommitted { operation_id } => {
                println!("→ transaction {operation_id} committed");
            }
            Event::TransactionRolledBack { operation_id, ok } => {
                if *ok {
                    println!("→ transaction {operation_id} rolled back");
                } else {
                    eprintln!("→ transaction {operation_id} rolled back with errors; manual inspection may be needed");
                }
            }
            Event::LockAcquired { dest_host, vm_name, reclaimed_stale } => {
                if *reclaimed_stale {
                    println!("→ reclaimed stale lock for `{vm_name}` on {dest_host}");
                }
            }
            Event::DestinationCleaned { .. } | Event::VmDefined { .. } | Event::CommandExecuted { .. } => {}
        }
    }
}

fn build_options(args: &SyncArgs, cfg: &AppConfig) -> Result<SyncOptions> {
    let mut options = SyncOptions::new(args.source_host.clone(), args.dest_host.clone(), args.vm_name.clone());

    options.target_name = args.target_name.clone();
    options.dry_run = args.dry_run;
    options.verify = args.verify || cfg.transfer.verify;
    options.checkpoint = args.checkpoint;
    options.delta_only = args.delta_only;

    options.parallel = args.parallel.unwrap_or(cfg.transfer.parallel);
    options.transfer_method = match &args.transfer_method {
        Some(method) => method.parse()?,
        None => cfg.transfer.method,
    };
    options.bandwidth_limit = match &args.bandwidth_limit {
        Some(value) => command::parse_bandwidth(value)?,
        None => cfg.transfer.bandwidth_limit,
    };
    if let Some(timeout) = args.timeout {
        options.timeout_seconds = timeout;
    }
    options.ssh_key = args.ssh_key.clone().or_else(|| cfg.ssh.identity_file.clone());
    options.ssh_port = args.ssh_port.or(Some(cfg.ssh.port));
    options.host_key_policy = Some(cfg.ssh.host_key_policy);
    options.known_hosts_file = cfg.ssh.known_hosts_file.clone();

    Ok(options)
}
