use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use crate::Result;
use crate::cli::ListArgs;
use crate::core::operations;
use crate::core::options::{ListFormat, ListOptions, StatusFilter};
use crate::core::outcome::{ListOutcome, VmSummary};
use crate::core::transport::ProcessRunner;
use crate::error::Error;

use super::common::emit_diagnostics;

pub fn handle_list(args: ListArgs, _config_override: Option<&PathBuf>) -> Result<ListOutcome> {
    let status = match args.status.as_str() {
        "all" => StatusFilter::All,
        "running" => StatusFilter::Running,
        "stopped" => StatusFilter::Stopped,
        "paused" => StatusFilter::Paused,
        other => {
            return Err(Error::Validation {
                message: format!("unknown --status value `{other}`"),
            });
        }
    };
    let format = match args.format.as_str() {
        "table" => ListFormat::Table,
        "list" => ListFormat::List,
        "json" => ListFormat::Json,
        other => {
            return Err(Error::Validation {
                message: format!("unknown --format value `{other}`"),
            });
        }
    };

    let options = ListOptions { hosts: args.hosts, status, format };
    let runner = ProcessRunner;
    let cancel = AtomicBool::new(false);

    let output = operations::list(&runner, &options, &cancel, None)?;
    emit_diagnostics(&output.diagnostics);
    render(&output.value, format);

    Ok(output.value)
}

fn render(outcome: &ListOutcome, format: ListFormat) {
    match format {
        ListFormat::Json => {
            let rows: Vec<_> = outcome
                .vms
                .iter()
                .map(|vm| {
                    serde_json::json!({
                        "host": vm.host,
                        "name": vm.name,
                        "state": format!("{:?}", vm.state),
                        "memory_mib": vm.memory_mib,
                        "vcpus": vm.vcpus,
                        "disk_count": vm.disk_count,
                    })
                })
                .collect();
            println!("{}", serde_json::Value::Array(rows));
        }
        ListFormat::List => {
            for vm in &outcome.vms {
                println!("{}/{}\t{:?}", vm.host, vm.name, vm.state);
            }
        }
        ListFormat::Table => render_table(&outcome.vms),
    }
}

fn render_table(vms: &[VmSummary]) {
    if vms.is_empty() {
        println!("No VMs found.");
        return;
    }
    let name_width = vms.iter().map(|v| v.name.len()).max().unwrap_or(4).max("NAME".len());
    let host_width = vms.iter().map(|v| v.host.len()).max().unwrap_or(4).max("HOST".len());
    println!("{:<name_width$}  {:<host_width$}  STATE      MEM(MiB)  VCPUS  DISKS", "NAME", "HOST");
    for vm in vms {
        println!(
            "{:<name_width$}  {:<host_width$}  {:<9?}  {:>8}  {:>5}  {:>5}",
            vm.name, vm.host, vm.state, vm.memory_mib, vm.vcpus, vm.disk_count
        );
    }
}
