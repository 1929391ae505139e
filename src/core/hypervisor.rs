//! Hypervisor Adapter (C3).
//!
//! Reads VM and host facts and issues lifecycle mutations against a remote
//! `libvirt`-compatible daemon, reached exclusively through C1-built `virsh`
//! invocations executed over a C2 connection. No part of this module talks
//! to a hypervisor library directly — everything is text in, text out,
//! which is what let the teacher's storage layer shell out to `qemu-img`
//! instead of linking one.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::command;
use super::model::{DiskFormat, DiskRef, HostCapacity, NetworkInterface, RunState, VmDescriptor};
use super::transport::{Connection, Transport};

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

fn tag(xml: &str, name: &str) -> Option<String> {
    let pattern = format!(r"<{name}>([^<]*)</{name}>");
    Regex::new(&pattern)
        .ok()?
        .captures(xml)
        .map(|c| c[1].to_string())
}

fn attr(block: &str, element: &str, attribute: &str) -> Option<String> {
    let pattern = format!(r#"<{element}[^>]*\b{attribute}=['"]([^'"]+)['"]"#);
    Regex::new(&pattern)
        .ok()?
        .captures(block)
        .map(|c| c[1].to_string())
}

fn blocks<'a>(xml: &'a str, element: &str) -> Vec<&'a str> {
    let pattern = format!(r"(?s)<{element}[ >].*?</{element}>");
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.find_iter(xml).map(|m| m.as_str()).collect()
}

fn parse_disks(xml: &str) -> Vec<DiskRef> {
    blocks(xml, "disk")
        .into_iter()
        .filter_map(|block| {
            let path = attr(block, "source", "file")?;
            let target_device = attr(block, "target", "dev").unwrap_or_else(|| "vda".to_string());
            let format = match attr(block, "driver", "type").as_deref() {
                Some("raw") => DiskFormat::Raw,
                Some("vmdk") => DiskFormat::Vmdk,
                Some("vdi") => DiskFormat::Vdi,
                _ => DiskFormat::Qcow2,
            };
            Some(DiskRef {
                path,
                size_bytes: 0,
                format,
                target_device,
            })
        })
        .collect()
}

fn parse_interfaces(xml: &str) -> Vec<NetworkInterface> {
    blocks(xml, "interface")
        .into_iter()
        .filter_map(|block| {
            let mac = attr(block, "mac", "address")?;
            let network = attr(block, "source", "network")
                .or_else(|| attr(block, "source", "bridge"))
                .unwrap_or_else(|| "default".to_string());
            let name = attr(block, "target", "dev").unwrap_or_else(|| "eth0".to_string());
            Some(NetworkInterface {
                name,
                mac,
                network,
                ip: None,
            })
        })
        .collect()
}

fn parse_state(raw: &str) -> RunState {
    match raw.trim() {
        "running" => RunState::Running,
        "paused" => RunState::Paused,
        "pmsuspended" => RunState::Suspended,
        "crashed" => RunState::Crashed,
        _ => RunState::Stopped,
    }
}

fn parse_virsh_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let parts: Vec<&str> = text.splitn(2, char::is_whitespace).collect();
    let number: f64 = parts.first()?.parse().ok()?;
    let unit = parts.get(1).map(|s| s.trim()).unwrap_or("bytes");
    let multiplier: f64 = match unit {
        u if u.starts_with("KiB") => 1024.0,
        u if u.starts_with("MiB") => 1024.0 * 1024.0,
        u if u.starts_with("GiB") => 1024.0 * 1024.0 * 1024.0,
        u if u.starts_with("TiB") => 1024.0_f64.powi(4),
        u if u.starts_with("KB") => 1000.0,
        u if u.starts_with("MB") => 1000.0 * 1000.0,
        u if u.starts_with("GB") => 1000.0 * 1000.0 * 1000.0,
        _ => 1.0,
    };
    Some((number * multiplier) as u64)
}

fn parse_kv(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn run(transport: &Transport<'_>, conn: &Connection, remote_command: &str) -> Result<String> {
    let cancel = AtomicBool::new(false);
    let output = transport.execute(conn, remote_command, Some(EXEC_TIMEOUT), &cancel)?;
    if !output.success() {
        return Err(Error::Hypervisor {
            host: conn.host.clone(),
            message: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// List VM names on `conn`, optionally filtered to a single run state.
pub fn list_vms(
    transport: &Transport<'_>,
    conn: &Connection,
    state_filter: Option<RunState>,
) -> Result<Vec<VmDescriptor>> {
    let argv = command::virsh("list", &["--all", "--name"])?;
    let stdout = run(transport, conn, &argv)?;
    let mut descriptors = Vec::new();
    for name in stdout.lines().map(str::trim).filter(|n| !n.is_empty()) {
        let descriptor = get_vm(transport, conn, name)?;
        if state_filter.is_none_or(|filter| filter == descriptor.state) {
            descriptors.push(descriptor);
        }
    }
    Ok(descriptors)
}

/// Fetch a single VM's full descriptor. Fails `VmNotFound` if `name` is
/// absent on `conn`'s host.
pub fn get_vm(transport: &Transport<'_>, conn: &Connection, name: &str) -> Result<VmDescriptor> {
    if !vm_exists(transport, conn, name)? {
        return Err(Error::VmNotFound {
            host: conn.host.clone(),
            name: name.to_string(),
        });
    }

    let dumpxml = command::virsh("dumpxml", &[name])?;
    let xml = run(transport, conn, &dumpxml)?;

    let domstate = command::virsh("domstate", &[name])?;
    let state_raw = run(transport, conn, &domstate)?;
    let state = parse_state(&state_raw);

    let dominfo = command::virsh("dominfo", &[name])?;
    let info = parse_kv(&run(transport, conn, &dominfo)?);
    let vcpus: u32 = info
        .get("CPU(s)")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let memory_kib = tag(&xml, "memory").and_then(|m| m.parse::<u64>().ok()).unwrap_or(0);
    let memory_mib = memory_kib / 1024;

    let uuid = tag(&xml, "uuid").unwrap_or_default();

    let mut disks = parse_disks(&xml);
    for disk in &mut disks {
        let stat_cmd = command::stat_size(&disk.path, std::path::Path::new("/"))?;
        if let Ok(size_text) = run(transport, conn, &stat_cmd) {
            disk.size_bytes = size_text.trim().parse().unwrap_or(0);
        }
    }
    let interfaces = parse_interfaces(&xml);

    let now = format_time(OffsetDateTime::now_utc());

    Ok(VmDescriptor {
        name: name.to_string(),
        uuid,
        state,
        memory_mib,
        vcpus,
        disks,
        interfaces,
        definition: xml,
        created: now.clone(),
        modified: now,
        host: conn.host.clone(),
    })
}

/// Whether `name` exists on `conn`'s host (running or not).
pub fn vm_exists(transport: &Transport<'_>, conn: &Connection, name: &str) -> Result<bool> {
    let argv = command::virsh("dominfo", &[name])?;
    let cancel = AtomicBool::new(false);
    let output = transport.execute(conn, &argv, Some(EXEC_TIMEOUT), &cancel)?;
    Ok(output.success())
}

/// Aggregate free/total storage, memory, and vCPU capacity for `conn`'s host.
pub fn host_capacity(transport: &Transport<'_>, conn: &Connection) -> Result<HostCapacity> {
    let nodeinfo = parse_kv(&run(transport, conn, &command::virsh("nodeinfo", &[])?)?);
    let total_vcpus: u32 = nodeinfo.get("CPU(s)").and_then(|v| v.parse().ok()).unwrap_or(0);
    let total_memory_mib = nodeinfo
        .get("Memory size")
        .and_then(|v| parse_virsh_size(v))
        .map(|bytes| bytes / (1024 * 1024))
        .unwrap_or(0);

    let pool_refresh = run(transport, conn, &command::virsh("pool-refresh", &[])?);
    let _ = pool_refresh;

    let pool_names = run(transport, conn, &command::virsh("pool-list", &["--all", "--name"])?)?;
    let mut total_bytes = 0u64;
    let mut available_bytes = 0u64;
    for pool in pool_names.lines().map(str::trim).filter(|p| !p.is_empty()) {
        let info_cmd = command::virsh("pool-info", &[pool])?;
        let Ok(info_text) = run(transport, conn, &info_cmd) else {
            continue;
        };
        let info = parse_kv(&info_text);
        if info.get("State").map(String::as_str) != Some("running") {
            continue;
        }
        if let Some(capacity) = info.get("Capacity").and_then(|v| parse_virsh_size(v)) {
            total_bytes += capacity;
        }
        if let Some(available) = info.get("Available").and_then(|v| parse_virsh_size(v)) {
            available_bytes += available;
        }
    }

    let running_names = run(transport, conn, &command::virsh("list", &["--name"])?)?;
    let mut used_memory_mib = 0u64;
    let mut used_vcpus = 0u32;
    for name in running_names.lines().map(str::trim).filter(|n| !n.is_empty()) {
        let info = parse_kv(&run(transport, conn, &command::virsh("dominfo", &[name])?)?);
        used_vcpus += info.get("CPU(s)").and_then(|v| v.parse().ok()).unwrap_or(0);
        if let Some(mem) = info.get("Used memory").and_then(|v| parse_virsh_size(v)) {
            used_memory_mib += mem / (1024 * 1024);
        }
    }

    Ok(HostCapacity {
        total_bytes,
        available_bytes,
        total_memory_mib,
        available_memory_mib: total_memory_mib.saturating_sub(used_memory_mib),
        total_vcpus,
        available_vcpus: total_vcpus.saturating_sub(used_vcpus),
    })
}

/// Materialize `definition_xml` (already rewritten for the new name/UUID/
/// disk paths/MACs) as a defined-but-not-started domain on `conn`.
pub fn define_vm(
    transport: &Transport<'_>,
    conn: &Connection,
    remote_staging_dir: &str,
    vm_name: &str,
    definition_xml: &str,
) -> Result<VmDescriptor> {
    let local_path = std::env::temp_dir().join(format!("hyperclone-def-{}.xml", Uuid::new_v4()));
    std::fs::write(&local_path, definition_xml).map_err(|source| Error::Io {
        path: local_path.clone(),
        source,
    })?;

    let remote_path = format!("{remote_staging_dir}/definition.xml");
    let upload_result = transport.upload(conn, &local_path, &remote_path);
    let _ = std::fs::remove_file(&local_path);
    upload_result?;

    let define_cmd = command::virsh("define", &[&remote_path])?;
    let result = run(transport, conn, &define_cmd);

    let cleanup_cmd = command::rm_file(&remote_path, std::path::Path::new(remote_staging_dir))?;
    let _ = run(transport, conn, &cleanup_cmd);

    result?;
    get_vm(transport, conn, vm_name)
}

/// Remove `name` and its backing disks from `conn`'s host. Idempotent:
/// succeeds silently if the VM is already gone.
pub fn cleanup_vm(transport: &Transport<'_>, conn: &Connection, name: &str) -> Result<()> {
    if !vm_exists(transport, conn, name)? {
        return Ok(());
    }
    let descriptor = get_vm(transport, conn, name)?;
    if descriptor.state == RunState::Running {
        let _ = run(transport, conn, &command::virsh_destroy(name)?);
    }
    run(transport, conn, &command::virsh_undefine(name)?)?;
    for disk in &descriptor.disks {
        let rm_cmd = command::rm_file(&disk.path, std::path::Path::new("/"))?;
        let _ = run(transport, conn, &rm_cmd);
    }
    Ok(())
}

pub fn create_snapshot(
    transport: &Transport<'_>,
    conn: &Connection,
    name: &str,
    snapshot_name: &str,
) -> Result<()> {
    run(transport, conn, &command::virsh("snapshot-create-as", &[name, snapshot_name])?)?;
    Ok(())
}

pub fn delete_snapshot(
    transport: &Transport<'_>,
    conn: &Connection,
    name: &str,
    snapshot_name: &str,
) -> Result<()> {
    run(transport, conn, &command::virsh("snapshot-delete", &[name, snapshot_name])?)?;
    Ok(())
}

/// Generate a fresh locally-administered MAC under the `52:54:00` OUI the
/// reference hypervisor backend uses for generated interfaces.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

/// Rewrite a source definition document for a clone: swap the name, assign
/// a fresh UUID, remap every disk path per `disk_path_map`, and — unless
/// `preserve_mac` — replace every interface MAC with a fresh one. All other
/// content passes through unchanged.
pub fn rewrite_definition(
    xml: &str,
    new_name: &str,
    disk_path_map: &HashMap<String, String>,
    preserve_mac: bool,
) -> Result<String> {
    let mut out = xml.to_string();

    out = Regex::new(r"<name>[^<]*</name>")
        .unwrap()
        .replace(&out, format!("<name>{new_name}</name>").as_str())
        .into_owned();

    let new_uuid = Uuid::new_v4().to_string();
    out = Regex::new(r"<uuid>[^<]*</uuid>")
        .unwrap()
        .replace(&out, format!("<uuid>{new_uuid}</uuid>").as_str())
        .into_owned();

    for (old_path, new_path) in disk_path_map {
        out = out.replace(old_path.as_str(), new_path.as_str());
    }

    if !preserve_mac {
        let mac_re = Regex::new(r#"(<mac address=['"])([0-9A-Fa-f:]+)(['"])"#).unwrap();
        out = mac_re
            .replace_all(&out, |_: &regex::Captures| {
                format!("<mac address='{}'", generate_mac())
            })
            .into_owned();
    }

    Ok(out)
}

fn format_time(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_disks_extracts_path_format_and_target() {
        let xml = r#"
            <domain>
              <devices>
                <disk type='file' device='disk'>
                  <driver name='qemu' type='qcow2'/>
                  <source file='/var/lib/libvirt/images/v1.qcow2'/>
                  <target dev='vda' bus='virtio'/>
                </disk>
              </devices>
            </domain>
        "#;
        let disks = parse_disks(xml);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].path, "/var/lib/libvirt/images/v1.qcow2");
        assert_eq!(disks[0].target_device, "vda");
        assert_eq!(disks[0].format, DiskFormat::Qcow2);
    }

    #[test]
    fn parse_interfaces_extracts_mac_and_network() {
        let xml = r#"
            <interface type='network'>
              <mac address='52:54:00:11:22:33'/>
              <source network='default'/>
              <target dev='vnet0'/>
            </interface>
        "#;
        let ifaces = parse_interfaces(xml);
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].mac, "52:54:00:11:22:33");
        assert_eq!(ifaces[0].network, "default");
    }

    #[test]
    fn parse_virsh_size_handles_common_units() {
        assert_eq!(parse_virsh_size("40.00 GiB"), Some(40 * 1024 * 1024 * 1024));
        assert_eq!(parse_virsh_size("2048 KiB"), Some(2048 * 1024));
        assert_eq!(parse_virsh_size("100 bytes"), Some(100));
    }

    #[test]
    fn rewrite_definition_replaces_name_uuid_and_disk_paths() {
        let xml = "<domain><name>v1</name><uuid>aaaa</uuid><disk><source file='/img/v1.qcow2'/></disk><interface><mac address='11:22:33:44:55:66'/></interface></domain>";
        let mut map = HashMap::new();
        map.insert("/img/v1.qcow2".to_string(), "/img/v1_clone.qcow2".to_string());

        let rewritten = rewrite_definition(xml, "v1_clone", &map, false).unwrap();
        assert!(rewritten.contains("<name>v1_clone</name>"));
        assert!(!rewritten.contains("<uuid>aaaa</uuid>"));
        assert!(rewritten.contains("/img/v1_clone.qcow2"));
        assert!(!rewritten.contains("11:22:33:44:55:66"));
    }

    #[test]
    fn rewrite_definition_preserves_mac_when_requested() {
        let xml = "<domain><name>v1</name><uuid>aaaa</uuid><interface><mac address='11:22:33:44:55:66'/></interface></domain>";
        let rewritten = rewrite_definition(xml, "v1_clone", &HashMap::new(), true).unwrap();
        assert!(rewritten.contains("11:22:33:44:55:66"));
    }

    #[test]
    fn generated_mac_uses_locally_administered_oui() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.split(':').count(), 6);
    }
}
