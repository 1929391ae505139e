//! Canonical data model shared by the hypervisor adapter, transfer engine,
//! and orchestrator (spec §3).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Run-state of a VM as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
    Paused,
    Suspended,
    Crashed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Running => "running",
            RunState::Stopped => "stopped",
            RunState::Paused => "paused",
            RunState::Suspended => "suspended",
            RunState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// On-disk image format for a `DiskRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
        };
        f.write_str(s)
    }
}

/// A disk backing a VM's block device, as seen on its owning host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRef {
    pub path: String,
    pub size_bytes: u64,
    pub format: DiskFormat,
    pub target_device: String,
}

/// A VM network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub network: String,
    pub ip: Option<String>,
}

const RESERVED_VM_NAMES: [&str; 3] = ["localhost", "none", "all"];

/// The canonical description of a VM as seen on a host (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub name: String,
    pub uuid: String,
    pub state: RunState,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disks: Vec<DiskRef>,
    pub interfaces: Vec<NetworkInterface>,
    /// Raw hypervisor definition document (opaque XML), base64-free in memory.
    pub definition: String,
    pub created: String,
    pub modified: String,
    pub host: String,
}

impl VmDescriptor {
    /// Validate the `name` invariant from spec §3: `^[A-Za-z0-9_-]{1,64}$`
    /// and not a reserved name.
    pub fn validate_name(name: &str) -> Result<()> {
        validate_vm_name(name)
    }
}

/// Validate a VM name against the spec's invariant. Shared by the data model
/// and the command builder so the rule lives in exactly one place.
pub fn validate_vm_name(name: &str) -> Result<()> {
    let len_ok = !name.is_empty() && name.len() <= 64;
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !len_ok || !chars_ok {
        return Err(Error::InvalidVmName {
            value: name.to_string(),
            message: "must match ^[A-Za-z0-9_-]{1,64}$".to_string(),
        });
    }
    if RESERVED_VM_NAMES.contains(&name) {
        return Err(Error::InvalidVmName {
            value: name.to_string(),
            message: format!("`{name}` is a reserved name"),
        });
    }
    Ok(())
}

/// Validate a MAC address against `^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$`.
pub fn validate_mac(mac: &str) -> Result<()> {
    let bytes: Vec<&str> = mac.split(|c| c == ':' || c == '-').collect();
    let ok = bytes.len() == 6 && bytes.iter().all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit()));
    if !ok {
        return Err(Error::Validation {
            message: format!("invalid MAC address `{mac}`"),
        });
    }
    Ok(())
}

/// Aggregate capacity of a host, across its active storage pools (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostCapacity {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub total_memory_mib: u64,
    pub available_memory_mib: u64,
    pub total_vcpus: u32,
    pub available_vcpus: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        assert!(validate_vm_name("web-01").is_ok());
        assert!(validate_vm_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn rejects_too_long_or_reserved() {
        assert!(validate_vm_name(&"a".repeat(65)).is_err());
        assert!(validate_vm_name("localhost").is_err());
        assert!(validate_vm_name("none").is_err());
        assert!(validate_vm_name("all").is_err());
        assert!(validate_vm_name("").is_err());
        assert!(validate_vm_name("bad name").is_err());
    }

    #[test]
    fn mac_validation() {
        assert!(validate_mac("52:54:00:ab:cd:ef").is_ok());
        assert!(validate_mac("52-54-00-ab-cd-ef").is_ok());
        assert!(validate_mac("not-a-mac").is_err());
        assert!(validate_mac("52:54:00:ab:cd").is_err());
    }
}
