use std::path::PathBuf;

use super::command::Bandwidth;
use super::transfer::TransferMethod;
use super::transport::HostKeyPolicy;

/// Source used when resolving the YAML configuration file.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Search the default locations (user config, system config, cwd).
    Discover,
    /// Use an explicit path, bypassing discovery.
    Explicit(PathBuf),
}

/// Parameters for configuration loading.
#[derive(Debug, Clone)]
pub struct ConfigLoadOptions {
    pub source: ConfigSource,
    /// Whether a missing config file is an error or silently yields defaults.
    pub allow_missing: bool,
}

impl ConfigLoadOptions {
    pub fn explicit(path: PathBuf) -> Self {
        Self {
            source: ConfigSource::Explicit(path),
            allow_missing: false,
        }
    }

    pub fn discover() -> Self {
        Self {
            source: ConfigSource::Discover,
            allow_missing: true,
        }
    }
}

impl Default for ConfigLoadOptions {
    fn default() -> Self {
        Self::discover()
    }
}

/// Options accepted by the `clone` operation (spec §3 `CloneOptions`).
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub source_host: String,
    pub dest_host: String,
    pub vm_name: String,
    pub new_name: Option<String>,
    pub force: bool,
    pub dry_run: bool,
    pub parallel: u32,
    pub verify: bool,
    pub preserve_mac: bool,
    pub bandwidth_limit: Option<Bandwidth>,
    pub timeout_seconds: u64,
    pub idempotent: bool,
    pub transfer_method: TransferMethod,
    pub ssh_key: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub host_key_policy: Option<HostKeyPolicy>,
    pub known_hosts_file: Option<PathBuf>,
    pub network_config: Option<PathBuf>,
}

impl CloneOptions {
    pub fn new(source_host: impl Into<String>, dest_host: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self {
            source_host: source_host.into(),
            dest_host: dest_host.into(),
            vm_name: vm_name.into(),
            new_name: None,
            force: false,
            dry_run: false,
            parallel: 4,
            verify: false,
            preserve_mac: false,
            bandwidth_limit: None,
            timeout_seconds: 3600,
            idempotent: false,
            transfer_method: TransferMethod::Rsync,
            ssh_key: None,
            ssh_port: None,
            host_key_policy: None,
            known_hosts_file: None,
            network_config: None,
        }
    }

    /// The destination VM name after applying the `{source}_clone` default.
    pub fn resolved_new_name(&self) -> String {
        self.new_name.clone().unwrap_or_else(|| format!("{}_clone", self.vm_name))
    }
}

/// Options accepted by the `sync` operation. Reuses the clone envelope
/// (spec §9's open question, resolved in favor of one shared path) minus
/// the name-creation and MAC-preservation fields that don't apply to an
/// in-place refresh of an existing destination VM.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub source_host: String,
    pub dest_host: String,
    pub vm_name: String,
    pub target_name: Option<String>,
    pub dry_run: bool,
    pub parallel: u32,
    pub verify: bool,
    pub bandwidth_limit: Option<Bandwidth>,
    pub timeout_seconds: u64,
    pub transfer_method: TransferMethod,
    pub checkpoint: bool,
    pub delta_only: bool,
    pub ssh_key: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub host_key_policy: Option<HostKeyPolicy>,
    pub known_hosts_file: Option<PathBuf>,
}

impl SyncOptions {
    pub fn new(source_host: impl Into<String>, dest_host: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self {
            source_host: source_host.into(),
            dest_host: dest_host.into(),
            vm_name: vm_name.into(),
            target_name: None,
            dry_run: false,
            parallel: 4,
            verify: false,
            bandwidth_limit: None,
            timeout_seconds: 7200,
            transfer_method: TransferMethod::Blocksync,
            checkpoint: false,
            delta_only: false,
            ssh_key: None,
            ssh_port: None,
            host_key_policy: None,
            known_hosts_file: None,
        }
    }

    pub fn resolved_target_name(&self) -> String {
        self.target_name.clone().unwrap_or_else(|| self.vm_name.clone())
    }
}

/// Run-state filter accepted by `list --status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Running,
    Stopped,
    Paused,
}

/// Rendering requested by `list --format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    Table,
    List,
    Json,
}

/// Options for the `list` operation.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub hosts: Vec<String>,
    pub status: StatusFilter,
    pub format: ListFormat,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            status: StatusFilter::All,
            format: ListFormat::Table,
        }
    }
}

/// Options for the `status` operation.
#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    pub operation_id: Option<String>,
    pub all: bool,
    pub active: bool,
    pub follow: bool,
}
