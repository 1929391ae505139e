use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI definition for the `hyperclone` tool.
#[derive(Debug, Parser)]
#[command(
    name = "hyperclone",
    author = "hyperclone project",
    version,
    about = "Clone and incrementally sync hypervisor-managed VMs between hosts over SSH."
)]
pub struct Cli {
    /// Path to an explicit configuration file. Defaults to searching for `hyperclone.yaml`.
    #[arg(
        global = true,
        short,
        long = "config",
        value_name = "PATH",
        help = "Override auto-discovery and load configuration from PATH"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Clone a VM from one host to another.
    Clone(CloneArgs),
    /// Incrementally sync an existing destination VM's disks from the source.
    Sync(SyncArgs),
    /// List VMs on one or more hosts.
    List(ListArgs),
    /// Inspect the status of tracked operations.
    Status(StatusArgs),
    /// Inspect or edit the configuration file.
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct CloneArgs {
    pub source_host: String,
    pub dest_host: String,
    pub vm_name: String,

    #[arg(long, value_name = "NAME", help = "Name for the destination VM (default: `{vm_name}_clone`)")]
    pub new_name: Option<String>,

    #[arg(long, help = "Replace an existing destination VM of the same name")]
    pub force: bool,

    #[arg(long, help = "Do not transfer or define anything; report what would happen")]
    pub dry_run: bool,

    #[arg(long, value_name = "N", help = "Number of disks to transfer concurrently")]
    pub parallel: Option<u32>,

    #[arg(long, help = "Verify each transferred disk with a checksum")]
    pub verify: bool,

    #[arg(long, help = "Keep the source VM's network interface MAC addresses")]
    pub preserve_mac: bool,

    #[arg(long, value_name = "RATE", help = "Bandwidth limit, e.g. 100K, 1G")]
    pub bandwidth_limit: Option<String>,

    #[arg(long, value_name = "SECONDS", help = "Overall operation timeout")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Succeed without error if the destination VM already matches")]
    pub idempotent: bool,

    #[arg(long, value_name = "STRATEGY", help = "rsync, stream, or blocksync")]
    pub transfer_method: Option<String>,

    #[arg(long, value_name = "PATH", help = "SSH identity file")]
    pub ssh_key: Option<PathBuf>,

    #[arg(long, value_name = "PORT", help = "SSH port")]
    pub ssh_port: Option<u16>,

    #[arg(long, value_name = "PATH", help = "Network interface overrides")]
    pub network_config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    pub source_host: String,
    pub dest_host: String,
    pub vm_name: String,

    #[arg(long, value_name = "NAME", help = "Destination VM name (default: same as vm_name)")]
    pub target_name: Option<String>,

    #[arg(long, help = "Do not transfer anything; report what would happen")]
    pub dry_run: bool,

    #[arg(long, value_name = "N")]
    pub parallel: Option<u32>,

    #[arg(long)]
    pub verify: bool,

    #[arg(long, value_name = "RATE")]
    pub bandwidth_limit: Option<String>,

    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    #[arg(long, value_name = "STRATEGY")]
    pub transfer_method: Option<String>,

    #[arg(long, help = "Resume from the last recorded checkpoint")]
    pub checkpoint: bool,

    #[arg(long, help = "Transfer only blocks that differ from the destination")]
    pub delta_only: bool,

    #[arg(long, value_name = "PATH")]
    pub ssh_key: Option<PathBuf>,

    #[arg(long, value_name = "PORT")]
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Args, Default)]
pub struct ListArgs {
    pub hosts: Vec<String>,

    #[arg(long, value_name = "FILTER", default_value = "all", help = "all, running, stopped, or paused")]
    pub status: String,

    #[arg(long, value_name = "FORMAT", default_value = "table", help = "table, list, or json")]
    pub format: String,
}

#[derive(Debug, Args, Default)]
pub struct StatusArgs {
    pub operation_id: Option<String>,

    #[arg(long, help = "Show every tracked operation, including terminal ones")]
    pub all: bool,

    #[arg(long, help = "Show only pending/running operations")]
    pub active: bool,

    #[arg(long, help = "Stream progress until the operation reaches a terminal state")]
    pub follow: bool,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Print a single key's value.
    Get { key: String },
    /// Write a single key into the config file, creating it if necessary.
    Set { key: String, value: String },
    Unset { key: String },
    /// Write a default configuration file.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// List all known configuration keys.
    List,
    /// Print the path that would be loaded.
    Path,
}
