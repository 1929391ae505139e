use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad grouping used to bucket error codes, matching the categories in the
/// error taxonomy (system/authentication/operation/validation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    System,
    Authentication,
    Operation,
    Validation,
}

/// Library error type. One variant per failure mode; each carries enough
/// context to render a single-line message and, where useful, a remediation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("general failure: {message}")]
    General { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("could not connect to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("VM `{name}` was not found on {host}")]
    VmNotFound { host: String, name: String },

    #[error(
        "VM `{name}` already exists on {host}. Re-run with --force or --idempotent to replace it."
    )]
    VmExists { host: String, name: String },

    #[error("insufficient resources on {host}: need {required} bytes, {available} available")]
    InsufficientResources {
        host: String,
        required: u64,
        available: u64,
    },

    #[error("transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("operation cancelled")]
    OperationCancelled,

    #[error("hypervisor error on {host}: {message}")]
    Hypervisor { host: String, message: String },

    #[error("authentication to {host} failed: {message}")]
    Auth { host: String, message: String },

    #[error("SSH identity key {path} is unusable: {message}")]
    SshKey { path: PathBuf, message: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("host key verification failed for {host}: {message}")]
    HostKey { host: String, message: String },

    #[error("clone failed: {message}")]
    Clone { message: String },

    #[error("sync failed: {message}")]
    Sync { message: String },

    #[error("operation {operation_id} timed out after {seconds}s")]
    OperationTimeout { operation_id: String, seconds: u64 },

    #[error("operation {operation_id} was not found")]
    OperationNotFound { operation_id: String },

    #[error("disk space check failed: {message}")]
    DiskSpace { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("invalid host `{value}`: {message}")]
    InvalidHost { value: String, message: String },

    #[error("invalid VM name `{value}`: {message}")]
    InvalidVmName { value: String, message: String },

    #[error("invalid path `{value}`: {message}")]
    InvalidPath { value: String, message: String },

    #[error("invalid port `{value}`: {message}")]
    InvalidPort { value: String, message: String },

    #[error("invalid timeout `{value}`: {message}")]
    InvalidTimeout { value: String, message: String },

    #[error("invalid bandwidth limit `{value}`: {message}")]
    InvalidBandwidth { value: String, message: String },

    #[error("failed to read configuration file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write configuration file at {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Stable numeric code from the error taxonomy (System 1000s, Auth
    /// 1100s, Operation 1200s, Validation 1300s).
    pub fn code(&self) -> u32 {
        match self {
            Error::General { .. } => 1000,
            Error::Configuration { .. } | Error::ReadConfig { .. } | Error::WriteConfig { .. } => {
                1001
            }
            Error::ParseConfig { .. } => 1001,
            Error::Connection { .. } => 1002,
            Error::VmNotFound { .. } => 1003,
            Error::VmExists { .. } => 1004,
            Error::InsufficientResources { .. } => 1005,
            Error::Transfer { .. } => 1006,
            Error::Validation { .. } => 1007,
            Error::OperationCancelled => 1008,
            Error::Hypervisor { .. } => 1009,
            Error::Io { .. } => 1010,
            Error::Auth { .. } => 1100,
            Error::SshKey { .. } => 1101,
            Error::PermissionDenied { .. } => 1102,
            Error::HostKey { .. } => 1103,
            Error::Clone { .. } => 1200,
            Error::Sync { .. } => 1201,
            Error::OperationTimeout { .. } => 1202,
            Error::OperationNotFound { .. } => 1203,
            Error::DiskSpace { .. } => 1204,
            Error::Network { .. } => 1205,
            Error::InvalidHost { .. } => 1300,
            Error::InvalidVmName { .. } => 1301,
            Error::InvalidPath { .. } => 1302,
            Error::InvalidPort { .. } => 1303,
            Error::InvalidTimeout { .. } => 1304,
            Error::InvalidBandwidth { .. } => 1305,
        }
    }

    pub fn category(&self) -> Category {
        match self.code() {
            1000..=1099 => Category::System,
            1100..=1199 => Category::Authentication,
            1200..=1299 => Category::Operation,
            1300..=1399 => Category::Validation,
            _ => Category::System,
        }
    }

    /// Short machine name for the error, used in `ErrorResponse.error.code`
    /// alongside the numeric code.
    pub fn machine_name(&self) -> &'static str {
        match self {
            Error::General { .. } => "general",
            Error::Configuration { .. } | Error::ReadConfig { .. } | Error::WriteConfig { .. } => {
                "configuration"
            }
            Error::ParseConfig { .. } => "configuration",
            Error::Connection { .. } => "connection",
            Error::VmNotFound { .. } => "vm-not-found",
            Error::VmExists { .. } => "vm-exists",
            Error::InsufficientResources { .. } => "insufficient-resources",
            Error::Transfer { .. } => "transfer",
            Error::Validation { .. } => "validation",
            Error::OperationCancelled => "operation-cancelled",
            Error::Hypervisor { .. } => "hypervisor",
            Error::Io { .. } => "io",
            Error::Auth { .. } => "auth",
            Error::SshKey { .. } => "ssh-key",
            Error::PermissionDenied { .. } => "permission-denied",
            Error::HostKey { .. } => "host-key",
            Error::Clone { .. } => "clone",
            Error::Sync { .. } => "sync",
            Error::OperationTimeout { .. } => "operation-timeout",
            Error::OperationNotFound { .. } => "operation-not-found",
            Error::DiskSpace { .. } => "disk-space",
            Error::Network { .. } => "network",
            Error::InvalidHost { .. } => "invalid-host",
            Error::InvalidVmName { .. } => "invalid-vm-name",
            Error::InvalidPath { .. } => "invalid-path",
            Error::InvalidPort { .. } => "invalid-port",
            Error::InvalidTimeout { .. } => "invalid-timeout",
            Error::InvalidBandwidth { .. } => "invalid-bandwidth",
        }
    }

    /// Numbered remediation steps for user-facing categories. Empty when
    /// there's nothing actionable beyond the message itself.
    pub fn remediation(&self) -> Vec<String> {
        match self {
            Error::Auth { host, .. } => vec![
                format!("1. Copy your public key to {host}: ssh-copy-id -p <port> <user>@{host}"),
                "2. Confirm your agent holds the key: ssh-add -l".to_string(),
                format!("3. Test connectivity manually: ssh -v <user>@{host}"),
            ],
            Error::SshKey { path, .. } => vec![
                format!("1. Restrict key permissions: chmod 600 {}", path.display()),
                "2. Or load the key into an agent instead: ssh-add <path>".to_string(),
            ],
            Error::HostKey { host, .. } => vec![
                format!("1. Verify the host key out-of-band, then add it: ssh-keyscan {host} >> ~/.ssh/known_hosts"),
                "2. Or set HYPERCLONE_SSH_HOST_KEY_POLICY=accept for a one-time trust-on-first-use.".to_string(),
                "3. Re-run the command once the key is trusted.".to_string(),
            ],
            Error::PermissionDenied { .. } => vec![
                "1. Confirm the remote user has privileges for the hypervisor daemon.".to_string(),
                "2. Re-run as a user in the libvirt/kvm group, or via sudo-capable transport.".to_string(),
            ],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_fall_in_declared_ranges() {
        assert_eq!(
            Error::VmExists {
                host: "h".into(),
                name: "v".into()
            }
            .category(),
            Category::System
        );
        assert_eq!(
            Error::Auth {
                host: "h".into(),
                message: "m".into()
            }
            .category(),
            Category::Authentication
        );
        assert_eq!(
            Error::Clone {
                message: "m".into()
            }
            .category(),
            Category::Operation
        );
        assert_eq!(
            Error::InvalidPort {
                value: "0".into(),
                message: "m".into()
            }
            .category(),
            Category::Validation
        );
    }

    #[test]
    fn auth_errors_carry_remediation() {
        let err = Error::Auth {
            host: "dest".into(),
            message: "no key".into(),
        };
        assert!(!err.remediation().is_empty());
    }

    #[test]
    fn general_errors_have_no_remediation() {
        let err = Error::General {
            message: "boom".into(),
        };
        assert!(err.remediation().is_empty());
    }
}
