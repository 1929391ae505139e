//! Configuration (C7).
//!
//! Loads a strongly typed `AppConfig` from a YAML file, discovered the same
//! way the teacher resolves its project file: an explicit path always wins
//! (and a missing explicit path is a hard error), otherwise the first
//! existing well-known location, otherwise built-in defaults. Unknown keys
//! are rejected up front rather than silently ignored, and every
//! "stringly-typed" field (ports, bandwidth, booleans) is coerced exactly
//! once, here, never at the point of use.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

use crate::core::command::Bandwidth;
use crate::core::options::{ConfigLoadOptions, ConfigSource};
use crate::core::transfer::TransferMethod;
use crate::core::transport::HostKeyPolicy;
use crate::error::{Error, Result};

/// SSH connection defaults (spec §6 env var table mirrors these).
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub identity_file: Option<PathBuf>,
    pub port: u16,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            port: 22,
            host_key_policy: HostKeyPolicy::Strict,
            known_hosts_file: None,
        }
    }
}

/// Default transfer parameters, overridable per invocation by CLI flags.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub method: TransferMethod,
    pub parallel: u32,
    pub bandwidth_limit: Option<Bandwidth>,
    pub verify: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            method: TransferMethod::Rsync,
            parallel: 4,
            bandwidth_limit: None,
            verify: false,
        }
    }
}

/// Where remote disk images may live, and how the libvirt daemon is reached.
#[derive(Debug, Clone)]
pub struct LibvirtConfig {
    pub uri: String,
    pub storage_dir: PathBuf,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            storage_dir: PathBuf::from("/var/lib/libvirt/images"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: LogLevel::Info }
    }
}

/// The fully resolved, effective configuration for one process invocation.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub ssh: SshConfig,
    pub transfer: TransferConfig,
    pub libvirt: LibvirtConfig,
    pub logging: LoggingConfig,
    pub source_path: Option<PathBuf>,
}

/// Well-known config file search path, in precedence order, for
/// `ConfigSource::Discover`.
pub fn discover_path() -> Option<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("hyperclone/config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    } else if let Ok(home) = env::var("HOME") {
        let candidate = PathBuf::from(home).join(".config/hyperclone/config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let cwd = PathBuf::from("hyperclone.yaml");
    if cwd.exists() {
        return Some(cwd);
    }
    None
}

/// `$XDG_STATE_HOME/hyperclone`, or `~/.local/state/hyperclone`, overridable
/// by `HYPERCLONE_STATE_DIR` (spec §6).
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("HYPERCLONE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("hyperclone");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".local/state/hyperclone");
    }
    PathBuf::from("/var/lib/hyperclone")
}

/// Load and validate the effective configuration.
pub fn load(options: &ConfigLoadOptions) -> Result<AppConfig> {
    let path = match &options.source {
        ConfigSource::Explicit(path) => {
            if !path.exists() {
                return Err(Error::ReadConfig {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
                });
            }
            Some(path.clone())
        }
        ConfigSource::Discover => discover_path(),
    };

    let Some(path) = path else {
        if options.allow_missing {
            return Ok(AppConfig::default());
        }
        return Err(Error::Configuration {
            message: "no configuration file found and none was provided".to_string(),
        });
    };

    let contents = fs::read_to_string(&path).map_err(|source| Error::ReadConfig {
        path: path.clone(),
        source,
    })?;

    let value: Value = serde_yaml::from_str(&contents).map_err(|source| Error::ParseConfig {
        path: path.clone(),
        source,
    })?;

    reject_unknown_keys(&value, &path)?;

    let raw: RawConfig = serde_yaml::from_value(value).map_err(|source| Error::ParseConfig {
        path: path.clone(),
        source,
    })?;

    let mut config = raw.into_app_config(&path)?;
    config.source_path = Some(path);
    Ok(config)
}

fn parse_error(path: &Path, message: impl Into<String>) -> Error {
    use serde::de::Error as _;
    Error::ParseConfig {
        path: path.to_path_buf(),
        source: serde_yaml::Error::custom(message.into()),
    }
}

const ALLOWED_SECTIONS: &[&str] = &["ssh", "transfer", "libvirt", "logging"];
const ALLOWED_SSH_KEYS: &[&str] = &["identity_file", "port", "host_key_policy", "known_hosts_file"];
const ALLOWED_TRANSFER_KEYS: &[&str] = &["method", "parallel", "bandwidth_limit", "verify"];
const ALLOWED_LIBVIRT_KEYS: &[&str] = &["uri", "storage_dir"];
const ALLOWED_LOGGING_KEYS: &[&str] = &["level"];

fn reject_unknown_keys(value: &Value, path: &Path) -> Result<()> {
    let Value::Mapping(root) = value else {
        return Ok(());
    };
    check_keys(root, ALLOWED_SECTIONS, "<root>", path)?;
    let sections: HashMap<&str, &[&str]> = [
        ("ssh", ALLOWED_SSH_KEYS),
        ("transfer", ALLOWED_TRANSFER_KEYS),
        ("libvirt", ALLOWED_LIBVIRT_KEYS),
        ("logging", ALLOWED_LOGGING_KEYS),
    ]
    .into_iter()
    .collect();
    for (key, section_value) in root.iter() {
        let Some(section_name) = key.as_str() else { continue };
        let Some(allowed) = sections.get(section_name) else { continue };
        if let Value::Mapping(section) = section_value {
            check_keys(section, allowed, section_name, path)?;
        }
    }
    Ok(())
}

fn check_keys(map: &serde_yaml::Mapping, allowed: &[&str], context: &str, path: &Path) -> Result<()> {
    for key in map.keys() {
        let Some(key) = key.as_str() else { continue };
        if !allowed.contains(&key) {
            return Err(parse_error(path, format!("unknown key `{key}` in `{context}`")));
        }
    }
    Ok(())
}

/// A raw scalar that may arrive from YAML as a string, bool, or number.
/// Coerces `"true"`/`"false"`/`"null"`/`"none"` to their typed equivalents,
/// and numeric strings to an integer then a float, exactly once at load
/// time — never re-parsed at point of use.
#[derive(Debug, Clone)]
enum CoercedValue {
    Bool(bool),
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for CoercedValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Bool(b) => CoercedValue::Bool(b),
            Value::Null => CoercedValue::Null,
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CoercedValue::Int(i)
                } else {
                    CoercedValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => CoercedValue::Bool(true),
                "false" => CoercedValue::Bool(false),
                "null" | "none" => CoercedValue::Null,
                _ => match s.parse::<i64>() {
                    Ok(i) => CoercedValue::Int(i),
                    Err(_) => match s.parse::<f64>() {
                        Ok(f) => CoercedValue::Float(f),
                        Err(_) => CoercedValue::Text(s),
                    },
                },
            },
            other => CoercedValue::Text(serde_yaml::to_string(&other).unwrap_or_default()),
        })
    }
}

impl CoercedValue {
    fn as_text(&self) -> String {
        match self {
            CoercedValue::Bool(b) => b.to_string(),
            CoercedValue::Null => String::new(),
            CoercedValue::Int(i) => i.to_string(),
            CoercedValue::Float(f) => f.to_string(),
            CoercedValue::Text(s) => s.clone(),
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            CoercedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn as_u32(&self) -> Option<u32> {
        match self {
            CoercedValue::Int(i) => u32::try_from(*i).ok(),
            _ => None,
        }
    }

    fn as_u16(&self) -> Option<u16> {
        match self {
            CoercedValue::Int(i) => u16::try_from(*i).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    ssh: Option<RawSsh>,
    transfer: Option<RawTransfer>,
    libvirt: Option<RawLibvirt>,
    logging: Option<RawLogging>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSsh {
    identity_file: Option<String>,
    port: Option<CoercedValue>,
    host_key_policy: Option<String>,
    known_hosts_file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTransfer {
    method: Option<String>,
    parallel: Option<CoercedValue>,
    bandwidth_limit: Option<String>,
    verify: Option<CoercedValue>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLibvirt {
    uri: Option<String>,
    storage_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLogging {
    level: Option<String>,
}

impl RawConfig {
    fn into_app_config(self, path: &Path) -> Result<AppConfig> {
        let mut config = AppConfig::default();

        if let Some(ssh) = self.ssh {
            if let Some(identity_file) = ssh.identity_file {
                config.ssh.identity_file = Some(PathBuf::from(identity_file));
            }
            if let Some(port) = ssh.port {
                config.ssh.port = port.as_u16().ok_or_else(|| {
                    parse_error(path, format!("ssh.port must be an integer in 1..=65535, got `{}`", port.as_text()))
                })?;
            }
            if let Some(policy) = ssh.host_key_policy {
                config.ssh.host_key_policy = HostKeyPolicy::from_env(&policy)?;
            }
            if let Some(known_hosts) = ssh.known_hosts_file {
                config.ssh.known_hosts_file = Some(PathBuf::from(known_hosts));
            }
        }

        if let Some(transfer) = self.transfer {
            if let Some(method) = transfer.method {
                config.transfer.method = method.parse().map_err(|_| Error::Configuration {
                    message: format!("unknown transfer.method `{method}`"),
                })?;
            }
            if let Some(parallel) = transfer.parallel {
                config.transfer.parallel = parallel
                    .as_u32()
                    .ok_or_else(|| parse_error(path, "transfer.parallel must be a positive integer"))?;
            }
            if let Some(bandwidth) = transfer.bandwidth_limit {
                config.transfer.bandwidth_limit = crate::core::command::parse_bandwidth(&bandwidth)?;
            }
            if let Some(verify) = transfer.verify {
                config.transfer.verify = verify
                    .as_bool()
                    .ok_or_else(|| parse_error(path, "transfer.verify must be a boolean"))?;
            }
        }

        if let Some(libvirt) = self.libvirt {
            if let Some(uri) = libvirt.uri {
                config.libvirt.uri = uri;
            }
            if let Some(storage_dir) = libvirt.storage_dir {
                config.libvirt.storage_dir = PathBuf::from(storage_dir);
            }
        }

        if let Some(logging) = self.logging {
            if let Some(level) = logging.level {
                config.logging.level = match level.to_ascii_lowercase().as_str() {
                    "error" => LogLevel::Error,
                    "warning" | "warn" => LogLevel::Warning,
                    "info" => LogLevel::Info,
                    "debug" => LogLevel::Debug,
                    other => {
                        return Err(Error::Configuration {
                            message: format!("unknown logging.level `{other}`"),
                        });
                    }
                };
            }
        }

        Ok(config)
    }
}

/// Apply environment variable overrides on top of a loaded `AppConfig`,
/// per spec §6's precedence (env beats file, explicit CLI flags beat both —
/// those are applied by the `app` layer when constructing operation options).
pub fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(path) = env::var("HYPERCLONE_SSH_KEY_PATH") {
        config.ssh.identity_file = Some(PathBuf::from(path));
    }
    if let Ok(port) = env::var("HYPERCLONE_SSH_PORT") {
        config.ssh.port = port.parse().map_err(|_| Error::InvalidPort {
            value: port.clone(),
            message: "HYPERCLONE_SSH_PORT must be numeric".to_string(),
        })?;
    }
    if let Ok(policy) = env::var("HYPERCLONE_SSH_HOST_KEY_POLICY") {
        config.ssh.host_key_policy = HostKeyPolicy::from_env(&policy)?;
    }
    if let Ok(known_hosts) = env::var("HYPERCLONE_KNOWN_HOSTS_FILE") {
        config.ssh.known_hosts_file = Some(PathBuf::from(known_hosts));
    }
    if let Ok(uri) = env::var("HYPERCLONE_LIBVIRT_URI") {
        config.libvirt.uri = uri;
    }
    Ok(())
}

/// Scaffold a default config file at `path`. Refuses to overwrite an
/// existing file unless `force` is set.
pub fn init_default(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Configuration {
            message: format!("{} already exists; use --force to overwrite", path.display()),
        });
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, default_config_contents()).map_err(|source| Error::WriteConfig {
        path: path.to_path_buf(),
        source,
    })
}

/// Rewrite a single dotted key (e.g. `ssh.port`) in the YAML file at `path`,
/// creating the file (and the section mapping, if absent) as needed. The
/// value is stored as the same `CoercedValue` scalar `into_app_config` would
/// read back, so a round trip through `set` then `load` behaves the same as
/// hand-editing the file.
pub fn set_key(path: &Path, key: &str, value: &str) -> Result<()> {
    let (section, field) = split_key(path, key)?;
    let mut root = read_or_empty_mapping(path)?;

    let mut section_map = match root.iter().find(|(k, _)| k.as_str() == Some(section)) {
        Some((_, Value::Mapping(existing))) => existing.clone(),
        Some(_) => return Err(parse_error(path, format!("`{section}` is not a mapping"))),
        None => serde_yaml::Mapping::new(),
    };
    section_map.insert(Value::String(field.to_string()), coerce_for_storage(value));
    root.insert(Value::String(section.to_string()), Value::Mapping(section_map));

    write_mapping(path, &root)
}

/// Remove a single dotted key from the YAML file at `path`, leaving the
/// rest of the document untouched. Removing a key that is already absent is
/// not an error: the effective value simply reverts to the built-in default.
pub fn unset_key(path: &Path, key: &str) -> Result<()> {
    let (section, field) = split_key(path, key)?;
    let mut root = read_or_empty_mapping(path)?;

    if let Some((_, Value::Mapping(existing))) = root.iter().find(|(k, _)| k.as_str() == Some(section)) {
        let mut section_map = serde_yaml::Mapping::new();
        for (k, v) in existing.iter() {
            if k.as_str() != Some(field) {
                section_map.insert(k.clone(), v.clone());
            }
        }
        root.insert(Value::String(section.to_string()), Value::Mapping(section_map));
    }

    write_mapping(path, &root)
}

fn split_key(path: &Path, key: &str) -> Result<(&str, &str)> {
    if !known_keys().contains(&key) {
        return Err(parse_error(path, format!("unknown configuration key `{key}`")));
    }
    key.split_once('.')
        .ok_or_else(|| parse_error(path, format!("malformed configuration key `{key}`")))
}

fn read_or_empty_mapping(path: &Path) -> Result<serde_yaml::Mapping> {
    if !path.exists() {
        return Ok(serde_yaml::Mapping::new());
    }
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(serde_yaml::Mapping::new());
    }
    match serde_yaml::from_str(&contents).map_err(|source| Error::ParseConfig { path: path.to_path_buf(), source })? {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(serde_yaml::Mapping::new()),
        _ => Err(parse_error(path, "configuration file root must be a mapping")),
    }
}

fn write_mapping(path: &Path, root: &serde_yaml::Mapping) -> Result<()> {
    let body = serde_yaml::to_string(&Value::Mapping(root.clone())).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::Io { path: parent.to_path_buf(), source })?;
        }
    }
    fs::write(path, body).map_err(|source| Error::WriteConfig { path: path.to_path_buf(), source })
}

fn coerce_for_storage(value: &str) -> Value {
    match value.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" | "none" => Value::Null,
        _ => match value.parse::<i64>() {
            Ok(i) => Value::Number(i.into()),
            Err(_) => Value::String(value.to_string()),
        },
    }
}

fn default_config_contents() -> &'static str {
    "ssh:\n  port: 22\n  host_key_policy: strict\n\n\
transfer:\n  method: rsync\n  parallel: 4\n  verify: false\n\n\
libvirt:\n  uri: qemu:///system\n  storage_dir: /var/lib/libvirt/images\n\n\
logging:\n  level: info\n"
}

/// Known configuration keys, in dotted-path form, for `config list`.
pub fn known_keys() -> Vec<&'static str> {
    vec![
        "ssh.identity_file",
        "ssh.port",
        "ssh.host_key_policy",
        "ssh.known_hosts_file",
        "transfer.method",
        "transfer.parallel",
        "transfer.bandwidth_limit",
        "transfer.verify",
        "libvirt.uri",
        "libvirt.storage_dir",
        "logging.level",
    ]
}

/// Render a single config key as its string representation, for `config get`.
pub fn get_key(config: &AppConfig, key: &str) -> Option<String> {
    Some(match key {
        "ssh.identity_file" => config.ssh.identity_file.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        "ssh.port" => config.ssh.port.to_string(),
        "ssh.host_key_policy" => format!("{:?}", config.ssh.host_key_policy).to_ascii_lowercase(),
        "ssh.known_hosts_file" => config.ssh.known_hosts_file.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        "transfer.method" => format!("{:?}", config.transfer.method).to_ascii_lowercase(),
        "transfer.parallel" => config.transfer.parallel.to_string(),
        "transfer.bandwidth_limit" => config.transfer.bandwidth_limit.map(|b| format!("{}K", b.kbps)).unwrap_or_default(),
        "transfer.verify" => config.transfer.verify.to_string(),
        "libvirt.uri" => config.libvirt.uri.clone(),
        "libvirt.storage_dir" => config.libvirt.storage_dir.display().to_string(),
        "logging.level" => format!("{:?}", config.logging.level).to_ascii_lowercase(),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_a_minimal_file_and_leaves_defaults_for_missing_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "ssh:\n  port: 2222\n").unwrap();

        let config = load(&ConfigLoadOptions::explicit(path)).unwrap();
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.transfer.method, TransferMethod::Rsync);
    }

    #[test]
    fn rejects_unknown_top_level_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "bogus:\n  x: 1\n").unwrap();

        let result = load(&ConfigLoadOptions::explicit(path));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_key_within_a_known_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "transfer:\n  methodx: rsync\n").unwrap();

        let result = load(&ConfigLoadOptions::explicit(path));
        assert!(result.is_err());
    }

    #[test]
    fn coerces_string_booleans_and_numbers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "transfer:\n  verify: \"true\"\n  parallel: \"8\"\n").unwrap();

        let config = load(&ConfigLoadOptions::explicit(path)).unwrap();
        assert!(config.transfer.verify);
        assert_eq!(config.transfer.parallel, 8);
    }

    #[test]
    fn missing_explicit_path_is_a_hard_error() {
        let result = load(&ConfigLoadOptions::explicit(PathBuf::from("/nonexistent/hyperclone.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn discover_with_no_file_yields_defaults_when_missing_is_allowed() {
        let config = load(&ConfigLoadOptions::discover()).unwrap();
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn set_key_creates_the_file_and_section_if_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        set_key(&path, "ssh.port", "2201").unwrap();

        let config = load(&ConfigLoadOptions::explicit(path)).unwrap();
        assert_eq!(config.ssh.port, 2201);
    }

    #[test]
    fn set_key_leaves_other_keys_in_the_section_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "ssh:\n  port: 2200\n  host_key_policy: warn\n").unwrap();

        set_key(&path, "ssh.port", "2222").unwrap();

        let config = load(&ConfigLoadOptions::explicit(path)).unwrap();
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::Warn);
    }

    #[test]
    fn unset_key_reverts_to_the_built_in_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "ssh:\n  port: 2200\n").unwrap();

        unset_key(&path, "ssh.port").unwrap();

        let config = load(&ConfigLoadOptions::explicit(path)).unwrap();
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn set_key_rejects_an_unknown_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let result = set_key(&path, "ssh.bogus", "1");
        assert!(result.is_err());
    }
}
