//! Remote Transport (C2).
//!
//! Authenticated remote-shell connections, modeled as argv builders over a
//! pluggable `CommandRunner` rather than an embedded SSH protocol
//! implementation — the same "shell out to the real tool" idiom the teacher
//! uses for `qemu-system`/`qemu-img`. This keeps the dependency stack
//! aligned with the teacher (no async SSH library) and matches the
//! single-process, cooperative-suspension model of spec §5: each call is a
//! blocking `Command::output()`, which is exactly one "suspend at an I/O
//! boundary" from the caller's point of view.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

use super::command::validate_hostname;
use super::diagnostics::{Diagnostic, Severity};

/// Output of a single command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Test seam between the transport and the OS: "run this argv, get back
/// exit code/stdout/stderr". The real implementation shells out; tests
/// substitute a scripted fake so unit tests never touch a network.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<ExecOutput>;
}

/// Runs argv via `std::process::Command`.
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String], _timeout: Option<Duration>) -> Result<ExecOutput> {
        if argv.is_empty() {
            return Err(Error::General {
                message: "empty command argv".to_string(),
            });
        }
        let output = StdCommand::new(&argv[0])
            .args(&argv[1..])
            .output()
            .map_err(|source| Error::Network {
                message: format!("failed to spawn `{}`: {source}", argv[0]),
            })?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Host-key verification mode (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    Strict,
    Warn,
    Accept,
}

impl HostKeyPolicy {
    pub fn from_env(value: &str) -> Result<Self> {
        match value {
            "strict" => Ok(HostKeyPolicy::Strict),
            "warn" => Ok(HostKeyPolicy::Warn),
            "accept" => Ok(HostKeyPolicy::Accept),
            other => Err(Error::Configuration {
                message: format!("unknown host key policy `{other}`"),
            }),
        }
    }

    fn ssh_strict_host_key_checking(self) -> &'static str {
        match self {
            HostKeyPolicy::Strict => "yes",
            HostKeyPolicy::Warn => "accept-new",
            HostKeyPolicy::Accept => "accept-new",
        }
    }
}

/// Explicit connection parameters a caller may supply, taking precedence
/// over everything else in the resolution chain.
#[derive(Debug, Clone, Default)]
pub struct ConnectArgs {
    pub identity_file: Option<PathBuf>,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub host_key_policy: Option<HostKeyPolicy>,
    pub known_hosts_file: Option<PathBuf>,
}

/// A single parsed `Host` stanza from the user's SSH config file.
#[derive(Debug, Clone, Default)]
pub struct SshConfigEntry {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

/// Minimal parser for `~/.ssh/config`-style files: enough to resolve
/// `HostName`, `User`, `Port`, `IdentityFile` for a `Host` pattern match.
pub fn parse_ssh_config(contents: &str, host: &str) -> SshConfigEntry {
    let mut current_matches = false;
    let mut entry = SshConfigEntry::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or("").to_ascii_lowercase();
        let value = parts.next().unwrap_or("").trim();
        match key.as_str() {
            "host" => {
                current_matches = value.split_whitespace().any(|pattern| {
                    pattern == "*" || pattern == host || glob_match(pattern, host)
                });
            }
            "hostname" if current_matches && entry.hostname.is_none() => {
                entry.hostname = Some(value.to_string());
            }
            "user" if current_matches && entry.user.is_none() => {
                entry.user = Some(value.to_string());
            }
            "port" if current_matches && entry.port.is_none() => {
                entry.port = value.parse().ok();
            }
            "identityfile" if current_matches && entry.identity_file.is_none() => {
                entry.identity_file = Some(PathBuf::from(shellexpand_home(value)));
            }
            _ => {}
        }
    }
    entry
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() != 2 {
        return pattern == value;
    }
    value.starts_with(parts[0]) && value.ends_with(parts[1])
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

/// Environment variable overrides observed during resolution (spec §6),
/// namespaced with the `HYPERCLONE_` prefix.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub known_hosts_file: Option<PathBuf>,
    pub host_key_policy: Option<HostKeyPolicy>,
}

impl EnvOverrides {
    pub fn from_process_env() -> Result<Self> {
        let ssh_key_path = env::var("HYPERCLONE_SSH_KEY_PATH").ok().map(PathBuf::from);
        let ssh_port = match env::var("HYPERCLONE_SSH_PORT") {
            Ok(v) => Some(v.parse().map_err(|_| Error::InvalidPort {
                value: v.clone(),
                message: "HYPERCLONE_SSH_PORT must be numeric".to_string(),
            })?),
            Err(_) => None,
        };
        let known_hosts_file = env::var("HYPERCLONE_KNOWN_HOSTS_FILE")
            .ok()
            .map(PathBuf::from);
        let host_key_policy = match env::var("HYPERCLONE_SSH_HOST_KEY_POLICY") {
            Ok(v) => Some(HostKeyPolicy::from_env(&v)?),
            Err(_) => None,
        };
        Ok(Self {
            ssh_key_path,
            ssh_port,
            known_hosts_file,
            host_key_policy,
        })
    }
}

/// A fully resolved set of connection parameters for one host, after
/// applying the §4.2 precedence chain: explicit args > ssh config >
/// environment > process defaults.
#[derive(Debug, Clone)]
pub struct Connection {
    pub host: String,
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub known_hosts_file: Option<PathBuf>,
    pub host_key_policy: HostKeyPolicy,
}

/// Resolve connection parameters for `host` following spec §4.2's
/// precedence: explicit call args, then the user's SSH config, then
/// environment overrides, then process defaults (current user, port 22,
/// `~/.ssh/id_ed25519`).
pub fn resolve(
    host: &str,
    explicit: &ConnectArgs,
    ssh_config: Option<&SshConfigEntry>,
    env_overrides: &EnvOverrides,
) -> Result<Connection> {
    validate_hostname(host)?;

    let hostname = ssh_config
        .and_then(|c| c.hostname.clone())
        .unwrap_or_else(|| host.to_string());

    let username = explicit
        .username
        .clone()
        .or_else(|| ssh_config.and_then(|c| c.user.clone()))
        .unwrap_or_else(default_username);

    let port = explicit
        .port
        .or_else(|| ssh_config.and_then(|c| c.port))
        .or(env_overrides.ssh_port)
        .unwrap_or(22);

    let identity_file = explicit
        .identity_file
        .clone()
        .or_else(|| ssh_config.and_then(|c| c.identity_file.clone()))
        .or_else(|| env_overrides.ssh_key_path.clone())
        .or_else(default_identity_file);

    let host_key_policy = explicit
        .host_key_policy
        .or(env_overrides.host_key_policy)
        .unwrap_or(HostKeyPolicy::Strict);

    let known_hosts_file = explicit
        .known_hosts_file
        .clone()
        .or_else(|| env_overrides.known_hosts_file.clone());

    Ok(Connection {
        host: host.to_string(),
        hostname,
        username,
        port,
        identity_file,
        known_hosts_file,
        host_key_policy,
    })
}

fn default_username() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

fn default_identity_file() -> Option<PathBuf> {
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".ssh/id_ed25519"))
}

/// Check that an identity key file is readable and restricted to the owner
/// (mode 0600 or 0400), per spec §4.2.
#[cfg(unix)]
pub fn check_identity_key_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path).map_err(|source| Error::SshKey {
        path: path.to_path_buf(),
        message: format!("cannot stat identity file: {source}"),
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode != 0o600 && mode != 0o400 {
        return Err(Error::SshKey {
            path: path.to_path_buf(),
            message: format!(
                "mode {mode:o} is too permissive; expected 0600 or 0400"
            ),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_identity_key_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Retry policy for transient transport errors (spec §4.2): up to
/// `max_attempts` tries with exponential backoff starting at `base_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Whether an error is transient (network/connection-refused/timeout/drop)
/// and thus eligible for retry, versus permanent (auth, host-key,
/// validation) and never retried.
fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Network { .. } | Error::Connection { .. })
}

/// Run `op` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between transient failures. Authentication and host-key errors
/// are never retried; they propagate on the first attempt.
pub fn with_retry<T>(
    policy: RetryPolicy,
    cancel: &AtomicBool,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < policy.max_attempts => {
                if cancel.load(Ordering::SeqCst) {
                    return Err(Error::OperationCancelled);
                }
                thread::sleep(policy.backoff_delay(attempt));
            }
            Err(err) => return Err(err),
        }
    }
}

/// The Remote Transport. Owns no persistent socket; each call spawns the
/// real `ssh`/`scp`/`rsync` binary through `runner`, matching the way the
/// teacher shells out to `qemu-system`/`qemu-img` rather than linking a
/// hypervisor library.
pub struct Transport<'a> {
    pub runner: &'a dyn CommandRunner,
    pub retry: RetryPolicy,
}

impl<'a> Transport<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            retry: RetryPolicy::default(),
        }
    }

    fn ssh_argv(&self, conn: &Connection, remote_command: &str) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        argv.push("-p".to_string());
        argv.push(conn.port.to_string());
        argv.push("-o".to_string());
        argv.push(format!(
            "StrictHostKeyChecking={}",
            conn.host_key_policy.ssh_strict_host_key_checking()
        ));
        if let Some(known_hosts) = &conn.known_hosts_file {
            argv.push("-o".to_string());
            argv.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        if let Some(identity) = &conn.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        argv.push(format!("{}@{}", conn.username, conn.hostname));
        argv.push(remote_command.to_string());
        argv
    }

    /// Authenticate and verify host-key policy by probing connectivity.
    /// Fatal (never retried): auth and host-key failures. Transient:
    /// connection refused / timeout, retried per `self.retry`. Under
    /// `HostKeyPolicy::Warn`, an unknown host is trusted but recorded as a
    /// diagnostic rather than accepted silently (spec boundary B5).
    pub fn open(&self, conn: &Connection, cancel: &AtomicBool, diagnostics: &mut Vec<Diagnostic>) -> Result<()> {
        if conn.host_key_policy == HostKeyPolicy::Strict {
            // Strict mode never auto-trusts; an unknown host fails immediately.
            let known = self.known_host(conn)?;
            if !known {
                return Err(Error::HostKey {
                    host: conn.host.clone(),
                    message: "host is not present in known_hosts under strict policy".to_string(),
                });
            }
        } else if conn.host_key_policy == HostKeyPolicy::Warn && !self.known_host(conn)? {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                format!(
                    "host key for {} is not in known_hosts; trusting it on first connect under the `warn` policy",
                    conn.host
                ),
            ));
        }
        if let Some(identity) = &conn.identity_file {
            check_identity_key_permissions(identity)?;
        }

        with_retry(self.retry, cancel, || {
            let argv = self.ssh_argv(conn, "true");
            let output = self.runner.run(&argv, Some(Duration::from_secs(30)))?;
            if output.success() {
                Ok(())
            } else if looks_like_auth_failure(&output.stderr) {
                Err(Error::Auth {
                    host: conn.host.clone(),
                    message: output.stderr.trim().to_string(),
                })
            } else {
                Err(Error::Connection {
                    host: conn.host.clone(),
                    message: output.stderr.trim().to_string(),
                })
            }
        })
    }

    fn known_host(&self, conn: &Connection) -> Result<bool> {
        let mut argv = vec!["ssh-keygen".to_string(), "-F".to_string(), conn.hostname.clone()];
        if let Some(known_hosts) = &conn.known_hosts_file {
            argv.push("-f".to_string());
            argv.push(known_hosts.display().to_string());
        }
        let output = self.runner.run(&argv, Some(Duration::from_secs(5)))?;
        Ok(output.success() && !output.stdout.trim().is_empty())
    }

    /// Execute `remote_command` (already built by C1) on `conn`. Exit code
    /// is returned to the caller, not raised — callers decide policy.
    pub fn execute(
        &self,
        conn: &Connection,
        remote_command: &str,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<ExecOutput> {
        with_retry(self.retry, cancel, || {
            let argv = self.ssh_argv(conn, remote_command);
            let output = self.runner.run(&argv, timeout)?;
            Ok(output)
        })
    }

    /// Upload a local file to `remote_path` on `conn` via `scp`.
    pub fn upload(&self, conn: &Connection, local_path: &Path, remote_path: &str) -> Result<()> {
        let mut argv = vec!["scp".to_string(), "-P".to_string(), conn.port.to_string()];
        if let Some(identity) = &conn.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        argv.push(local_path.display().to_string());
        argv.push(format!("{}@{}:{}", conn.username, conn.hostname, remote_path));
        let output = self.runner.run(&argv, None)?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Network {
                message: output.stderr.trim().to_string(),
            })
        }
    }

    /// Download `remote_path` on `conn` to a local file.
    pub fn download(&self, conn: &Connection, remote_path: &str, local_path: &Path) -> Result<()> {
        let mut argv = vec!["scp".to_string(), "-P".to_string(), conn.port.to_string()];
        if let Some(identity) = &conn.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        argv.push(format!("{}@{}:{}", conn.username, conn.hostname, remote_path));
        argv.push(local_path.display().to_string());
        let output = self.runner.run(&argv, None)?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Network {
                message: output.stderr.trim().to_string(),
            })
        }
    }

    /// Close releases no resources today (each call is its own process),
    /// but is kept as an explicit lifecycle method so callers have one
    /// deterministic place to release a connection when multiplexing is
    /// later backed by a persistent ControlMaster socket.
    pub fn close(&self, _conn: &Connection) {}
}

fn looks_like_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("permission denied") || lower.contains("authentication failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Mutex;

    struct ScriptedRunner {
        responses: Mutex<RefCell<Vec<ExecOutput>>>,
        calls: Mutex<RefCell<Vec<Vec<String>>>>,
    }

    impl ScriptedRunner {
        fn new(responses: Vec<ExecOutput>) -> Self {
            Self {
                responses: Mutex::new(RefCell::new(responses)),
                calls: Mutex::new(RefCell::new(Vec::new())),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().borrow().len()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, argv: &[String], _timeout: Option<Duration>) -> Result<ExecOutput> {
            self.calls.lock().unwrap().borrow_mut().push(argv.to_vec());
            let mut responses = self.responses.lock().unwrap();
            let mut responses = responses.borrow_mut();
            if responses.is_empty() {
                panic!("ScriptedRunner ran out of responses");
            }
            Ok(responses.remove(0))
        }
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn resolution_precedence_explicit_wins() {
        let explicit = ConnectArgs {
            identity_file: Some(PathBuf::from("/explicit/key")),
            username: Some("alice".to_string()),
            port: Some(2222),
        };
        let config = SshConfigEntry {
            hostname: Some("real-host".to_string()),
            user: Some("bob".to_string()),
            port: Some(22),
            identity_file: Some(PathBuf::from("/config/key")),
        };
        let env = EnvOverrides::default();
        let conn = resolve("alias", &explicit, Some(&config), &env).unwrap();
        assert_eq!(conn.username, "alice");
        assert_eq!(conn.port, 2222);
        assert_eq!(conn.identity_file, Some(PathBuf::from("/explicit/key")));
        assert_eq!(conn.hostname, "real-host");
    }

    #[test]
    fn resolution_falls_back_to_env_then_default_port() {
        let explicit = ConnectArgs::default();
        let env = EnvOverrides {
            ssh_port: Some(2022),
            ..Default::default()
        };
        let conn = resolve("host", &explicit, None, &env).unwrap();
        assert_eq!(conn.port, 2022);

        let conn_default = resolve("host", &explicit, None, &EnvOverrides::default()).unwrap();
        assert_eq!(conn_default.port, 22);
    }

    #[test]
    fn ssh_config_parses_relevant_fields() {
        let contents = "Host dest\n  HostName 10.0.0.5\n  User admin\n  Port 2200\n";
        let entry = parse_ssh_config(contents, "dest");
        assert_eq!(entry.hostname.as_deref(), Some("10.0.0.5"));
        assert_eq!(entry.user.as_deref(), Some("admin"));
        assert_eq!(entry.port, Some(2200));
    }

    #[test]
    fn retry_exhausts_attempts_on_persistent_network_error() {
        let cancel = AtomicBool::new(false);
        let mut attempts = 0;
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let result: Result<()> = with_retry(policy, &cancel, || {
            attempts += 1;
            Err(Error::Network {
                message: "refused".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_does_not_retry_auth_failures() {
        let cancel = AtomicBool::new(false);
        let mut attempts = 0;
        let result: Result<()> = with_retry(RetryPolicy::default(), &cancel, || {
            attempts += 1;
            Err(Error::Auth {
                host: "h".to_string(),
                message: "no".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn execute_surfaces_nonzero_exit_without_erroring() {
        let runner = ScriptedRunner::new(vec![fail("command not found")]);
        let transport = Transport::new(&runner);
        let conn = resolve("host", &ConnectArgs::default(), None, &EnvOverrides::default()).unwrap();
        let cancel = AtomicBool::new(false);
        let output = transport
            .execute(&conn, "false", None, &cancel)
            .expect("execute should not error on nonzero exit");
        assert!(!output.success());
        assert_eq!(runner.call_count(), 1);
    }

    #[test]
    fn open_detects_auth_failure_and_does_not_retry() {
        let runner = ScriptedRunner::new(vec![fail("Permission denied (publickey).")]);
        let transport = Transport::new(&runner);
        let mut conn = resolve("host", &ConnectArgs::default(), None, &EnvOverrides::default()).unwrap();
        conn.host_key_policy = HostKeyPolicy::Accept;
        let cancel = AtomicBool::new(false);
        let mut diagnostics = Vec::new();
        let result = transport.open(&conn, &cancel, &mut diagnostics);
        assert!(matches!(result, Err(Error::Auth { .. })));
        assert_eq!(runner.call_count(), 1);
    }

    #[test]
    fn strict_policy_rejects_unknown_host() {
        let runner = ScriptedRunner::new(vec![ok("")]);
        let transport = Transport::new(&runner);
        let mut conn = resolve("host", &ConnectArgs::default(), None, &EnvOverrides::default()).unwrap();
        conn.host_key_policy = HostKeyPolicy::Strict;
        let cancel = AtomicBool::new(false);
        let mut diagnostics = Vec::new();
        let result = transport.open(&conn, &cancel, &mut diagnostics);
        assert!(matches!(result, Err(Error::HostKey { .. })));
    }

    #[test]
    fn warn_policy_trusts_unknown_host_but_logs_a_diagnostic() {
        let runner = ScriptedRunner::new(vec![fail("no such host key"), ok("")]);
        let transport = Transport::new(&runner);
        let mut conn = resolve("host", &ConnectArgs::default(), None, &EnvOverrides::default()).unwrap();
        conn.host_key_policy = HostKeyPolicy::Warn;
        let cancel = AtomicBool::new(false);
        let mut diagnostics = Vec::new();
        let result = transport.open(&conn, &cancel, &mut diagnostics);
        assert!(result.is_ok());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
    }
}
