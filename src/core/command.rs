//! Secure Command Builder (C1).
//!
//! Every shell command hyperclone runs on a remote host is assembled here.
//! Every argument is validated before it is interpolated, and every value is
//! POSIX single-quoted so a failure in validation is the only way untrusted
//! input can reach a remote shell.

use std::collections::HashMap;
use std::path::{Component, Path};

use crate::error::{Error, Result};

use super::model::validate_vm_name;

/// Single-quote a string per POSIX rules: wrap in `'...'`, and turn any
/// embedded `'` into `'\''` (close quote, escaped quote, reopen quote).
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Validate a hostname: `^[A-Za-z0-9.-]{1,255}$`, or a valid IPv4/IPv6
/// literal (IPv6 literals may additionally contain `:`).
pub fn validate_hostname(host: &str) -> Result<()> {
    if host.is_empty() || host.len() > 255 {
        return Err(Error::InvalidHost {
            value: host.to_string(),
            message: "length must be 1..=255".to_string(),
        });
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    let ok = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if !ok {
        return Err(Error::InvalidHost {
            value: host.to_string(),
            message: "must match ^[A-Za-z0-9.-]{1,255}$ or be an IP literal".to_string(),
        });
    }
    Ok(())
}

/// Validate a path: absolute, no `..` segment after normalization, and
/// lying under `base_dir`.
pub fn validate_path_under(path: &str, base_dir: &Path) -> Result<()> {
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return Err(Error::InvalidPath {
            value: path.to_string(),
            message: "path must be absolute".to_string(),
        });
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::InvalidPath {
            value: path.to_string(),
            message: "path must not contain `..`".to_string(),
        });
    }
    if !candidate.starts_with(base_dir) {
        return Err(Error::InvalidPath {
            value: path.to_string(),
            message: format!("path must lie under {}", base_dir.display()),
        });
    }
    Ok(())
}

/// Validate a TCP port, 1..=65535.
pub fn validate_port(port: u32) -> Result<u16> {
    if port == 0 || port > 65535 {
        return Err(Error::InvalidPort {
            value: port.to_string(),
            message: "port must be in 1..=65535".to_string(),
        });
    }
    Ok(port as u16)
}

/// A parsed bandwidth limit, stored internally in KiB/s (rsync's unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    pub kbps: u64,
}

/// Parse a bandwidth string like `100M`, `1G`, `100`, `0`, or `""`.
/// Empty string means unlimited (`None`); `"1X"` is a validation error.
pub fn parse_bandwidth(value: &str) -> Result<Option<Bandwidth>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let (digits, suffix) = match trimmed
        .chars()
        .position(|c| !c.is_ascii_digit())
    {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    if digits.is_empty() {
        return Err(Error::InvalidBandwidth {
            value: value.to_string(),
            message: "expected digits optionally followed by K/M/G/T".to_string(),
        });
    }
    let base: u64 = digits.parse().map_err(|_| Error::InvalidBandwidth {
        value: value.to_string(),
        message: "not a valid integer".to_string(),
    })?;
    let multiplier = match suffix {
        "" => 1u64,
        "K" => 1,
        "M" => 1024,
        "G" => 1024 * 1024,
        "T" => 1024 * 1024 * 1024,
        other => {
            return Err(Error::InvalidBandwidth {
                value: value.to_string(),
                message: format!("unknown unit suffix `{other}`"),
            });
        }
    };
    Ok(Some(Bandwidth {
        kbps: base * multiplier,
    }))
}

/// Fill a `{placeholder}` template with validated, quoted values. Unknown
/// placeholders in `params` or unresolved placeholders in `template` are
/// both hard errors.
pub fn safe(template: &str, params: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let end = template[i..]
                .find('}')
                .map(|p| i + p)
                .ok_or_else(|| Error::Validation {
                    message: "unterminated placeholder in command template".to_string(),
                })?;
            let key = &template[i + 1..end];
            let value = params.get(key).ok_or_else(|| Error::Validation {
                message: format!("unknown placeholder `{{{key}}}` in command template"),
            })?;
            out.push_str(&shell_quote(value));
            i = end + 1;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    let _ = &mut chars;
    Ok(out)
}

/// rsync options accepted by the builder.
#[derive(Debug, Clone, Default)]
pub struct RsyncOptions {
    pub bandwidth: Option<Bandwidth>,
    pub extra_args: Vec<String>,
}

/// `rsync -avS --partial --inplace --progress --stats [--bwlimit=N] src dest`.
/// `--stats` gives the transfer engine a parseable summary (`Literal data:
/// N bytes`) without a second pass over the output.
pub fn rsync(
    source_path: &str,
    dest_path: &str,
    dest_host: &str,
    base_dir: &Path,
    options: &RsyncOptions,
) -> Result<String> {
    validate_hostname(dest_host)?;
    validate_path_under(source_path, base_dir)?;
    validate_path_under(dest_path, base_dir)?;

    let mut parts = vec![
        "rsync".to_string(),
        "-avS".to_string(),
        "--partial".to_string(),
        "--inplace".to_string(),
        "--progress".to_string(),
        "--stats".to_string(),
    ];
    if let Some(bw) = options.bandwidth {
        parts.push(format!("--bwlimit={}", bw.kbps));
    }
    for extra in &options.extra_args {
        parts.push(shell_quote(extra));
    }
    parts.push(shell_quote(source_path));
    parts.push(format!(
        "{}:{}",
        shell_quote(dest_host),
        shell_quote(dest_path)
    ));
    Ok(parts.join(" "))
}

/// `cat <source> | ssh <dest_host> 'cat > <dest>'` — a direct host-to-host
/// stream with no resume support, issued from the source host's own shell.
/// Requires the source host to already trust `dest_host` (out of scope for
/// the orchestrator; operator-provisioned).
pub fn stream_copy(source_path: &str, dest_path: &str, dest_host: &str, base_dir: &Path) -> Result<String> {
    validate_hostname(dest_host)?;
    validate_path_under(source_path, base_dir)?;
    validate_path_under(dest_path, base_dir)?;
    let inner = format!("cat > {}", shell_quote(dest_path));
    Ok(format!(
        "cat {} | ssh {} {}",
        shell_quote(source_path),
        shell_quote(dest_host),
        shell_quote(&inner)
    ))
}

const VIRSH_SUBCOMMANDS: &[&str] = &[
    "list", "dominfo", "dumpxml", "define", "undefine", "destroy", "start",
    "domblklist", "snapshot-create-as", "snapshot-delete", "domstate",
    "nodeinfo", "pool-list", "pool-info", "pool-refresh",
];

/// `virsh <subcommand> <args...>`, subcommand whitelisted, args quoted.
pub fn virsh(subcommand: &str, args: &[&str]) -> Result<String> {
    if !VIRSH_SUBCOMMANDS.contains(&subcommand) {
        return Err(Error::Validation {
            message: format!("virsh subcommand `{subcommand}` is not whitelisted"),
        });
    }
    let mut parts = vec!["virsh".to_string(), subcommand.to_string()];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    Ok(parts.join(" "))
}

/// `virsh destroy <vm>` — force-stop a running domain.
pub fn virsh_destroy(vm_name: &str) -> Result<String> {
    validate_vm_name(vm_name)?;
    virsh("destroy", &[vm_name])
}

/// `virsh undefine <vm>` — remove a domain's definition.
pub fn virsh_undefine(vm_name: &str) -> Result<String> {
    validate_vm_name(vm_name)?;
    virsh("undefine", &[vm_name])
}

/// `rm -f <path>`, path validated to lie under `base_dir`.
pub fn rm_file(path: &str, base_dir: &Path) -> Result<String> {
    validate_path_under(path, base_dir)?;
    Ok(format!("rm -f {}", shell_quote(path)))
}

/// `rm -rf <path>`, path validated to lie under `base_dir`.
pub fn rm_directory(path: &str, base_dir: &Path) -> Result<String> {
    validate_path_under(path, base_dir)?;
    Ok(format!("rm -rf {}", shell_quote(path)))
}

/// `mv <src> <dest>`, both validated to lie under `base_dir`.
pub fn move_file(src: &str, dest: &str, base_dir: &Path) -> Result<String> {
    validate_path_under(src, base_dir)?;
    validate_path_under(dest, base_dir)?;
    Ok(format!("mv {} {}", shell_quote(src), shell_quote(dest)))
}

/// `cp <src> <dest>`, both validated to lie under `base_dir`. Used to seed a
/// staging copy of a disk that already exists at `dest` before a delta
/// transfer method diffs against it in place.
pub fn copy_file(src: &str, dest: &str, base_dir: &Path) -> Result<String> {
    validate_path_under(src, base_dir)?;
    validate_path_under(dest, base_dir)?;
    Ok(format!("cp {} {}", shell_quote(src), shell_quote(dest)))
}

/// `mkdir -p <path>`, validated to lie under `base_dir`.
pub fn mkdir(path: &str, base_dir: &Path) -> Result<String> {
    validate_path_under(path, base_dir)?;
    Ok(format!("mkdir -p {}", shell_quote(path)))
}

/// A block-level differential sync tool invocation between the same-host
/// staging copy and the destination's existing disk. Falls back to a plain
/// copy when `dest_exists` is false (first transfer, spec §4.4).
pub fn blocksync(
    source_path: &str,
    dest_path: &str,
    dest_host: &str,
    base_dir: &Path,
    dest_exists: bool,
) -> Result<String> {
    validate_hostname(dest_host)?;
    validate_path_under(source_path, base_dir)?;
    validate_path_under(dest_path, base_dir)?;
    if dest_exists {
        Ok(format!(
            "blocksync {} {}:{}",
            shell_quote(source_path),
            shell_quote(dest_host),
            shell_quote(dest_path)
        ))
    } else {
        Ok(format!(
            "blocksync --full {} {}:{}",
            shell_quote(source_path),
            shell_quote(dest_host),
            shell_quote(dest_path)
        ))
    }
}

/// `stat -c %s <path>` — the file's size in bytes, used by the hypervisor
/// adapter (disk size isn't part of `virsh dumpxml`'s output) and by the
/// orchestrator's pre-transfer disk inventory.
pub fn stat_size(path: &str, base_dir: &Path) -> Result<String> {
    validate_path_under(path, base_dir)?;
    Ok(format!("stat -c %s {}", shell_quote(path)))
}

/// `sha256sum <path>`, used by the transfer engine's `verify` option.
pub fn checksum(path: &str, base_dir: &Path) -> Result<String> {
    validate_path_under(path, base_dir)?;
    Ok(format!("sha256sum {}", shell_quote(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base() -> PathBuf {
        PathBuf::from("/var/lib/hyperclone")
    }

    #[test]
    fn quoting_recovers_original_argument() {
        let evil = "'; rm -rf / #";
        let quoted = shell_quote(evil);
        // A shell splitting `echo <quoted>` would recover exactly `evil`.
        assert!(quoted.starts_with('\''));
        assert!(quoted.ends_with('\''));
        assert!(quoted.contains("'\\''"));
    }

    #[test]
    fn rsync_rejects_path_outside_base() {
        let opts = RsyncOptions::default();
        let result = rsync(
            "/etc/passwd",
            "/var/lib/hyperclone/x.qcow2",
            "dest.example.com",
            &base(),
            &opts,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rsync_happy_path_includes_bwlimit() {
        let opts = RsyncOptions {
            bandwidth: Some(Bandwidth { kbps: 1024 }),
            extra_args: Vec::new(),
        };
        let cmd = rsync(
            "/var/lib/hyperclone/src.qcow2",
            "/var/lib/hyperclone/dst.qcow2",
            "dest.example.com",
            &base(),
            &opts,
        )
        .unwrap();
        assert!(cmd.contains("--bwlimit=1024"));
        assert!(cmd.contains("--stats"));
        assert!(cmd.starts_with("rsync -avS --partial --inplace --progress"));
    }

    #[test]
    fn virsh_rejects_unknown_subcommand() {
        assert!(virsh("shutdown", &["vm1"]).is_err());
    }

    #[test]
    fn virsh_destroy_validates_name() {
        assert!(virsh_destroy("bad name").is_err());
        assert!(virsh_destroy("vm1").unwrap().contains("virsh destroy"));
    }

    #[test]
    fn bandwidth_boundary_cases() {
        assert_eq!(parse_bandwidth("").unwrap(), None);
        assert_eq!(parse_bandwidth("0").unwrap().unwrap().kbps, 0);
        assert_eq!(parse_bandwidth("100").unwrap().unwrap().kbps, 100);
        assert_eq!(parse_bandwidth("100K").unwrap().unwrap().kbps, 100);
        assert_eq!(parse_bandwidth("1G").unwrap().unwrap().kbps, 1024 * 1024);
        assert!(parse_bandwidth("1X").is_err());
    }

    #[test]
    fn port_boundary_cases() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(1).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(65536).is_err());
    }

    #[test]
    fn safe_rejects_unknown_placeholder() {
        let mut params = HashMap::new();
        params.insert("known", "value".to_string());
        assert!(safe("echo {unknown}", &params).is_err());
    }

    #[test]
    fn safe_quotes_every_value() {
        let mut params = HashMap::new();
        params.insert("name", "it's a test".to_string());
        let result = safe("echo {name}", &params).unwrap();
        assert!(result.contains("'\\''"));
    }

    #[test]
    fn stream_copy_nests_the_remote_command_in_a_single_quoted_argument() {
        let cmd = stream_copy(
            "/var/lib/hyperclone/src.qcow2",
            "/var/lib/hyperclone/dst.qcow2",
            "dest.example.com",
            &base(),
        )
        .unwrap();
        assert!(cmd.starts_with("cat "));
        assert!(cmd.contains("| ssh 'dest.example.com'"));
        assert!(cmd.contains("cat > '/var/lib/hyperclone/dst.qcow2'"));
    }

    #[test]
    fn stat_size_and_checksum_validate_path() {
        assert!(stat_size("/etc/passwd", &base()).is_err());
        let cmd = stat_size("/var/lib/hyperclone/disk.qcow2", &base()).unwrap();
        assert!(cmd.starts_with("stat -c %s"));
        let cmd = checksum("/var/lib/hyperclone/disk.qcow2", &base()).unwrap();
        assert!(cmd.starts_with("sha256sum"));
    }

    #[test]
    fn blocksync_falls_back_to_full_copy_when_dest_missing() {
        let cmd = blocksync(
            "/var/lib/hyperclone/a.qcow2",
            "/var/lib/hyperclone/b.qcow2",
            "dest",
            &base(),
            false,
        )
        .unwrap();
        assert!(cmd.contains("--full"));
    }
}
