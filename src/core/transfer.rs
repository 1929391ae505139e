//! Transfer Engine (C4).
//!
//! Moves one disk image from a path on the source host to a path on the
//! destination host, in one of three strategies. Every strategy issues its
//! command through the Secure Command Builder and executes it on the
//! *source* host's connection: the bytes flow source→destination directly
//! (rsync/stream over their own SSH hop, or the block-sync tool speaking to
//! the destination itself), never relayed through the control process.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::{Error, Result};

use super::command::{self, Bandwidth, RsyncOptions};
use super::events::Event;
use super::reporter::Reporter;
use super::transport::{Connection, Transport};

/// Transfer strategy selected by `CloneOptions::transfer_method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    Rsync,
    Stream,
    Blocksync,
}

impl std::str::FromStr for TransferMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsync" => Ok(TransferMethod::Rsync),
            "stream" => Ok(TransferMethod::Stream),
            "blocksync" => Ok(TransferMethod::Blocksync),
            other => Err(Error::Validation {
                message: format!("unknown transfer method `{other}`"),
            }),
        }
    }
}

/// One disk transfer's parameters, common to all three strategies.
pub struct TransferRequest<'a> {
    pub disk_label: String,
    pub source_path: String,
    pub dest_path: String,
    pub dest_host: String,
    pub total_bytes: u64,
    pub bandwidth_limit: Option<Bandwidth>,
    pub verify: bool,
    pub dest_exists: bool,
    pub base_dir: &'a Path,
}

/// Outcome of a completed (non-cancelled) transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub checksum: Option<String>,
}

fn parse_rsync_bytes(stdout: &str) -> Option<u64> {
    let re = Regex::new(r"Literal data:\s*([\d,]+)\s*bytes").ok()?;
    let caps = re.captures(stdout)?;
    caps[1].replace(',', "").parse().ok()
}

fn run_on_source(
    transport: &Transport<'_>,
    source_conn: &Connection,
    remote_command: &str,
    cancel: &AtomicBool,
) -> Result<(String, String)> {
    let output = transport.execute(source_conn, remote_command, None, cancel)?;
    if !output.success() {
        return Err(Error::Transfer {
            path: remote_command.to_string(),
            message: output.stderr.trim().to_string(),
        });
    }
    Ok((output.stdout, output.stderr))
}

fn checksum_remote(
    transport: &Transport<'_>,
    conn: &Connection,
    path: &str,
    base_dir: &Path,
    cancel: &AtomicBool,
) -> Result<String> {
    let cmd = command::checksum(path, base_dir)?;
    let output = transport.execute(conn, &cmd, None, cancel)?;
    if !output.success() {
        return Err(Error::Transfer {
            path: path.to_string(),
            message: format!("checksum failed: {}", output.stderr.trim()),
        });
    }
    output
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::Transfer {
            path: path.to_string(),
            message: "checksum command produced no output".to_string(),
        })
}

/// Run `request` via `method` on `source_conn` (and, for verification,
/// `dest_conn`). Checks `cancel` before issuing the transfer and again
/// before computing a verification checksum — the two suspension points
/// this blocking, shell-per-call model can honor.
#[allow(clippy::too_many_arguments)]
pub fn transfer(
    method: TransferMethod,
    transport: &Transport<'_>,
    source_conn: &Connection,
    dest_conn: &Connection,
    request: &TransferRequest<'_>,
    cancel: &AtomicBool,
    reporter: &mut dyn Reporter,
) -> Result<TransferOutcome> {
    if cancel.load(Ordering::SeqCst) {
        return Err(Error::OperationCancelled);
    }

    let started = Instant::now();
    let options = RsyncOptions {
        bandwidth: request.bandwidth_limit,
        extra_args: Vec::new(),
    };

    let bytes_transferred = match method {
        TransferMethod::Rsync => {
            let cmd = command::rsync(
                &request.source_path,
                &request.dest_path,
                &request.dest_host,
                request.base_dir,
                &options,
            )?;
            let (stdout, _) = run_on_source(transport, source_conn, &cmd, cancel)?;
            parse_rsync_bytes(&stdout).unwrap_or(request.total_bytes)
        }
        TransferMethod::Stream => {
            let cmd = command::stream_copy(
                &request.source_path,
                &request.dest_path,
                &request.dest_host,
                request.base_dir,
            )?;
            run_on_source(transport, source_conn, &cmd, cancel)?;
            request.total_bytes
        }
        TransferMethod::Blocksync => {
            let cmd = command::blocksync(
                &request.source_path,
                &request.dest_path,
                &request.dest_host,
                request.base_dir,
                request.dest_exists,
            )?;
            let result = run_on_source(transport, source_conn, &cmd, cancel);
            match result {
                Ok(_) => request.total_bytes,
                Err(Error::Transfer { message, .. })
                    if message.to_ascii_lowercase().contains("not found")
                        || message.to_ascii_lowercase().contains("command not found") =>
                {
                    return Err(Error::Transfer {
                        path: request.disk_label.clone(),
                        message: "blocksync is not installed on one of the hosts".to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    };

    reporter.report(Event::TransferProgress {
        disk: request.disk_label.clone(),
        bytes_transferred,
        total_bytes: request.total_bytes,
        speed_bytes_per_sec: if started.elapsed().as_secs_f64() > 0.0 {
            bytes_transferred as f64 / started.elapsed().as_secs_f64()
        } else {
            bytes_transferred as f64
        },
    });

    if cancel.load(Ordering::SeqCst) {
        return Err(Error::OperationCancelled);
    }

    let checksum = if request.verify {
        let source_sum = checksum_remote(transport, source_conn, &request.source_path, request.base_dir, cancel)?;
        let dest_sum = checksum_remote(transport, dest_conn, &request.dest_path, request.base_dir, cancel)?;
        if source_sum != dest_sum {
            return Err(Error::Transfer {
                path: request.dest_path.clone(),
                message: "checksum mismatch after transfer".to_string(),
            });
        }
        Some(source_sum)
    } else {
        None
    };

    let duration = started.elapsed();
    reporter.report(Event::TransferCompleted {
        disk: request.disk_label.clone(),
        bytes_transferred,
        duration,
        checksum: checksum.clone(),
    });

    Ok(TransferOutcome {
        bytes_transferred,
        duration,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_data_line_from_rsync_stats() {
        let stdout = "building file list ... done\nLiteral data: 4,294,967,296 bytes\ntotal size is 10,737,418,240\n";
        assert_eq!(parse_rsync_bytes(stdout), Some(4_294_967_296));
    }

    #[test]
    fn missing_literal_data_falls_back_to_none() {
        assert_eq!(parse_rsync_bytes("no stats here"), None);
    }

    #[test]
    fn transfer_method_parses_known_values_only() {
        assert_eq!("rsync".parse::<TransferMethod>().unwrap(), TransferMethod::Rsync);
        assert_eq!("stream".parse::<TransferMethod>().unwrap(), TransferMethod::Stream);
        assert_eq!(
            "blocksync".parse::<TransferMethod>().unwrap(),
            TransferMethod::Blocksync
        );
        assert!("teleport".parse::<TransferMethod>().is_err());
    }
}
