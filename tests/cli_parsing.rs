#![cfg(feature = "cli")]

use clap::Parser;
use hyperclone::cli::{Cli, Commands};

#[test]
fn clone_parses_required_positionals_and_defaults() {
    let cli = Cli::try_parse_from(["hyperclone", "clone", "src-host", "dst-host", "web01"]).unwrap();
    match cli.command {
        Some(Commands::Clone(args)) => {
            assert_eq!(args.source_host, "src-host");
            assert_eq!(args.dest_host, "dst-host");
            assert_eq!(args.vm_name, "web01");
            assert!(!args.force);
            assert!(!args.dry_run);
            assert!(args.new_name.is_none());
        }
        _ => panic!("expected Clone command"),
    }
}

#[test]
fn clone_accepts_every_documented_flag() {
    let cli = Cli::try_parse_from([
        "hyperclone",
        "clone",
        "src-host",
        "dst-host",
        "web01",
        "--new-name",
        "web01-copy",
        "--force",
        "--dry-run",
        "--parallel",
        "8",
        "--verify",
        "--preserve-mac",
        "--bandwidth-limit",
        "10M",
        "--timeout",
        "120",
        "--idempotent",
        "--transfer-method",
        "stream",
        "--ssh-port",
        "2222",
    ])
    .unwrap();
    match cli.command {
        Some(Commands::Clone(args)) => {
            assert_eq!(args.new_name.as_deref(), Some("web01-copy"));
            assert!(args.force && args.dry_run && args.verify && args.preserve_mac && args.idempotent);
            assert_eq!(args.parallel, Some(8));
            assert_eq!(args.bandwidth_limit.as_deref(), Some("10M"));
            assert_eq!(args.timeout, Some(120));
            assert_eq!(args.transfer_method.as_deref(), Some("stream"));
            assert_eq!(args.ssh_port, Some(2222));
        }
        _ => panic!("expected Clone command"),
    }
}

#[test]
fn sync_parses_with_checkpoint_and_delta_only() {
    let cli = Cli::try_parse_from([
        "hyperclone",
        "sync",
        "src-host",
        "dst-host",
        "web01",
        "--checkpoint",
        "--delta-only",
    ])
    .unwrap();
    match cli.command {
        Some(Commands::Sync(args)) => {
            assert!(args.checkpoint);
            assert!(args.delta_only);
        }
        _ => panic!("expected Sync command"),
    }
}

#[test]
fn list_defaults_to_all_hosts_table_format() {
    let cli = Cli::try_parse_from(["hyperclone", "list"]).unwrap();
    match cli.command {
        Some(Commands::List(args)) => {
            assert!(args.hosts.is_empty());
            assert_eq!(args.status, "all");
            assert_eq!(args.format, "table");
        }
        _ => panic!("expected List command"),
    }
}

#[test]
fn list_accepts_multiple_hosts_and_overrides() {
    let cli = Cli::try_parse_from([
        "hyperclone", "list", "host-a", "host-b", "--status", "running", "--format", "json",
    ])
    .unwrap();
    match cli.command {
        Some(Commands::List(args)) => {
            assert_eq!(args.hosts, vec!["host-a".to_string(), "host-b".to_string()]);
            assert_eq!(args.status, "running");
            assert_eq!(args.format, "json");
        }
        _ => panic!("expected List command"),
    }
}

#[test]
fn status_with_no_operation_id_lists_everything() {
    let cli = Cli::try_parse_from(["hyperclone", "status", "--active"]).unwrap();
    match cli.command {
        Some(Commands::Status(args)) => {
            assert!(args.operation_id.is_none());
            assert!(args.active);
        }
        _ => panic!("expected Status command"),
    }
}

#[test]
fn global_config_flag_applies_before_the_subcommand() {
    let cli = Cli::try_parse_from(["hyperclone", "--config", "/etc/hyperclone.yaml", "list"]).unwrap();
    assert_eq!(cli.config.unwrap().to_str().unwrap(), "/etc/hyperclone.yaml");
}

#[test]
fn clone_rejects_missing_positional_arguments() {
    let result = Cli::try_parse_from(["hyperclone", "clone", "src-host"]);
    assert!(result.is_err());
}

#[test]
fn config_subcommand_requires_a_nested_command() {
    let result = Cli::try_parse_from(["hyperclone", "config"]);
    assert!(result.is_err());
}
