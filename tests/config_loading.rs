use std::fs;

use hyperclone::core::options::ConfigLoadOptions;
use hyperclone::{Error, apply_env_overrides, default_state_dir, init_default, load, set_key, unset_key};
use tempfile::tempdir;

#[test]
fn loads_every_section_from_an_explicit_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hyperclone.yaml");
    fs::write(
        &path,
        r#"
ssh:
  identity_file: /home/ops/.ssh/id_ed25519
  port: "2222"
  host_key_policy: accept
transfer:
  method: blocksync
  parallel: "16"
  bandwidth_limit: 50M
  verify: "true"
libvirt:
  uri: qemu+ssh:///system
  storage_dir: /srv/vms
logging:
  level: debug
"#,
    )
    .unwrap();

    let cfg = load(&ConfigLoadOptions::explicit(path.clone())).unwrap();

    assert_eq!(cfg.ssh.port, 2222);
    assert_eq!(cfg.ssh.host_key_policy, hyperclone::core::transport::HostKeyPolicy::Accept);
    assert_eq!(cfg.transfer.parallel, 16);
    assert!(cfg.transfer.verify);
    assert_eq!(cfg.libvirt.uri, "qemu+ssh:///system");
    assert_eq!(cfg.libvirt.storage_dir.to_str().unwrap(), "/srv/vms");
    assert_eq!(cfg.source_path.as_deref(), Some(path.as_path()));
}

#[test]
fn unknown_top_level_section_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hyperclone.yaml");
    fs::write(&path, "bogus_section:\n  x: 1\n").unwrap();

    let err = load(&ConfigLoadOptions::explicit(path)).unwrap_err();
    assert!(matches!(err, Error::ParseConfig { .. }));
}

#[test]
fn unknown_key_within_a_known_section_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hyperclone.yaml");
    fs::write(&path, "ssh:\n  unknown_field: 1\n").unwrap();

    let err = load(&ConfigLoadOptions::explicit(path)).unwrap_err();
    assert!(matches!(err, Error::ParseConfig { .. }));
}

#[test]
fn missing_explicit_path_is_a_hard_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("does-not-exist.yaml");
    let err = load(&ConfigLoadOptions::explicit(path)).unwrap_err();
    assert!(matches!(err, Error::ReadConfig { .. }));
}

#[test]
fn discovery_with_no_file_anywhere_yields_defaults() {
    temp_env::with_vars(
        [
            ("XDG_CONFIG_HOME", None::<&str>),
            ("HOME", Some("/nonexistent-hyperclone-test-home")),
        ],
        || {
            let cfg = load(&ConfigLoadOptions::discover()).unwrap();
            assert_eq!(cfg.ssh.port, 22);
            assert_eq!(cfg.transfer.parallel, 4);
        },
    );
}

#[test]
fn env_overrides_apply_on_top_of_a_loaded_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hyperclone.yaml");
    fs::write(&path, "ssh:\n  port: 22\n").unwrap();

    temp_env::with_var("HYPERCLONE_SSH_PORT", Some("2200"), || {
        let mut cfg = load(&ConfigLoadOptions::explicit(path.clone())).unwrap();
        apply_env_overrides(&mut cfg).unwrap();
        assert_eq!(cfg.ssh.port, 2200);
    });
}

#[test]
fn default_state_dir_honors_explicit_override() {
    temp_env::with_var("HYPERCLONE_STATE_DIR", Some("/tmp/hyperclone-test-state"), || {
        assert_eq!(default_state_dir().to_str().unwrap(), "/tmp/hyperclone-test-state");
    });
}

#[test]
fn init_default_refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hyperclone.yaml");
    init_default(&path, false).unwrap();
    assert!(path.exists());

    let err = init_default(&path, false).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    init_default(&path, true).unwrap();
}

#[test]
fn set_then_unset_round_trips_through_the_default() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hyperclone.yaml");
    fs::write(&path, "transfer:\n  parallel: 4\n").unwrap();

    set_key(&path, "ssh.port", "2022").unwrap();
    let cfg = load(&ConfigLoadOptions::explicit(path.clone())).unwrap();
    assert_eq!(cfg.ssh.port, 2022);
    assert_eq!(cfg.transfer.parallel, 4);

    unset_key(&path, "ssh.port").unwrap();
    let cfg = load(&ConfigLoadOptions::explicit(path)).unwrap();
    assert_eq!(cfg.ssh.port, 22);
}
