use std::path::PathBuf;

use crate::Result;
use crate::cli::ConfigCommand;
use crate::config;
use crate::error::Error;

use super::common::load_effective_config;

pub fn handle_config(command: ConfigCommand, config_override: Option<&PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let cfg = load_effective_config(config_override)?;
            for key in config::known_keys() {
                if let Some(value) = config::get_key(&cfg, key) {
                    println!("{key} = {value}");
                }
            }
        }
        ConfigCommand::Get { key } => {
            let cfg = load_effective_config(config_override)?;
            match config::get_key(&cfg, &key) {
                Some(value) => println!("{value}"),
                None => {
                    return Err(Error::Configuration {
                        message: format!("unknown configuration key `{key}`"),
                    });
                }
            }
        }
        ConfigCommand::Set { key, value } => {
            let path = effective_path(config_override);
            config::set_key(&path, &key, &value)?;
            println!("Set {key} in {}", path.display());
        }
        ConfigCommand::Unset { key } => {
            let path = effective_path(config_override);
            config::unset_key(&path, &key)?;
            println!("Unset {key} in {}", path.display());
        }
        ConfigCommand::Init { force } => {
            let path = effective_path(config_override);
            config::init_default(&path, force)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigCommand::List => {
            for key in config::known_keys() {
                println!("{key}");
            }
        }
        ConfigCommand::Path => match config_override {
            Some(path) => println!("{}", path.display()),
            None => match config::discover_path() {
                Some(path) => println!("{}", path.display()),
                None => println!("(no configuration file found; built-in defaults apply)"),
            },
        },
    }
    Ok(())
}

/// The file `set`/`unset`/`init` operate on: the explicit `--config` path if
/// given, otherwise whatever `discover_path` finds, otherwise a fresh
/// `hyperclone.yaml` in the current directory.
fn effective_path(config_override: Option<&PathBuf>) -> PathBuf {
    config_override
        .cloned()
        .or_else(config::discover_path)
        .unwrap_or_else(|| PathBuf::from("hyperclone.yaml"))
}
