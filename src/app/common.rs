use std::path::PathBuf;

use crate::config::{self, AppConfig};
use crate::core::diagnostics::{Diagnostic, Severity};
use crate::core::options::ConfigLoadOptions;
use crate::error::Result;

pub fn config_load_options(config_override: Option<&PathBuf>) -> ConfigLoadOptions {
    match config_override {
        Some(path) => ConfigLoadOptions::explicit(path.clone()),
        None => ConfigLoadOptions::discover(),
    }
}

/// Load the effective configuration: file, then environment overrides.
/// CLI flags are applied on top of this by each handler.
pub fn load_effective_config(config_override: Option<&PathBuf>) -> Result<AppConfig> {
    let options = config_load_options(config_override);
    let mut cfg = config::load(&options)?;
    config::apply_env_overrides(&mut cfg)?;
    Ok(cfg)
}

pub fn emit_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        match diagnostic.severity {
            Severity::Warning => {
                eprintln!("Warning: {}", diagnostic.message);
                if let Some(help) = &diagnostic.help {
                    eprintln!("         {help}");
                }
            }
            Severity::Info => {
                println!("{}", diagnostic.message);
            }
            Severity::Error => {
                eprintln!("Error: {}", diagnostic.message);
                if let Some(help) = &diagnostic.help {
                    eprintln!("       {help}");
                }
            }
        }
    }
}
