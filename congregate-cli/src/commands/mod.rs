pub mod check;
pub mod cursor;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};

use congregate_core::{config, SyncConfig};

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Global {
    pub config: Option<PathBuf>,
}

impl Global {
    pub fn home(&self) -> Result<PathBuf> {
        config::home().context("could not determine home directory")
    }

    /// Resolved, validated configuration: `--config` when given, else the home default.
    pub fn load_config(&self) -> Result<SyncConfig> {
        match &self.config {
            Some(path) => config::load_from(path)
                .with_context(|| format!("failed to load configuration from {}", path.display())),
            None => {
                let home = self.home()?;
                config::load_at(&home).with_context(|| {
                    format!(
                        "failed to load configuration (looked for {})",
                        config::config_path_at(&home).display()
                    )
                })
            }
        }
    }
}
