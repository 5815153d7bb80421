//! `congregate check`: pre-flight connectivity for both systems.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use congregate_sync::{connectors, Source};

use super::Global;

/// Arguments for `congregate check`.
#[derive(Args, Debug)]
pub struct CheckArgs {}

impl CheckArgs {
    pub fn run(self, global: &Global) -> Result<()> {
        let config = global.load_config()?;
        let (pco, fibery) = connectors(&config).context("failed to build connectors")?;

        let mut failed = 0;
        for source in [&pco as &dyn Source, &fibery as &dyn Source] {
            match source.check_connectivity() {
                Ok(()) => println!("{} {}", "✓".green().bold(), source.system()),
                Err(err) => {
                    failed += 1;
                    println!("{} {}: {err}", "✗".red().bold(), source.system());
                }
            }
        }
        if failed > 0 {
            bail!("{failed} of 2 systems unreachable");
        }
        Ok(())
    }
}
