//! `congregate cursor`: manual cursor maintenance.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use congregate_core::CursorName;
use congregate_sync::FileCursorStore;

use super::Global;

#[derive(Subcommand, Debug)]
pub enum CursorCommand {
    /// Forget a cursor so the next sync pulls every record in that direction.
    Reset(ResetArgs),
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Asource, Bsource or all.
    pub target: ResetTarget,
}

/// Parsed from CLI strings; `all` expands to both cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    One(CursorName),
    All,
}

impl ResetTarget {
    fn names(self) -> Vec<CursorName> {
        match self {
            ResetTarget::One(name) => vec![name],
            ResetTarget::All => CursorName::all().to_vec(),
        }
    }
}

impl FromStr for ResetTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(ResetTarget::All);
        }
        CursorName::from_str(s)
            .map(ResetTarget::One)
            .map_err(|err| format!("{err}, or all"))
    }
}

impl fmt::Display for ResetTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetTarget::One(name) => name.fmt(f),
            ResetTarget::All => f.write_str("all"),
        }
    }
}

pub fn run(command: CursorCommand, global: &Global) -> Result<()> {
    match command {
        CursorCommand::Reset(args) => reset(args.target, global),
    }
}

fn reset(target: ResetTarget, global: &Global) -> Result<()> {
    let mut store = FileCursorStore::at_home(&global.home()?);
    for name in target.names() {
        let removed = store
            .clear(name)
            .with_context(|| format!("failed to reset cursor {name}"))?;
        if removed {
            println!("✓ {name} reset; next sync pulls everything for this direction");
        } else {
            println!("· {name} was not set");
        }
    }
    Ok(())
}
