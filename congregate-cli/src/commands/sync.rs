//! `congregate sync`: one reconciliation run.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use congregate_core::Direction;
use congregate_sync::pipeline::{DirectionReport, KindReport};
use congregate_sync::{run_once, FileCursorStore, RunMode, RunReport, RunSettings};

use super::Global;

/// Arguments for `congregate sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Look up and plan every write without applying any; cursors are left untouched.
    #[arg(long)]
    pub dry_run: bool,

    /// Also push Fibery edits back into Planning Center for this run.
    #[arg(long)]
    pub reverse: bool,

    /// Print the run report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self, global: &Global) -> Result<()> {
        let config = global.load_config()?;
        let mut cursors = FileCursorStore::at_home(&global.home()?);

        let mut settings = RunSettings::from_config(&config);
        if self.reverse {
            settings.reverse = Direction::Enabled;
        }
        if self.dry_run {
            settings.mode = RunMode::DryRun;
        }

        let report = run_once(&config, &mut cursors, settings).context("sync run failed")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize run report")?
            );
            return Ok(());
        }
        print_report(&report);
        Ok(())
    }
}

#[derive(Tabled)]
struct KindRow {
    #[tabled(rename = "direction")]
    direction: &'static str,
    #[tabled(rename = "kind")]
    kind: &'static str,
    #[tabled(rename = "pulled")]
    pulled: usize,
    #[tabled(rename = "processed")]
    processed: usize,
    #[tabled(rename = "deferred")]
    deferred: usize,
    #[tabled(rename = "created")]
    created: usize,
    #[tabled(rename = "updated")]
    updated: usize,
    #[tabled(rename = "unchanged")]
    skipped: usize,
    #[tabled(rename = "refused")]
    refused: usize,
    #[tabled(rename = "rejected")]
    rejected: usize,
}

impl KindRow {
    fn new(direction: &'static str, kind: &'static str, report: &KindReport) -> Self {
        Self {
            direction,
            kind,
            pulled: report.pulled,
            processed: report.processed,
            deferred: report.deferred,
            created: report.created,
            updated: report.updated,
            skipped: report.skipped,
            refused: report.refused,
            rejected: report.rejected,
        }
    }
}

fn direction_rows(label: &'static str, report: &DirectionReport) -> [KindRow; 2] {
    [
        KindRow::new(label, "households", &report.households),
        KindRow::new(label, "people", &report.people),
    ]
}

fn print_report(report: &RunReport) {
    let dry = report.mode == RunMode::DryRun;
    let prefix = if dry { "[dry-run] " } else { "" };
    let status = if report.writes() == 0 && report.planned.is_empty() {
        "nothing to do".to_string()
    } else if dry {
        format!("{} writes planned", report.planned.len())
    } else {
        format!("{} writes", report.writes())
    };
    println!(
        "{prefix}{} sync finished in {} ms ({status})",
        "✓".green().bold(),
        report.duration_ms
    );

    let b_label = if report.b_to_a.reconciled {
        "fibery → pco"
    } else {
        "fibery (pull only)"
    };
    let mut rows = Vec::new();
    rows.extend(direction_rows("pco → fibery", &report.a_to_b));
    rows.extend(direction_rows(b_label, &report.b_to_a));
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for planned in &report.planned {
        let value = serde_json::to_value(&planned.command).unwrap_or_default();
        let action = value["action"].as_str().unwrap_or("write");
        println!(
            "  ~  {} {} {} {}",
            planned.system,
            planned.kind,
            action,
            planned.command.natural_key().unwrap_or("<no key>")
        );
    }

    let deferred = report.a_to_b.households.deferred
        + report.a_to_b.people.deferred
        + report.b_to_a.households.deferred
        + report.b_to_a.people.deferred;
    if deferred > 0 {
        println!(
            "{}",
            format!("{deferred} records deferred by the per-run limit; run sync again to continue.")
                .yellow()
        );
    }

    if report.cursors_committed {
        for (name, direction) in [("Asource", &report.a_to_b), ("Bsource", &report.b_to_a)] {
            let after = direction
                .cursor_after
                .as_ref()
                .map_or("never", |c| c.as_str());
            println!("  {name}: {after}");
        }
    } else {
        println!("{}", "cursors not committed (dry run)".bright_black());
    }
}
