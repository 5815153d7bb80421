//! `congregate status`: stored cursors and how long ago each was set.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use congregate_core::{Cursor, CursorName};
use congregate_sync::cursor_store::CursorFile;
use congregate_sync::FileCursorStore;

use super::Global;

/// Arguments for `congregate status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, global: &Global) -> Result<()> {
        let store = FileCursorStore::at_home(&global.home()?);
        let file = store
            .load()
            .with_context(|| format!("failed to read cursor store {}", store.path().display()))?;
        let rows = cursor_rows(&file, Utc::now());

        if self.json {
            let payload = StatusJson {
                store: store.path().display().to_string(),
                cursors: rows,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_table(&store, rows);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct CursorStatus {
    name: &'static str,
    direction: &'static str,
    cursor: Option<String>,
    age: String,
}

#[derive(Serialize)]
struct StatusJson {
    store: String,
    cursors: Vec<CursorStatus>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "cursor")]
    name: String,
    #[tabled(rename = "drives")]
    direction: &'static str,
    #[tabled(rename = "modified since")]
    cursor: String,
    #[tabled(rename = "age")]
    age: String,
}

fn cursor_rows(file: &CursorFile, now: DateTime<Utc>) -> Vec<CursorStatus> {
    CursorName::all()
        .iter()
        .map(|&name| {
            let cursor = file.get(name);
            CursorStatus {
                name: name.key(),
                direction: match name {
                    CursorName::SourceA => "pco → fibery",
                    CursorName::SourceB => "fibery → pco",
                },
                cursor: cursor.map(|c| c.as_str().to_string()),
                age: cursor_age(cursor, now),
            }
        })
        .collect()
}

fn cursor_age(cursor: Option<&Cursor>, now: DateTime<Utc>) -> String {
    match cursor {
        None => "never".to_string(),
        Some(cursor) => match cursor.instant() {
            Some(at) => format_seconds(now.signed_duration_since(at).num_seconds().max(0) as u64),
            None => "unknown".to_string(),
        },
    }
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

fn print_table(store: &FileCursorStore, rows: Vec<CursorStatus>) {
    println!(
        "Congregate v{} | cursor store {}",
        env!("CARGO_PKG_VERSION"),
        store.path().display()
    );

    let never = rows.iter().filter(|r| r.cursor.is_none()).count();
    let table_rows: Vec<StatusTableRow> = rows
        .into_iter()
        .map(|row| StatusTableRow {
            name: if row.cursor.is_some() {
                row.name.green().bold().to_string()
            } else {
                row.name.bright_black().bold().to_string()
            },
            direction: row.direction,
            cursor: row.cursor.unwrap_or_else(|| "-".to_string()),
            age: row.age,
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");

    if never > 0 {
        println!("Cursors marked 'never' pull every record on the next 'congregate sync'.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    #[test]
    fn ages_are_coarse_and_missing_cursor_is_never() {
        let now = Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap();
        let cursor = |s: &str| Cursor(s.to_string());
        assert_eq!(cursor_age(None, now), "never");
        assert_eq!(cursor_age(Some(&cursor("2025-03-02T11:59:30.000Z")), now), "30s");
        assert_eq!(cursor_age(Some(&cursor("2025-03-02T09:00:00.000Z")), now), "3h");
        assert_eq!(cursor_age(Some(&cursor("2025-02-28T12:00:00.000Z")), now), "2d");
        assert_eq!(cursor_age(Some(&cursor("garbage")), now), "unknown");
    }

    #[test]
    fn rows_cover_both_cursors_in_order() {
        let mut cursors = BTreeMap::new();
        cursors.insert("Bsource".to_string(), Cursor("2025-03-02T11:00:00.000Z".into()));
        let file = CursorFile {
            updated_at: Utc::now(),
            cursors,
        };
        let rows = cursor_rows(&file, Utc::now());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Asource");
        assert!(rows[0].cursor.is_none());
        assert_eq!(rows[1].cursor.as_deref(), Some("2025-03-02T11:00:00.000Z"));
    }
}
