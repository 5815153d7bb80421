//! Cursor store: durable "modified after" tokens, one per pull direction.
//!
//! Persists a `CursorFile` JSON document at `<home>/.congregate/cursors.json`.
//! Writes use an atomic `.tmp` + rename so a crash mid-save never leaves a
//! truncated file behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use congregate_core::{Cursor, CursorName};

use crate::error::{io_err, SyncError};

/// Read/write access to the named cursors.
///
/// `get` after a successful `set` in the same process returns the value set.
pub trait CursorStore {
    /// `None` means "never synced": pull everything.
    fn get(&self, name: CursorName) -> Result<Option<Cursor>, SyncError>;
    fn set(&mut self, name: CursorName, cursor: &Cursor) -> Result<(), SyncError>;
}

/// On-disk payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorFile {
    pub updated_at: DateTime<Utc>,
    /// Keyed by [`CursorName::key`].
    pub cursors: BTreeMap<String, Cursor>,
}

impl CursorFile {
    fn empty() -> Self {
        Self {
            updated_at: Utc::now(),
            cursors: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: CursorName) -> Option<&Cursor> {
        self.cursors.get(name.key())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CursorFileCompat {
    Structured(CursorFileStructuredCompat),
    /// Bare `{"Asource": "...", "Bsource": "..."}` map.
    Flat(BTreeMap<String, Cursor>),
}

#[derive(Debug, Deserialize)]
struct CursorFileStructuredCompat {
    updated_at: Option<DateTime<Utc>>,
    cursors: BTreeMap<String, Cursor>,
}

/// `<home>/.congregate/cursors.json`
pub fn store_path_at(home: &Path) -> PathBuf {
    home.join(".congregate").join("cursors.json")
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// JSON file store. Every `set` is persisted before it returns.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_home(home: &Path) -> Self {
        Self::new(store_path_at(home))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole file. Missing file yields an empty store.
    pub fn load(&self) -> Result<CursorFile, SyncError> {
        if !self.path.exists() {
            return Ok(CursorFile::empty());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        match serde_json::from_str::<CursorFileCompat>(&contents)? {
            CursorFileCompat::Structured(file) => Ok(CursorFile {
                updated_at: file.updated_at.unwrap_or_else(Utc::now),
                cursors: file.cursors,
            }),
            CursorFileCompat::Flat(cursors) => Ok(CursorFile {
                updated_at: Utc::now(),
                cursors,
            }),
        }
    }

    fn save(&self, file: &CursorFile) -> Result<(), SyncError> {
        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid cursor store path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let json = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }

    /// Forget a cursor so the next run pulls everything in that direction.
    /// Returns whether a value was removed.
    pub fn clear(&mut self, name: CursorName) -> Result<bool, SyncError> {
        let mut file = self.load()?;
        let removed = file.cursors.remove(name.key()).is_some();
        if removed {
            file.updated_at = Utc::now();
            self.save(&file)?;
        }
        Ok(removed)
    }
}

impl CursorStore for FileCursorStore {
    fn get(&self, name: CursorName) -> Result<Option<Cursor>, SyncError> {
        Ok(self.load()?.get(name).cloned())
    }

    fn set(&mut self, name: CursorName, cursor: &Cursor) -> Result<(), SyncError> {
        let mut file = self.load()?;
        file.cursors.insert(name.key().to_string(), cursor.clone());
        file.updated_at = Utc::now();
        self.save(&file)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    cursors: BTreeMap<CursorName, Cursor>,
    /// Number of successful `set` calls.
    pub writes: usize,
}

impl MemoryCursorStore {
    pub fn with(entries: impl IntoIterator<Item = (CursorName, Cursor)>) -> Self {
        Self {
            cursors: entries.into_iter().collect(),
            writes: 0,
        }
    }
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, name: CursorName) -> Result<Option<Cursor>, SyncError> {
        Ok(self.cursors.get(&name).cloned())
    }

    fn set(&mut self, name: CursorName, cursor: &Cursor) -> Result<(), SyncError> {
        self.cursors.insert(name, cursor.clone());
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cursor(s: &str) -> Cursor {
        Cursor(s.to_string())
    }

    #[test]
    fn missing_file_means_never_synced() {
        let tmp = TempDir::new().unwrap();
        let store = FileCursorStore::at_home(tmp.path());
        assert_eq!(store.get(CursorName::SourceA).unwrap(), None);
    }

    #[test]
    fn set_then_get_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileCursorStore::at_home(tmp.path());
        store
            .set(CursorName::SourceA, &cursor("2025-01-01T00:00:00.000Z"))
            .unwrap();
        store
            .set(CursorName::SourceB, &cursor("2025-02-01T00:00:00.000Z"))
            .unwrap();

        let reopened = FileCursorStore::at_home(tmp.path());
        assert_eq!(
            reopened.get(CursorName::SourceA).unwrap(),
            Some(cursor("2025-01-01T00:00:00.000Z"))
        );
        assert_eq!(
            reopened.get(CursorName::SourceB).unwrap(),
            Some(cursor("2025-02-01T00:00:00.000Z"))
        );
    }

    #[test]
    fn tmp_file_cleaned_up_after_save() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileCursorStore::at_home(tmp.path());
        store.set(CursorName::SourceA, &cursor("t")).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn flat_map_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = store_path_at(tmp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"Asource":"2024-06-01T00:00:00.000Z"}"#).unwrap();

        let store = FileCursorStore::new(&path);
        assert_eq!(
            store.get(CursorName::SourceA).unwrap(),
            Some(cursor("2024-06-01T00:00:00.000Z"))
        );
        assert_eq!(store.get(CursorName::SourceB).unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = store_path_at(tmp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let err = FileCursorStore::new(&path)
            .get(CursorName::SourceA)
            .unwrap_err();
        assert!(matches!(err, SyncError::Json(_)), "got: {err}");
    }

    #[test]
    fn clear_removes_only_named_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileCursorStore::at_home(tmp.path());
        store.set(CursorName::SourceA, &cursor("a")).unwrap();
        store.set(CursorName::SourceB, &cursor("b")).unwrap();

        assert!(store.clear(CursorName::SourceA).unwrap());
        assert!(!store.clear(CursorName::SourceA).unwrap());
        assert_eq!(store.get(CursorName::SourceA).unwrap(), None);
        assert_eq!(store.get(CursorName::SourceB).unwrap(), Some(cursor("b")));
    }

    #[test]
    fn memory_store_counts_writes() {
        let mut store = MemoryCursorStore::default();
        store.set(CursorName::SourceB, &cursor("x")).unwrap();
        assert_eq!(store.writes, 1);
        assert_eq!(store.get(CursorName::SourceB).unwrap(), Some(cursor("x")));
    }
}
