//! Connector seams.
//!
//! A connector is both a [`Source`] (incremental pulls mapped to canonical
//! records) and a [`Destination`] (natural-key lookups and batch writes).
//! The orchestrator only sees these traits, so tests drive whole runs
//! against in-memory platforms.

pub mod dry_run;
pub mod fibery;
pub mod pco;

use chrono::{DateTime, Utc};
use serde_json::Value;

use congregate_core::{CanonicalHousehold, CanonicalPerson, Cursor, EntityKind};

use crate::error::{MappingError, SyncError};
use crate::reconcile::{Desired, ExistingRecordIndex, WriteCommand, WriteOutcome, WriteProfile};

pub use dry_run::DryRun;
pub use fibery::FiberyConnector;
pub use pco::PcoConnector;

/// A pulled record and the source's last-modified instant for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub record: T,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Result of one pull: records in source order, oldest first, plus the rows
/// that could not be mapped.
#[derive(Debug, Clone, PartialEq)]
pub struct Pulled<T> {
    pub records: Vec<Stamped<T>>,
    pub rejected: Vec<MappingError>,
}

impl<T> Default for Pulled<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// How a person's household relation is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HouseholdLink<'a> {
    /// Point the relation at this destination id.
    Linked(&'a str),
    /// Write an explicit clear.
    Cleared,
    /// Leave whatever the destination holds.
    Untouched,
}

impl HouseholdLink<'_> {
    /// The relation field's desired value (`None` = absent, never written).
    pub fn value(self) -> Option<Value> {
        match self {
            HouseholdLink::Linked(id) => Some(Value::String(id.to_string())),
            HouseholdLink::Cleared => Some(Value::Null),
            HouseholdLink::Untouched => None,
        }
    }
}

pub trait Connector: Send + Sync {
    /// Short name for logs and errors (`pco`, `fibery`).
    fn system(&self) -> &'static str;
}

pub trait Source: Connector {
    /// Cheap authenticated read proving credentials and schema.
    fn check_connectivity(&self) -> Result<(), SyncError>;

    /// Households modified at or after `since` (everything when `None`).
    fn pull_households(
        &self,
        since: Option<&Cursor>,
    ) -> Result<Pulled<CanonicalHousehold>, SyncError>;

    fn pull_people(&self, since: Option<&Cursor>) -> Result<Pulled<CanonicalPerson>, SyncError>;
}

pub trait Destination: Connector {
    fn profile(&self, kind: EntityKind) -> WriteProfile;

    fn desired_household(&self, household: &CanonicalHousehold) -> Desired;

    fn desired_person(&self, person: &CanonicalPerson, household: HouseholdLink<'_>) -> Desired;

    /// Existing records for `keys`. Keys with no record are simply absent.
    fn lookup(&self, kind: EntityKind, keys: &[String]) -> Result<ExistingRecordIndex, SyncError>;

    /// Submit `commands` as one batch. Any rejection fails the whole batch.
    fn apply(
        &self,
        kind: EntityKind,
        commands: &[WriteCommand],
    ) -> Result<Vec<WriteOutcome>, SyncError>;
}
