//! Congregate core library: canonical records, field table, configuration.
//!
//! - [`types`]: natural-key newtypes, canonical records, cursor names
//! - [`fields`]: the static field-mapping table and its space-qualified form
//! - [`config`]: [`SyncConfig`] load / validate
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod fields;
pub mod types;

pub use config::SyncConfig;
pub use error::ConfigError;
pub use fields::{FieldKind, FieldMap, HouseholdField, PersonField};
pub use types::{
    CanonicalHousehold, CanonicalPerson, Cursor, CursorName, Direction, EntityKind, HouseholdId,
    PersonId,
};
