//! Canonical domain types shared by every connector.
//!
//! Optional fields use `None` as the single "absent" sentinel: the mapper folds
//! `null`, missing and empty-string inputs into `None`, so a blank string never
//! reaches a destination payload.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Natural key of a person, as issued by Source A.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersonId(pub String);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for PersonId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PersonId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Natural key of a household, as issued by Source A.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HouseholdId(pub String);

impl fmt::Display for HouseholdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for HouseholdId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HouseholdId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque "modified since" token: an ISO-8601 instant, optionally followed by
/// `#household=<key>&person=<key>`. A key names the last record of that kind
/// already synced at exactly that instant; pulls resume after it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

const RESUME_MARK: char = '#';

impl Cursor {
    /// Cursor for an instant, rendered as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Same instant, with records of `kind` up to and including `key` marked done.
    pub fn with_resume_key(self, kind: EntityKind, key: &str) -> Self {
        let marks: Vec<String> = EntityKind::all()
            .iter()
            .filter_map(|&k| {
                let value = if k == kind {
                    key.to_string()
                } else {
                    self.resume_key(k)?
                };
                Some(format!("{k}={}", urlencoding::encode(&value)))
            })
            .collect();
        Self(format!("{}{RESUME_MARK}{}", self.since(), marks.join("&")))
    }

    /// The instant part of the token; what pull filters compare against.
    pub fn since(&self) -> &str {
        self.0
            .split_once(RESUME_MARK)
            .map_or(self.0.as_str(), |(since, _)| since)
    }

    /// The instant this token represents, if it parses as RFC 3339.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.since())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Last key of `kind` already synced at [`instant`](Self::instant), if any.
    pub fn resume_key(&self, kind: EntityKind) -> Option<String> {
        let (_, marks) = self.0.split_once(RESUME_MARK)?;
        let label = kind.to_string();
        marks.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name != label {
                return None;
            }
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The two named cursors, one per pull direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CursorName {
    /// Progress of pulls from Source A (PCO), driving A→B.
    #[serde(rename = "Asource")]
    SourceA,
    /// Progress of pulls from Source B (Fibery), driving B→A.
    #[serde(rename = "Bsource")]
    SourceB,
}

impl CursorName {
    pub fn all() -> &'static [CursorName] {
        &[CursorName::SourceA, CursorName::SourceB]
    }

    pub fn key(self) -> &'static str {
        match self {
            CursorName::SourceA => "Asource",
            CursorName::SourceB => "Bsource",
        }
    }
}

impl fmt::Display for CursorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for CursorName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Asource" => Ok(CursorName::SourceA),
            "Bsource" => Ok(CursorName::SourceB),
            other => Err(format!(
                "unknown cursor '{other}'; expected: Asource, Bsource"
            )),
        }
    }
}

/// The two entity kinds kept in agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Household,
    Person,
}

impl EntityKind {
    /// Both kinds, in write order.
    pub fn all() -> &'static [EntityKind] {
        &[EntityKind::Household, EntityKind::Person]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Household => write!(f, "household"),
            EntityKind::Person => write!(f, "person"),
        }
    }
}

/// Whether the reverse (B→A) direction runs. Chosen once, at orchestrator construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Enabled,
    #[default]
    Disabled,
}

impl Direction {
    pub fn is_enabled(self) -> bool {
        matches!(self, Direction::Enabled)
    }
}

// ---------------------------------------------------------------------------
// Canonical records
// ---------------------------------------------------------------------------

/// System-neutral person record produced by the entity mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalPerson {
    pub person_id: PersonId,
    /// Display name; always present (derived when the source has none).
    pub name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: Option<String>,
    pub birthdate: Option<NaiveDate>,
    pub child: Option<bool>,
    pub given_name: Option<String>,
    pub grade: Option<i64>,
    pub middle_name: Option<String>,
    pub nickname: Option<String>,
    /// Instant kept in its source representation (see the mapper's instant rule).
    pub inactivated_at: Option<String>,
    pub membership: Option<String>,
    pub directory_status: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub household_id: Option<HouseholdId>,
}

impl CanonicalPerson {
    /// A person with only the natural key and a name; every other field absent.
    pub fn named(person_id: impl Into<PersonId>, name: impl Into<String>) -> Self {
        Self {
            person_id: person_id.into(),
            name: name.into(),
            first_name: None,
            last_name: None,
            status: None,
            birthdate: None,
            child: None,
            given_name: None,
            grade: None,
            middle_name: None,
            nickname: None,
            inactivated_at: None,
            membership: None,
            directory_status: None,
            email: None,
            phone: None,
            household_id: None,
        }
    }
}

/// System-neutral household record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalHousehold {
    pub household_id: HouseholdId,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn newtype_display() {
        assert_eq!(PersonId::from("101").to_string(), "101");
        assert_eq!(HouseholdId::from("h-7").to_string(), "h-7");
    }

    #[test]
    fn cursor_renders_millisecond_utc() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 0).unwrap();
        let cursor = Cursor::at(at);
        assert_eq!(cursor.as_str(), "2025-03-09T14:05:00.000Z");
        assert_eq!(cursor.instant(), Some(at));
    }

    #[test]
    fn cursor_with_garbage_token_has_no_instant() {
        assert_eq!(Cursor("yesterday".into()).instant(), None);
    }

    #[test]
    fn resume_keys_ride_along_with_the_instant() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 0).unwrap();
        let cursor = Cursor::at(at)
            .with_resume_key(EntityKind::Person, "P 9&x")
            .with_resume_key(EntityKind::Household, "H2");
        assert_eq!(
            cursor.as_str(),
            "2025-03-09T14:05:00.000Z#household=H2&person=P%209%26x"
        );
        assert_eq!(cursor.since(), "2025-03-09T14:05:00.000Z");
        assert_eq!(cursor.instant(), Some(at));
        assert_eq!(cursor.resume_key(EntityKind::Person).as_deref(), Some("P 9&x"));

        let moved = cursor.with_resume_key(EntityKind::Household, "H3");
        assert_eq!(moved.resume_key(EntityKind::Household).as_deref(), Some("H3"));
        assert_eq!(moved.resume_key(EntityKind::Person).as_deref(), Some("P 9&x"));
        assert_eq!(Cursor::at(at).resume_key(EntityKind::Household), None);
    }

    #[test]
    fn cursor_name_round_trips_through_str() {
        for name in CursorName::all() {
            assert_eq!(name.key().parse::<CursorName>().unwrap(), *name);
        }
        assert!("pcoLastSync".parse::<CursorName>().is_err());
    }

    #[test]
    fn cursor_name_serializes_as_key() {
        let yaml = serde_yaml::to_string(&CursorName::SourceB).unwrap();
        assert_eq!(yaml.trim(), "Bsource");
    }

    #[test]
    fn direction_defaults_to_disabled() {
        assert_eq!(Direction::default(), Direction::Disabled);
        assert!(Direction::Enabled.is_enabled());
    }
}
