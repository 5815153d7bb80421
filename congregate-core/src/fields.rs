//! Static field-mapping table.
//!
//! Every canonical field has exactly one Fibery label and at most one PCO
//! attribute. Fibery names are qualified by the configured space
//! (`<space>/<label>`) once, in [`FieldMap::new`], which also validates the
//! table; connectors never concatenate field names themselves.

use std::collections::{BTreeSet, HashSet};

use crate::error::ConfigError;

/// Value shape of a field, driving coercion in the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// The natural key; always written, never dropped from a patch.
    Key,
    Text,
    Date,
    Instant,
    Boolean,
    Integer,
    /// Reference to another entity, written by destination identifier.
    Relation,
}

// ---------------------------------------------------------------------------
// People
// ---------------------------------------------------------------------------

/// Canonical person fields. Discriminants index [`FieldMap`] storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PersonField {
    PersonId,
    Name,
    FirstName,
    LastName,
    Status,
    Birthdate,
    Child,
    GivenName,
    Grade,
    MiddleName,
    Nickname,
    InactivatedAt,
    Membership,
    DirectoryStatus,
    Email,
    Phone,
    Household,
}

impl PersonField {
    pub const ALL: [PersonField; 17] = [
        PersonField::PersonId,
        PersonField::Name,
        PersonField::FirstName,
        PersonField::LastName,
        PersonField::Status,
        PersonField::Birthdate,
        PersonField::Child,
        PersonField::GivenName,
        PersonField::Grade,
        PersonField::MiddleName,
        PersonField::Nickname,
        PersonField::InactivatedAt,
        PersonField::Membership,
        PersonField::DirectoryStatus,
        PersonField::Email,
        PersonField::Phone,
        PersonField::Household,
    ];

    /// Unqualified Fibery field label.
    pub fn label(self) -> &'static str {
        match self {
            PersonField::PersonId => "Person ID",
            PersonField::Name => "Name",
            PersonField::FirstName => "First Name",
            PersonField::LastName => "Last Name",
            PersonField::Status => "Status",
            PersonField::Birthdate => "Birthdate",
            PersonField::Child => "Child",
            PersonField::GivenName => "Given Name",
            PersonField::Grade => "Grade",
            PersonField::MiddleName => "Middle Name",
            PersonField::Nickname => "Nickname",
            PersonField::InactivatedAt => "Inactivated At",
            PersonField::Membership => "Membership",
            PersonField::DirectoryStatus => "Directory Status",
            PersonField::Email => "Email",
            PersonField::Phone => "Phone",
            PersonField::Household => "Household",
        }
    }

    /// PCO attribute carrying this field, if it is a plain attribute.
    ///
    /// The key is the resource id, the household is a relationship, and
    /// email/phone live in `included` contact records.
    pub fn pco_attribute(self) -> Option<&'static str> {
        match self {
            PersonField::Name => Some("name"),
            PersonField::FirstName => Some("first_name"),
            PersonField::LastName => Some("last_name"),
            PersonField::Status => Some("status"),
            PersonField::Birthdate => Some("birthdate"),
            PersonField::Child => Some("child"),
            PersonField::GivenName => Some("given_name"),
            PersonField::Grade => Some("grade"),
            PersonField::MiddleName => Some("middle_name"),
            PersonField::Nickname => Some("nickname"),
            PersonField::InactivatedAt => Some("inactivated_at"),
            PersonField::Membership => Some("membership"),
            PersonField::DirectoryStatus => Some("directory_status"),
            PersonField::PersonId
            | PersonField::Email
            | PersonField::Phone
            | PersonField::Household => None,
        }
    }

    /// Whether PCO accepts writes to this attribute.
    pub fn pco_writable(self) -> bool {
        !matches!(
            self,
            PersonField::Name | PersonField::InactivatedAt
        ) && self.pco_attribute().is_some()
    }

    pub fn kind(self) -> FieldKind {
        match self {
            PersonField::PersonId => FieldKind::Key,
            PersonField::Birthdate => FieldKind::Date,
            PersonField::InactivatedAt => FieldKind::Instant,
            PersonField::Child => FieldKind::Boolean,
            PersonField::Grade => FieldKind::Integer,
            PersonField::Household => FieldKind::Relation,
            _ => FieldKind::Text,
        }
    }

    /// Fields introduced after the mapping's initial rollout (key, name and
    /// household were the original set). Records written before these
    /// existed are backfilled when the backfill option is on.
    pub fn is_backfill(self) -> bool {
        !matches!(
            self,
            PersonField::PersonId
                | PersonField::Name
                | PersonField::Household
                | PersonField::Email
                | PersonField::Phone
        )
    }
}

// ---------------------------------------------------------------------------
// Households
// ---------------------------------------------------------------------------

/// Canonical household fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HouseholdField {
    HouseholdId,
    Name,
}

impl HouseholdField {
    pub const ALL: [HouseholdField; 2] = [HouseholdField::HouseholdId, HouseholdField::Name];

    pub fn label(self) -> &'static str {
        match self {
            HouseholdField::HouseholdId => "Household ID",
            HouseholdField::Name => "Name",
        }
    }

    pub fn pco_attribute(self) -> Option<&'static str> {
        match self {
            HouseholdField::HouseholdId => None,
            HouseholdField::Name => Some("name"),
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            HouseholdField::HouseholdId => FieldKind::Key,
            HouseholdField::Name => FieldKind::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Qualified map
// ---------------------------------------------------------------------------

/// Space-qualified Fibery names for every canonical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    space: String,
    person: Vec<String>,
    household: Vec<String>,
}

impl FieldMap {
    /// Qualify the table for `space` and validate it.
    pub fn new(space: &str) -> Result<Self, ConfigError> {
        let space = space.trim();
        if space.is_empty() {
            return Err(ConfigError::Invalid {
                key: "fibery.space",
                reason: "must not be empty".into(),
            });
        }
        if space.contains('/') {
            return Err(ConfigError::Invalid {
                key: "fibery.space",
                reason: format!("'{space}' must not contain '/'"),
            });
        }

        let person: Vec<String> = PersonField::ALL
            .iter()
            .map(|f| format!("{space}/{}", f.label()))
            .collect();
        let household: Vec<String> = HouseholdField::ALL
            .iter()
            .map(|f| format!("{space}/{}", f.label()))
            .collect();

        ensure_unique("people", &person)?;
        ensure_unique("household", &household)?;

        Ok(Self {
            space: space.to_string(),
            person,
            household,
        })
    }

    pub fn space(&self) -> &str {
        &self.space
    }

    /// Qualified Fibery name of a person field.
    pub fn person(&self, field: PersonField) -> &str {
        &self.person[field as usize]
    }

    /// Qualified Fibery name of a household field.
    pub fn household(&self, field: HouseholdField) -> &str {
        &self.household[field as usize]
    }

    /// Fibery type name of the People database.
    pub fn person_type(&self) -> String {
        format!("{}/People", self.space)
    }

    /// Fibery type name of the Household database.
    pub fn household_type(&self) -> String {
        format!("{}/Household", self.space)
    }

    /// Qualified names of the person fields added after the initial rollout.
    pub fn backfill_person_fields(&self) -> BTreeSet<String> {
        PersonField::ALL
            .iter()
            .filter(|f| f.is_backfill())
            .map(|f| self.person(*f).to_string())
            .collect()
    }
}

fn ensure_unique(kind: &str, names: &[String]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::Invalid {
                key: "fibery.space",
                reason: format!("duplicate {kind} field '{name}'"),
            });
        }
    }
    Ok(())
}
