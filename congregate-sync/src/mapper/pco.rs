//! PCO JSON:API resources ⇄ canonical records.

use std::collections::HashMap;

use serde_json::Value;

use congregate_core::{
    CanonicalHousehold, CanonicalPerson, EntityKind, HouseholdId, PersonField, PersonId,
};

use super::{
    boolean, date, date_value, instant, integer, joined_name, string_value, text,
    UNNAMED_HOUSEHOLD, UNNAMED_PERSON,
};
use crate::connector::pco::{PcoRef, PcoResource, SYSTEM};
use crate::error::MappingError;
use crate::reconcile::FieldValues;

/// Key field of PCO write payloads; the resource id.
pub const KEY: &str = "id";
/// Pseudo-field carrying the household relationship in desired records.
pub const HOUSEHOLD: &str = "household";

/// `included` resources of a list page, indexed by `(type, id)`.
#[derive(Debug, Default)]
pub struct Included<'a> {
    by_ref: HashMap<(&'a str, &'a str), &'a PcoResource>,
}

impl<'a> Included<'a> {
    pub fn new(resources: &'a [PcoResource]) -> Self {
        let by_ref = resources
            .iter()
            .filter_map(|r| r.id.as_deref().map(|id| ((r.kind.as_str(), id), r)))
            .collect();
        Self { by_ref }
    }

    fn resolve(&self, r: &PcoRef) -> Option<&'a PcoResource> {
        self.by_ref.get(&(r.kind.as_str(), r.id.as_str())).copied()
    }
}

fn missing_id(kind: EntityKind) -> MappingError {
    MappingError {
        system: SYSTEM,
        kind,
        record: "<unknown>".into(),
        reason: "resource has no id".into(),
    }
}

pub fn person_from_pco(
    resource: &PcoResource,
    included: &Included<'_>,
) -> Result<CanonicalPerson, MappingError> {
    let id = resource
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing_id(EntityKind::Person))?;
    let attr = |name: &str| resource.attributes.get(name);

    let first_name = text(attr("first_name"));
    let last_name = text(attr("last_name"));
    let name = joined_name(first_name.as_deref(), last_name.as_deref())
        .or_else(|| text(attr("name")))
        .unwrap_or_else(|| UNNAMED_PERSON.to_string());

    Ok(CanonicalPerson {
        person_id: PersonId::from(id),
        name,
        first_name,
        last_name,
        status: text(attr("status")),
        birthdate: date(attr("birthdate")),
        child: boolean(attr("child")),
        given_name: text(attr("given_name")),
        grade: integer(attr("grade")),
        middle_name: text(attr("middle_name")),
        nickname: text(attr("nickname")),
        inactivated_at: instant(attr("inactivated_at")),
        membership: text(attr("membership")),
        directory_status: text(attr("directory_status")),
        email: primary_contact(resource, included, "emails", "address"),
        phone: primary_contact(resource, included, "phone_numbers", "number"),
        household_id: resource
            .related("households")
            .first()
            .map(|r| HouseholdId::from(r.id.as_str())),
    })
}

/// The `primary` contact record of a relationship, else the first one.
fn primary_contact(
    resource: &PcoResource,
    included: &Included<'_>,
    relationship: &str,
    attribute: &str,
) -> Option<String> {
    let contacts: Vec<&PcoResource> = resource
        .related(relationship)
        .iter()
        .filter_map(|r| included.resolve(r))
        .collect();
    let chosen = contacts
        .iter()
        .find(|c| boolean(c.attributes.get("primary")) == Some(true))
        .or_else(|| contacts.first())?;
    text(chosen.attributes.get(attribute))
}

pub fn household_from_pco(resource: &PcoResource) -> Result<CanonicalHousehold, MappingError> {
    let id = resource
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing_id(EntityKind::Household))?;
    let name = text(resource.attributes.get("name"))
        .or_else(|| text(resource.attributes.get("label")))
        .unwrap_or_else(|| UNNAMED_HOUSEHOLD.to_string());
    Ok(CanonicalHousehold {
        household_id: HouseholdId::from(id),
        name,
    })
}

// ---------------------------------------------------------------------------
// Canonical → PCO attributes
// ---------------------------------------------------------------------------

/// Writable PCO attributes of `person`, plus the `id` key.
///
/// PCO rejects writes to `name`, so a missing first/last name is split out of
/// the display name instead. Read-only fields are never included.
pub fn person_attributes(person: &CanonicalPerson) -> FieldValues {
    let mut parts = person.name.split_whitespace();
    let split_first = parts.next().map(str::to_string);
    let split_last = Some(parts.collect::<Vec<_>>().join(" ")).filter(|s| !s.is_empty());

    let mut out = FieldValues::new();
    out.insert(KEY.into(), Some(Value::String(person.person_id.0.clone())));
    for field in PersonField::ALL {
        if !field.pco_writable() {
            continue;
        }
        let Some(attribute) = field.pco_attribute() else {
            continue;
        };
        let value = match field {
            PersonField::FirstName => string_value(&person.first_name.clone().or(split_first.clone())),
            PersonField::LastName => string_value(&person.last_name.clone().or(split_last.clone())),
            PersonField::Status => string_value(&person.status),
            PersonField::Birthdate => person.birthdate.map(date_value),
            PersonField::Child => person.child.map(Value::Bool),
            PersonField::GivenName => string_value(&person.given_name),
            PersonField::Grade => person.grade.map(Value::from),
            PersonField::MiddleName => string_value(&person.middle_name),
            PersonField::Nickname => string_value(&person.nickname),
            PersonField::Membership => string_value(&person.membership),
            PersonField::DirectoryStatus => string_value(&person.directory_status),
            _ => None,
        };
        out.insert(attribute.to_string(), value);
    }
    out
}

pub fn household_attributes(household: &CanonicalHousehold) -> FieldValues {
    let mut out = FieldValues::new();
    out.insert(
        KEY.into(),
        Some(Value::String(household.household_id.0.clone())),
    );
    out.insert("name".into(), Some(Value::String(household.name.clone())));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(doc: Value) -> PcoResource {
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn maps_attributes_relationship_and_derived_name() {
        let person = resource(json!({
            "type": "Person",
            "id": "P1",
            "attributes": {
                "first_name": "Jo",
                "last_name": "Smith",
                "name": "Joanne Smith",
                "birthdate": "1990-04-02",
                "child": false,
                "grade": null,
                "nickname": "",
                "inactivated_at": "2024-05-01T12:00:00Z"
            },
            "relationships": {"households": {"data": [{"type": "Household", "id": "H1"}]}}
        }));
        let p = person_from_pco(&person, &Included::default()).unwrap();
        assert_eq!(p.person_id.0, "P1");
        assert_eq!(p.name, "Jo Smith");
        assert_eq!(p.child, Some(false));
        assert_eq!(p.grade, None);
        assert_eq!(p.nickname, None);
        assert_eq!(p.inactivated_at.as_deref(), Some("2024-05-01T12:00:00Z"));
        assert_eq!(p.household_id, Some(HouseholdId::from("H1")));
    }

    #[test]
    fn name_falls_back_to_attribute_then_placeholder() {
        let named = resource(json!({"type": "Person", "id": "2", "attributes": {"name": "Pat"}}));
        assert_eq!(person_from_pco(&named, &Included::default()).unwrap().name, "Pat");

        let blank = resource(json!({"type": "Person", "id": "3", "attributes": {}}));
        assert_eq!(
            person_from_pco(&blank, &Included::default()).unwrap().name,
            UNNAMED_PERSON
        );
    }

    #[test]
    fn missing_id_is_a_mapping_error() {
        let bad = resource(json!({"type": "Person", "attributes": {"first_name": "X"}}));
        let err = person_from_pco(&bad, &Included::default()).unwrap_err();
        assert_eq!(err.kind, EntityKind::Person);
        assert_eq!(err.record, "<unknown>");
    }

    #[test]
    fn prefers_primary_contact_from_included() {
        let person = resource(json!({
            "type": "Person", "id": "P1", "attributes": {},
            "relationships": {
                "emails": {"data": [{"type": "Email", "id": "e1"}, {"type": "Email", "id": "e2"}]},
                "phone_numbers": {"data": [{"type": "PhoneNumber", "id": "n1"}]}
            }
        }));
        let included: Vec<PcoResource> = serde_json::from_value(json!([
            {"type": "Email", "id": "e1", "attributes": {"address": "old@example.com", "primary": false}},
            {"type": "Email", "id": "e2", "attributes": {"address": "jo@example.com", "primary": true}},
            {"type": "PhoneNumber", "id": "n1", "attributes": {"number": "555-0100"}}
        ]))
        .unwrap();
        let p = person_from_pco(&person, &Included::new(&included)).unwrap();
        assert_eq!(p.email.as_deref(), Some("jo@example.com"));
        assert_eq!(p.phone.as_deref(), Some("555-0100"));
    }

    #[test]
    fn household_name_fallbacks() {
        let labelled = resource(json!({"type": "Household", "id": "H", "attributes": {"label": "The Smiths"}}));
        assert_eq!(household_from_pco(&labelled).unwrap().name, "The Smiths");
        let bare = resource(json!({"type": "Household", "id": "H", "attributes": {"name": ""}}));
        assert_eq!(household_from_pco(&bare).unwrap().name, UNNAMED_HOUSEHOLD);
    }

    #[test]
    fn attributes_split_name_and_skip_read_only() {
        let mut person = CanonicalPerson::named("P9", "Mary Ann Lee");
        person.inactivated_at = Some("2024-01-01T00:00:00Z".into());
        person.email = Some("m@example.com".into());
        let attrs = person_attributes(&person);

        assert_eq!(attrs["id"], Some(json!("P9")));
        assert_eq!(attrs["first_name"], Some(json!("Mary")));
        assert_eq!(attrs["last_name"], Some(json!("Ann Lee")));
        assert!(!attrs.contains_key("name"));
        assert!(!attrs.contains_key("inactivated_at"));
        assert!(!attrs.contains_key("email"));
        assert_eq!(attrs["status"], None);
    }
}
