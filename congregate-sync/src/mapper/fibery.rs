//! Fibery entities ⇄ canonical records.
//!
//! Field names are always taken from the [`FieldMap`]; nothing here builds a
//! qualified name itself.

use serde_json::{Map, Value};

use congregate_core::{
    CanonicalHousehold, CanonicalPerson, EntityKind, FieldMap, HouseholdField, HouseholdId,
    PersonField, PersonId,
};

use super::{
    boolean, date, date_value, instant, integer, joined_name, string_value, text,
    UNNAMED_HOUSEHOLD, UNNAMED_PERSON,
};
use crate::connector::fibery::SYSTEM;
use crate::error::MappingError;
use crate::reconcile::FieldValues;

fn entity_label(row: &Map<String, Value>) -> String {
    text(row.get("fibery/id")).unwrap_or_else(|| "<unknown>".into())
}

pub fn person_from_fibery(
    row: &Map<String, Value>,
    fields: &FieldMap,
) -> Result<CanonicalPerson, MappingError> {
    let get = |field: PersonField| row.get(fields.person(field));

    let person_id = text(get(PersonField::PersonId)).ok_or_else(|| MappingError {
        system: SYSTEM,
        kind: EntityKind::Person,
        record: entity_label(row),
        reason: "Person ID is empty".into(),
    })?;

    let first_name = text(get(PersonField::FirstName));
    let last_name = text(get(PersonField::LastName));
    let name = text(get(PersonField::Name))
        .or_else(|| joined_name(first_name.as_deref(), last_name.as_deref()))
        .unwrap_or_else(|| UNNAMED_PERSON.to_string());

    let household_id = match get(PersonField::Household) {
        Some(Value::Object(household)) => {
            text(household.get(fields.household(HouseholdField::HouseholdId)))
        }
        _ => None,
    };

    Ok(CanonicalPerson {
        person_id: PersonId::from(person_id),
        name,
        first_name,
        last_name,
        status: text(get(PersonField::Status)),
        birthdate: date(get(PersonField::Birthdate)),
        child: boolean(get(PersonField::Child)),
        given_name: text(get(PersonField::GivenName)),
        grade: integer(get(PersonField::Grade)),
        middle_name: text(get(PersonField::MiddleName)),
        nickname: text(get(PersonField::Nickname)),
        inactivated_at: instant(get(PersonField::InactivatedAt)),
        membership: text(get(PersonField::Membership)),
        directory_status: text(get(PersonField::DirectoryStatus)),
        email: text(get(PersonField::Email)),
        phone: text(get(PersonField::Phone)),
        household_id: household_id.map(HouseholdId::from),
    })
}

pub fn household_from_fibery(
    row: &Map<String, Value>,
    fields: &FieldMap,
) -> Result<CanonicalHousehold, MappingError> {
    let id = text(row.get(fields.household(HouseholdField::HouseholdId))).ok_or_else(|| {
        MappingError {
            system: SYSTEM,
            kind: EntityKind::Household,
            record: entity_label(row),
            reason: "Household ID is empty".into(),
        }
    })?;
    let name = text(row.get(fields.household(HouseholdField::Name)))
        .unwrap_or_else(|| UNNAMED_HOUSEHOLD.to_string());
    Ok(CanonicalHousehold {
        household_id: HouseholdId::from(id),
        name,
    })
}

/// Every person field except the household relation, keyed by qualified name.
pub fn person_fields(person: &CanonicalPerson, fields: &FieldMap) -> FieldValues {
    let mut out = FieldValues::new();
    for field in PersonField::ALL {
        let value = match field {
            PersonField::PersonId => Some(Value::String(person.person_id.0.clone())),
            PersonField::Name => Some(Value::String(person.name.clone())),
            PersonField::FirstName => string_value(&person.first_name),
            PersonField::LastName => string_value(&person.last_name),
            PersonField::Status => string_value(&person.status),
            PersonField::Birthdate => person.birthdate.map(date_value),
            PersonField::Child => person.child.map(Value::Bool),
            PersonField::GivenName => string_value(&person.given_name),
            PersonField::Grade => person.grade.map(Value::from),
            PersonField::MiddleName => string_value(&person.middle_name),
            PersonField::Nickname => string_value(&person.nickname),
            PersonField::InactivatedAt => string_value(&person.inactivated_at),
            PersonField::Membership => string_value(&person.membership),
            PersonField::DirectoryStatus => string_value(&person.directory_status),
            PersonField::Email => string_value(&person.email),
            PersonField::Phone => string_value(&person.phone),
            PersonField::Household => continue,
        };
        out.insert(fields.person(field).to_string(), value);
    }
    out
}

pub fn household_fields(household: &CanonicalHousehold, fields: &FieldMap) -> FieldValues {
    let mut out = FieldValues::new();
    out.insert(
        fields.household(HouseholdField::HouseholdId).to_string(),
        Some(Value::String(household.household_id.0.clone())),
    );
    out.insert(
        fields.household(HouseholdField::Name).to_string(),
        Some(Value::String(household.name.clone())),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map() -> FieldMap {
        FieldMap::new("S").unwrap()
    }

    fn row(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn reads_nested_household_key() {
        let r = row(json!({
            "fibery/id": "f-1",
            "S/Person ID": "P1",
            "S/Name": "Jo Smith",
            "S/Grade": 4,
            "S/Household": {"fibery/id": "fh-1", "S/Household ID": "H1", "S/Name": "Smith"}
        }));
        let p = person_from_fibery(&r, &map()).unwrap();
        assert_eq!(p.person_id.0, "P1");
        assert_eq!(p.grade, Some(4));
        assert_eq!(p.household_id, Some(HouseholdId::from("H1")));
    }

    #[test]
    fn empty_relation_means_no_household() {
        let r = row(json!({"S/Person ID": "P1", "S/Household": null}));
        let p = person_from_fibery(&r, &map()).unwrap();
        assert_eq!(p.household_id, None);
        assert_eq!(p.name, UNNAMED_PERSON);
    }

    #[test]
    fn blank_key_is_rejected_with_entity_id() {
        let r = row(json!({"fibery/id": "f-9", "S/Person ID": ""}));
        let err = person_from_fibery(&r, &map()).unwrap_err();
        assert_eq!(err.record, "f-9");
    }

    #[test]
    fn person_fields_cover_everything_but_the_relation() {
        let fields = person_fields(&CanonicalPerson::named("P1", "Jo"), &map());
        assert_eq!(fields.len(), PersonField::ALL.len() - 1);
        assert!(!fields.contains_key("S/Household"));
        assert_eq!(fields["S/Person ID"], Some(json!("P1")));
        assert_eq!(fields["S/Birthdate"], None);
    }

    #[test]
    fn household_round_trip_through_fibery_shape() {
        let h = CanonicalHousehold {
            household_id: HouseholdId::from("H1"),
            name: "Smith".into(),
        };
        let values = household_fields(&h, &map());
        let r: Map<String, Value> = values
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
        assert_eq!(household_from_fibery(&r, &map()).unwrap(), h);
    }
}
