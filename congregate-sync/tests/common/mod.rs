//! In-memory platforms for orchestrator tests.
//!
//! A [`FakeSystem`] is both a source and a destination. Rows carry simple
//! field names (`key`, `name`, `first_name`, ..., `household`) and a
//! modification instant from a shared [`SimClock`], so cursors behave as
//! they would against a real system.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

use congregate_core::{CanonicalHousehold, CanonicalPerson, Cursor, EntityKind};
use congregate_sync::connector::{Connector, Pulled, Stamped};
use congregate_sync::reconcile::{
    Desired, ExistingRecord, ExistingRecordIndex, FieldValues, WriteCommand, WriteOutcome,
    WriteProfile,
};
use congregate_sync::{Destination, HouseholdLink, Source, SyncError};

/// Monotonic test clock; every reading advances one second unless frozen,
/// in which case every reading is the same instant.
#[derive(Clone)]
pub struct SimClock {
    seconds: Arc<AtomicI64>,
    frozen: Arc<AtomicBool>,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            seconds: Arc::new(AtomicI64::new(0)),
            frozen: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tick(&self) -> DateTime<Utc> {
        let n = if self.frozen.load(Ordering::SeqCst) {
            self.seconds.load(Ordering::SeqCst)
        } else {
            self.seconds.fetch_add(1, Ordering::SeqCst)
        };
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(n)
    }

    /// Stamp everything from here on with one instant, as a bulk import does.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::SeqCst);
        self.seconds.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct Row {
    pub fields: Map<String, Value>,
    pub modified_at: DateTime<Utc>,
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub kind: EntityKind,
    pub create: bool,
    pub key: String,
    pub fields: Map<String, Value>,
}

#[derive(Default)]
struct State {
    households: BTreeMap<String, Row>,
    people: BTreeMap<String, Row>,
    writes: Vec<Write>,
    next_id: u64,
    fail_writes_for: Option<EntityKind>,
    offline: bool,
}

impl State {
    fn table(&mut self, kind: EntityKind) -> &mut BTreeMap<String, Row> {
        match kind {
            EntityKind::Household => &mut self.households,
            EntityKind::Person => &mut self.people,
        }
    }
}

/// A system that refuses creates plays the primary one: it also keeps its
/// household relations when the other side has none to offer.
pub struct FakeSystem {
    name: &'static str,
    allow_create: bool,
    clock: SimClock,
    state: Mutex<State>,
}

const PERSON_TEXT: [&str; 4] = ["first_name", "last_name", "nickname", "status"];

impl FakeSystem {
    pub fn new(name: &'static str, allow_create: bool, clock: &SimClock) -> Self {
        Self {
            name,
            allow_create,
            clock: clock.clone(),
            state: Mutex::new(State::default()),
        }
    }

    fn insert(&self, kind: EntityKind, fields: Value) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{}-{}", self.name, state.next_id);
        let row = Row {
            fields: fields.as_object().cloned().unwrap(),
            modified_at: self.clock.tick(),
        };
        state.table(kind).insert(id.clone(), row);
        id
    }

    pub fn seed_household(&self, key: &str, name: &str) -> String {
        self.insert(EntityKind::Household, json!({"key": key, "name": name}))
    }

    /// `household` is a natural key; it is resolved to this system's id.
    pub fn seed_person(&self, key: &str, first: &str, last: &str, household: Option<&str>) -> String {
        let household = household
            .and_then(|h| self.id_of(EntityKind::Household, h))
            .map_or(Value::Null, Value::String);
        self.insert(
            EntityKind::Person,
            json!({
                "key": key,
                "name": format!("{first} {last}"),
                "first_name": first,
                "last_name": last,
                "household": household,
            }),
        )
    }

    /// Person referencing a household key this system has never seen.
    pub fn seed_orphan(&self, key: &str, name: &str, household_key: &str) {
        self.insert(
            EntityKind::Person,
            json!({"key": key, "name": name, "household_key": household_key}),
        );
    }

    /// Edit a field as a user would, bumping the modification time.
    pub fn edit(&self, kind: EntityKind, key: &str, field: &str, value: Value) {
        let at = self.clock.tick();
        let mut state = self.state.lock().unwrap();
        let row = state
            .table(kind)
            .values_mut()
            .find(|r| r.fields.get("key") == Some(&json!(key)))
            .unwrap();
        row.fields.insert(field.to_string(), value);
        row.modified_at = at;
    }

    pub fn id_of(&self, kind: EntityKind, key: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state
            .table(kind)
            .iter()
            .find(|(_, r)| r.fields.get("key") == Some(&json!(key)))
            .map(|(id, _)| id.clone())
    }

    pub fn row(&self, kind: EntityKind, key: &str) -> Option<Map<String, Value>> {
        let mut state = self.state.lock().unwrap();
        state
            .table(kind)
            .values()
            .find(|r| r.fields.get("key") == Some(&json!(key)))
            .map(|r| r.fields.clone())
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.state.lock().unwrap().table(kind).len()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub fn fail_writes_for(&self, kind: EntityKind) {
        self.state.lock().unwrap().fail_writes_for = Some(kind);
    }

    pub fn go_offline(&self) {
        self.state.lock().unwrap().offline = true;
    }

    fn since_filter(rows: &BTreeMap<String, Row>, since: Option<&Cursor>) -> Vec<(String, Row)> {
        let since = since.and_then(Cursor::instant);
        let mut out: Vec<(String, Row)> = rows
            .iter()
            .filter(|(_, r)| since.map_or(true, |s| r.modified_at >= s))
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        out.sort_by_key(|(_, r)| r.modified_at);
        out
    }
}

fn text(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Connector for FakeSystem {
    fn system(&self) -> &'static str {
        self.name
    }
}

impl Source for FakeSystem {
    fn check_connectivity(&self) -> Result<(), SyncError> {
        if self.state.lock().unwrap().offline {
            return Err(SyncError::Remote {
                system: self.name,
                detail: "unreachable".into(),
            });
        }
        Ok(())
    }

    fn pull_households(
        &self,
        since: Option<&Cursor>,
    ) -> Result<Pulled<CanonicalHousehold>, SyncError> {
        let state = self.state.lock().unwrap();
        let records = Self::since_filter(&state.households, since)
            .into_iter()
            .map(|(_, row)| Stamped {
                record: CanonicalHousehold {
                    household_id: text(&row.fields, "key").unwrap().into(),
                    name: text(&row.fields, "name").unwrap_or_default(),
                },
                modified_at: Some(row.modified_at),
            })
            .collect();
        Ok(Pulled {
            records,
            rejected: Vec::new(),
        })
    }

    fn pull_people(&self, since: Option<&Cursor>) -> Result<Pulled<CanonicalPerson>, SyncError> {
        let state = self.state.lock().unwrap();
        let records = Self::since_filter(&state.people, since)
            .into_iter()
            .map(|(_, row)| {
                let f = &row.fields;
                let mut person = CanonicalPerson::named(
                    text(f, "key").unwrap(),
                    text(f, "name").unwrap_or_default(),
                );
                person.first_name = text(f, "first_name");
                person.last_name = text(f, "last_name");
                person.nickname = text(f, "nickname");
                person.status = text(f, "status");
                person.household_id = text(f, "household")
                    .and_then(|id| state.households.get(&id))
                    .and_then(|h| text(&h.fields, "key"))
                    .or_else(|| text(f, "household_key"))
                    .map(Into::into);
                Stamped {
                    record: person,
                    modified_at: Some(row.modified_at),
                }
            })
            .collect();
        Ok(Pulled {
            records,
            rejected: Vec::new(),
        })
    }
}

impl Destination for FakeSystem {
    fn profile(&self, _kind: EntityKind) -> WriteProfile {
        WriteProfile {
            allow_create: self.allow_create,
            clear_relations: self.allow_create,
            ..WriteProfile::new("key")
        }
    }

    fn desired_household(&self, household: &CanonicalHousehold) -> Desired {
        let mut fields = FieldValues::new();
        fields.insert("key".into(), Some(json!(household.household_id.0)));
        fields.insert("name".into(), Some(json!(household.name)));
        Desired {
            natural_key: Some(household.household_id.0.clone()),
            fields,
        }
    }

    fn desired_person(&self, person: &CanonicalPerson, household: HouseholdLink<'_>) -> Desired {
        let mut fields = FieldValues::new();
        fields.insert("key".into(), Some(json!(person.person_id.0)));
        fields.insert("name".into(), Some(json!(person.name)));
        let values = [
            &person.first_name,
            &person.last_name,
            &person.nickname,
            &person.status,
        ];
        for (name, value) in PERSON_TEXT.iter().zip(values) {
            fields.insert(name.to_string(), value.as_ref().map(|v| json!(v)));
        }
        fields.insert("household".into(), household.value());
        Desired {
            natural_key: Some(person.person_id.0.clone()),
            fields,
        }
    }

    fn lookup(&self, kind: EntityKind, keys: &[String]) -> Result<ExistingRecordIndex, SyncError> {
        let mut state = self.state.lock().unwrap();
        let mut index = ExistingRecordIndex::default();
        for (id, row) in state.table(kind).iter() {
            if let Some(key) = text(&row.fields, "key").filter(|k| keys.contains(k)) {
                index.insert(
                    key,
                    ExistingRecord {
                        id: id.clone(),
                        snapshot: row.fields.clone(),
                    },
                );
            }
        }
        Ok(index)
    }

    fn apply(
        &self,
        kind: EntityKind,
        commands: &[WriteCommand],
    ) -> Result<Vec<WriteOutcome>, SyncError> {
        if self.state.lock().unwrap().fail_writes_for == Some(kind) {
            return Err(SyncError::Batch {
                system: self.name,
                kind,
                reason: "injected failure".into(),
            });
        }
        let mut outcomes = Vec::new();
        for command in commands {
            let at = self.clock.tick();
            let mut state = self.state.lock().unwrap();
            let (id, key, create, fields) = match command {
                WriteCommand::Create {
                    natural_key,
                    fields,
                } => {
                    state.next_id += 1;
                    let id = format!("{}-{}", self.name, state.next_id);
                    state.table(kind).insert(
                        id.clone(),
                        Row {
                            fields: fields.clone(),
                            modified_at: at,
                        },
                    );
                    (id, natural_key.clone().unwrap_or_default(), true, fields.clone())
                }
                WriteCommand::Update {
                    natural_key,
                    id,
                    patch,
                } => {
                    let row = state.table(kind).get_mut(id).unwrap();
                    for (name, value) in patch {
                        row.fields.insert(name.clone(), value.clone());
                    }
                    row.modified_at = at;
                    (id.clone(), natural_key.clone(), false, patch.clone())
                }
            };
            state.writes.push(Write {
                kind,
                create,
                key: key.clone(),
                fields,
            });
            outcomes.push(WriteOutcome {
                natural_key: Some(key),
                id,
            });
        }
        Ok(outcomes)
    }
}
