//! Fibery command API.
//!
//! Everything goes through `POST /api/commands` with an ordered array of
//! `{command, args}`; the response is an aligned array of
//! `{success, result}`. Pulls page with `q/offset` in ascending
//! modification order. Writes for one kind are a single command batch.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use congregate_core::{
    CanonicalHousehold, CanonicalPerson, ConfigError, Cursor, EntityKind, FieldMap,
    HouseholdField, PersonField, SyncConfig,
};

use super::{Connector, Destination, HouseholdLink, Pulled, Source, Stamped};
use crate::error::{MappingError, SyncError};
use crate::mapper::fibery::{
    household_fields, household_from_fibery, person_fields, person_from_fibery,
};
use crate::reconcile::{
    Desired, ExistingRecord, ExistingRecordIndex, WriteCommand, WriteOutcome, WriteProfile,
};
use crate::transport::{HttpRequest, Method, Transport};

pub const SYSTEM: &str = "fibery";

const ID: &str = "fibery/id";
const MODIFIED: &str = "fibery/modification-date";

/// One element of a command response.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Value,
}

pub struct FiberyConnector {
    transport: Transport,
    api_url: String,
    authorization: String,
    fields: FieldMap,
    page_limit: u32,
    backfill: bool,
}

impl FiberyConnector {
    pub fn new(config: &SyncConfig, transport: Transport) -> Result<Self, ConfigError> {
        Ok(Self {
            transport,
            api_url: config.fibery.api_url(),
            authorization: format!("Token {}", config.fibery.token),
            fields: config.field_map()?,
            page_limit: config.fibery.page_limit,
            backfill: config.sync.backfill_new_fields,
        })
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    fn type_name(&self, kind: EntityKind) -> String {
        match kind {
            EntityKind::Household => self.fields.household_type(),
            EntityKind::Person => self.fields.person_type(),
        }
    }

    fn key_field(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Household => self.fields.household(HouseholdField::HouseholdId),
            EntityKind::Person => self.fields.person(PersonField::PersonId),
        }
    }

    fn relation_field(&self) -> &str {
        self.fields.person(PersonField::Household)
    }

    /// `q/select` covering every mapped field, the household as a nested
    /// selection, and the modification date.
    fn select(&self, kind: EntityKind) -> Value {
        let mut select = vec![json!(ID)];
        match kind {
            EntityKind::Household => {
                for field in HouseholdField::ALL {
                    select.push(json!(self.fields.household(field)));
                }
            }
            EntityKind::Person => {
                for field in PersonField::ALL {
                    if field == PersonField::Household {
                        continue;
                    }
                    select.push(json!(self.fields.person(field)));
                }
                let mut nested = Map::new();
                nested.insert(
                    self.relation_field().to_string(),
                    json!([
                        ID,
                        self.fields.household(HouseholdField::HouseholdId),
                        self.fields.household(HouseholdField::Name)
                    ]),
                );
                select.push(Value::Object(nested));
            }
        }
        select.push(json!(MODIFIED));
        Value::Array(select)
    }

    /// Submit a command array; the response must align with it.
    fn commands(&self, commands: Vec<Value>) -> Result<Vec<CommandResult>, SyncError> {
        let request = HttpRequest::json(Method::Post, self.api_url.clone(), &Value::Array(commands.clone()))
            .header("Authorization", self.authorization.clone());
        let results: Vec<CommandResult> = self.transport.send_json(SYSTEM, &request)?;
        if results.len() != commands.len() {
            return Err(SyncError::decode(
                SYSTEM,
                format!("{} results for {} commands", results.len(), commands.len()),
            ));
        }
        Ok(results)
    }

    fn query(&self, query: Value, params: Option<Value>) -> Result<Vec<Map<String, Value>>, SyncError> {
        let mut args = Map::new();
        args.insert("query".into(), query);
        if let Some(params) = params {
            args.insert("params".into(), params);
        }
        let command = json!({"command": "fibery.entity/query", "args": args});
        let result = self
            .commands(vec![command])?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::decode(SYSTEM, "empty query response"))?;
        if !result.success {
            return Err(SyncError::Remote {
                system: SYSTEM,
                detail: result.result.to_string(),
            });
        }
        match result.result {
            Value::Array(rows) => Ok(rows
                .into_iter()
                .filter_map(|row| match row {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            other => Err(SyncError::decode(
                SYSTEM,
                format!("query result is not an array: {other}"),
            )),
        }
    }

    /// All rows of `kind` modified at or after `since`, oldest first.
    fn pull_rows(
        &self,
        kind: EntityKind,
        since: Option<&Cursor>,
    ) -> Result<Vec<Map<String, Value>>, SyncError> {
        let mut rows = Vec::new();
        let mut offset: u64 = 0;
        loop {
            let mut query = Map::new();
            query.insert("q/from".into(), json!(self.type_name(kind)));
            query.insert("q/select".into(), self.select(kind));
            if since.is_some() {
                query.insert("q/where".into(), json!([">=", [MODIFIED], "$since"]));
            }
            query.insert("q/order-by".into(), json!([[[MODIFIED], "q/asc"]]));
            query.insert("q/limit".into(), json!(self.page_limit));
            query.insert("q/offset".into(), json!(offset));
            let params = since.map(|c| json!({"$since": c.since()}));

            let page = self.query(Value::Object(query), params)?;
            let count = page.len();
            debug!(kind = %kind, offset, rows = count, "fetched page");
            rows.extend(page);
            if count < self.page_limit as usize {
                break;
            }
            offset += u64::from(self.page_limit);
        }
        Ok(rows)
    }

    /// Copy of `row` with the household relation reduced to its `fibery/id`.
    fn flatten(&self, row: &Map<String, Value>) -> Map<String, Value> {
        let mut flat = row.clone();
        if let Some(relation) = flat.get_mut(self.relation_field()) {
            *relation = match relation {
                Value::Object(related) => related.get(ID).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            };
        }
        flat
    }

    /// Destination-id relation values become `{"fibery/id": ...}`.
    fn expand(&self, kind: EntityKind, fields: &Map<String, Value>) -> Map<String, Value> {
        let mut out = fields.clone();
        let relation = self.relation_field();
        if kind == EntityKind::Person {
            if let Some(Value::String(id)) = out.get(relation) {
                let expanded = json!({ ID: id });
                out.insert(relation.to_string(), expanded);
            }
        }
        out
    }

    fn stamp<T>(
        rows: &[Map<String, Value>],
        map: impl Fn(&Map<String, Value>) -> Result<T, MappingError>,
    ) -> Pulled<T> {
        let mut pulled = Pulled::default();
        for row in rows {
            match map(row) {
                Ok(record) => pulled.records.push(Stamped {
                    record,
                    modified_at: row
                        .get(MODIFIED)
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                }),
                Err(err) => {
                    warn!(error = %err, "skipping unmappable record");
                    pulled.rejected.push(err);
                }
            }
        }
        pulled
    }
}

impl Connector for FiberyConnector {
    fn system(&self) -> &'static str {
        SYSTEM
    }
}

impl Source for FiberyConnector {
    fn check_connectivity(&self) -> Result<(), SyncError> {
        let count_one = |kind| {
            json!({
                "command": "fibery.entity/query",
                "args": {"query": {"q/from": self.type_name(kind), "q/select": [ID], "q/limit": 1}}
            })
        };
        let results = self.commands(vec![count_one(EntityKind::Household), count_one(EntityKind::Person)])?;
        match results.iter().find(|r| !r.success) {
            Some(failed) => Err(SyncError::Remote {
                system: SYSTEM,
                detail: failed.result.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn pull_households(
        &self,
        since: Option<&Cursor>,
    ) -> Result<Pulled<CanonicalHousehold>, SyncError> {
        let rows = self.pull_rows(EntityKind::Household, since)?;
        Ok(Self::stamp(&rows, |row| household_from_fibery(row, &self.fields)))
    }

    fn pull_people(&self, since: Option<&Cursor>) -> Result<Pulled<CanonicalPerson>, SyncError> {
        let rows = self.pull_rows(EntityKind::Person, since)?;
        Ok(Self::stamp(&rows, |row| person_from_fibery(row, &self.fields)))
    }
}

impl Destination for FiberyConnector {
    fn profile(&self, kind: EntityKind) -> WriteProfile {
        let mut profile = WriteProfile::new(self.key_field(kind));
        if kind == EntityKind::Person && self.backfill {
            profile.always_refresh = self.fields.backfill_person_fields();
        }
        profile
    }

    fn desired_household(&self, household: &CanonicalHousehold) -> Desired {
        Desired {
            natural_key: Some(household.household_id.0.clone()),
            fields: household_fields(household, &self.fields),
        }
    }

    fn desired_person(&self, person: &CanonicalPerson, household: HouseholdLink<'_>) -> Desired {
        let mut fields = person_fields(person, &self.fields);
        fields.insert(self.relation_field().to_string(), household.value());
        Desired {
            natural_key: Some(person.person_id.0.clone()),
            fields,
        }
    }

    fn lookup(&self, kind: EntityKind, keys: &[String]) -> Result<ExistingRecordIndex, SyncError> {
        let key_field = self.key_field(kind).to_string();
        let query = json!({
            "q/from": self.type_name(kind),
            "q/select": self.select(kind),
            "q/where": ["in", [key_field.clone()], "$ids"],
            "q/limit": keys.len(),
        });
        let rows = self.query(query, Some(json!({ "$ids": keys })))?;

        let mut index = ExistingRecordIndex::default();
        for row in rows {
            let (Some(key), Some(id)) = (
                crate::mapper::text(row.get(&key_field)),
                crate::mapper::text(row.get(ID)),
            ) else {
                continue;
            };
            index.insert(
                key,
                ExistingRecord {
                    id,
                    snapshot: self.flatten(&row),
                },
            );
        }
        Ok(index)
    }

    fn apply(
        &self,
        kind: EntityKind,
        commands: &[WriteCommand],
    ) -> Result<Vec<WriteOutcome>, SyncError> {
        let type_name = self.type_name(kind);
        let payload: Vec<Value> = commands
            .iter()
            .map(|command| match command {
                WriteCommand::Create { fields, .. } => json!({
                    "command": "fibery.entity/create",
                    "args": {"type": type_name, "entity": self.expand(kind, fields)},
                }),
                WriteCommand::Update { id, patch, .. } => {
                    let mut entity = self.expand(kind, patch);
                    entity.insert(ID.into(), json!(id));
                    json!({
                        "command": "fibery.entity/update",
                        "args": {"type": type_name, "entity": entity},
                    })
                }
            })
            .collect();

        let results = self
            .commands(payload)
            .map_err(|err| SyncError::batch(SYSTEM, kind, err))?;

        let mut outcomes = Vec::with_capacity(commands.len());
        for (command, result) in commands.iter().zip(results) {
            if !result.success {
                return Err(SyncError::batch(
                    SYSTEM,
                    kind,
                    format!(
                        "{} rejected: {}",
                        command.natural_key().unwrap_or("<no key>"),
                        result.result
                    ),
                ));
            }
            let id = match command {
                WriteCommand::Update { id, .. } => id.clone(),
                WriteCommand::Create { .. } => crate::mapper::text(result.result.get(ID))
                    .ok_or_else(|| SyncError::batch(SYSTEM, kind, "create returned no fibery/id"))?,
            };
            outcomes.push(WriteOutcome {
                natural_key: command.natural_key().map(str::to_string),
                id,
            });
        }
        Ok(outcomes)
    }
}
