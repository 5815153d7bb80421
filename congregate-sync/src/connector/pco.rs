//! Planning Center People (JSON:API over REST).
//!
//! - pulls: `GET /people` and `GET /households` filtered by
//!   `where[updated_at][gte]`, ordered by `updated_at`, following `links.next`
//! - lookups: one `GET /<collection>/<id>` per key; 404 means no record
//! - writes: one `PATCH` (or `POST`) per command, sequentially
//!
//! Authentication is HTTP Basic with the application id and secret.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use congregate_core::config::PcoConfig;
use congregate_core::{CanonicalHousehold, CanonicalPerson, Cursor, EntityKind, PersonField};

use super::{Connector, Destination, HouseholdLink, Pulled, Source, Stamped};
use crate::error::{MappingError, SyncError};
use crate::mapper::pco::{
    household_attributes, household_from_pco, person_attributes, person_from_pco, Included,
    HOUSEHOLD, KEY,
};
use crate::reconcile::{
    Desired, ExistingRecord, ExistingRecordIndex, WriteCommand, WriteOutcome, WriteProfile,
};
use crate::transport::{HttpRequest, Method, Transport};

pub const SYSTEM: &str = "pco";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PcoResource {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, PcoRelationship>,
}

impl PcoResource {
    /// Resource identifiers linked under `relationship`, in document order.
    pub fn related(&self, relationship: &str) -> Vec<&PcoRef> {
        match self.relationships.get(relationship).and_then(|r| r.data.as_ref()) {
            Some(PcoLinkage::Many(refs)) => refs.iter().collect(),
            Some(PcoLinkage::One(one)) => vec![one],
            None => Vec::new(),
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.attributes
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PcoRelationship {
    #[serde(default)]
    pub data: Option<PcoLinkage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PcoLinkage {
    Many(Vec<PcoRef>),
    One(PcoRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcoRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PcoPage {
    #[serde(default)]
    pub data: Vec<PcoResource>,
    #[serde(default)]
    pub included: Vec<PcoResource>,
    #[serde(default)]
    pub links: PcoLinks,
}

#[derive(Debug, Default, Deserialize)]
pub struct PcoLinks {
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PcoSingle {
    data: PcoResource,
}

/// Ids are strings in JSON:API, but accept bare numbers too.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

fn collection(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::Household => ("households", "Household"),
        EntityKind::Person => ("people", "Person"),
    }
}

pub struct PcoConnector {
    transport: Transport,
    base_url: String,
    authorization: String,
    per_page: u32,
}

impl PcoConnector {
    pub fn new(config: &PcoConfig, transport: Transport) -> Self {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", config.app_id, config.secret));
        Self {
            transport,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            authorization: format!("Basic {credentials}"),
            per_page: config.per_page,
        }
    }

    fn authorized(&self, request: HttpRequest) -> HttpRequest {
        request
            .header("Authorization", self.authorization.clone())
            .header("Accept", "application/json")
    }

    fn list_url(&self, path: &str, since: Option<&Cursor>, include: Option<&str>) -> String {
        let mut params = Vec::new();
        if let Some(since) = since {
            params.push(format!(
                "{}={}",
                urlencoding::encode("where[updated_at][gte]"),
                urlencoding::encode(since.since())
            ));
        }
        params.push("order=updated_at".to_string());
        params.push(format!("per_page={}", self.per_page));
        if let Some(include) = include {
            params.push(format!("include={}", urlencoding::encode(include)));
        }
        format!("{}/{path}?{}", self.base_url, params.join("&"))
    }

    /// Every page of a list endpoint, following `links.next`.
    fn list_pages(&self, first_url: String) -> Result<Vec<PcoPage>, SyncError> {
        let mut pages = Vec::new();
        let mut url = Some(first_url);
        while let Some(current) = url.take() {
            let page: PcoPage = self
                .transport
                .send_json(SYSTEM, &self.authorized(HttpRequest::get(current.clone())))?;
            debug!(url = %current, records = page.data.len(), "fetched page");
            url = page
                .links
                .next
                .clone()
                .filter(|next| !next.is_empty() && *next != current);
            pages.push(page);
        }
        Ok(pages)
    }

    fn get_one(&self, kind: EntityKind, id: &str) -> Result<Option<PcoResource>, SyncError> {
        let (path, _) = collection(kind);
        let mut url = format!("{}/{path}/{}", self.base_url, urlencoding::encode(id));
        if kind == EntityKind::Person {
            url.push_str("?include=households");
        }
        match self.transport.send(&self.authorized(HttpRequest::get(url.clone()))) {
            Ok(response) => {
                let single: PcoSingle = serde_json::from_str(&response.body)
                    .map_err(|e| SyncError::decode(SYSTEM, format!("GET {url}: {e}")))?;
                Ok(Some(single.data))
            }
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Comparable snapshot: writable attributes plus the flattened household.
    fn snapshot(kind: EntityKind, resource: &PcoResource) -> Map<String, Value> {
        let mut snapshot = Map::new();
        let attributes: Vec<&str> = match kind {
            EntityKind::Household => vec!["name"],
            EntityKind::Person => PersonField::ALL
                .iter()
                .filter(|f| f.pco_writable())
                .filter_map(|f| f.pco_attribute())
                .collect(),
        };
        for attribute in attributes {
            if let Some(value) = resource.attributes.get(attribute) {
                snapshot.insert(attribute.to_string(), value.clone());
            }
        }
        if kind == EntityKind::Person {
            let household = resource
                .related("households")
                .first()
                .map(|r| Value::String(r.id.clone()))
                .unwrap_or(Value::Null);
            snapshot.insert(HOUSEHOLD.to_string(), household);
        }
        snapshot
    }

    fn write(&self, kind: EntityKind, command: &WriteCommand) -> Result<WriteOutcome, SyncError> {
        let (path, type_name) = collection(kind);
        match command {
            WriteCommand::Update {
                natural_key, id, patch,
            } => {
                let url = format!("{}/{path}/{}", self.base_url, urlencoding::encode(id));
                let body = resource_body(type_name, Some(id), patch);
                self.transport
                    .send(&self.authorized(HttpRequest::json(Method::Patch, url, &body)))?;
                Ok(WriteOutcome {
                    natural_key: Some(natural_key.clone()),
                    id: id.clone(),
                })
            }
            WriteCommand::Create {
                natural_key,
                fields,
            } => {
                let url = format!("{}/{path}", self.base_url);
                let body = resource_body(type_name, None, fields);
                let created: PcoSingle = self
                    .transport
                    .send_json(SYSTEM, &self.authorized(HttpRequest::json(Method::Post, url, &body)))?;
                let id = created
                    .data
                    .id
                    .ok_or_else(|| SyncError::decode(SYSTEM, "created resource has no id"))?;
                Ok(WriteOutcome {
                    natural_key: natural_key.clone(),
                    id,
                })
            }
        }
    }

    fn stamp<T>(
        resources: &[PcoResource],
        mut map: impl FnMut(&PcoResource) -> Result<T, MappingError>,
        out: &mut Pulled<T>,
    ) {
        for resource in resources {
            match map(resource) {
                Ok(record) => out.records.push(Stamped {
                    record,
                    modified_at: resource.updated_at(),
                }),
                Err(err) => {
                    warn!(error = %err, "skipping unmappable record");
                    out.rejected.push(err);
                }
            }
        }
    }
}

/// JSON:API body for a write. The key and household pseudo-fields become the
/// resource id and the `households` relationship.
fn resource_body(type_name: &str, id: Option<&String>, fields: &Map<String, Value>) -> Value {
    let attributes: Map<String, Value> = fields
        .iter()
        .filter(|(name, _)| name.as_str() != KEY && name.as_str() != HOUSEHOLD)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut data = Map::new();
    data.insert("type".into(), json!(type_name));
    if let Some(id) = id {
        data.insert("id".into(), json!(id));
    }
    data.insert("attributes".into(), Value::Object(attributes));
    if let Some(household) = fields.get(HOUSEHOLD) {
        let linkage = match household {
            Value::String(id) => json!([{"type": "Household", "id": id}]),
            _ => json!([]),
        };
        data.insert(
            "relationships".into(),
            json!({"households": {"data": linkage}}),
        );
    }
    json!({ "data": data })
}

impl Connector for PcoConnector {
    fn system(&self) -> &'static str {
        SYSTEM
    }
}

impl Source for PcoConnector {
    fn check_connectivity(&self) -> Result<(), SyncError> {
        let url = format!("{}/people?per_page=1", self.base_url);
        self.transport.send(&self.authorized(HttpRequest::get(url)))?;
        Ok(())
    }

    fn pull_households(
        &self,
        since: Option<&Cursor>,
    ) -> Result<Pulled<CanonicalHousehold>, SyncError> {
        let mut pulled = Pulled::default();
        for page in self.list_pages(self.list_url("households", since, None))? {
            Self::stamp(&page.data, household_from_pco, &mut pulled);
        }
        Ok(pulled)
    }

    fn pull_people(&self, since: Option<&Cursor>) -> Result<Pulled<CanonicalPerson>, SyncError> {
        let mut pulled = Pulled::default();
        let url = self.list_url("people", since, Some("emails,phone_numbers"));
        for page in self.list_pages(url)? {
            let included = Included::new(&page.included);
            Self::stamp(&page.data, |r| person_from_pco(r, &included), &mut pulled);
        }
        Ok(pulled)
    }
}

impl Destination for PcoConnector {
    /// Planning Center is the primary system: keys it does not know are
    /// never created from Fibery.
    fn profile(&self, _kind: EntityKind) -> WriteProfile {
        WriteProfile {
            allow_create: false,
            clear_relations: false,
            ..WriteProfile::new(KEY)
        }
    }

    fn desired_household(&self, household: &CanonicalHousehold) -> Desired {
        Desired {
            natural_key: Some(household.household_id.0.clone()),
            fields: household_attributes(household),
        }
    }

    fn desired_person(&self, person: &CanonicalPerson, household: HouseholdLink<'_>) -> Desired {
        let mut fields = person_attributes(person);
        fields.insert(HOUSEHOLD.to_string(), household.value());
        Desired {
            natural_key: Some(person.person_id.0.clone()),
            fields,
        }
    }

    fn lookup(&self, kind: EntityKind, keys: &[String]) -> Result<ExistingRecordIndex, SyncError> {
        let mut index = ExistingRecordIndex::default();
        for key in keys {
            if let Some(resource) = self.get_one(kind, key)? {
                let id = resource.id.clone().unwrap_or_else(|| key.clone());
                index.insert(
                    key.clone(),
                    ExistingRecord {
                        id,
                        snapshot: Self::snapshot(kind, &resource),
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
        commands
            .iter()
            .map(|command| {
                self.write(kind, command)
                    .map_err(|err| SyncError::batch(SYSTEM, kind, err))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{recording_sleeper, ScriptedClient};
    use crate::transport::{HttpResponse, RetryPolicy};
    use std::sync::Arc;

    fn connector(script: Vec<Result<HttpResponse, String>>) -> (PcoConnector, Arc<ScriptedClient>) {
        let client = ScriptedClient::new(script);
        let (sleeper, _) = recording_sleeper();
        let transport = Transport::new(client.clone(), RetryPolicy::default()).with_sleeper(sleeper);
        let config = PcoConfig {
            base_url: "https://pco.test/people/v2".into(),
            app_id: "app".into(),
            secret: "secret".into(),
            per_page: 100,
        };
        (PcoConnector::new(&config, transport), client)
    }

    #[test]
    fn list_url_filters_orders_and_includes() {
        let (pco, _) = connector(vec![]);
        let url = pco.list_url(
            "people",
            Some(&Cursor("2025-01-01T00:00:00.000Z".into())),
            Some("emails,phone_numbers"),
        );
        assert_eq!(
            url,
            "https://pco.test/people/v2/people?where%5Bupdated_at%5D%5Bgte%5D=2025-01-01T00%3A00%3A00.000Z&order=updated_at&per_page=100&include=emails%2Cphone_numbers"
        );
        let resuming = Cursor("2025-01-01T00:00:00.000Z".into())
            .with_resume_key(EntityKind::Person, "77");
        assert_eq!(
            pco.list_url("people", Some(&resuming), Some("emails,phone_numbers")),
            url
        );
        assert!(!pco.list_url("households", None, None).contains("where"));
    }

    #[test]
    fn basic_auth_header_is_base64_of_app_and_secret() {
        let (pco, client) = connector(vec![Ok(HttpResponse::new(200, r#"{"data":[]}"#))]);
        pco.check_connectivity().unwrap();
        let seen = client.seen.lock().unwrap();
        assert!(seen[0]
            .headers
            .contains(&("Authorization".into(), "Basic YXBwOnNlY3JldA==".into())));
    }

    #[test]
    fn follows_next_links_until_exhausted() {
        let page1 = json!({
            "data": [{"type": "Household", "id": "1", "attributes": {"name": "A", "updated_at": "2025-01-01T00:00:00Z"}}],
            "links": {"next": "https://pco.test/people/v2/households?offset=1"}
        });
        let page2 = json!({
            "data": [{"type": "Household", "id": "2", "attributes": {"name": "B"}}],
            "links": {}
        });
        let (pco, client) = connector(vec![
            Ok(HttpResponse::new(200, page1.to_string())),
            Ok(HttpResponse::new(200, page2.to_string())),
        ]);
        let pulled = pco.pull_households(None).unwrap();
        assert_eq!(pulled.records.len(), 2);
        assert!(pulled.records[0].modified_at.is_some());
        assert_eq!(client.seen.lock().unwrap()[1].url, "https://pco.test/people/v2/households?offset=1");
    }

    #[test]
    fn lookup_treats_404_as_missing() {
        let found = json!({"data": {"type": "Household", "id": "H1", "attributes": {"name": "Smith"}}});
        let (pco, _) = connector(vec![
            Ok(HttpResponse::new(200, found.to_string())),
            Ok(HttpResponse::new(404, r#"{"errors":[{"status":"404"}]}"#)),
        ]);
        let index = pco
            .lookup(EntityKind::Household, &["H1".into(), "H404".into()])
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("H1").unwrap().snapshot["name"], json!("Smith"));
    }

    #[test]
    fn patch_body_moves_household_into_relationships() {
        let (pco, client) = connector(vec![Ok(HttpResponse::new(200, "{}"))]);
        let mut patch = Map::new();
        patch.insert("id".into(), json!("P1"));
        patch.insert("first_name".into(), json!("Jo"));
        patch.insert("household".into(), Value::Null);
        let outcomes = pco
            .apply(
                EntityKind::Person,
                &[WriteCommand::Update {
                    natural_key: "P1".into(),
                    id: "P1".into(),
                    patch,
                }],
            )
            .unwrap();
        assert_eq!(outcomes[0].id, "P1");

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].method, Method::Patch);
        assert_eq!(seen[0].url, "https://pco.test/people/v2/people/P1");
        let body: Value = serde_json::from_str(seen[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({"data": {
                "type": "Person",
                "id": "P1",
                "attributes": {"first_name": "Jo"},
                "relationships": {"households": {"data": []}}
            }})
        );
    }

    #[test]
    fn rejected_write_is_a_batch_error() {
        let (pco, _) = connector(vec![Ok(HttpResponse::new(422, "invalid"))]);
        let err = pco
            .apply(
                EntityKind::Household,
                &[WriteCommand::Update {
                    natural_key: "H1".into(),
                    id: "H1".into(),
                    patch: Map::new(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Batch { kind: EntityKind::Household, .. }), "{err}");
        assert!(err.to_string().contains("422"));
    }

    #[test]
    fn profile_refuses_creates() {
        let (pco, _) = connector(vec![]);
        assert!(!pco.profile(EntityKind::Person).allow_create);
        assert!(!pco.profile(EntityKind::Person).clear_relations);
        assert_eq!(pco.profile(EntityKind::Person).key_field, "id");
    }
}
