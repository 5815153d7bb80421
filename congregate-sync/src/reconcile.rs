//! Reconciliation: natural-key matching, minimal diffs and write planning.
//!
//! For one entity kind and one destination:
//!
//! 1. collapse duplicate natural keys (last occurrence wins)
//! 2. look up existing destination records by natural key
//! 3. plan a create for unmatched keys and a minimal patch for matched ones
//! 4. submit the plan as one batch and return the destination ids written
//!
//! Values in a [`Desired`] record use `None` for "absent": absent values are
//! never written. `Some(Value::Null)` is an explicit clear and is written
//! whenever the destination still holds a value.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use congregate_core::EntityKind;

use crate::connector::Destination;
use crate::error::SyncError;
use crate::mapper::parse_instant;

/// Destination field name → value (`None` = absent).
pub type FieldValues = BTreeMap<String, Option<Value>>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A record as it should look in the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Desired {
    pub natural_key: Option<String>,
    pub fields: FieldValues,
}

/// Destination identifier plus the field values currently stored there.
///
/// Relation fields are flattened to the related record's destination id.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRecord {
    pub id: String,
    pub snapshot: Map<String, Value>,
}

/// Existing destination records keyed by natural key.
#[derive(Debug, Clone, Default)]
pub struct ExistingRecordIndex {
    by_key: HashMap<String, ExistingRecord>,
}

impl ExistingRecordIndex {
    pub fn insert(&mut self, natural_key: impl Into<String>, record: ExistingRecord) {
        self.by_key.insert(natural_key.into(), record);
    }

    pub fn get(&self, natural_key: &str) -> Option<&ExistingRecord> {
        self.by_key.get(natural_key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExistingRecord)> {
        self.by_key.iter()
    }
}

/// One write to submit to a destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum WriteCommand {
    Create {
        natural_key: Option<String>,
        fields: Map<String, Value>,
    },
    Update {
        natural_key: String,
        id: String,
        patch: Map<String, Value>,
    },
}

impl WriteCommand {
    pub fn natural_key(&self) -> Option<&str> {
        match self {
            WriteCommand::Create { natural_key, .. } => natural_key.as_deref(),
            WriteCommand::Update { natural_key, .. } => Some(natural_key),
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, WriteCommand::Create { .. })
    }
}

/// A successful write: which natural key now lives at which destination id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub natural_key: Option<String>,
    pub id: String,
}

/// How a destination wants one entity kind written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProfile {
    /// Destination field holding the natural key; anchors every patch.
    pub key_field: String,
    /// Fields written on every update even when unchanged.
    pub always_refresh: BTreeSet<String>,
    /// Whether unmatched keys may be created.
    pub allow_create: bool,
    /// Whether a missing or unresolved relation is written as a clear.
    /// Off, the destination's relation is left as it is.
    pub clear_relations: bool,
}

impl WriteProfile {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            always_refresh: BTreeSet::new(),
            allow_create: true,
            clear_relations: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Records split by the per-run guardrail.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub processing: Vec<T>,
    /// Left for a later run, in pull order.
    pub deferred: Vec<T>,
}

/// Keep the first `limit` records (pull order, oldest first) and defer the rest.
pub fn truncate<T>(mut records: Vec<T>, limit: usize) -> Batch<T> {
    let deferred = if records.len() > limit {
        records.split_off(limit)
    } else {
        Vec::new()
    };
    Batch {
        processing: records,
        deferred,
    }
}

/// Collapse repeated natural keys to their last occurrence. Keyless records are kept.
pub fn dedupe_latest(desired: Vec<Desired>) -> Vec<Desired> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (i, d) in desired.iter().enumerate() {
        if let Some(key) = &d.natural_key {
            last.insert(key.clone(), i);
        }
    }
    desired
        .into_iter()
        .enumerate()
        .filter(|(i, d)| match &d.natural_key {
            Some(key) => last.get(key) == Some(i),
            None => true,
        })
        .map(|(_, d)| d)
        .collect()
}

/// Distinct natural keys in first-seen order.
pub fn natural_keys(desired: &[Desired]) -> Vec<String> {
    let mut seen = HashSet::new();
    desired
        .iter()
        .filter_map(|d| d.natural_key.clone())
        .filter(|k| seen.insert(k.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub commands: Vec<WriteCommand>,
    /// Matched records with nothing to write.
    pub skipped: usize,
    /// Unmatched keys the destination does not accept creates for.
    pub refused: Vec<String>,
}

impl Plan {
    pub fn creates(&self) -> usize {
        self.commands.iter().filter(|c| c.is_create()).count()
    }

    pub fn updates(&self) -> usize {
        self.commands.len() - self.creates()
    }
}

pub fn plan(desired: &[Desired], existing: &ExistingRecordIndex, profile: &WriteProfile) -> Plan {
    let mut plan = Plan::default();
    for record in desired {
        let matched = record
            .natural_key
            .as_deref()
            .and_then(|key| existing.get(key).map(|rec| (key, rec)));
        match matched {
            Some((key, rec)) => match diff(record, rec, profile) {
                Some(patch) => plan.commands.push(WriteCommand::Update {
                    natural_key: key.to_string(),
                    id: rec.id.clone(),
                    patch,
                }),
                None => plan.skipped += 1,
            },
            None if profile.allow_create => plan.commands.push(WriteCommand::Create {
                natural_key: record.natural_key.clone(),
                fields: create_payload(record),
            }),
            None => plan
                .refused
                .push(record.natural_key.clone().unwrap_or_else(|| "<no key>".into())),
        }
    }
    plan
}

/// Every non-absent field, including explicit clears.
fn create_payload(record: &Desired) -> Map<String, Value> {
    record
        .fields
        .iter()
        .filter_map(|(name, value)| value.clone().map(|v| (name.clone(), v)))
        .collect()
}

/// Minimal patch turning `existing` into `desired`, or `None` when nothing
/// beyond the key would be written.
pub fn diff(
    desired: &Desired,
    existing: &ExistingRecord,
    profile: &WriteProfile,
) -> Option<Map<String, Value>> {
    let mut patch = Map::new();
    for (name, wanted) in &desired.fields {
        if *name == profile.key_field {
            continue;
        }
        let Some(wanted) = wanted else {
            continue;
        };
        let current = existing.snapshot.get(name).filter(|v| !is_absent(v));
        let write = match (wanted, current) {
            // nothing to clear
            (Value::Null, None) => false,
            (_, None) => true,
            (w, Some(c)) => !values_equal(w, c) || profile.always_refresh.contains(name),
        };
        if write {
            patch.insert(name.clone(), wanted.clone());
        }
    }
    if patch.is_empty() {
        return None;
    }
    if let Some(key) = &desired.natural_key {
        patch.insert(profile.key_field.clone(), Value::String(key.clone()));
    }
    Some(patch)
}

fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Equality as the destination stores it: numbers by value, RFC 3339 strings
/// by instant, everything else structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) if x.contains('T') && y.contains('T') => {
            match (parse_instant(x), parse_instant(y)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Destination index
// ---------------------------------------------------------------------------

/// Natural key → destination id for records known to exist in a destination.
#[derive(Debug, Clone, Default)]
pub struct DestinationIndex {
    ids: HashMap<String, String>,
}

impl DestinationIndex {
    pub fn absorb_existing(&mut self, existing: &ExistingRecordIndex) {
        for (key, record) in existing.iter() {
            self.ids.insert(key.clone(), record.id.clone());
        }
    }

    pub fn absorb_outcomes(&mut self, outcomes: &[WriteOutcome]) {
        for outcome in outcomes {
            if let Some(key) = &outcome.natural_key {
                self.ids.insert(key.clone(), outcome.id.clone());
            }
        }
    }

    pub fn resolve(&self, natural_key: &str) -> Option<&str> {
        self.ids.get(natural_key).map(String::as_str)
    }

    /// Distinct keys from `keys` with no known destination id.
    pub fn missing<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Vec<String> {
        let mut seen = HashSet::new();
        keys.into_iter()
            .filter(|k| !self.ids.contains_key(*k) && seen.insert(*k))
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Result of reconciling one kind against one destination.
#[derive(Debug, Clone, Default)]
pub struct Pushed {
    pub plan: Plan,
    pub existing: ExistingRecordIndex,
    pub outcomes: Vec<WriteOutcome>,
}

/// Dedupe, look up, diff and submit `desired` as one batch.
pub fn push(
    destination: &dyn Destination,
    kind: EntityKind,
    desired: Vec<Desired>,
) -> Result<Pushed, SyncError> {
    let desired = dedupe_latest(desired);
    let keys = natural_keys(&desired);
    let existing = if keys.is_empty() {
        ExistingRecordIndex::default()
    } else {
        destination.lookup(kind, &keys)?
    };

    let plan = plan(&desired, &existing, &destination.profile(kind));
    for key in &plan.refused {
        warn!(
            system = destination.system(),
            kind = %kind,
            natural_key = %key,
            "no matching record; creation disabled for this destination"
        );
    }

    let outcomes = if plan.commands.is_empty() {
        Vec::new()
    } else {
        destination.apply(kind, &plan.commands)?
    };
    info!(
        system = destination.system(),
        kind = %kind,
        created = plan.creates(),
        updated = plan.updates(),
        skipped = plan.skipped,
        refused = plan.refused.len(),
        "reconciled"
    );

    Ok(Pushed {
        plan,
        existing,
        outcomes,
    })
}
