//! Dry-run destination: everything up to the write, nothing written.
//!
//! Lookups go to the wrapped destination so plans are accurate; `apply`
//! records the commands and answers with synthetic ids for creates, which
//! lets person relations resolve against households that would be created.

use std::sync::Mutex;

use serde::Serialize;

use congregate_core::{CanonicalHousehold, CanonicalPerson, EntityKind};

use super::{Connector, Destination, HouseholdLink};
use crate::error::SyncError;
use crate::reconcile::{Desired, ExistingRecordIndex, WriteCommand, WriteOutcome, WriteProfile};

/// A write that a live run would have submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedWrite {
    pub system: &'static str,
    pub kind: EntityKind,
    #[serde(flatten)]
    pub command: WriteCommand,
}

pub struct DryRun<'a> {
    inner: &'a dyn Destination,
    planned: Mutex<Vec<PlannedWrite>>,
}

impl<'a> DryRun<'a> {
    pub fn new(inner: &'a dyn Destination) -> Self {
        Self {
            inner,
            planned: Mutex::new(Vec::new()),
        }
    }

    pub fn into_planned(self) -> Vec<PlannedWrite> {
        self.planned
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Connector for DryRun<'_> {
    fn system(&self) -> &'static str {
        self.inner.system()
    }
}

impl Destination for DryRun<'_> {
    fn profile(&self, kind: EntityKind) -> WriteProfile {
        self.inner.profile(kind)
    }

    fn desired_household(&self, household: &CanonicalHousehold) -> Desired {
        self.inner.desired_household(household)
    }

    fn desired_person(&self, person: &CanonicalPerson, household: HouseholdLink<'_>) -> Desired {
        self.inner.desired_person(person, household)
    }

    fn lookup(&self, kind: EntityKind, keys: &[String]) -> Result<ExistingRecordIndex, SyncError> {
        self.inner.lookup(kind, keys)
    }

    fn apply(
        &self,
        kind: EntityKind,
        commands: &[WriteCommand],
    ) -> Result<Vec<WriteOutcome>, SyncError> {
        let mut planned = self
            .planned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            planned.push(PlannedWrite {
                system: self.inner.system(),
                kind,
                command: command.clone(),
            });
            let id = match command {
                WriteCommand::Create { natural_key, .. } => format!(
                    "dry-run:{kind}:{}",
                    natural_key.as_deref().unwrap_or("new")
                ),
                WriteCommand::Update { id, .. } => id.clone(),
            };
            outcomes.push(WriteOutcome {
                natural_key: command.natural_key().map(str::to_string),
                id,
            });
        }
        Ok(outcomes)
    }
}
