//! Sync orchestrator: one run, stages in fixed order.
//!
//! ```text
//! Init → TestConnectivity → LoadCursors → PullA → ReconcileHouseholdsAToB
//!      → ReconcilePeopleAToB → PullB → [ReconcileHouseholdsBToA → ReconcilePeopleBToA]
//!      → CommitCursors → Done
//! ```
//!
//! Any error between `LoadCursors` and `CommitCursors` returns early, so the
//! cursors are only ever written after every write of the run succeeded.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use congregate_core::{
    CanonicalHousehold, CanonicalPerson, Cursor, CursorName, Direction, EntityKind, SyncConfig,
};

use crate::connector::dry_run::PlannedWrite;
use crate::connector::{Destination, DryRun, HouseholdLink, Pulled, Source, Stamped};
use crate::cursor_store::CursorStore;
use crate::error::SyncError;
use crate::reconcile::{push, truncate, DestinationIndex, Plan};

// ---------------------------------------------------------------------------
// Settings and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStage {
    Init,
    TestConnectivity,
    LoadCursors,
    PullA,
    ReconcileHouseholdsAToB,
    ReconcilePeopleAToB,
    PullB,
    ReconcileHouseholdsBToA,
    ReconcilePeopleBToA,
    CommitCursors,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Init => "init",
            RunStage::TestConnectivity => "test-connectivity",
            RunStage::LoadCursors => "load-cursors",
            RunStage::PullA => "pull-a",
            RunStage::ReconcileHouseholdsAToB => "reconcile-households-a-to-b",
            RunStage::ReconcilePeopleAToB => "reconcile-people-a-to-b",
            RunStage::PullB => "pull-b",
            RunStage::ReconcileHouseholdsBToA => "reconcile-households-b-to-a",
            RunStage::ReconcilePeopleBToA => "reconcile-people-b-to-a",
            RunStage::CommitCursors => "commit-cursors",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Live,
    /// Look up and plan, but write nothing and leave cursors alone.
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub max_per_run: usize,
    pub reverse: Direction,
    pub mode: RunMode,
}

impl RunSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_per_run: config.sync.max_per_run,
            reverse: config.sync.reverse,
            mode: RunMode::Live,
        }
    }
}

/// Counts for one entity kind in one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub pulled: usize,
    /// Pulled rows that failed mapping.
    pub rejected: usize,
    pub processed: usize,
    /// Left for the next run by the guardrail.
    pub deferred: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Unmatched keys the destination would not create.
    pub refused: usize,
}

impl KindReport {
    fn from_pull<T>(pulled: &Pulled<T>) -> Self {
        Self {
            pulled: pulled.records.len(),
            rejected: pulled.rejected.len(),
            ..Self::default()
        }
    }

    fn record(&mut self, plan: &Plan) {
        self.created = plan.creates();
        self.updated = plan.updates();
        self.skipped = plan.skipped;
        self.refused = plan.refused.len();
    }

    pub fn writes(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DirectionReport {
    /// Whether the reconcile stages ran (B→A only runs when enabled).
    pub reconciled: bool,
    pub households: KindReport,
    pub people: KindReport,
    pub cursor_before: Option<Cursor>,
    pub cursor_after: Option<Cursor>,
}

impl DirectionReport {
    pub fn writes(&self) -> usize {
        self.households.writes() + self.people.writes()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    pub a_to_b: DirectionReport,
    pub b_to_a: DirectionReport,
    pub cursors_committed: bool,
    /// Writes a live run would have made; dry runs only.
    pub planned: Vec<PlannedWrite>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn writes(&self) -> usize {
        self.a_to_b.writes() + self.b_to_a.writes()
    }
}

// ---------------------------------------------------------------------------
// Cursor advance
// ---------------------------------------------------------------------------

/// How far a direction's cursor may move after a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Everything pulled was processed.
    RunStart,
    /// Records were deferred; resume at the first of them.
    Watermark(Cursor),
    /// Records were deferred and no watermark is known.
    Hold,
}

/// Natural key that orders records sharing a modification instant.
trait Keyed {
    fn natural_key(&self) -> &str;
}

impl Keyed for CanonicalHousehold {
    fn natural_key(&self) -> &str {
        &self.household_id.0
    }
}

impl Keyed for CanonicalPerson {
    fn natural_key(&self) -> &str {
        &self.person_id.0
    }
}

/// Sort by (modification instant, natural key) and drop the records `since`
/// marks as already synced at its instant.
fn resume_order<T: Keyed>(mut pulled: Pulled<T>, kind: EntityKind, since: Option<&Cursor>) -> Pulled<T> {
    pulled.records.sort_by(|a, b| {
        (a.modified_at, a.record.natural_key()).cmp(&(b.modified_at, b.record.natural_key()))
    });
    let resume = since.and_then(|c| Some((c.instant()?, c.resume_key(kind)?)));
    if let Some((at, after)) = resume {
        pulled
            .records
            .retain(|s| s.modified_at != Some(at) || s.record.natural_key() > after.as_str());
    }
    pulled
}

/// First record of one kind a later run must still see.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResumePoint {
    at: DateTime<Utc>,
    /// Last key already synced at `at`.
    after: Option<String>,
}

/// `None` when every record was processed, `Some(None)` when the first
/// unprocessed one has no modification time. `ordered` pairs each record,
/// in resume order, with whether it was processed.
fn resume_point<'r, T: Keyed + 'r>(
    ordered: impl IntoIterator<Item = (&'r Stamped<T>, bool)>,
    kind: EntityKind,
    previous: Option<&Cursor>,
) -> Option<Option<ResumePoint>> {
    let mut before: Option<&Stamped<T>> = None;
    for (stamped, processed) in ordered {
        if processed {
            before = Some(stamped);
            continue;
        }
        let Some(at) = stamped.modified_at else {
            return Some(None);
        };
        let after = before
            .filter(|b| b.modified_at == Some(at))
            .map(|b| b.record.natural_key().to_string())
            .or_else(|| {
                previous
                    .filter(|c| c.instant() == Some(at))
                    .and_then(|c| c.resume_key(kind))
            });
        return Some(Some(ResumePoint { at, after }));
    }
    None
}

/// Resume points of each kind folded into one advance: the earliest instant,
/// carrying the resume keys of every kind stopped at exactly that instant.
fn advance_from(marks: &[(EntityKind, Option<Option<ResumePoint>>)]) -> Advance {
    let mut points = Vec::new();
    for (kind, mark) in marks {
        match mark {
            None => {}
            Some(None) => return Advance::Hold,
            Some(Some(point)) => points.push((*kind, point)),
        }
    }
    let Some(at) = points.iter().map(|(_, p)| p.at).min() else {
        return Advance::RunStart;
    };
    let cursor = points
        .iter()
        .filter(|(_, p)| p.at == at)
        .fold(Cursor::at(at), |cursor, (kind, p)| match &p.after {
            Some(key) => cursor.with_resume_key(*kind, key),
            None => cursor,
        });
    Advance::Watermark(cursor)
}

/// The cursor to commit, or `None` to leave the stored one untouched.
/// Cursors never move to an earlier instant.
pub fn next_cursor(
    previous: Option<&Cursor>,
    advance: &Advance,
    run_start: DateTime<Utc>,
) -> Option<Cursor> {
    let target = match advance {
        Advance::RunStart => Cursor::at(run_start),
        Advance::Watermark(cursor) => cursor.clone(),
        Advance::Hold => return None,
    };
    let prev_at = previous.and_then(Cursor::instant);
    match (prev_at, target.instant()) {
        (Some(prev), Some(at)) if at < prev => None,
        (Some(prev), Some(at)) if at == prev && previous == Some(&target) => None,
        _ => Some(target),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct DirectionOutcome {
    report: DirectionReport,
    advance: Advance,
}

type Clock<'a> = Box<dyn Fn() -> DateTime<Utc> + 'a>;

/// Drives one run between PCO (Source A) and Fibery (Source B).
pub struct Orchestrator<'a> {
    source_a: &'a dyn Source,
    sink_a: &'a dyn Destination,
    source_b: &'a dyn Source,
    sink_b: &'a dyn Destination,
    cursors: &'a mut dyn CursorStore,
    settings: RunSettings,
    clock: Clock<'a>,
    stage: RunStage,
}

impl<'a> Orchestrator<'a> {
    pub fn new<A, B>(
        system_a: &'a A,
        system_b: &'a B,
        cursors: &'a mut dyn CursorStore,
        settings: RunSettings,
    ) -> Self
    where
        A: Source + Destination,
        B: Source + Destination,
    {
        Self {
            source_a: system_a,
            sink_a: system_a,
            source_b: system_b,
            sink_b: system_b,
            cursors,
            settings,
            clock: Box::new(Utc::now),
            stage: RunStage::Init,
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Stage reached by the last [`run`](Self::run); the failing stage after an error.
    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn run(&mut self) -> Result<RunReport, SyncError> {
        self.stage = RunStage::Init;
        let result = self.execute();
        if let Err(err) = &result {
            error!(stage = %self.stage, error = %err, "sync run failed; cursors unchanged");
        }
        result
    }

    fn enter(&mut self, stage: RunStage) {
        if self.stage != stage {
            debug!(stage = %stage, "entering stage");
            self.stage = stage;
        }
    }

    fn execute(&mut self) -> Result<RunReport, SyncError> {
        let timer = Instant::now();
        let started_at = (self.clock)();
        info!(
            mode = ?self.settings.mode,
            reverse = self.settings.reverse.is_enabled(),
            max_per_run = self.settings.max_per_run,
            "sync run starting"
        );

        self.enter(RunStage::TestConnectivity);
        for source in [self.source_a, self.source_b] {
            source
                .check_connectivity()
                .map_err(|err| SyncError::Connectivity {
                    system: source.system(),
                    source: Box::new(err),
                })?;
        }

        self.enter(RunStage::LoadCursors);
        let cursor_a = self.cursors.get(CursorName::SourceA)?;
        let cursor_b = self.cursors.get(CursorName::SourceB)?;

        let dry = self.settings.mode == RunMode::DryRun;
        let dry_b = dry.then(|| DryRun::new(self.sink_b));
        let dry_a = dry.then(|| DryRun::new(self.sink_a));
        let sink_b: &dyn Destination = match &dry_b {
            Some(d) => d,
            None => self.sink_b,
        };
        let sink_a: &dyn Destination = match &dry_a {
            Some(d) => d,
            None => self.sink_a,
        };

        self.enter(RunStage::PullA);
        let (households, people) = pull_both(self.source_a, cursor_a.as_ref())?;
        let forward = self.reconcile_direction(
            households,
            people,
            cursor_a.as_ref(),
            sink_b,
            [RunStage::ReconcileHouseholdsAToB, RunStage::ReconcilePeopleAToB],
        )?;

        self.enter(RunStage::PullB);
        let (households, people) = pull_both(self.source_b, cursor_b.as_ref())?;
        let reverse = if self.settings.reverse.is_enabled() {
            self.reconcile_direction(
                households,
                people,
                cursor_b.as_ref(),
                sink_a,
                [RunStage::ReconcileHouseholdsBToA, RunStage::ReconcilePeopleBToA],
            )?
        } else {
            DirectionOutcome {
                report: DirectionReport {
                    households: KindReport::from_pull(&households),
                    people: KindReport::from_pull(&people),
                    ..DirectionReport::default()
                },
                advance: Advance::RunStart,
            }
        };

        self.enter(RunStage::CommitCursors);
        let mut a_to_b = forward.report;
        let mut b_to_a = reverse.report;
        let next_a = next_cursor(cursor_a.as_ref(), &forward.advance, started_at);
        let next_b = next_cursor(cursor_b.as_ref(), &reverse.advance, started_at);
        if !dry {
            if let Some(next) = &next_a {
                self.cursors.set(CursorName::SourceA, next)?;
            }
            if let Some(next) = &next_b {
                self.cursors.set(CursorName::SourceB, next)?;
            }
        }
        if forward.advance != Advance::RunStart || reverse.advance != Advance::RunStart {
            warn!(
                a = ?forward.advance,
                b = ?reverse.advance,
                "guardrail deferred records; cursor held at watermark"
            );
        }
        a_to_b.cursor_after = next_a.or_else(|| cursor_a.clone());
        b_to_a.cursor_after = next_b.or_else(|| cursor_b.clone());
        a_to_b.cursor_before = cursor_a;
        b_to_a.cursor_before = cursor_b;

        let mut planned = Vec::new();
        for wrapper in [dry_b, dry_a].into_iter().flatten() {
            planned.extend(wrapper.into_planned());
        }

        self.enter(RunStage::Done);
        let report = RunReport {
            started_at,
            mode: self.settings.mode,
            a_to_b,
            b_to_a,
            cursors_committed: !dry,
            planned,
            duration_ms: u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        log_summary(&report);
        Ok(report)
    }

    /// Households first, then people resolved against the households now
    /// known to exist in `sink`. People whose household was deferred wait
    /// for it, so a deferral never reaches the destination as a clear.
    fn reconcile_direction(
        &mut self,
        households: Pulled<CanonicalHousehold>,
        people: Pulled<CanonicalPerson>,
        since: Option<&Cursor>,
        sink: &dyn Destination,
        stages: [RunStage; 2],
    ) -> Result<DirectionOutcome, SyncError> {
        let limit = self.settings.max_per_run;
        let households = resume_order(households, EntityKind::Household, since);
        let people = resume_order(people, EntityKind::Person, since);
        let mut report = DirectionReport {
            reconciled: true,
            households: KindReport::from_pull(&households),
            people: KindReport::from_pull(&people),
            ..DirectionReport::default()
        };

        self.enter(stages[0]);
        let household_batch = truncate(households.records, limit);
        report.households.processed = household_batch.processing.len();
        report.households.deferred = household_batch.deferred.len();
        let desired = household_batch
            .processing
            .iter()
            .map(|s| sink.desired_household(&s.record))
            .collect();
        let pushed = push(sink, EntityKind::Household, desired)?;
        report.households.record(&pushed.plan);

        let mut index = DestinationIndex::default();
        index.absorb_existing(&pushed.existing);
        index.absorb_outcomes(&pushed.outcomes);

        self.enter(stages[1]);
        let people_batch = truncate(people.records, limit);
        let waiting: HashSet<&str> = household_batch
            .deferred
            .iter()
            .map(|s| s.record.natural_key())
            .collect();
        let ready = |s: &Stamped<CanonicalPerson>| {
            s.record
                .household_id
                .as_ref()
                .map_or(true, |h| !waiting.contains(h.0.as_str()))
        };
        let processing: Vec<&Stamped<CanonicalPerson>> =
            people_batch.processing.iter().filter(|s| ready(*s)).collect();
        let held = people_batch.processing.len() - processing.len();
        if held > 0 {
            debug!(
                system = sink.system(),
                held, "people held back until their deferred household is written"
            );
        }
        report.people.processed = processing.len();
        report.people.deferred = people_batch.deferred.len() + held;

        let missing = index.missing(
            processing
                .iter()
                .filter_map(|s| s.record.household_id.as_ref().map(|h| h.0.as_str())),
        );
        if !missing.is_empty() {
            let found = sink.lookup(EntityKind::Household, &missing)?;
            index.absorb_existing(&found);
        }

        let clears = sink.profile(EntityKind::Person).clear_relations;
        let desired = processing
            .iter()
            .map(|s| {
                let person = &s.record;
                let link = match &person.household_id {
                    Some(key) => match index.resolve(&key.0) {
                        Some(id) => HouseholdLink::Linked(id),
                        None => {
                            warn!(
                                system = sink.system(),
                                person = %person.person_id,
                                household = %key,
                                cleared = clears,
                                "household not found in destination"
                            );
                            unlinked(clears)
                        }
                    },
                    None => unlinked(clears),
                };
                sink.desired_person(person, link)
            })
            .collect();
        let pushed = push(sink, EntityKind::Person, desired)?;
        report.people.record(&pushed.plan);

        let advance = advance_from(&[
            (
                EntityKind::Household,
                resume_point(
                    household_batch
                        .processing
                        .iter()
                        .map(|s| (s, true))
                        .chain(household_batch.deferred.iter().map(|s| (s, false))),
                    EntityKind::Household,
                    since,
                ),
            ),
            (
                EntityKind::Person,
                resume_point(
                    people_batch
                        .processing
                        .iter()
                        .map(|s| (s, ready(s)))
                        .chain(people_batch.deferred.iter().map(|s| (s, false))),
                    EntityKind::Person,
                    since,
                ),
            ),
        ]);
        Ok(DirectionOutcome { report, advance })
    }
}

/// Relation for a person with no resolvable household.
fn unlinked(clears: bool) -> HouseholdLink<'static> {
    if clears {
        HouseholdLink::Cleared
    } else {
        HouseholdLink::Untouched
    }
}

/// Pull households and people of one source concurrently.
fn pull_both(
    source: &dyn Source,
    since: Option<&Cursor>,
) -> Result<(Pulled<CanonicalHousehold>, Pulled<CanonicalPerson>), SyncError> {
    std::thread::scope(|scope| -> Result<_, SyncError> {
        let households = scope.spawn(|| source.pull_households(since));
        let people = source.pull_people(since);
        let households = households
            .join()
            .map_err(|_| SyncError::Worker("household pull"))?;
        let (households, people) = (households?, people?);
        info!(
            system = source.system(),
            households = households.records.len(),
            people = people.records.len(),
            rejected = households.rejected.len() + people.rejected.len(),
            "pulled"
        );
        Ok((households, people))
    })
}

fn log_summary(report: &RunReport) {
    let (a, b) = (&report.a_to_b, &report.b_to_a);
    info!(
        mode = ?report.mode,
        duration_ms = report.duration_ms,
        a_to_b_households_created = a.households.created,
        a_to_b_households_updated = a.households.updated,
        a_to_b_people_created = a.people.created,
        a_to_b_people_updated = a.people.updated,
        a_to_b_skipped = a.households.skipped + a.people.skipped,
        a_to_b_deferred = a.households.deferred + a.people.deferred,
        b_to_a_reconciled = b.reconciled,
        b_to_a_updated = b.households.updated + b.people.updated,
        b_to_a_refused = b.households.refused + b.people.refused,
        rejected = a.households.rejected + a.people.rejected + b.households.rejected + b.people.rejected,
        cursors_committed = report.cursors_committed,
        "sync run complete"
    );
}
