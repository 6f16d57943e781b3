//! Live-vs-historical pupil placement.
//!
//! For any (pupil, term) pair the resolver serves either the pupil's live
//! attributes or a durable snapshot taken for that term:
//! - a stored snapshot always wins and is returned verbatim;
//! - current and future terms without one get a virtual snapshot built from
//!   live data, never persisted;
//! - past terms without one are backfilled from live data and persisted
//!   (create-if-absent), after which the stored row is authoritative.
//!
//! Storage failures are reported, never papered over with live data.

use crate::clock::Clock;
use crate::model::{
    AcademicYear, DataSource, Pupil, PupilFilter, PupilTermSnapshot, Term, TermStatus,
    VirtualPupil,
};
use crate::store::{PupilStore, SnapshotStore};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage unavailable: {0:#}")]
    StorageUnavailable(#[source] anyhow::Error),

    #[error("{0}")]
    BadRequest(String),
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::BadRequest(_) => "bad_params",
        }
    }

    /// Logs and wraps a store failure.
    pub fn storage(e: anyhow::Error) -> Self {
        error!("snapshot store failure: {:#}", e);
        Self::StorageUnavailable(e)
    }
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Calendar-day comparison in UTC, inclusive at both ends.
pub fn resolve_term_status(term: &Term, now: DateTime<Utc>) -> TermStatus {
    let today = now.date_naive();
    if today < term.start_date {
        TermStatus::Future
    } else if today > term.end_date {
        TermStatus::Past
    } else {
        TermStatus::Current
    }
}

/// Overlays the snapshot's placement fields on a copy of the live pupil.
/// Fields a snapshot does not capture (guardians, status, photo, ...) stay
/// live, as do optional captured fields that are empty on the snapshot.
pub fn create_virtual_pupil_from_snapshot(
    pupil: &Pupil,
    snapshot: &PupilTermSnapshot,
    status: TermStatus,
) -> VirtualPupil {
    let mut view = pupil.clone();
    view.class_id = snapshot.class_id.clone();
    view.class_name = snapshot
        .class_name
        .clone()
        .or_else(|| pupil.class_name.clone());
    view.section = snapshot.section.clone().or_else(|| pupil.section.clone());
    view.first_name = snapshot.first_name.clone();
    view.last_name = snapshot.last_name.clone();
    view.admission_number = snapshot
        .admission_number
        .clone()
        .or_else(|| pupil.admission_number.clone());

    VirtualPupil {
        pupil: view,
        is_historical: status == TermStatus::Past,
        data_source: if snapshot.is_virtual() {
            DataSource::Live
        } else {
            DataSource::Snapshot
        },
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedPupil {
    pub pupil_id: String,
    pub code: String,
    pub message: String,
}

impl UnresolvedPupil {
    fn from_error(pupil_id: &str, e: &ResolveError) -> Self {
        Self {
            pupil_id: pupil_id.to_string(),
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Result of a fan-out. `unresolved` non-empty means a partial batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResolution {
    pub term_status: TermStatus,
    pub pupils: Vec<VirtualPupil>,
    pub unresolved: Vec<UnresolvedPupil>,
}

impl BatchResolution {
    pub fn is_partial(&self) -> bool {
        !self.unresolved.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Regenerated {
    pub snapshot: PupilTermSnapshot,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSummary {
    pub created: usize,
    pub existing: usize,
    pub unresolved: Vec<UnresolvedPupil>,
}

pub struct SnapshotResolver<'a, S: ?Sized, C: ?Sized> {
    store: &'a S,
    clock: &'a C,
}

impl<'a, S, C> SnapshotResolver<'a, S, C>
where
    S: SnapshotStore + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a C) -> Self {
        Self { store, clock }
    }

    pub fn term_status(&self, term: &Term) -> TermStatus {
        resolve_term_status(term, self.clock.now())
    }

    /// Snapshot-only form of [`Self::resolve_pupil`]; the IPC layer always
    /// wants the view as well.
    #[allow(dead_code)]
    pub fn get_or_create_snapshot(
        &self,
        pupil: &Pupil,
        term_id: &str,
        year: &AcademicYear,
    ) -> ResolveResult<PupilTermSnapshot> {
        let term = find_term(year, term_id)?;
        self.snapshot_for_term(pupil, term, self.term_status(term))
            .map(|(snap, _)| snap)
    }

    /// Returns the snapshot and whether this call persisted it.
    fn snapshot_for_term(
        &self,
        pupil: &Pupil,
        term: &Term,
        status: TermStatus,
    ) -> ResolveResult<(PupilTermSnapshot, bool)> {
        if let Some(stored) = self
            .store
            .get_snapshot(&pupil.id, &term.id)
            .map_err(ResolveError::storage)?
        {
            return Ok((stored, false));
        }

        match status {
            TermStatus::Current | TermStatus::Future => Ok((
                PupilTermSnapshot::capture(
                    PupilTermSnapshot::virtual_id(&pupil.id, &term.id),
                    pupil,
                    term,
                    self.clock.now(),
                ),
                false,
            )),
            TermStatus::Past => self.persist_from_live(pupil, term),
        }
    }

    fn persist_from_live(
        &self,
        pupil: &Pupil,
        term: &Term,
    ) -> ResolveResult<(PupilTermSnapshot, bool)> {
        let fresh = PupilTermSnapshot::capture(
            Uuid::new_v4().to_string(),
            pupil,
            term,
            self.clock.now(),
        );
        let stored = self
            .store
            .put_snapshot(&fresh)
            .map_err(ResolveError::storage)?;
        let created = stored.id == fresh.id;
        if created {
            info!(
                "backfilled snapshot for pupil {} term {} from live placement (class {})",
                pupil.id, term.id, pupil.class_id
            );
        }
        Ok((stored, created))
    }

    /// get-or-create plus the virtual view, with the term status used for
    /// both evaluated once.
    pub fn resolve_pupil(
        &self,
        pupil: &Pupil,
        term_id: &str,
        year: &AcademicYear,
    ) -> ResolveResult<(PupilTermSnapshot, VirtualPupil)> {
        let term = find_term(year, term_id)?;
        let status = self.term_status(term);
        let (snap, _) = self.snapshot_for_term(pupil, term, status)?;
        let view = create_virtual_pupil_from_snapshot(pupil, &snap, status);
        Ok((snap, view))
    }

    /// Fans out over `pupils`, keeping input order. A pupil that cannot be
    /// resolved is reported in `unresolved` and left out of `pupils`.
    pub fn list_with_historical_accuracy(
        &self,
        pupils: &[Pupil],
        term_id: &str,
        year: &AcademicYear,
    ) -> ResolveResult<BatchResolution> {
        let term = find_term(year, term_id)?;
        let status = self.term_status(term);

        let mut out = BatchResolution {
            term_status: status,
            pupils: Vec::with_capacity(pupils.len()),
            unresolved: Vec::new(),
        };
        for pupil in pupils {
            match self.snapshot_for_term(pupil, term, status) {
                Ok((snap, _)) => out
                    .pupils
                    .push(create_virtual_pupil_from_snapshot(pupil, &snap, status)),
                Err(e) => {
                    warn!(
                        "pupil {} unresolved for term {}: {}",
                        pupil.id, term.id, e
                    );
                    out.unresolved.push(UnresolvedPupil::from_error(&pupil.id, &e));
                }
            }
        }
        Ok(out)
    }

    /// Replaces the stored snapshot with the pupil's current placement.
    /// Only past terms hold durable snapshots, so only they regenerate.
    pub fn regenerate_snapshot(
        &self,
        pupil: &Pupil,
        term_id: &str,
        year: &AcademicYear,
    ) -> ResolveResult<Regenerated> {
        let term = find_term(year, term_id)?;
        let status = self.term_status(term);
        if status != TermStatus::Past {
            return Err(ResolveError::BadRequest(format!(
                "term {} is {}; only past terms hold snapshots",
                term.id,
                status.as_str()
            )));
        }

        let previous = self
            .store
            .get_snapshot(&pupil.id, &term.id)
            .map_err(ResolveError::storage)?;
        let id = previous
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let next = PupilTermSnapshot::capture(id, pupil, term, self.clock.now());
        let changed = previous
            .as_ref()
            .map(|s| s.fingerprint != next.fingerprint)
            .unwrap_or(true);

        self.store
            .replace_snapshot(&next)
            .map_err(ResolveError::storage)?;
        info!(
            "regenerated snapshot for pupil {} term {} (changed: {})",
            pupil.id, term.id, changed
        );
        Ok(Regenerated {
            snapshot: next,
            changed,
        })
    }

    /// Freezes every listed pupil for a past or current term.
    pub fn capture_term(
        &self,
        pupils: &[Pupil],
        term_id: &str,
        year: &AcademicYear,
    ) -> ResolveResult<CaptureSummary> {
        let term = find_term(year, term_id)?;
        if self.term_status(term) == TermStatus::Future {
            return Err(ResolveError::BadRequest(format!(
                "term {} has not started; nothing to capture",
                term.id
            )));
        }

        let mut summary = CaptureSummary::default();
        for pupil in pupils {
            let existing = self
                .store
                .get_snapshot(&pupil.id, &term.id)
                .map_err(ResolveError::storage);
            let res = match existing {
                Ok(Some(_)) => Ok(false),
                Ok(None) => self.persist_from_live(pupil, term).map(|(_, created)| created),
                Err(e) => Err(e),
            };
            match res {
                Ok(true) => summary.created += 1,
                Ok(false) => summary.existing += 1,
                Err(e) => {
                    warn!("capture of pupil {} for term {} failed: {}", pupil.id, term.id, e);
                    summary
                        .unresolved
                        .push(UnresolvedPupil::from_error(&pupil.id, &e));
                }
            }
        }
        info!(
            "captured term {}: {} created, {} existing, {} unresolved",
            term.id,
            summary.created,
            summary.existing,
            summary.unresolved.len()
        );
        Ok(summary)
    }
}

impl<'a, S, C> SnapshotResolver<'a, S, C>
where
    S: SnapshotStore + PupilStore + ?Sized,
    C: Clock + ?Sized,
{
    pub fn list_pupils_for_term(
        &self,
        filter: &PupilFilter,
        term_id: &str,
        year: &AcademicYear,
    ) -> ResolveResult<BatchResolution> {
        let pupils = self
            .store
            .list_pupils(filter)
            .map_err(ResolveError::storage)?;
        self.list_with_historical_accuracy(&pupils, term_id, year)
    }

    pub fn load_pupil(&self, pupil_id: &str) -> ResolveResult<Pupil> {
        self.store
            .get_pupil_by_id(pupil_id)
            .map_err(ResolveError::storage)?
            .ok_or_else(|| ResolveError::NotFound {
                entity: "pupil",
                id: pupil_id.to_string(),
            })
    }
}

fn find_term<'y>(year: &'y AcademicYear, term_id: &str) -> ResolveResult<&'y Term> {
    year.term(term_id).ok_or_else(|| ResolveError::NotFound {
        entity: "term",
        id: term_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::fixtures::{pupil, year_2023};
    use crate::store::seed::{insert_pupil, insert_year, memory_db, move_pupil};
    use crate::store::SqliteStore;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, HashSet};

    /// In the middle of T3 2023: T1/T2 past, T3 current.
    fn during_t3() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2023, 10, 2, 9, 0, 0).unwrap())
    }

    #[derive(Default)]
    struct MemStore {
        rows: RefCell<HashMap<(String, String), PupilTermSnapshot>>,
        writes: Cell<usize>,
        reads: RefCell<Vec<String>>,
        fail_reads_for: HashSet<String>,
        offline: bool,
    }

    impl MemStore {
        fn with_row(self, s: PupilTermSnapshot) -> Self {
            self.rows
                .borrow_mut()
                .insert((s.pupil_id.clone(), s.term_id.clone()), s);
            self
        }
    }

    impl SnapshotStore for MemStore {
        fn get_snapshot(
            &self,
            pupil_id: &str,
            term_id: &str,
        ) -> anyhow::Result<Option<PupilTermSnapshot>> {
            if self.offline || self.fail_reads_for.contains(pupil_id) {
                return Err(anyhow!("connection reset"));
            }
            self.reads.borrow_mut().push(pupil_id.to_string());
            Ok(self
                .rows
                .borrow()
                .get(&(pupil_id.to_string(), term_id.to_string()))
                .cloned())
        }

        fn put_snapshot(&self, s: &PupilTermSnapshot) -> anyhow::Result<PupilTermSnapshot> {
            if self.offline {
                return Err(anyhow!("connection reset"));
            }
            self.writes.set(self.writes.get() + 1);
            let mut rows = self.rows.borrow_mut();
            Ok(rows
                .entry((s.pupil_id.clone(), s.term_id.clone()))
                .or_insert_with(|| s.clone())
                .clone())
        }

        fn replace_snapshot(&self, s: &PupilTermSnapshot) -> anyhow::Result<()> {
            self.writes.set(self.writes.get() + 1);
            self.rows
                .borrow_mut()
                .insert((s.pupil_id.clone(), s.term_id.clone()), s.clone());
            Ok(())
        }

        fn list_snapshots_for_term(&self, term_id: &str) -> anyhow::Result<Vec<PupilTermSnapshot>> {
            Ok(self
                .rows
                .borrow()
                .values()
                .filter(|s| s.term_id == term_id)
                .cloned()
                .collect())
        }
    }

    #[test]
    fn term_status_boundaries_are_inclusive() {
        let year = year_2023();
        let t2 = &year.terms[1];
        let at = |y, m, d, h| Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap();
        assert_eq!(resolve_term_status(t2, at(2023, 5, 21, 23)), TermStatus::Future);
        assert_eq!(resolve_term_status(t2, at(2023, 5, 22, 0)), TermStatus::Current);
        assert_eq!(resolve_term_status(t2, at(2023, 8, 18, 23)), TermStatus::Current);
        assert_eq!(resolve_term_status(t2, at(2023, 8, 19, 0)), TermStatus::Past);
    }

    #[test]
    fn term_status_is_deterministic_for_fixed_clock() {
        let year = year_2023();
        let store = MemStore::default();
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);
        for t in &year.terms {
            assert_eq!(r.term_status(t), r.term_status(t));
        }
        assert_eq!(r.term_status(&year.terms[0]), TermStatus::Past);
        assert_eq!(r.term_status(&year.terms[2]), TermStatus::Current);
    }

    #[test]
    fn past_term_with_stored_snapshot_wins_over_live() {
        let year = year_2023();
        let stored_from = pupil("p1", "c4", "P4");
        let stored = PupilTermSnapshot::capture("snap-1".into(), &stored_from, &year.terms[1], Utc::now());
        let store = MemStore::default().with_row(stored.clone());
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);

        let mut live = pupil("p1", "c5", "P5");
        live.section = Some("West".into());
        let got = r.get_or_create_snapshot(&live, "t2", &year).expect("resolve");
        assert_eq!(got, stored);

        let view = create_virtual_pupil_from_snapshot(&live, &got, TermStatus::Past);
        assert_eq!(view.pupil.class_name.as_deref(), Some("P4"));
        assert_eq!(view.pupil.class_id, "c4");
        assert_eq!(view.pupil.section.as_deref(), Some("East"));
        assert!(view.is_historical);
        assert_eq!(view.data_source, DataSource::Snapshot);
        assert_eq!(store.writes.get(), 0);
    }

    #[test]
    fn current_and_future_terms_are_virtual_and_never_written() {
        let mut year = year_2023();
        year.terms.push(Term {
            id: "t4".into(),
            academic_year_id: "y2023".into(),
            name: "T4".into(),
            start_date: crate::model::fixtures::date("2024-01-08"),
            end_date: crate::model::fixtures::date("2024-03-29"),
            sort_order: 3,
        });
        let store = MemStore::default();
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);
        let live = pupil("p1", "c5", "P5");

        for term_id in ["t3", "t4"] {
            let (snap, view) = r.resolve_pupil(&live, term_id, &year).expect("resolve");
            assert!(snap.is_virtual());
            assert_eq!(snap.id, format!("virtual-p1-{}", term_id));
            assert_eq!(snap.class_name.as_deref(), Some("P5"));
            assert_eq!(view.data_source, DataSource::Live);
            assert!(!view.is_historical);
            assert_eq!(view.pupil, live);
        }
        assert_eq!(store.writes.get(), 0);
        assert!(store.rows.borrow().is_empty());
    }

    #[test]
    fn past_term_backfill_is_written_once() {
        let year = year_2023();
        let store = MemStore::default();
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);
        let live = pupil("p1", "c5", "P5");

        let first = r.get_or_create_snapshot(&live, "t1", &year).expect("first");
        assert!(!first.is_virtual());
        assert_eq!(first.class_name.as_deref(), Some("P5"));
        assert_eq!(first.captured_at, clock.0);

        let second = r.get_or_create_snapshot(&live, "t1", &year).expect("second");
        assert_eq!(first, second);
        assert_eq!(store.writes.get(), 1);
        assert_eq!(store.rows.borrow().len(), 1);
    }

    #[test]
    fn durable_snapshot_survives_promotion() {
        let conn = memory_db();
        let year = year_2023();
        insert_year(&conn, &year);
        insert_pupil(&conn, &pupil("p1", "c4", "P4"));
        let store = SqliteStore::new(&conn);
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);

        let before = r.load_pupil("p1").expect("pupil");
        let snap = r.get_or_create_snapshot(&before, "t2", &year).expect("backfill");
        assert_eq!(snap.class_name.as_deref(), Some("P4"));

        move_pupil(&conn, "p1", "c5", "P5");
        let after = r.load_pupil("p1").expect("pupil");
        assert_eq!(after.class_name.as_deref(), Some("P5"));

        let again = r.get_or_create_snapshot(&after, "t2", &year).expect("read");
        assert_eq!(again, snap);
        let (_, view) = r.resolve_pupil(&after, "t2", &year).expect("view");
        assert_eq!(view.pupil.class_name.as_deref(), Some("P4"));
        assert_eq!(view.data_source, DataSource::Snapshot);

        // Current term follows the move.
        let (_, live_view) = r.resolve_pupil(&after, "t3", &year).expect("view");
        assert_eq!(live_view.pupil.class_name.as_deref(), Some("P5"));
    }

    #[test]
    fn concurrent_backfill_settles_on_first_stored_row() {
        let conn = memory_db();
        let year = year_2023();
        insert_year(&conn, &year);
        let p4 = pupil("p1", "c4", "P4");
        insert_pupil(&conn, &p4);
        let store = SqliteStore::new(&conn);
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);

        // Both callers saw "no snapshot" before either wrote.
        assert!(store.get_snapshot("p1", "t1").expect("get").is_none());
        let (a, a_created) = r.persist_from_live(&p4, &year.terms[0]).expect("a");
        let p5 = pupil("p1", "c5", "P5");
        let (b, b_created) = r.persist_from_live(&p5, &year.terms[0]).expect("b");

        assert!(a_created);
        assert!(!b_created);
        assert_eq!(a, b);
        let read = r.get_or_create_snapshot(&p5, "t1", &year).expect("read");
        assert_eq!(read, a);
        assert_eq!(read.class_name.as_deref(), Some("P4"));
    }

    #[test]
    fn batch_keeps_input_order() {
        let year = year_2023();
        let pupils = vec![pupil("c", "c4", "P4"), pupil("a", "c4", "P4"), pupil("b", "c5", "P5")];
        let stored = PupilTermSnapshot::capture("snap-a".into(), &pupil("a", "c3", "P3"), &year.terms[0], Utc::now());
        let store = MemStore::default().with_row(stored);
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);

        let out = r.list_with_historical_accuracy(&pupils, "t1", &year).expect("batch");
        let ids: Vec<&str> = out.pupils.iter().map(|v| v.pupil.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(out.pupils[1].pupil.class_name.as_deref(), Some("P3"));
        assert_eq!(out.term_status, TermStatus::Past);
        assert!(!out.is_partial());
        assert_eq!(*store.reads.borrow(), vec!["c", "a", "b"]);
    }

    #[test]
    fn batch_reports_failed_pupil_and_continues() {
        let year = year_2023();
        let pupils = vec![pupil("a", "c4", "P4"), pupil("b", "c4", "P4"), pupil("c", "c4", "P4")];
        let store = MemStore {
            fail_reads_for: ["b".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);

        let out = r.list_with_historical_accuracy(&pupils, "t1", &year).expect("batch");
        let ids: Vec<&str> = out.pupils.iter().map(|v| v.pupil.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(out.is_partial());
        assert_eq!(out.unresolved.len(), 1);
        assert_eq!(out.unresolved[0].pupil_id, "b");
        assert_eq!(out.unresolved[0].code, "storage_unavailable");
        // No live fallback was written for the failed pupil either.
        assert!(!store.rows.borrow().contains_key(&("b".to_string(), "t1".to_string())));
    }

    #[test]
    fn unknown_term_fails_the_whole_batch() {
        let year = year_2023();
        let store = MemStore::default();
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);
        let err = r
            .list_with_historical_accuracy(&[pupil("a", "c4", "P4")], "t9", &year)
            .expect_err("unknown term");
        assert!(matches!(err, ResolveError::NotFound { entity: "term", .. }));
    }

    #[test]
    fn storage_failure_is_not_replaced_by_live_data() {
        let year = year_2023();
        let store = MemStore {
            offline: true,
            ..Default::default()
        };
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);
        for term_id in ["t1", "t3"] {
            let err = r
                .get_or_create_snapshot(&pupil("a", "c4", "P4"), term_id, &year)
                .expect_err("offline");
            assert!(matches!(err, ResolveError::StorageUnavailable(_)));
            assert_eq!(err.code(), "storage_unavailable");
        }
    }

    #[test]
    fn snapshot_gaps_fall_back_to_live_fields() {
        let year = year_2023();
        let mut then = pupil("p1", "c4", "P4");
        then.section = None;
        then.admission_number = None;
        then.class_name = None;
        let snap = PupilTermSnapshot::capture("s".into(), &then, &year.terms[0], Utc::now());

        let live = pupil("p1", "c5", "P5");
        let view = create_virtual_pupil_from_snapshot(&live, &snap, TermStatus::Past);
        assert_eq!(view.pupil.class_id, "c4");
        assert_eq!(view.pupil.class_name.as_deref(), Some("P5"));
        assert_eq!(view.pupil.section.as_deref(), Some("East"));
        assert_eq!(view.pupil.admission_number.as_deref(), Some("ADM-p1"));
        assert_eq!(view.pupil.guardians, live.guardians);
        assert_eq!(view.pupil.photo_url, live.photo_url);
    }

    #[test]
    fn regenerate_reports_change_and_keeps_id() {
        let year = year_2023();
        let stored = PupilTermSnapshot::capture("snap-1".into(), &pupil("p1", "c4", "P4"), &year.terms[0], Utc::now());
        let store = MemStore::default().with_row(stored);
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);

        let same = r.regenerate_snapshot(&pupil("p1", "c4", "P4"), "t1", &year).expect("regen");
        assert!(!same.changed);
        assert_eq!(same.snapshot.id, "snap-1");

        let moved = r.regenerate_snapshot(&pupil("p1", "c5", "P5"), "t1", &year).expect("regen");
        assert!(moved.changed);
        assert_eq!(moved.snapshot.id, "snap-1");
        let read = r.get_or_create_snapshot(&pupil("p1", "c4", "P4"), "t1", &year).expect("read");
        assert_eq!(read.class_name.as_deref(), Some("P5"));

        let err = r
            .regenerate_snapshot(&pupil("p1", "c5", "P5"), "t3", &year)
            .expect_err("current term");
        assert!(matches!(err, ResolveError::BadRequest(_)));
    }

    #[test]
    fn capture_term_counts_created_and_existing() {
        let year = year_2023();
        let stored = PupilTermSnapshot::capture("snap-a".into(), &pupil("a", "c4", "P4"), &year.terms[2], Utc::now());
        let store = MemStore {
            fail_reads_for: ["c".to_string()].into_iter().collect(),
            ..Default::default()
        }
        .with_row(stored);
        let clock = during_t3();
        let r = SnapshotResolver::new(&store, &clock);

        let pupils = vec![pupil("a", "c4", "P4"), pupil("b", "c4", "P4"), pupil("c", "c4", "P4")];
        let summary = r.capture_term(&pupils, "t3", &year).expect("capture");
        assert_eq!(summary.created, 1);
        assert_eq!(summary.existing, 1);
        assert_eq!(summary.unresolved.len(), 1);
        assert_eq!(summary.unresolved[0].pupil_id, "c");

        // A captured current term now serves the durable row.
        let (snap, view) = r.resolve_pupil(&pupils[1], "t3", &year).expect("resolve");
        assert!(!snap.is_virtual());
        assert_eq!(view.data_source, DataSource::Snapshot);
        assert!(!view.is_historical);
    }

    #[test]
    fn capture_rejects_future_term() {
        let year = year_2023();
        let store = MemStore::default();
        let clock = FixedClock(Utc.with_ymd_and_hms(2023, 1, 10, 9, 0, 0).unwrap());
        let r = SnapshotResolver::new(&store, &clock);
        let err = r
            .capture_term(&[pupil("a", "c4", "P4")], "t1", &year)
            .expect_err("future");
        assert!(matches!(err, ResolveError::BadRequest(_)));
        assert_eq!(store.writes.get(), 0);
    }
}
