use crate::model::{
    AcademicYear, Guardian, Pupil, PupilFilter, PupilStatus, PupilTermSnapshot, Term,
};
use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

pub trait PupilStore {
    fn get_pupil_by_id(&self, id: &str) -> anyhow::Result<Option<Pupil>>;
    fn list_pupils(&self, filter: &PupilFilter) -> anyhow::Result<Vec<Pupil>>;
}

pub trait SnapshotStore {
    fn get_snapshot(
        &self,
        pupil_id: &str,
        term_id: &str,
    ) -> anyhow::Result<Option<PupilTermSnapshot>>;

    /// Create-if-absent. Returns the row that is stored for the pair after
    /// the call, which is `snapshot` only if nobody wrote first.
    fn put_snapshot(&self, snapshot: &PupilTermSnapshot) -> anyhow::Result<PupilTermSnapshot>;

    /// Overwrites the stored row for the pair, inserting if missing.
    fn replace_snapshot(&self, snapshot: &PupilTermSnapshot) -> anyhow::Result<()>;

    fn list_snapshots_for_term(&self, term_id: &str) -> anyhow::Result<Vec<PupilTermSnapshot>>;
}

pub trait AcademicYearStore {
    fn get_academic_year(&self, id: &str) -> anyhow::Result<Option<AcademicYear>>;
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

const PUPIL_COLUMNS: &str = "p.id, p.first_name, p.last_name, p.admission_number, p.gender,
     p.class_id, c.name, p.section, p.status, p.family_id, p.guardians_json,
     p.photo_url, p.updated_at";

fn pupil_from_row(r: &Row<'_>) -> rusqlite::Result<(Pupil, String, String)> {
    let status_raw: String = r.get(8)?;
    let guardians_raw: String = r.get(10)?;
    Ok((
        Pupil {
            id: r.get(0)?,
            first_name: r.get(1)?,
            last_name: r.get(2)?,
            admission_number: r.get(3)?,
            gender: r.get(4)?,
            class_id: r.get(5)?,
            class_name: r.get(6)?,
            section: r.get(7)?,
            status: PupilStatus::Active,
            family_id: r.get(9)?,
            guardians: Vec::new(),
            photo_url: r.get(11)?,
            updated_at: r.get(12)?,
        },
        status_raw,
        guardians_raw,
    ))
}

fn finish_pupil((mut p, status_raw, guardians_raw): (Pupil, String, String)) -> anyhow::Result<Pupil> {
    p.status = PupilStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("pupil {} has unknown status {:?}", p.id, status_raw))?;
    p.guardians = serde_json::from_str::<Vec<Guardian>>(&guardians_raw)
        .with_context(|| format!("pupil {} has malformed guardians", p.id))?;
    Ok(p)
}

impl PupilStore for SqliteStore<'_> {
    fn get_pupil_by_id(&self, id: &str) -> anyhow::Result<Option<Pupil>> {
        let sql = format!(
            "SELECT {} FROM pupils p LEFT JOIN classes c ON c.id = p.class_id WHERE p.id = ?",
            PUPIL_COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, [id], pupil_from_row)
            .optional()
            .context("failed to load pupil")?;
        raw.map(finish_pupil).transpose()
    }

    fn list_pupils(&self, filter: &PupilFilter) -> anyhow::Result<Vec<Pupil>> {
        let mut sql = format!(
            "SELECT {} FROM pupils p LEFT JOIN classes c ON c.id = p.class_id WHERE 1 = 1",
            PUPIL_COLUMNS
        );
        let mut bind: Vec<Value> = Vec::new();
        if let Some(class_id) = &filter.class_id {
            sql.push_str(" AND p.class_id = ?");
            bind.push(Value::Text(class_id.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND p.status = ?");
            bind.push(Value::Text(status.as_str().to_string()));
        } else if !filter.include_inactive {
            sql.push_str(" AND p.status = 'active'");
        }
        sql.push_str(" ORDER BY p.last_name, p.first_name, p.id");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare pupil list")?;
        let raw = stmt
            .query_map(params_from_iter(bind), pupil_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list pupils")?;
        raw.into_iter().map(finish_pupil).collect()
    }
}

const SNAPSHOT_COLUMNS: &str = "id, pupil_id, term_id, academic_year_id, class_id, class_name,
     section, first_name, last_name, admission_number, fingerprint, captured_at";

fn snapshot_from_row(r: &Row<'_>) -> rusqlite::Result<PupilTermSnapshot> {
    let captured_raw: String = r.get(11)?;
    let captured_at = DateTime::parse_from_rfc3339(&captured_raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(PupilTermSnapshot {
        id: r.get(0)?,
        pupil_id: r.get(1)?,
        term_id: r.get(2)?,
        academic_year_id: r.get(3)?,
        class_id: r.get(4)?,
        class_name: r.get(5)?,
        section: r.get(6)?,
        first_name: r.get(7)?,
        last_name: r.get(8)?,
        admission_number: r.get(9)?,
        fingerprint: r.get(10)?,
        captured_at,
    })
}

impl SnapshotStore for SqliteStore<'_> {
    fn get_snapshot(
        &self,
        pupil_id: &str,
        term_id: &str,
    ) -> anyhow::Result<Option<PupilTermSnapshot>> {
        let sql = format!(
            "SELECT {} FROM pupil_term_snapshots WHERE pupil_id = ? AND term_id = ?",
            SNAPSHOT_COLUMNS
        );
        self.conn
            .query_row(&sql, (pupil_id, term_id), snapshot_from_row)
            .optional()
            .context("failed to load snapshot")
    }

    fn put_snapshot(&self, s: &PupilTermSnapshot) -> anyhow::Result<PupilTermSnapshot> {
        self.conn
            .execute(
                "INSERT INTO pupil_term_snapshots(
                   id, pupil_id, term_id, academic_year_id, class_id, class_name,
                   section, first_name, last_name, admission_number, fingerprint, captured_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(pupil_id, term_id) DO NOTHING",
                rusqlite::params![
                    s.id,
                    s.pupil_id,
                    s.term_id,
                    s.academic_year_id,
                    s.class_id,
                    s.class_name,
                    s.section,
                    s.first_name,
                    s.last_name,
                    s.admission_number,
                    s.fingerprint,
                    s.captured_at.to_rfc3339(),
                ],
            )
            .context("failed to insert snapshot")?;
        self.get_snapshot(&s.pupil_id, &s.term_id)?
            .ok_or_else(|| anyhow!("snapshot vanished after insert"))
    }

    fn replace_snapshot(&self, s: &PupilTermSnapshot) -> anyhow::Result<()> {
        // The pair keeps its original id across regenerations.
        self.conn
            .execute(
                "INSERT INTO pupil_term_snapshots(
                   id, pupil_id, term_id, academic_year_id, class_id, class_name,
                   section, first_name, last_name, admission_number, fingerprint, captured_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(pupil_id, term_id) DO UPDATE SET
                   academic_year_id = excluded.academic_year_id,
                   class_id = excluded.class_id,
                   class_name = excluded.class_name,
                   section = excluded.section,
                   first_name = excluded.first_name,
                   last_name = excluded.last_name,
                   admission_number = excluded.admission_number,
                   fingerprint = excluded.fingerprint,
                   captured_at = excluded.captured_at",
                rusqlite::params![
                    s.id,
                    s.pupil_id,
                    s.term_id,
                    s.academic_year_id,
                    s.class_id,
                    s.class_name,
                    s.section,
                    s.first_name,
                    s.last_name,
                    s.admission_number,
                    s.fingerprint,
                    s.captured_at.to_rfc3339(),
                ],
            )
            .context("failed to replace snapshot")?;
        Ok(())
    }

    fn list_snapshots_for_term(&self, term_id: &str) -> anyhow::Result<Vec<PupilTermSnapshot>> {
        let sql = format!(
            "SELECT {} FROM pupil_term_snapshots WHERE term_id = ?
             ORDER BY last_name, first_name, pupil_id",
            SNAPSHOT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([term_id], snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list snapshots")?;
        Ok(rows)
    }
}

pub fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date {:?} (expected YYYY-MM-DD)", raw))
}

impl AcademicYearStore for SqliteStore<'_> {
    fn get_academic_year(&self, id: &str) -> anyhow::Result<Option<AcademicYear>> {
        let head: Option<(String, String, String, String)> = self
            .conn
            .query_row(
                "SELECT id, name, start_date, end_date FROM academic_years WHERE id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .context("failed to load academic year")?;
        let Some((year_id, name, start, end)) = head else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT id, name, start_date, end_date, sort_order
             FROM terms
             WHERE academic_year_id = ?
             ORDER BY sort_order, start_date",
        )?;
        let raw_terms = stmt
            .query_map([&year_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to load terms")?;

        let mut terms = Vec::with_capacity(raw_terms.len());
        for (tid, tname, ts, te, order) in raw_terms {
            terms.push(Term {
                id: tid,
                academic_year_id: year_id.clone(),
                name: tname,
                start_date: parse_date(&ts)?,
                end_date: parse_date(&te)?,
                sort_order: order,
            });
        }

        Ok(Some(AcademicYear {
            id: year_id,
            name,
            start_date: parse_date(&start)?,
            end_date: parse_date(&end)?,
            terms,
        }))
    }
}
