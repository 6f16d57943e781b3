use crate::clock::{Clock, DaemonClock};
use crate::ipc::helpers::{get_required_str, with_db, with_db_clock, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::resolver::resolve_term_status;
use crate::store::{parse_date, AcademicYearStore, SqliteStore};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse_date(&raw).map_err(|e| HandlerErr::bad_params(format!("{}: {:#}", key, e)))
}

fn years_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               y.id, y.name, y.start_date, y.end_date,
               (SELECT COUNT(*) FROM terms t WHERE t.academic_year_id = y.id) AS term_count
             FROM academic_years y
             ORDER BY y.start_date DESC",
        )
        .map_err(HandlerErr::query)?;
    let years = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "termCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "academicYears": years }))
}

fn years_get(conn: &Connection, clock: &DaemonClock, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = get_required_str(params, "academicYearId")?;
    let year = SqliteStore::new(conn)
        .get_academic_year(&year_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("academic year not found"))?;
    let now = clock.now();
    let statuses: Vec<Value> = year
        .terms
        .iter()
        .map(|t| json!({ "termId": t.id, "status": resolve_term_status(t, now) }))
        .collect();
    Ok(json!({
        "academicYear": year,
        "termStatuses": statuses,
        "evaluatedAt": now.to_rfc3339(),
    }))
}

fn years_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    if start > end {
        return Err(HandlerErr::bad_params("startDate must not be after endDate"));
    }
    let year_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&year_id, &name, start.to_string(), end.to_string()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "academic_years" }))
    })?;
    Ok(json!({ "academicYearId": year_id }))
}

fn years_add_term(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = get_required_str(params, "academicYearId")?;
    let name = get_required_str(params, "name")?;
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    if start > end {
        return Err(HandlerErr::bad_params("startDate must not be after endDate"));
    }

    let year = SqliteStore::new(conn)
        .get_academic_year(&year_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("academic year not found"))?;
    if start < year.start_date || end > year.end_date {
        return Err(HandlerErr::bad_params("term must lie within its academic year")
            .with_details(json!({
                "yearStartDate": year.start_date.to_string(),
                "yearEndDate": year.end_date.to_string(),
            })));
    }
    if let Some(clash) = year.terms.iter().find(|t| start <= t.end_date && t.start_date <= end) {
        return Err(HandlerErr::bad_params("term overlaps an existing term")
            .with_details(json!({ "termId": clash.id })));
    }

    let sort_order = year.terms.iter().map(|t| t.sort_order + 1).max().unwrap_or(0);
    let term_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, academic_year_id, name, start_date, end_date, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        rusqlite::params![term_id, year_id, name, start.to_string(), end.to_string(), sort_order],
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "terms" }))
    })?;
    Ok(json!({ "termId": term_id, "sortOrder": sort_order }))
}

fn years_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = get_required_str(params, "academicYearId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM academic_years WHERE id = ?",
            [&year_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("academic year not found"));
    }
    let held: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pupil_term_snapshots s
             JOIN terms t ON t.id = s.term_id
             WHERE t.academic_year_id = ?",
            [&year_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if held > 0 {
        return Err(HandlerErr::bad_params("academic year has snapshots and cannot be deleted")
            .with_details(json!({ "snapshotCount": held })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM terms WHERE academic_year_id = ?", [&year_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": "terms" }))
        })?;
    tx.execute("DELETE FROM academic_years WHERE id = ?", [&year_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "academic_years" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.list" => Some(with_db(state, req, years_list)),
        "years.get" => Some(with_db_clock(state, req, years_get)),
        "years.create" => Some(with_db(state, req, years_create)),
        "years.addTerm" => Some(with_db(state, req, years_add_term)),
        "years.delete" => Some(with_db(state, req, years_delete)),
        _ => None,
    }
}
