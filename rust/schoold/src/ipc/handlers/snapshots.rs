use crate::clock::DaemonClock;
use crate::ipc::handlers::pupils::parse_filter;
use crate::ipc::handlers::setup::{load_section, SetupSection};
use crate::ipc::helpers::{
    get_required_str, load_academic_year, with_db, with_db_clock, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::resolver::{ResolveError, SnapshotResolver};
use crate::store::{PupilStore, SnapshotStore, SqliteStore};
use rusqlite::Connection;
use serde_json::{json, Value};

fn snapshots_term_status(
    conn: &Connection,
    clock: &DaemonClock,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let year = load_academic_year(conn, params)?;
    let term_id = get_required_str(params, "termId")?;
    let term = year.term(&term_id).ok_or_else(|| ResolveError::NotFound {
        entity: "term",
        id: term_id.clone(),
    })?;
    let store = SqliteStore::new(conn);
    let status = SnapshotResolver::new(&store, clock).term_status(term);
    Ok(json!({
        "termId": term.id,
        "academicYearId": year.id,
        "status": status,
        "startDate": term.start_date.to_string(),
        "endDate": term.end_date.to_string(),
    }))
}

fn snapshots_get_or_create(
    conn: &Connection,
    clock: &DaemonClock,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let pupil_id = get_required_str(params, "pupilId")?;
    let term_id = get_required_str(params, "termId")?;
    let year = load_academic_year(conn, params)?;
    let store = SqliteStore::new(conn);
    let resolver = SnapshotResolver::new(&store, clock);

    let pupil = resolver.load_pupil(&pupil_id)?;
    let (snapshot, view) = resolver.resolve_pupil(&pupil, &term_id, &year)?;
    Ok(json!({
        "snapshot": snapshot,
        "isVirtual": snapshot.is_virtual(),
        "pupil": view,
    }))
}

fn snapshots_list_for_term(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let year = load_academic_year(conn, params)?;
    if year.term(&term_id).is_none() {
        return Err(ResolveError::NotFound {
            entity: "term",
            id: term_id,
        }
        .into());
    }
    let snapshots = SqliteStore::new(conn)
        .list_snapshots_for_term(&term_id)
        .map_err(|e| HandlerErr::from(ResolveError::storage(e)))?;
    Ok(json!({ "termId": term_id, "snapshots": snapshots }))
}

fn snapshots_regenerate(
    conn: &Connection,
    clock: &DaemonClock,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let pupil_id = get_required_str(params, "pupilId")?;
    let term_id = get_required_str(params, "termId")?;
    let year = load_academic_year(conn, params)?;
    let store = SqliteStore::new(conn);
    let resolver = SnapshotResolver::new(&store, clock);

    let pupil = resolver.load_pupil(&pupil_id)?;
    let regenerated = resolver.regenerate_snapshot(&pupil, &term_id, &year)?;
    Ok(json!(regenerated))
}

fn snapshots_capture_term(
    conn: &Connection,
    clock: &DaemonClock,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let year = load_academic_year(conn, params)?;
    let mut filter = parse_filter(params)?;
    if params.get("includeInactive").map_or(true, Value::is_null) {
        filter.include_inactive = load_section(conn, SetupSection::Snapshots)
            .map_err(HandlerErr::query)?
            .get("captureIncludeInactive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
    }
    let store = SqliteStore::new(conn);
    let resolver = SnapshotResolver::new(&store, clock);

    let pupils = store
        .list_pupils(&filter)
        .map_err(|e| HandlerErr::from(ResolveError::storage(e)))?;
    let summary = resolver.capture_term(&pupils, &term_id, &year)?;
    Ok(json!({
        "termId": term_id,
        "created": summary.created,
        "existing": summary.existing,
        "unresolved": summary.unresolved,
        "partial": !summary.unresolved.is_empty(),
    }))
}

fn pupils_list_for_term(
    conn: &Connection,
    clock: &DaemonClock,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let year = load_academic_year(conn, params)?;
    let filter = parse_filter(params)?;
    let store = SqliteStore::new(conn);
    let resolver = SnapshotResolver::new(&store, clock);

    let batch = resolver.list_pupils_for_term(&filter, &term_id, &year)?;
    Ok(json!({
        "termId": term_id,
        "termStatus": batch.term_status,
        "partial": batch.is_partial(),
        "pupils": batch.pupils,
        "unresolved": batch.unresolved,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "snapshots.termStatus" => Some(with_db_clock(state, req, snapshots_term_status)),
        "snapshots.getOrCreate" => Some(with_db_clock(state, req, snapshots_get_or_create)),
        "snapshots.listForTerm" => Some(with_db(state, req, snapshots_list_for_term)),
        "snapshots.regenerate" => Some(with_db_clock(state, req, snapshots_regenerate)),
        "snapshots.captureTerm" => Some(with_db_clock(state, req, snapshots_capture_term)),
        "pupils.listForTerm" => Some(with_db_clock(state, req, pupils_list_for_term)),
        _ => None,
    }
}
