use crate::ipc::helpers::{
    class_exists, get_optional_bool, get_optional_str, get_required_str, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Guardian, Pupil, PupilFilter, PupilStatus};
use crate::store::{PupilStore, SqliteStore};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub(crate) fn parse_filter(params: &Value) -> Result<PupilFilter, HandlerErr> {
    let status = match get_optional_str(params, "status")? {
        Some(s) => Some(
            PupilStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?,
        ),
        None => None,
    };
    Ok(PupilFilter {
        class_id: get_optional_str(params, "classId")?,
        status,
        include_inactive: get_optional_bool(params, "includeInactive", false)?,
    })
}

fn parse_guardians(v: &Value) -> Result<Vec<Guardian>, HandlerErr> {
    let guardians: Vec<Guardian> = serde_json::from_value(v.clone())
        .map_err(|e| HandlerErr::bad_params(format!("guardians: {}", e)))?;
    if guardians.iter().any(|g| g.name.trim().is_empty()) {
        return Err(HandlerErr::bad_params("guardian name must not be empty"));
    }
    Ok(guardians)
}

fn load_pupil(conn: &Connection, pupil_id: &str) -> Result<Pupil, HandlerErr> {
    SqliteStore::new(conn)
        .get_pupil_by_id(pupil_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("pupil not found"))
}

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn pupils_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filter = parse_filter(params)?;
    let pupils = SqliteStore::new(conn)
        .list_pupils(&filter)
        .map_err(HandlerErr::query)?;
    Ok(json!({ "pupils": pupils }))
}

fn pupils_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let pupil_id = get_required_str(params, "pupilId")?;
    Ok(json!({ "pupil": load_pupil(conn, &pupil_id)? }))
}

fn pupils_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    let status = match get_optional_str(params, "status")? {
        Some(s) => PupilStatus::parse(&s)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?,
        None => PupilStatus::Active,
    };
    let guardians = match params.get("guardians") {
        Some(v) if !v.is_null() => parse_guardians(v)?,
        _ => Vec::new(),
    };
    let guardians_json = serde_json::to_string(&guardians).map_err(HandlerErr::query)?;

    let pupil_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO pupils(id, class_id, section, first_name, last_name, admission_number,
           gender, status, family_id, guardians_json, photo_url, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            pupil_id,
            class_id,
            get_optional_str(params, "section")?,
            first_name,
            last_name,
            get_optional_str(params, "admissionNumber")?,
            get_optional_str(params, "gender")?,
            status.as_str(),
            get_optional_str(params, "familyId")?,
            guardians_json,
            get_optional_str(params, "photoUrl")?,
            now_stamp(),
        ],
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "pupils" }))
    })?;

    Ok(json!({ "pupilId": pupil_id }))
}

/// Patch semantics: only keys present in `patch` change. Moving `classId`
/// or `section` is how promotions and transfers land.
fn pupils_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let pupil_id = get_required_str(params, "pupilId")?;
    let patch_v = params.get("patch").unwrap_or(&Value::Null);
    let patch: &Map<String, Value> = patch_v
        .as_object()
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let mut p = load_pupil(conn, &pupil_id)?;

    for (k, v) in patch {
        match k.as_str() {
            "classId" => {
                let class_id = get_required_str(patch_v, k)?;
                if !class_exists(conn, &class_id)? {
                    return Err(HandlerErr::not_found("class not found"));
                }
                p.class_id = class_id;
            }
            "firstName" => p.first_name = get_required_str(patch_v, k)?,
            "lastName" => p.last_name = get_required_str(patch_v, k)?,
            "section" => p.section = get_optional_str(patch_v, k)?,
            "admissionNumber" => p.admission_number = get_optional_str(patch_v, k)?,
            "gender" => p.gender = get_optional_str(patch_v, k)?,
            "familyId" => p.family_id = get_optional_str(patch_v, k)?,
            "photoUrl" => p.photo_url = get_optional_str(patch_v, k)?,
            "status" => {
                let s = get_required_str(patch_v, k)?;
                p.status = PupilStatus::parse(&s)
                    .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?;
            }
            "guardians" => p.guardians = parse_guardians(v)?,
            _ => return Err(HandlerErr::bad_params(format!("unknown pupil field: {}", k))),
        }
    }

    let guardians_json = serde_json::to_string(&p.guardians).map_err(HandlerErr::query)?;
    conn.execute(
        "UPDATE pupils SET class_id = ?, section = ?, first_name = ?, last_name = ?,
           admission_number = ?, gender = ?, status = ?, family_id = ?, guardians_json = ?,
           photo_url = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            p.class_id,
            p.section,
            p.first_name,
            p.last_name,
            p.admission_number,
            p.gender,
            p.status.as_str(),
            p.family_id,
            guardians_json,
            p.photo_url,
            now_stamp(),
            pupil_id,
        ],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "pupil": load_pupil(conn, &pupil_id)? }))
}

fn pupils_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let pupil_id = get_required_str(params, "pupilId")?;
    load_pupil(conn, &pupil_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_snapshots = tx
        .execute("DELETE FROM pupil_term_snapshots WHERE pupil_id = ?", [&pupil_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "pupil_term_snapshots" }))
        })?;
    tx.execute("DELETE FROM pupils WHERE id = ?", [&pupil_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "pupils" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "removedSnapshots": removed_snapshots }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "pupils.list" => Some(with_db(state, req, pupils_list)),
        "pupils.get" => Some(with_db(state, req, pupils_get)),
        "pupils.create" => Some(with_db(state, req, pupils_create)),
        "pupils.update" => Some(with_db(state, req, pupils_update)),
        "pupils.delete" => Some(with_db(state, req, pupils_delete)),
        _ => None,
    }
}
