use crate::db;
use crate::ipc::helpers::{with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
pub(crate) enum SetupSection {
    School,
    Snapshots,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "snapshots" => Some(Self::Snapshots),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => crate::ipc::helpers::SETUP_SCHOOL_KEY,
            Self::Snapshots => "setup.snapshots",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "schoolName": "",
            "currentAcademicYearId": null
        }),
        SetupSection::Snapshots => json!({
            "captureIncludeInactive": false
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    if s.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(s))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "schoolName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 160)?));
                }
                "currentAcademicYearId" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 64)?);
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Snapshots => match k.as_str() {
                "captureIncludeInactive" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown snapshots field: {}", k)),
            },
        }
    }
    Ok(())
}

pub(crate) fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values must not block the setup screen.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn setup_get(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let school = load_section(conn, SetupSection::School).map_err(HandlerErr::query)?;
    let snapshots = load_section(conn, SetupSection::Snapshots).map_err(HandlerErr::query)?;
    Ok(json!({
        "school": school,
        "snapshots": snapshots
    }))
}

fn setup_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let section_raw = params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing section"))?;
    let section = SetupSection::parse(section_raw)
        .ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch_obj = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let mut current = load_section(conn, section).map_err(HandlerErr::query)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;

    if let Some(year_id) = current.get("currentAcademicYearId").and_then(|v| v.as_str()) {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM academic_years WHERE id = ?",
                [year_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if found.is_none() {
            return Err(HandlerErr::not_found("academic year not found"));
        }
    }

    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true, section_raw: current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_db(state, req, setup_get)),
        "setup.update" => Some(with_db(state, req, setup_update)),
        _ => None,
    }
}
