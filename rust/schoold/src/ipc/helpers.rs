use crate::clock::DaemonClock;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::AcademicYear;
use crate::resolver::ResolveError;
use crate::store::{AcademicYearStore, SqliteStore};
use rusqlite::{Connection, OptionalExtension};

pub const SETUP_SCHOOL_KEY: &str = "setup.school";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<ResolveError> for HandlerErr {
    fn from(e: ResolveError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

pub fn require_db(conn: Option<&Connection>) -> Result<&Connection, HandlerErr> {
    conn.ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Absent and null both read as None; empty strings too.
pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()).filter(|s| !s.is_empty()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string or null", key))),
    }
}

pub fn get_optional_bool(
    params: &serde_json::Value,
    key: &str,
    default: bool,
) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

/// `academicYearId` from params, else the school's configured current year.
pub fn load_academic_year(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<AcademicYear, HandlerErr> {
    let year_id = match get_optional_str(params, "academicYearId")? {
        Some(id) => id,
        None => db::settings_get_json(conn, SETUP_SCHOOL_KEY)
            .map_err(HandlerErr::query)?
            .and_then(|v| {
                v.get("currentAcademicYearId")
                    .and_then(|x| x.as_str())
                    .map(|s| s.to_string())
            })
            .ok_or_else(|| {
                HandlerErr::bad_params(
                    "missing academicYearId and no current academic year is configured",
                )
            })?,
    };
    SqliteStore::new(conn)
        .get_academic_year(&year_id)
        .map_err(|e| HandlerErr::new("storage_unavailable", format!("{:#}", e)))?
        .ok_or_else(|| HandlerErr::not_found(format!("academic year not found: {}", year_id)))
}

pub type DbHandler = fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

/// Runs a handler that needs an open workspace and shapes its response.
pub fn with_db(state: &AppState, req: &Request, f: DbHandler) -> serde_json::Value {
    let res = require_db(state.db.as_ref()).and_then(|conn| f(conn, &req.params));
    match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub type ClockedHandler =
    fn(&Connection, &DaemonClock, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

pub fn with_db_clock(state: &AppState, req: &Request, f: ClockedHandler) -> serde_json::Value {
    let res = require_db(state.db.as_ref()).and_then(|conn| f(conn, &state.clock, &req.params));
    match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}
