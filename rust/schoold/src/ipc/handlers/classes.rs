use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{class_exists, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           (SELECT COUNT(*) FROM pupils p WHERE p.class_id = c.id) AS pupil_count,
           (SELECT COUNT(*) FROM pupils p
              WHERE p.class_id = c.id AND p.status = 'active') AS active_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let pupil_count: i64 = row.get(2)?;
            let active_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "pupilCount": pupil_count,
                "activePupilCount": active_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "classes" }))
    })?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_rename(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    // Snapshots keep the name they captured.
    conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &class_id))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    let placed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pupils WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if placed > 0 {
        return Err(HandlerErr::bad_params("class still has pupils; move them first")
            .with_details(json!({ "pupilCount": placed })));
    }
    conn.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "classes" }))
        })?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(with_db(state, req, classes_create)),
        "classes.rename" => Some(with_db(state, req, classes_rename)),
        "classes.delete" => Some(with_db(state, req, classes_delete)),
        _ => None,
    }
}
