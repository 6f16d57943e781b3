use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "schoold.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(workspace.join(DB_FILE_NAME))?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates (or migrates) every table the sidecar uses. Split out of
/// `open_db` so unit tests can run against `Connection::open_in_memory`.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pupils(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            section TEXT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            admission_number TEXT,
            gender TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            family_id TEXT,
            guardians_json TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_pupils_photo_url(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupils_class ON pupils(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupils_family ON pupils(family_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_year ON terms(academic_year_id, sort_order)",
        [],
    )?;

    // class_name is copied rather than joined: a renamed class must not
    // rewrite history.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pupil_term_snapshots(
            id TEXT PRIMARY KEY,
            pupil_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            class_name TEXT,
            section TEXT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            admission_number TEXT,
            captured_at TEXT NOT NULL,
            FOREIGN KEY(pupil_id) REFERENCES pupils(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(pupil_id, term_id)
        )",
        [],
    )?;
    ensure_snapshots_fingerprint(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_term ON pupil_term_snapshots(term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_pupil ON pupil_term_snapshots(pupil_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_pupils_photo_url(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "pupils", "photo_url")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE pupils ADD COLUMN photo_url TEXT", [])?;
    Ok(())
}

fn ensure_snapshots_fingerprint(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "pupil_term_snapshots", "fingerprint")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE pupil_term_snapshots ADD COLUMN fingerprint TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
