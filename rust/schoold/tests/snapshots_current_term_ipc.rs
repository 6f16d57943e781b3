use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar(fixed_now: &str) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .env("SCHOOLD_FIXED_NOW", fixed_now)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_at<'a>(v: &'a serde_json::Value, key: &str) -> &'a str {
    v.get(key).and_then(|x| x.as_str()).unwrap_or_default()
}

struct School {
    year_id: String,
    t3_id: String,
    future_year_id: String,
    future_term_id: String,
    pupil_id: String,
}

fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> School {
    let class = request_ok(stdin, reader, "s1", "classes.create", json!({ "name": "P4" }));
    let pupil = request_ok(
        stdin,
        reader,
        "s2",
        "pupils.create",
        json!({
            "classId": str_at(&class, "classId"),
            "firstName": "Amina",
            "lastName": "Okello",
            "section": "East"
        }),
    );
    let year = request_ok(
        stdin,
        reader,
        "s3",
        "years.create",
        json!({ "name": "2023", "startDate": "2023-02-01", "endDate": "2023-12-01" }),
    );
    let year_id = str_at(&year, "academicYearId").to_string();
    let t3 = request_ok(
        stdin,
        reader,
        "s4",
        "years.addTerm",
        json!({
            "academicYearId": year_id,
            "name": "Term 3",
            "startDate": "2023-09-11",
            "endDate": "2023-12-01"
        }),
    );
    let future_year = request_ok(
        stdin,
        reader,
        "s5",
        "years.create",
        json!({ "name": "2024", "startDate": "2024-02-05", "endDate": "2024-11-29" }),
    );
    let future_year_id = str_at(&future_year, "academicYearId").to_string();
    let future_term = request_ok(
        stdin,
        reader,
        "s6",
        "years.addTerm",
        json!({
            "academicYearId": future_year_id,
            "name": "Term 1",
            "startDate": "2024-02-05",
            "endDate": "2024-04-26"
        }),
    );
    School {
        year_id,
        t3_id: str_at(&t3, "termId").to_string(),
        future_year_id,
        future_term_id: str_at(&future_term, "termId").to_string(),
        pupil_id: str_at(&pupil, "pupilId").to_string(),
    }
}

#[test]
fn current_term_resolves_virtually_without_writes() {
    let workspace = temp_dir("schoold-current-term");
    let (mut child, mut stdin, mut reader) = spawn_sidecar("2023-10-02");
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "snapshots.getOrCreate",
        json!({
            "academicYearId": school.year_id,
            "termId": school.t3_id,
            "pupilId": school.pupil_id
        }),
    );
    assert_eq!(res["isVirtual"], json!(true));
    assert_eq!(
        str_at(&res["snapshot"], "id"),
        format!("virtual-{}-{}", school.pupil_id, school.t3_id)
    );
    assert_eq!(res["pupil"]["isHistorical"], json!(false));
    assert_eq!(str_at(&res["pupil"], "dataSource"), "live");
    assert_eq!(str_at(&res["pupil"], "className"), "P4");

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "snapshots.listForTerm",
        json!({ "academicYearId": school.year_id, "termId": school.t3_id }),
    );
    assert_eq!(stored["snapshots"], json!([]));

    // Regeneration is reserved for past terms.
    let regen = request(
        &mut stdin,
        &mut reader,
        "4",
        "snapshots.regenerate",
        json!({
            "academicYearId": school.year_id,
            "termId": school.t3_id,
            "pupilId": school.pupil_id
        }),
    );
    assert_eq!(regen["ok"], json!(false));
    assert_eq!(regen["error"]["code"], json!("bad_params"));

    // An explicit capture does freeze the current term.
    let capture = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "snapshots.captureTerm",
        json!({ "academicYearId": school.year_id, "termId": school.t3_id }),
    );
    assert_eq!(capture["created"], json!(1));
    assert_eq!(capture["existing"], json!(0));
    assert_eq!(capture["partial"], json!(false));

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "snapshots.getOrCreate",
        json!({
            "academicYearId": school.year_id,
            "termId": school.t3_id,
            "pupilId": school.pupil_id
        }),
    );
    assert_eq!(after["isVirtual"], json!(false));
    assert_eq!(str_at(&after["pupil"], "dataSource"), "snapshot");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn future_term_is_virtual_and_cannot_be_captured() {
    let workspace = temp_dir("schoold-future-term");
    let (mut child, mut stdin, mut reader) = spawn_sidecar("2023-10-02");
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let status = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "snapshots.termStatus",
        json!({ "academicYearId": school.future_year_id, "termId": school.future_term_id }),
    );
    assert_eq!(str_at(&status, "status"), "future");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "snapshots.getOrCreate",
        json!({
            "academicYearId": school.future_year_id,
            "termId": school.future_term_id,
            "pupilId": school.pupil_id
        }),
    );
    assert_eq!(res["isVirtual"], json!(true));
    assert_eq!(res["pupil"]["isHistorical"], json!(false));

    let capture = request(
        &mut stdin,
        &mut reader,
        "4",
        "snapshots.captureTerm",
        json!({ "academicYearId": school.future_year_id, "termId": school.future_term_id }),
    );
    assert_eq!(capture["ok"], json!(false));
    assert_eq!(capture["error"]["code"], json!("bad_params"));

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "snapshots.listForTerm",
        json!({ "academicYearId": school.future_year_id, "termId": school.future_term_id }),
    );
    assert_eq!(stored["snapshots"], json!([]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn term_status_follows_the_pinned_clock() {
    let workspace = temp_dir("schoold-term-clock");
    let (mut child, mut stdin, mut reader) = spawn_sidecar("2023-12-01T23:59:59Z");
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    // Last day of the term is still current.
    let status = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "snapshots.termStatus",
        json!({ "academicYearId": school.year_id, "termId": school.t3_id }),
    );
    assert_eq!(str_at(&status, "status"), "current");

    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(health["clockFixed"], json!(true));
    assert_eq!(str_at(&health, "now"), "2023-12-01T23:59:59+00:00");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
