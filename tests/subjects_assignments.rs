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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        id,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn assignment_links_subject_teacher_and_class() {
    let workspace = temp_dir("schoold-assignments");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "SS 1A" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "lastName": "Nwosu", "firstName": "Grace", "email": "g.nwosu@example.edu" }),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "name": "Economics", "code": "eco" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.assign",
        json!({ "classId": class_id, "subjectId": subject_id, "teacherId": teacher_id }),
    );

    let for_class = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.forClass",
        json!({ "classId": class_id }),
    );
    let subjects = for_class["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 1);
    // Codes normalize to upper case on entry.
    assert_eq!(subjects[0]["code"].as_str(), Some("ECO"));
    assert_eq!(subjects[0]["teacherName"].as_str(), Some("Nwosu, Grace"));

    // Re-assigning the same subject swaps the teacher instead of duplicating.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.assign",
        json!({ "classId": class_id, "subjectId": subject_id }),
    );
    let for_class = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.forClass",
        json!({ "classId": class_id }),
    );
    let subjects = for_class["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 1);
    assert!(subjects[0]["teacherName"].is_null());

    // Deleting a teacher detaches them from assignments.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.assign",
        json!({ "classId": class_id, "subjectId": subject_id, "teacherId": teacher_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "teachers.delete",
        json!({ "teacherId": teacher_id }),
    );
    let for_class = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.forClass",
        json!({ "classId": class_id }),
    );
    assert!(for_class["subjects"][0]["teacherName"].is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "subjects.unassign",
        json!({ "classId": class_id, "subjectId": subject_id }),
    );
    let for_class = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "subjects.forClass",
        json!({ "classId": class_id }),
    );
    assert_eq!(for_class["subjects"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn marks_sheet_requires_an_assigned_subject() {
    let workspace = temp_dir("schoold-unassigned-sheet");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "SS 2A" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Geography", "code": "GEO" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.create",
        json!({ "name": "First Term Examination", "session": "2025/2026", "term": 1 }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "marks.sheetOpen",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "examId": exam_id,
            "cycle": "midterm"
        }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn exam_dates_validate_and_terms_clamp() {
    let workspace = temp_dir("schoold-exams");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "exams.create",
        json!({
            "name": "Mock Examination",
            "session": "2025/2026",
            "term": 2,
            "startsOn": "next tuesday"
        }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("bad_params"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.create",
        json!({
            "name": "Mock Examination",
            "session": "2025/2026",
            "term": 9,
            "startsOn": "2026-02-16"
        }),
    );
    let exam_id = created["examId"].as_str().expect("examId").to_string();

    let listed = request_ok(&mut stdin, &mut reader, "4", "exams.list", json!({}));
    let exams = listed["exams"].as_array().expect("exams");
    assert_eq!(exams.len(), 1);
    assert_eq!(exams[0]["term"].as_i64(), Some(3));
    assert_eq!(exams[0]["startsOn"].as_str(), Some("2026-02-16"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "exams.update",
        json!({ "examId": exam_id, "patch": { "startsOn": null, "term": 1 } }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "6", "exams.list", json!({}));
    let exams = listed["exams"].as_array().expect("exams");
    assert!(exams[0]["startsOn"].is_null());
    assert_eq!(exams[0]["term"].as_i64(), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
