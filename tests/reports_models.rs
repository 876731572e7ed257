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

fn request_ok(
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    class_id: String,
    exam_id: String,
    math_id: String,
    english_id: String,
    students: Vec<String>,
}

fn seed_results(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        stdin,
        reader,
        "setup-2",
        "classes.create",
        json!({ "name": "SS 3A" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    let mut students = Vec::new();
    for (i, (last, first)) in [("Adebayo", "Kemi"), ("Balogun", "Femi"), ("Chukwu", "Ada")]
        .iter()
        .enumerate()
    {
        let s = request_ok(
            stdin,
            reader,
            &format!("setup-s{}", i),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        );
        students.push(s["studentId"].as_str().expect("studentId").to_string());
    }

    let math = request_ok(
        stdin,
        reader,
        "setup-3",
        "subjects.create",
        json!({ "name": "Mathematics", "code": "MTH" }),
    );
    let math_id = math["subjectId"].as_str().expect("subjectId").to_string();
    let english = request_ok(
        stdin,
        reader,
        "setup-4",
        "subjects.create",
        json!({ "name": "English Language", "code": "ENG" }),
    );
    let english_id = english["subjectId"].as_str().expect("subjectId").to_string();
    for (i, sub) in [&math_id, &english_id].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("setup-a{}", i),
            "subjects.assign",
            json!({ "classId": class_id, "subjectId": sub }),
        );
    }

    let exam = request_ok(
        stdin,
        reader,
        "setup-5",
        "exams.create",
        json!({ "name": "Third Term Examination", "session": "2025/2026", "term": 3 }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();

    // Terminal percentages: Adebayo 85/75, Balogun 75/85, Chukwu 55/none.
    let _ = request_ok(
        stdin,
        reader,
        "setup-6",
        "marks.saveSheet",
        json!({
            "classId": class_id,
            "subjectId": math_id,
            "examId": exam_id,
            "cycle": "terminal",
            "rows": [
                { "studentId": students[0], "ca1": 20, "ca2": 15, "examScore": 50 },
                { "studentId": students[1], "ca1": 15, "ca2": 15, "examScore": 45 },
                { "studentId": students[2], "ca1": 10, "ca2": 10, "examScore": 35 }
            ]
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "setup-7",
        "marks.saveSheet",
        json!({
            "classId": class_id,
            "subjectId": english_id,
            "examId": exam_id,
            "cycle": "terminal",
            "rows": [
                { "studentId": students[0], "ca1": 15, "ca2": 15, "examScore": 45 },
                { "studentId": students[1], "ca1": 20, "ca2": 15, "examScore": 50 }
            ]
        }),
    );

    Fixture {
        class_id,
        exam_id,
        math_id,
        english_id,
        students,
    }
}

#[test]
fn broadsheet_ranks_students_with_shared_positions() {
    let workspace = temp_dir("schoold-broadsheet");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_results(&mut stdin, &mut reader, &workspace);

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.classBroadsheet",
        json!({ "classId": fx.class_id, "examId": fx.exam_id, "cycle": "terminal" }),
    );

    let subjects = model["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);

    let rows = model["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 3);

    // Adebayo: (85 + 75) / 2 = 80, tied for first with Balogun.
    assert_eq!(rows[0]["averagePercentage"].as_i64(), Some(80));
    assert_eq!(rows[0]["grade"].as_str(), Some("A"));
    assert_eq!(rows[0]["position"].as_i64(), Some(1));

    assert_eq!(rows[1]["averagePercentage"].as_i64(), Some(80));
    assert_eq!(rows[1]["position"].as_i64(), Some(1));

    // Chukwu has one subject at 55 and the tie above pushes them to third.
    assert_eq!(rows[2]["averagePercentage"].as_i64(), Some(55));
    assert_eq!(rows[2]["grade"].as_str(), Some("D"));
    assert_eq!(rows[2]["position"].as_i64(), Some(3));

    // Cell grid lines up with the subject list; the missing English record
    // for Chukwu is a null cell, not a zero.
    let chukwu_cells = rows[2]["cells"].as_array().expect("cells");
    assert_eq!(chukwu_cells.len(), 2);
    assert_eq!(chukwu_cells[0]["percentage"].as_i64(), Some(55));
    assert!(chukwu_cells[1].is_null());

    // No midterm records were entered: everyone is unranked on that cycle.
    let midterm = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.classBroadsheet",
        json!({ "classId": fx.class_id, "examId": fx.exam_id, "cycle": "midterm" }),
    );
    for row in midterm["rows"].as_array().expect("rows") {
        assert!(row["averagePercentage"].is_null());
        assert!(row["position"].is_null());
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn report_card_collects_subject_rows_and_overall_standing() {
    let workspace = temp_dir("schoold-report-card");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_results(&mut stdin, &mut reader, &workspace);

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.studentReportCard",
        json!({
            "classId": fx.class_id,
            "examId": fx.exam_id,
            "studentId": fx.students[2]
        }),
    );

    assert_eq!(card["student"]["displayName"].as_str(), Some("Chukwu, Ada"));
    assert_eq!(card["subjectsOffered"].as_i64(), Some(2));
    assert_eq!(card["subjectsGraded"].as_i64(), Some(1));

    let subjects = card["subjects"].as_array().expect("subjects");
    let math_row = subjects
        .iter()
        .find(|s| s["subjectId"].as_str() == Some(fx.math_id.as_str()))
        .expect("math row");
    assert_eq!(math_row["terminal"]["total"].as_f64(), Some(55.0));
    assert_eq!(math_row["terminal"]["grade"].as_str(), Some("D"));
    assert!(math_row["midterm"].is_null());

    let english_row = subjects
        .iter()
        .find(|s| s["subjectId"].as_str() == Some(fx.english_id.as_str()))
        .expect("english row");
    assert!(english_row["terminal"].is_null());

    let overall = &card["overall"];
    assert_eq!(overall["averagePercentage"].as_i64(), Some(55));
    assert_eq!(overall["grade"].as_str(), Some("D"));
    assert_eq!(overall["remark"].as_str(), Some("Pass"));
    assert_eq!(overall["position"].as_i64(), Some(3));
    assert_eq!(overall["rankedCount"].as_i64(), Some(3));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
