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

#[test]
fn exported_csv_carries_recomputed_rows() {
    let workspace = temp_dir("schoold-csv-export");
    let out_path = workspace.join("results.csv");
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
        json!({ "name": "JSS 3B" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "classId": class_id,
            "lastName": "Lawal, Jr",
            "firstName": "Musa",
            "admissionNo": "2025/031"
        }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "name": "Basic Science", "code": "BSC" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.assign",
        json!({ "classId": class_id, "subjectId": subject_id }),
    );
    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exams.create",
        json!({ "name": "First Term Examination", "session": "2025/2026", "term": 1 }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.saveSheet",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "examId": exam_id,
            "cycle": "midterm",
            "rows": [{ "studentId": student_id, "ca1": 9, "ca2": 8, "examScore": 17 }]
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "exchange.exportResultsCsv",
        json!({
            "classId": class_id,
            "examId": exam_id,
            "outPath": out_path.to_string_lossy()
        }),
    );
    assert_eq!(exported["rows"].as_i64(), Some(1));

    let text = std::fs::read_to_string(&out_path).expect("read exported csv");
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("admission_no,student,subject,cycle,ca1,ca2,exam,total,percentage,grade")
    );
    let row = lines.next().expect("data row");
    // The comma inside the surname forces quoting on the student column.
    assert!(row.starts_with("2025/031,\"Lawal, Jr, Musa\",Basic Science,midterm,"));
    assert!(row.ends_with("9,8,17,34,85,A"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
