use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match req.params.get("workspacePath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => match state.workspace.as_ref() {
            Some(p) => p.clone(),
            None => return err(&req.id, "bad_params", "missing workspacePath", None),
        },
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing outPath", None),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "uploadCount": summary.upload_count,
                "outPath": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:#}"), None),
    }
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match req.params.get("workspacePath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => match state.workspace.as_ref() {
            Some(p) => p.clone(),
            None => return err(&req.id, "bad_params", "missing workspacePath", None),
        },
    };
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing inPath", None),
    };

    // Release the current handle so the database file can be swapped.
    if state.workspace.as_deref() == Some(workspace.as_path()) {
        state.db = None;
    }

    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "backup_import_failed", format!("{e:#}"), None),
    };

    match db::open_db(&workspace) {
        Ok(conn) => {
            state.workspace = Some(workspace.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "bundleFormatDetected": summary.bundle_format_detected,
                    "uploadCount": summary.upload_count,
                    "workspacePath": workspace.to_string_lossy()
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_export_results_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let exam_id = match req.params.get("examId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examId", None),
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing outPath", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT s.admission_no, s.last_name, s.first_name, sub.name, r.cycle,
                r.ca1, r.ca2, r.exam_score, r.total, r.percentage, r.grade
         FROM score_records r
         JOIN students s ON s.id = r.student_id
         JOIN subjects sub ON sub.id = r.subject_id
         WHERE r.class_id = ? AND r.exam_id = ?
         ORDER BY s.sort_order, sub.sort_order, r.cycle",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&class_id, &exam_id), |r| {
            let admission_no: Option<String> = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let subject: String = r.get(3)?;
            let cycle: String = r.get(4)?;
            let ca1: f64 = r.get(5)?;
            let ca2: f64 = r.get(6)?;
            let exam_score: f64 = r.get(7)?;
            let total: f64 = r.get(8)?;
            let percentage: i64 = r.get(9)?;
            let grade: String = r.get(10)?;
            Ok(format!(
                "{},{},{},{},{},{},{},{},{},{}",
                csv_quote(admission_no.as_deref().unwrap_or("")),
                csv_quote(&format!("{}, {}", last, first)),
                csv_quote(&subject),
                cycle,
                ca1,
                ca2,
                exam_score,
                total,
                percentage,
                grade
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let lines = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(&req.id, "io_failed", e.to_string(), None);
        }
    }
    let mut f = match std::fs::File::create(&out_path) {
        Ok(f) => f,
        Err(e) => return err(&req.id, "io_failed", e.to_string(), None),
    };
    let header = "admission_no,student,subject,cycle,ca1,ca2,exam,total,percentage,grade";
    let body = lines.join("\n");
    let text = if body.is_empty() {
        format!("{}\n", header)
    } else {
        format!("{}\n{}\n", header, body)
    };
    if let Err(e) = f.write_all(text.as_bytes()) {
        return err(&req.id, "io_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "rows": lines.len(),
            "outPath": out_path.to_string_lossy()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_bundle(state, req)),
        "exchange.exportResultsCsv" => Some(handle_export_results_csv(state, req)),
        _ => None,
    }
}
