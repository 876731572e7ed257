use crate::db::UPLOADS_DIR_NAME;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut len: u64 = 0;
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        len += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((format!("{:x}", hasher.finalize()), len))
}

fn check_owner_refs(
    conn: &Connection,
    class_id: Option<&str>,
    student_id: Option<&str>,
) -> Result<(), HandlerErr> {
    if let Some(cid) = class_id {
        let found = conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [cid], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !found {
            return Err(HandlerErr {
                code: "not_found",
                message: "class not found".to_string(),
                details: None,
            });
        }
    }
    if let Some(sid) = student_id {
        let found = conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [sid], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !found {
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found".to_string(),
                details: None,
            });
        }
    }
    Ok(())
}

fn uploads_store(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let source_path = PathBuf::from(get_required_str(params, "sourcePath")?);
    if !source_path.is_file() {
        return Err(HandlerErr {
            code: "not_found",
            message: "source file not found".to_string(),
            details: Some(json!({ "sourcePath": source_path.to_string_lossy() })),
        });
    }

    let class_id = params.get("classId").and_then(|v| v.as_str());
    let student_id = params.get("studentId").and_then(|v| v.as_str());
    check_owner_refs(conn, class_id, student_id)?;

    let file_name = params
        .get("fileName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            source_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "upload.bin".to_string());

    let upload_id = Uuid::new_v4().to_string();
    let stored_name = format!("{}-{}", upload_id, file_name);
    let uploads_dir = workspace.join(UPLOADS_DIR_NAME);
    if let Err(e) = std::fs::create_dir_all(&uploads_dir) {
        return Err(HandlerErr {
            code: "io_failed",
            message: e.to_string(),
            details: None,
        });
    }
    let dest = uploads_dir.join(&stored_name);
    if let Err(e) = std::fs::copy(&source_path, &dest) {
        return Err(HandlerErr {
            code: "io_failed",
            message: e.to_string(),
            details: Some(json!({ "dest": dest.to_string_lossy() })),
        });
    }

    let (sha256, byte_len) = match sha256_file(&dest) {
        Ok(v) => v,
        Err(e) => {
            let _ = std::fs::remove_file(&dest);
            return Err(HandlerErr {
                code: "io_failed",
                message: e.to_string(),
                details: None,
            });
        }
    };

    let uploaded_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    conn.execute(
        "INSERT INTO uploads(id, class_id, student_id, file_name, stored_name, byte_len, sha256, uploaded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &upload_id,
            class_id,
            student_id,
            &file_name,
            &stored_name,
            byte_len as i64,
            &sha256,
            &uploaded_at,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "uploads" })),
    })?;

    Ok(json!({
        "uploadId": upload_id,
        "fileName": file_name,
        "storedName": stored_name,
        "byteLen": byte_len,
        "sha256": sha256,
        "uploadedAt": uploaded_at
    }))
}

fn uploads_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let student_id = params.get("studentId").and_then(|v| v.as_str());

    let mut sql = String::from(
        "SELECT id, class_id, student_id, file_name, stored_name, byte_len, sha256, uploaded_at
         FROM uploads",
    );
    let mut binds: Vec<String> = Vec::new();
    let mut clauses: Vec<&str> = Vec::new();
    if let Some(cid) = class_id {
        clauses.push("class_id = ?");
        binds.push(cid.to_string());
    }
    if let Some(sid) = student_id {
        clauses.push("student_id = ?");
        binds.push(sid.to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY uploaded_at DESC, file_name");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            let id: String = r.get(0)?;
            let class_id: Option<String> = r.get(1)?;
            let student_id: Option<String> = r.get(2)?;
            let file_name: String = r.get(3)?;
            let stored_name: String = r.get(4)?;
            let byte_len: i64 = r.get(5)?;
            let sha256: String = r.get(6)?;
            let uploaded_at: String = r.get(7)?;
            Ok(json!({
                "id": id,
                "classId": class_id,
                "studentId": student_id,
                "fileName": file_name,
                "storedName": stored_name,
                "byteLen": byte_len,
                "sha256": sha256,
                "uploadedAt": uploaded_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "uploads": rows }))
}

fn uploads_delete(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let upload_id = get_required_str(params, "uploadId")?;

    let stored_name: Option<String> = conn
        .query_row(
            "SELECT stored_name FROM uploads WHERE id = ?",
            [&upload_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(stored_name) = stored_name else {
        return Err(HandlerErr {
            code: "not_found",
            message: "upload not found".to_string(),
            details: None,
        });
    };

    conn.execute("DELETE FROM uploads WHERE id = ?", [&upload_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "uploads" })),
        })?;

    // Best-effort: the row is gone either way.
    let _ = std::fs::remove_file(workspace.join(UPLOADS_DIR_NAME).join(&stored_name));

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "uploads.store" | "uploads.list" | "uploads.delete" => {}
        _ => return None,
    }

    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "uploads.store" => uploads_store(conn, workspace, &req.params),
        "uploads.list" => uploads_list(conn, &req.params),
        _ => uploads_delete(conn, workspace, &req.params),
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
