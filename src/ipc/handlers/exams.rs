use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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

fn parse_starts_on(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    match params.get("startsOn") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "startsOn must be an ISO date string".to_string(),
                    details: None,
                });
            };
            let t = s.trim();
            if t.is_empty() {
                return Ok(None);
            }
            let date = NaiveDate::parse_from_str(t, "%Y-%m-%d").map_err(|_| HandlerErr {
                code: "bad_params",
                message: "startsOn must be YYYY-MM-DD".to_string(),
                details: Some(json!({ "startsOn": t })),
            })?;
            Ok(Some(date.format("%Y-%m-%d").to_string()))
        }
    }
}

fn exams_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, session, term, starts_on
             FROM exams
             ORDER BY session DESC, term, name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let session: String = r.get(2)?;
            let term: i64 = r.get(3)?;
            let starts_on: Option<String> = r.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "session": session,
                "term": term,
                "startsOn": starts_on
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "exams": rows }))
}

fn exams_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    let session = get_required_str(params, "session")?.trim().to_string();
    if name.is_empty() || session.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name/session must not be empty".to_string(),
            details: None,
        });
    }
    let term = params
        .get("term")
        .and_then(|v| v.as_i64())
        .unwrap_or(1)
        .clamp(1, 3);
    let starts_on = parse_starts_on(params)?;

    let exam_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(id, name, session, term, starts_on, updated_at)
         VALUES(?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&exam_id, &name, &session, term, starts_on.as_deref()),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exams" })),
    })?;

    Ok(json!({ "examId": exam_id }))
}

fn exams_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        })?;

    let exists = conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: None,
        });
    }

    for key in ["name", "session"] {
        let Some(v) = patch.get(key) else {
            continue;
        };
        let value = v.as_str().map(|s| s.trim()).unwrap_or("");
        if value.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("{} must not be empty", key),
                details: None,
            });
        }
        let sql = format!(
            "UPDATE exams SET {} = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
            key
        );
        conn.execute(&sql, (value, &exam_id)).map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    if let Some(v) = patch.get("term") {
        let term = v.as_i64().ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "term must be an integer".to_string(),
            details: None,
        })?;
        conn.execute(
            "UPDATE exams SET term = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
            (term.clamp(1, 3), &exam_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    if patch.contains_key("startsOn") {
        let starts_on = parse_starts_on(&serde_json::Value::Object(patch.clone()))?;
        conn.execute(
            "UPDATE exams SET starts_on = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
            (starts_on.as_deref(), &exam_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    Ok(json!({ "ok": true }))
}

fn exams_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;

    let exists = conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = tx.execute("DELETE FROM score_records WHERE exam_id = ?", [&exam_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "score_records" })),
        });
    }
    if let Err(e) = tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "exams" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let dispatch = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        match f(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }
    };

    match req.method.as_str() {
        "exams.list" => Some(dispatch(exams_list)),
        "exams.create" => Some(dispatch(exams_create)),
        "exams.update" => Some(dispatch(exams_update)),
        "exams.delete" => Some(dispatch(exams_delete)),
        _ => None,
    }
}
