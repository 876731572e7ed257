use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })
}

fn subjects_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, code, sort_order FROM subjects ORDER BY sort_order, name")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let code: Option<String> = r.get(2)?;
            let sort_order: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "subjects": rows }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let code = params
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty());

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects",
            [],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, sort_order) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, code.as_deref(), sort_order),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })?;

    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        })?;

    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }

    if let Some(v) = patch.get("name") {
        let name = v.as_str().map(|s| s.trim()).unwrap_or("");
        if name.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "name must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (name, &subject_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(v) = patch.get("code") {
        let code = v
            .as_str()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty());
        conn.execute(
            "UPDATE subjects SET code = ? WHERE id = ?",
            (code.as_deref(), &subject_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    Ok(json!({ "ok": true }))
}

fn subjects_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;

    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let steps: [(&str, &str); 3] = [
        (
            "DELETE FROM score_records WHERE subject_id = ?",
            "score_records",
        ),
        (
            "DELETE FROM class_subjects WHERE subject_id = ?",
            "class_subjects",
        ),
        ("DELETE FROM subjects WHERE id = ?", "subjects"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&subject_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn subjects_assign(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let teacher_id = params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }
    if let Some(ref tid) = teacher_id {
        if !row_exists(conn, "SELECT 1 FROM teachers WHERE id = ?", tid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "teacher not found".to_string(),
                details: None,
            });
        }
    }

    conn.execute(
        "INSERT INTO class_subjects(class_id, subject_id, teacher_id)
         VALUES(?, ?, ?)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET
           teacher_id = excluded.teacher_id",
        (&class_id, &subject_id, teacher_id.as_deref()),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "class_subjects" })),
    })?;

    Ok(json!({ "ok": true }))
}

fn subjects_unassign(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;

    let changed = conn
        .execute(
            "DELETE FROM class_subjects WHERE class_id = ? AND subject_id = ?",
            (&class_id, &subject_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "class_subjects" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject is not assigned to class".to_string(),
            details: None,
        });
    }

    Ok(json!({ "ok": true }))
}

fn subjects_for_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT sub.id, sub.name, sub.code, cs.teacher_id, t.last_name, t.first_name
             FROM class_subjects cs
             JOIN subjects sub ON sub.id = cs.subject_id
             LEFT JOIN teachers t ON t.id = cs.teacher_id
             WHERE cs.class_id = ?
             ORDER BY sub.sort_order, sub.name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&class_id], |r| {
            let subject_id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let code: Option<String> = r.get(2)?;
            let teacher_id: Option<String> = r.get(3)?;
            let t_last: Option<String> = r.get(4)?;
            let t_first: Option<String> = r.get(5)?;
            let teacher_name = match (t_last, t_first) {
                (Some(last), Some(first)) => Some(format!("{}, {}", last, first)),
                _ => None,
            };
            Ok(json!({
                "subjectId": subject_id,
                "name": name,
                "code": code,
                "teacherId": teacher_id,
                "teacherName": teacher_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "subjects": rows }))
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
        "subjects.list" => Some(dispatch(subjects_list)),
        "subjects.create" => Some(dispatch(subjects_create)),
        "subjects.update" => Some(dispatch(subjects_update)),
        "subjects.delete" => Some(dispatch(subjects_delete)),
        "subjects.assign" => Some(dispatch(subjects_assign)),
        "subjects.unassign" => Some(dispatch(subjects_unassign)),
        "subjects.forClass" => Some(dispatch(subjects_for_class)),
        _ => None,
    }
}
