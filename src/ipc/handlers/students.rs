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

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, admission_no, gender, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let last_name: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let admission_no: Option<String> = r.get(3)?;
            let gender: Option<String> = r.get(4)?;
            let active: i64 = r.get(5)?;
            let sort_order: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": format!("{}, {}", last_name, first_name),
                "admissionNo": admission_no,
                "gender": gender,
                "active": active != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "students": rows }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lastName/firstName must not be empty".to_string(),
            details: None,
        });
    }
    let admission_no = params
        .get("admissionNo")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let gender = params
        .get("gender")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, admission_no, gender, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            admission_no.as_deref(),
            gender.as_deref(),
            active as i64,
            sort_order,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        })?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&class_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
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
            message: "student not found".to_string(),
            details: None,
        });
    }

    let text_fields: [(&str, &str); 4] = [
        ("lastName", "last_name"),
        ("firstName", "first_name"),
        ("admissionNo", "admission_no"),
        ("gender", "gender"),
    ];
    for (key, column) in text_fields {
        let Some(v) = patch.get(key) else {
            continue;
        };
        let value = v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        if (key == "lastName" || key == "firstName") && value.is_none() {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("{} must not be empty", key),
                details: None,
            });
        }
        let sql = format!(
            "UPDATE students SET {} = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
            column
        );
        conn.execute(&sql, (value.as_deref(), &student_id))
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "column": column })),
            })?;
    }

    if let Some(v) = patch.get("active") {
        let active = v.as_bool().ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "active must be a boolean".to_string(),
            details: None,
        })?;
        conn.execute(
            "UPDATE students SET active = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    Ok(json!({ "ok": true }))
}

fn students_reorder(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let ordered = params
        .get("orderedIds")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing orderedIds[]".to_string(),
            details: None,
        })?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for (i, v) in ordered.iter().enumerate() {
        let Some(sid) = v.as_str() else {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("orderedIds[{}] must be a string", i),
                details: None,
            });
        };
        let changed = tx
            .execute(
                "UPDATE students SET sort_order = ? WHERE class_id = ? AND id = ?",
                (i as i64, &class_id, sid),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: None,
            })?;
        if changed == 0 {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found in class".to_string(),
                details: Some(json!({ "studentId": sid })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true, "count": ordered.len() }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&class_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
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
            message: "student not found".to_string(),
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
            "DELETE FROM score_records WHERE student_id = ?",
            "score_records",
        ),
        ("DELETE FROM uploads WHERE student_id = ?", "uploads"),
        ("DELETE FROM students WHERE id = ?", "students"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
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
        "students.list" => Some(dispatch(students_list)),
        "students.create" => Some(dispatch(students_create)),
        "students.update" => Some(dispatch(students_update)),
        "students.reorder" => Some(dispatch(students_reorder)),
        "students.delete" => Some(dispatch(students_delete)),
        _ => None,
    }
}
