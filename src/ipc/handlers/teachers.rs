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

fn teachers_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, email, phone, active
             FROM teachers
             ORDER BY last_name, first_name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let last_name: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let email: Option<String> = r.get(3)?;
            let phone: Option<String> = r.get(4)?;
            let active: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": format!("{}, {}", last_name, first_name),
                "email": email,
                "phone": phone,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "teachers": rows }))
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lastName/firstName must not be empty".to_string(),
            details: None,
        });
    }
    let email = params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let phone = params
        .get("phone")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, last_name, first_name, email, phone, active, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &teacher_id,
            &last_name,
            &first_name,
            email.as_deref(),
            phone.as_deref(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "teachers" })),
    })?;

    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        })?;

    let exists = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
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
            message: "teacher not found".to_string(),
            details: None,
        });
    }

    let text_fields: [(&str, &str); 4] = [
        ("lastName", "last_name"),
        ("firstName", "first_name"),
        ("email", "email"),
        ("phone", "phone"),
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
            "UPDATE teachers SET {} = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
            column
        );
        conn.execute(&sql, (value.as_deref(), &teacher_id))
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
            "UPDATE teachers SET active = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
            (active as i64, &teacher_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    Ok(json!({ "ok": true }))
}

fn teachers_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;

    let exists = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
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
            message: "teacher not found".to_string(),
            details: None,
        });
    }

    // Subject assignments keep their row but lose the teacher reference.
    conn.execute(
        "UPDATE class_subjects SET teacher_id = NULL WHERE teacher_id = ?",
        [&teacher_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "class_subjects" })),
    })?;
    conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "teachers" })),
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
        "teachers.list" => Some(dispatch(teachers_list)),
        "teachers.create" => Some(dispatch(teachers_create)),
        "teachers.update" => Some(dispatch(teachers_update)),
        "teachers.delete" => Some(dispatch(teachers_delete)),
        _ => None,
    }
}
