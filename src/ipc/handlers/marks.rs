use crate::calc::{
    clamp_component, component_ceiling, compute_score, derive_terminal_seed, max_total, Component,
    ExamCycle,
};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
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

fn get_cycle(params: &serde_json::Value) -> Result<ExamCycle, HandlerErr> {
    let raw = get_required_str(params, "cycle")?;
    ExamCycle::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "cycle must be midterm or terminal".to_string(),
        details: Some(json!({ "cycle": raw })),
    })
}

/// Forgiving numeric coercion for mark entry: numbers pass through, numeric
/// strings parse, anything else counts as 0. Clamping handles the range.
fn coerce_number(v: Option<&serde_json::Value>) -> f64 {
    match v {
        Some(v) => {
            if let Some(n) = v.as_f64() {
                n
            } else if let Some(s) = v.as_str() {
                s.trim().parse::<f64>().unwrap_or(0.0)
            } else {
                0.0
            }
        }
        None => 0.0,
    }
}

struct SheetKey {
    exam_id: String,
    class_id: String,
    subject_id: String,
    cycle: ExamCycle,
}

fn resolve_sheet_key(conn: &Connection, params: &serde_json::Value) -> Result<SheetKey, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let exam_id = get_required_str(params, "examId")?;
    let cycle = get_cycle(params)?;

    let checks: [(&str, &str, &str); 3] = [
        ("SELECT 1 FROM classes WHERE id = ?", &class_id, "class not found"),
        ("SELECT 1 FROM subjects WHERE id = ?", &subject_id, "subject not found"),
        ("SELECT 1 FROM exams WHERE id = ?", &exam_id, "exam not found"),
    ];
    for (sql, id, message) in checks {
        let found = conn
            .query_row(sql, [id], |r| r.get::<_, i64>(0))
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
                message: message.to_string(),
                details: None,
            });
        }
    }

    let assigned = conn
        .query_row(
            "SELECT 1 FROM class_subjects WHERE class_id = ? AND subject_id = ?",
            (&class_id, &subject_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !assigned {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject is not assigned to class".to_string(),
            details: Some(json!({ "classId": class_id, "subjectId": subject_id })),
        });
    }

    Ok(SheetKey {
        exam_id,
        class_id,
        subject_id,
        cycle,
    })
}

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    display_name: String,
    sort_order: i64,
    active: bool,
}

fn load_roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(RosterStudent {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            sort_order: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

#[derive(Debug, Clone, Copy)]
struct StoredComponents {
    ca1: f64,
    ca2: f64,
    exam_score: f64,
}

/// All stored component triples for one sheet, keyed by student.
fn load_sheet_records(
    conn: &Connection,
    key: &SheetKey,
    cycle: ExamCycle,
) -> Result<HashMap<String, StoredComponents>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, ca1, ca2, exam_score
             FROM score_records
             WHERE exam_id = ? AND class_id = ? AND subject_id = ? AND cycle = ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map(
            (&key.exam_id, &key.class_id, &key.subject_id, cycle.as_str()),
            |r| {
                let student_id: String = r.get(0)?;
                Ok((
                    student_id,
                    StoredComponents {
                        ca1: r.get(1)?,
                        ca2: r.get(2)?,
                        exam_score: r.get(3)?,
                    },
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(rows.into_iter().collect())
}

fn upsert_record(
    conn: &Connection,
    key: &SheetKey,
    student_id: &str,
    ca1: f64,
    ca2: f64,
    exam_score: f64,
) -> Result<serde_json::Value, HandlerErr> {
    let computed = compute_score(key.cycle, ca1, ca2, exam_score);
    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO score_records(
            id, exam_id, class_id, subject_id, student_id, cycle,
            ca1, ca2, exam_score, total, percentage, grade, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(exam_id, class_id, subject_id, student_id, cycle) DO UPDATE SET
           ca1 = excluded.ca1,
           ca2 = excluded.ca2,
           exam_score = excluded.exam_score,
           total = excluded.total,
           percentage = excluded.percentage,
           grade = excluded.grade,
           updated_at = excluded.updated_at",
        (
            &record_id,
            &key.exam_id,
            &key.class_id,
            &key.subject_id,
            student_id,
            key.cycle.as_str(),
            ca1,
            ca2,
            exam_score,
            computed.total,
            computed.percentage,
            computed.grade.as_str(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "score_records" })),
    })?;

    Ok(json!({
        "studentId": student_id,
        "ca1": ca1,
        "ca2": ca2,
        "examScore": exam_score,
        "total": computed.total,
        "percentage": computed.percentage,
        "grade": computed.grade.as_str()
    }))
}

fn maxima_json(cycle: ExamCycle) -> serde_json::Value {
    json!({
        "ca1": component_ceiling(cycle, Component::Ca1),
        "ca2": component_ceiling(cycle, Component::Ca2),
        "exam": component_ceiling(cycle, Component::Exam),
        "total": max_total(cycle)
    })
}

fn sheet_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = resolve_sheet_key(conn, params)?;
    let roster = load_roster(conn, &key.class_id)?;
    let records = load_sheet_records(conn, &key, key.cycle)?;
    let midterms = if key.cycle == ExamCycle::Terminal {
        load_sheet_records(conn, &key, ExamCycle::Midterm)?
    } else {
        HashMap::new()
    };

    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(roster.len());
    for s in &roster {
        let midterm = midterms.get(&s.id);
        let ca_locked = key.cycle == ExamCycle::Terminal && midterm.is_some();

        let (components, entered, seeded) = match records.get(&s.id) {
            Some(stored) => (*stored, true, false),
            None => match midterm {
                // Terminal sheet with a completed midterm: present the
                // derived seed. Nothing is persisted until save.
                Some(m) => {
                    let seed = derive_terminal_seed(m.ca1, m.ca2, m.exam_score);
                    (
                        StoredComponents {
                            ca1: seed.ca1,
                            ca2: seed.ca2,
                            exam_score: seed.exam_score,
                        },
                        false,
                        true,
                    )
                }
                None => (
                    StoredComponents {
                        ca1: 0.0,
                        ca2: 0.0,
                        exam_score: 0.0,
                    },
                    false,
                    false,
                ),
            },
        };

        let computed = compute_score(key.cycle, components.ca1, components.ca2, components.exam_score);
        rows.push(json!({
            "studentId": s.id,
            "displayName": s.display_name,
            "sortOrder": s.sort_order,
            "active": s.active,
            "ca1": components.ca1,
            "ca2": components.ca2,
            "examScore": components.exam_score,
            "total": computed.total,
            "percentage": computed.percentage,
            "grade": computed.grade.as_str(),
            "entered": entered,
            "seeded": seeded,
            "caLocked": ca_locked
        }));
    }

    Ok(json!({
        "classId": key.class_id,
        "subjectId": key.subject_id,
        "examId": key.exam_id,
        "cycle": key.cycle.as_str(),
        "maxima": maxima_json(key.cycle),
        "rows": rows
    }))
}

/// Decide the CA components a terminal save may write. An existing terminal
/// record derived from a midterm keeps its stored CA1/CA2; a fresh terminal
/// record with a midterm source takes the derived seed. Direct entry applies
/// only when there is no midterm record for the student.
fn resolve_terminal_cas(
    existing: Option<&StoredComponents>,
    midterm: Option<&StoredComponents>,
    input_ca1: f64,
    input_ca2: f64,
) -> (f64, f64) {
    match midterm {
        Some(m) => match existing {
            Some(stored) => (stored.ca1, stored.ca2),
            None => {
                let seed = derive_terminal_seed(m.ca1, m.ca2, m.exam_score);
                (seed.ca1, seed.ca2)
            }
        },
        None => (input_ca1, input_ca2),
    }
}

fn save_sheet(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = resolve_sheet_key(conn, params)?;
    let Some(rows_arr) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing rows[]".to_string(),
            details: None,
        });
    };

    let roster = load_roster(conn, &key.class_id)?;
    let roster_ids: HashSet<&str> = roster.iter().map(|s| s.id.as_str()).collect();
    let existing = load_sheet_records(conn, &key, key.cycle)?;
    let midterms = if key.cycle == ExamCycle::Terminal {
        load_sheet_records(conn, &key, ExamCycle::Midterm)?
    } else {
        HashMap::new()
    };

    let mut saved: Vec<serde_json::Value> = Vec::new();
    let mut skipped: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, row) in rows_arr.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("row at index {} must be an object", i),
            }));
            continue;
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("row at index {} missing studentId", i),
            }));
            continue;
        };
        if !roster_ids.contains(student_id) {
            errors.push(json!({
                "index": i,
                "studentId": student_id,
                "code": "not_found",
                "message": "student not found in class",
            }));
            continue;
        }

        let in_ca1 = clamp_component(key.cycle, Component::Ca1, coerce_number(obj.get("ca1")));
        let in_ca2 = clamp_component(key.cycle, Component::Ca2, coerce_number(obj.get("ca2")));
        let exam_score =
            clamp_component(key.cycle, Component::Exam, coerce_number(obj.get("examScore")));

        let (ca1, ca2) = if key.cycle == ExamCycle::Terminal {
            resolve_terminal_cas(
                existing.get(student_id),
                midterms.get(student_id),
                in_ca1,
                in_ca2,
            )
        } else {
            (in_ca1, in_ca2)
        };

        // A record only comes into existence once something non-zero is
        // entered; blank rows stay blank instead of storing all-zero marks.
        let has_record = existing.contains_key(student_id);
        if !has_record && ca1 == 0.0 && ca2 == 0.0 && exam_score == 0.0 {
            skipped += 1;
            continue;
        }

        match upsert_record(conn, &key, student_id, ca1, ca2, exam_score) {
            Ok(v) => saved.push(v),
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": student_id,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let mut result = json!({
        "ok": true,
        "saved": saved.len(),
        "skipped": skipped,
        "rows": saved
    });
    if !errors.is_empty() {
        result
            .as_object_mut()
            .expect("result should be object")
            .insert("errors".into(), json!(errors));
    }
    Ok(result)
}

fn update_entry(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = resolve_sheet_key(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let field_raw = get_required_str(params, "field")?;
    let Some(field) = Component::parse(&field_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "field must be one of: ca1, ca2, examScore".to_string(),
            details: Some(json!({ "field": field_raw })),
        });
    };

    let in_class = conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&key.class_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !in_class {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found in class".to_string(),
            details: None,
        });
    }

    let existing = load_sheet_records(conn, &key, key.cycle)?;
    let midterms = if key.cycle == ExamCycle::Terminal {
        load_sheet_records(conn, &key, ExamCycle::Midterm)?
    } else {
        HashMap::new()
    };
    let midterm = midterms.get(&student_id);

    if key.cycle == ExamCycle::Terminal
        && midterm.is_some()
        && matches!(field, Component::Ca1 | Component::Ca2)
    {
        return Err(HandlerErr {
            code: "ca_locked",
            message: "terminal CA components are derived from midterm results".to_string(),
            details: Some(json!({ "field": field_raw })),
        });
    }

    let value = clamp_component(key.cycle, field, coerce_number(params.get("value")));

    let base = match existing.get(&student_id) {
        Some(stored) => *stored,
        None => match midterm {
            Some(m) => {
                let seed = derive_terminal_seed(m.ca1, m.ca2, m.exam_score);
                StoredComponents {
                    ca1: seed.ca1,
                    ca2: seed.ca2,
                    exam_score: seed.exam_score,
                }
            }
            None => StoredComponents {
                ca1: 0.0,
                ca2: 0.0,
                exam_score: 0.0,
            },
        },
    };

    let (ca1, ca2, exam_score) = match field {
        Component::Ca1 => (value, base.ca2, base.exam_score),
        Component::Ca2 => (base.ca1, value, base.exam_score),
        Component::Exam => (base.ca1, base.ca2, value),
    };

    let has_record = existing.contains_key(&student_id);
    if !has_record && ca1 == 0.0 && ca2 == 0.0 && exam_score == 0.0 {
        let computed = compute_score(key.cycle, ca1, ca2, exam_score);
        return Ok(json!({
            "saved": false,
            "studentId": student_id,
            "ca1": ca1,
            "ca2": ca2,
            "examScore": exam_score,
            "total": computed.total,
            "percentage": computed.percentage,
            "grade": computed.grade.as_str()
        }));
    }

    let mut result = upsert_record(conn, &key, &student_id, ca1, ca2, exam_score)?;
    result
        .as_object_mut()
        .expect("result should be object")
        .insert("saved".into(), json!(true));
    Ok(result)
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
        "marks.sheetOpen" => Some(dispatch(sheet_open)),
        "marks.saveSheet" => Some(dispatch(save_sheet)),
        "marks.updateEntry" => Some(dispatch(update_entry)),
        _ => None,
    }
}
