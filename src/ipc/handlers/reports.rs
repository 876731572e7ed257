use crate::calc::{round_half_up, ExamCycle, Grade};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

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

fn query_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn require_row(conn: &Connection, sql: &str, id: &str, message: &str) -> Result<(), HandlerErr> {
    let found = conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map_err(query_failed)?
        .is_some();
    if found {
        Ok(())
    } else {
        Err(HandlerErr {
            code: "not_found",
            message: message.to_string(),
            details: None,
        })
    }
}

#[derive(Debug, Clone)]
struct SubjectDef {
    id: String,
    name: String,
    code: Option<String>,
}

fn subjects_for_class(conn: &Connection, class_id: &str) -> Result<Vec<SubjectDef>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT sub.id, sub.name, sub.code
             FROM class_subjects cs
             JOIN subjects sub ON sub.id = cs.subject_id
             WHERE cs.class_id = ?
             ORDER BY sub.sort_order, sub.name",
        )
        .map_err(query_failed)?;
    stmt.query_map([class_id], |r| {
        Ok(SubjectDef {
            id: r.get(0)?,
            name: r.get(1)?,
            code: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

#[derive(Debug, Clone, Copy)]
struct RecordCells {
    ca1: f64,
    ca2: f64,
    exam_score: f64,
    total: f64,
    percentage: i64,
}

fn record_json(r: &RecordCells, grade: &str) -> serde_json::Value {
    json!({
        "ca1": r.ca1,
        "ca2": r.ca2,
        "examScore": r.exam_score,
        "total": r.total,
        "percentage": r.percentage,
        "grade": grade
    })
}

/// Stored records for one exam/class, keyed by (student, subject, cycle).
fn load_exam_records(
    conn: &Connection,
    exam_id: &str,
    class_id: &str,
) -> Result<HashMap<(String, String, String), (RecordCells, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, subject_id, cycle, ca1, ca2, exam_score, total, percentage, grade
             FROM score_records
             WHERE exam_id = ? AND class_id = ?",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map((exam_id, class_id), |r| {
            let student_id: String = r.get(0)?;
            let subject_id: String = r.get(1)?;
            let cycle: String = r.get(2)?;
            let cells = RecordCells {
                ca1: r.get(3)?,
                ca2: r.get(4)?,
                exam_score: r.get(5)?,
                total: r.get(6)?,
                percentage: r.get(7)?,
            };
            let grade: String = r.get(8)?;
            Ok(((student_id, subject_id, cycle), (cells, grade)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(rows.into_iter().collect())
}

/// Standard competition ranking over descending averages: equal averages
/// share a position and the next distinct average skips past the tie.
fn assign_positions(averages: &[(String, Option<i64>)]) -> HashMap<String, i64> {
    let mut ranked: Vec<(&String, i64)> = averages
        .iter()
        .filter_map(|(id, avg)| avg.map(|a| (id, a)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let mut positions: HashMap<String, i64> = HashMap::new();
    let mut last_avg: Option<i64> = None;
    let mut last_pos: i64 = 0;
    for (i, (id, avg)) in ranked.iter().enumerate() {
        let pos = if Some(*avg) == last_avg {
            last_pos
        } else {
            (i as i64) + 1
        };
        positions.insert((*id).clone(), pos);
        last_avg = Some(*avg);
        last_pos = pos;
    }
    positions
}

/// Per-student mean of stored percentages for one cycle, across the class
/// subjects. Students with no records for the cycle get no average.
fn cycle_averages(
    students: &[(String, String, i64, bool)],
    subjects: &[SubjectDef],
    records: &HashMap<(String, String, String), (RecordCells, String)>,
    cycle: ExamCycle,
) -> Vec<(String, Option<i64>)> {
    students
        .iter()
        .map(|(sid, _, _, _)| {
            let mut sum: i64 = 0;
            let mut count: i64 = 0;
            for sub in subjects {
                let k = (sid.clone(), sub.id.clone(), cycle.as_str().to_string());
                if let Some((cells, _)) = records.get(&k) {
                    sum += cells.percentage;
                    count += 1;
                }
            }
            let avg = if count > 0 {
                Some(round_half_up(sum as f64 / count as f64))
            } else {
                None
            };
            (sid.clone(), avg)
        })
        .collect()
}

fn load_students(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<(String, String, i64, bool)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(query_failed)?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok((
            r.get::<_, String>(0)?,
            format!("{}, {}", last, first),
            r.get::<_, i64>(3)?,
            r.get::<_, i64>(4)? != 0,
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

fn student_report_card(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let exam_id = get_required_str(params, "examId")?;
    let student_id = get_required_str(params, "studentId")?;

    require_row(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class not found")?;
    require_row(conn, "SELECT 1 FROM exams WHERE id = ?", &exam_id, "exam not found")?;

    let class_name: String = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .map_err(query_failed)?;
    let exam_row: (String, String, i64) = conn
        .query_row(
            "SELECT name, session, term FROM exams WHERE id = ?",
            [&exam_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(query_failed)?;

    let students = load_students(conn, &class_id)?;
    let Some((_, display_name, _, _)) = students.iter().find(|(id, _, _, _)| id == &student_id)
    else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found in class".to_string(),
            details: None,
        });
    };

    let subjects = subjects_for_class(conn, &class_id)?;
    let records = load_exam_records(conn, &exam_id, &class_id)?;

    let mut subject_rows: Vec<serde_json::Value> = Vec::with_capacity(subjects.len());
    for sub in &subjects {
        let mid_key = (student_id.clone(), sub.id.clone(), "midterm".to_string());
        let term_key = (student_id.clone(), sub.id.clone(), "terminal".to_string());
        let midterm = records.get(&mid_key).map(|(c, g)| record_json(c, g));
        let terminal = records.get(&term_key).map(|(c, g)| record_json(c, g));
        subject_rows.push(json!({
            "subjectId": sub.id,
            "name": sub.name,
            "code": sub.code,
            "midterm": midterm,
            "terminal": terminal
        }));
    }

    let averages = cycle_averages(&students, &subjects, &records, ExamCycle::Terminal);
    let positions = assign_positions(&averages);
    let own_average = averages
        .iter()
        .find(|(id, _)| id == &student_id)
        .and_then(|(_, avg)| *avg);
    let overall = own_average.map(|avg| {
        let grade = Grade::from_percentage(avg);
        json!({
            "averagePercentage": avg,
            "grade": grade.as_str(),
            "remark": grade.remark(),
            "position": positions.get(&student_id),
            "rankedCount": positions.len()
        })
    });

    let graded_count = subject_rows
        .iter()
        .filter(|row| !row["terminal"].is_null())
        .count();

    Ok(json!({
        "class": { "id": class_id, "name": class_name },
        "exam": { "id": exam_id, "name": exam_row.0, "session": exam_row.1, "term": exam_row.2 },
        "student": { "id": student_id, "displayName": display_name },
        "subjects": subject_rows,
        "subjectsOffered": subjects.len(),
        "subjectsGraded": graded_count,
        "overall": overall
    }))
}

fn class_broadsheet(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let exam_id = get_required_str(params, "examId")?;
    let cycle_raw = get_required_str(params, "cycle")?;
    let Some(cycle) = ExamCycle::parse(&cycle_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "cycle must be midterm or terminal".to_string(),
            details: Some(json!({ "cycle": cycle_raw })),
        });
    };

    require_row(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class not found")?;
    require_row(conn, "SELECT 1 FROM exams WHERE id = ?", &exam_id, "exam not found")?;

    let students = load_students(conn, &class_id)?;
    let subjects = subjects_for_class(conn, &class_id)?;
    let records = load_exam_records(conn, &exam_id, &class_id)?;

    let averages = cycle_averages(&students, &subjects, &records, cycle);
    let positions = assign_positions(&averages);
    let avg_by_student: HashMap<&str, Option<i64>> = averages
        .iter()
        .map(|(id, avg)| (id.as_str(), *avg))
        .collect();

    let subjects_json: Vec<serde_json::Value> = subjects
        .iter()
        .map(|s| json!({ "subjectId": s.id, "name": s.name, "code": s.code }))
        .collect();

    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(students.len());
    for (sid, display_name, sort_order, active) in &students {
        let cells: Vec<serde_json::Value> = subjects
            .iter()
            .map(|sub| {
                let k = (sid.clone(), sub.id.clone(), cycle.as_str().to_string());
                match records.get(&k) {
                    Some((c, grade)) => json!({
                        "total": c.total,
                        "percentage": c.percentage,
                        "grade": grade
                    }),
                    None => serde_json::Value::Null,
                }
            })
            .collect();

        let average = avg_by_student.get(sid.as_str()).copied().flatten();
        let overall_grade = average.map(|a| Grade::from_percentage(a).as_str());
        rows.push(json!({
            "studentId": sid,
            "displayName": display_name,
            "sortOrder": sort_order,
            "active": active,
            "cells": cells,
            "averagePercentage": average,
            "grade": overall_grade,
            "position": positions.get(sid.as_str())
        }));
    }

    Ok(json!({
        "classId": class_id,
        "examId": exam_id,
        "cycle": cycle.as_str(),
        "subjects": subjects_json,
        "rows": rows
    }))
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
        "reports.studentReportCard" => Some(dispatch(student_report_card)),
        "reports.classBroadsheet" => Some(dispatch(class_broadsheet)),
        _ => None,
    }
}
