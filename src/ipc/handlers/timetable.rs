use crate::ipc::helpers::{
    db_conn, ensure_exists, ensure_user_role, optional_str, require, required_str, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{Action, Role};
use crate::timetable::{self, Booking, ProposedBooking, Slot};
use chrono::Weekday;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ProposedEntry {
    subject_id: String,
    booking: ProposedBooking,
}

/// Falls back to the teacher assigned to the class and subject when no
/// teacher is named.
fn parse_proposed_entry(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<ProposedEntry, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let day = required_str(params, "day")?;
    let start = required_str(params, "startTime")?;
    let end = required_str(params, "endTime")?;
    let slot = Slot::parse(&day, &start, &end).map_err(|e| {
        HandlerErr::bad_params(e.to_string())
            .with_details(json!({ "day": day, "startTime": start, "endTime": end }))
    })?;

    ensure_exists(conn, "classrooms", &class_id, "class")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let teacher_id = match optional_str(params, "teacherId")? {
        Some(teacher_id) => {
            ensure_user_role(conn, &teacher_id, Role::Teacher, "teacherId")?;
            Some(teacher_id)
        }
        None => conn
            .query_row(
                "SELECT teacher_id FROM class_assignments WHERE class_id = ? AND subject_id = ?",
                (&class_id, &subject_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?,
    };

    Ok(ProposedEntry {
        subject_id,
        booking: ProposedBooking {
            class_id,
            teacher_id,
            slot,
        },
    })
}

fn bookings_on_day(conn: &Connection, day: Weekday) -> Result<Vec<Booking>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, class_id, teacher_id, start_time, end_time
             FROM timetable_entries
             WHERE day_index = ?
             ORDER BY start_time, id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows: Vec<(String, String, Option<String>, String, String)> = stmt
        .query_map([day.num_days_from_monday()], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    rows.into_iter()
        .map(|(entry_id, class_id, teacher_id, start, end)| {
            let start = timetable::parse_time(&start);
            let end = timetable::parse_time(&end);
            let slot = start
                .and_then(|s| end.and_then(|e| Slot::new(day, s, e)))
                .map_err(|e| {
                    HandlerErr::new("db_query_failed", format!("stored entry is invalid: {}", e))
                        .with_details(json!({ "entryId": entry_id }))
                })?;
            Ok(Booking {
                entry_id,
                class_id,
                teacher_id,
                slot,
            })
        })
        .collect()
}

fn conflict_details(conflict: &timetable::SlotConflict<'_>) -> serde_json::Value {
    let b = conflict.existing;
    json!({
        "kind": conflict.kind,
        "entryId": b.entry_id,
        "classId": b.class_id,
        "teacherId": b.teacher_id,
        "day": timetable::day_name(b.slot.day),
        "startTime": timetable::format_time(b.slot.start),
        "endTime": timetable::format_time(b.slot.end),
    })
}

fn timetable_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewTimetable)?;
    let class_id = optional_str(&req.params, "classId")?;
    let teacher_id = optional_str(&req.params, "teacherId")?;

    let mut sql = String::from(
        "SELECT t.id, t.class_id, c.name, t.subject_id, sub.name, t.teacher_id, u.name,
                t.day, t.start_time, t.end_time
         FROM timetable_entries t
         JOIN classrooms c ON c.id = t.class_id
         JOIN subjects sub ON sub.id = t.subject_id
         LEFT JOIN users u ON u.id = t.teacher_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();
    if let Some(class_id) = class_id {
        clauses.push("t.class_id = ?");
        binds.push(SqlValue::Text(class_id));
    }
    if let Some(teacher_id) = teacher_id {
        clauses.push("t.teacher_id = ?");
        binds.push(SqlValue::Text(teacher_id));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY t.day_index, t.start_time, c.name");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let entries = stmt
        .query_map(params_from_iter(binds), |r| {
            let id: String = r.get(0)?;
            let class_id: String = r.get(1)?;
            let class_name: String = r.get(2)?;
            let subject_id: String = r.get(3)?;
            let subject: String = r.get(4)?;
            let teacher_id: Option<String> = r.get(5)?;
            let teacher: Option<String> = r.get(6)?;
            let day: String = r.get(7)?;
            let start_time: String = r.get(8)?;
            let end_time: String = r.get(9)?;
            Ok(json!({
                "id": id,
                "classId": class_id,
                "className": class_name,
                "subjectId": subject_id,
                "subject": subject,
                "teacherId": teacher_id,
                "teacher": teacher,
                "day": day,
                "startTime": start_time,
                "endTime": end_time,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "entries": entries }))
}

fn timetable_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageTimetable)?;
    let entry = parse_proposed_entry(conn, &req.params)?;
    let slot = entry.booking.slot;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let existing = bookings_on_day(&tx, slot.day)?;
    if let Some(conflict) = timetable::find_conflict(&existing, &entry.booking) {
        return Err(HandlerErr::new("conflict", conflict.kind.message())
            .with_details(conflict_details(&conflict)));
    }

    let entry_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO timetable_entries(
            id, class_id, subject_id, teacher_id, day, day_index, start_time, end_time
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &entry_id,
            &entry.booking.class_id,
            &entry.subject_id,
            &entry.booking.teacher_id,
            timetable::day_name(slot.day),
            slot.day.num_days_from_monday(),
            timetable::format_time(slot.start),
            timetable::format_time(slot.end),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "timetable_entries" }))
    })?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    Ok(json!({
        "entryId": entry_id,
        "teacherId": entry.booking.teacher_id,
        "day": timetable::day_name(slot.day),
        "startTime": timetable::format_time(slot.start),
        "endTime": timetable::format_time(slot.end),
    }))
}

fn timetable_check_conflict(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageTimetable)?;
    let entry = parse_proposed_entry(conn, &req.params)?;

    let existing = bookings_on_day(conn, entry.booking.slot.day)?;
    if !timetable::has_conflict(&existing, &entry.booking) {
        return Ok(json!({ "conflict": false }));
    }
    let mut out = json!({ "conflict": true });
    if let Some(conflict) = timetable::find_conflict(&existing, &entry.booking) {
        out = conflict_details(&conflict);
        out["conflict"] = json!(true);
        out["message"] = json!(conflict.kind.message());
    }
    Ok(out)
}

fn timetable_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageTimetable)?;
    let entry_id = required_str(&req.params, "entryId")?;

    let removed = conn
        .execute("DELETE FROM timetable_entries WHERE id = ?", [&entry_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if removed == 0 {
        return Err(HandlerErr::new("not_found", "timetable entry not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "timetable.get" => timetable_get(state, req),
        "timetable.add" => timetable_add(state, req),
        "timetable.checkConflict" => timetable_check_conflict(state, req),
        "timetable.delete" => timetable_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
