// backend/src/routes/attendance.rs

use axum::{extract::{Query, State}, http::HeaderMap, Json};
use axum::http::StatusCode;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::query_as;
use uuid::Uuid;

use crate::ingest::{self, PunchEvent};
use crate::models::{
    AttendanceRecord, AttendanceStatus, BatchResult, Holiday, IngestMethod, StaffProfile,
};
use crate::status;
use crate::AppState;
use super::internal_error;

async fn load_staff(state: &AppState, staff_id: Uuid) -> Result<StaffProfile, (StatusCode, String)> {
    query_as::<_, StaffProfile>(r#"SELECT * FROM staff_profiles WHERE staff_id=$1"#)
        .bind(staff_id)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "staff profile not found".into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Web self-service punches
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PunchBody {
    pub staff_id: Uuid,
}

pub async fn check_in(
    State(state): State<AppState>,
    Json(b): Json<PunchBody>,
) -> Result<Json<AttendanceRecord>, (StatusCode, String)> {
    let staff = load_staff(&state, b.staff_id).await?;
    let tz = ingest::staff_tz(&staff, state.cfg.tz_offset_min);
    let now = Utc::now();
    let today = now.with_timezone(&tz).date_naive();

    let shift = state.resolver.resolve(&staff, today).await;
    let outcome = status::compute_status(&shift, staff.criteria_mode, now, None, false, tz);

    let row = query_as::<_, AttendanceRecord>(
        r#"
        INSERT INTO attendance_records
            (staff_id, date, check_in, status,
             shift_id, shift_start, shift_end, grace_minutes_applied,
             criteria_mode, method)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        ON CONFLICT (staff_id, date) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(staff.staff_id)
    .bind(today)
    .bind(now)
    .bind(outcome.status)
    .bind(shift.shift_id)
    .bind(shift.start_time)
    .bind(shift.end_time)
    .bind(shift.grace_minutes)
    .bind(staff.criteria_mode)
    .bind(IngestMethod::Web)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    row.ok_or((StatusCode::CONFLICT, "already checked in for today".into()))
        .map(Json)
}

pub async fn check_out(
    State(state): State<AppState>,
    Json(b): Json<PunchBody>,
) -> Result<Json<AttendanceRecord>, (StatusCode, String)> {
    let staff = load_staff(&state, b.staff_id).await?;
    let tz = ingest::staff_tz(&staff, state.cfg.tz_offset_min);
    let now = Utc::now();
    let today = now.with_timezone(&tz).date_naive();

    let record = query_as::<_, AttendanceRecord>(
        r#"SELECT * FROM attendance_records WHERE staff_id=$1 AND date=$2"#,
    )
    .bind(staff.staff_id)
    .bind(today)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(record) = record else {
        return Err((StatusCode::NOT_FOUND, "no check-in record found for today".into()));
    };
    if record.check_out.is_some() {
        return Err((StatusCode::CONFLICT, "already checked out".into()));
    }
    let Some(check_in) = record.check_in else {
        return Err((StatusCode::CONFLICT, "record has no check-in".into()));
    };

    let shift = state.resolver.resolve(&staff, today).await;
    let outcome = status::compute_status(&shift, staff.criteria_mode, check_in, Some(now), false, tz);

    let row = query_as::<_, AttendanceRecord>(
        r#"
        UPDATE attendance_records SET
            check_out = $2,
            status = $3,
            work_hours = $4,
            shift_id = $5,
            shift_start = $6,
            shift_end = $7,
            grace_minutes_applied = $8,
            criteria_mode = $9,
            updated_at = now()
        WHERE record_id = $1
        RETURNING *
        "#,
    )
    .bind(record.record_id)
    .bind(now)
    .bind(outcome.status)
    .bind(outcome.work_hours)
    .bind(shift.shift_id)
    .bind(shift.start_time)
    .bind(shift.end_time)
    .bind(shift.grace_minutes)
    .bind(staff.criteria_mode)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(row))
}

// ─────────────────────────────────────────────────────────────────────────────
// Projections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQ {
    pub staff_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

pub async fn list_attendance(
    State(state): State<AppState>,
    Query(q): Query<ListQ>,
) -> Result<Json<Vec<AttendanceRecord>>, (StatusCode, String)> {
    let mut records = query_as::<_, AttendanceRecord>(
        r#"SELECT * FROM attendance_records WHERE staff_id=$1 AND date >= $2 AND date <= $3 ORDER BY date"#,
    )
    .bind(q.staff_id).bind(q.from).bind(q.to)
    .fetch_all(&state.pool).await.map_err(internal_error)?;

    let holidays = query_as::<_, Holiday>(
        r#"SELECT * FROM holidays WHERE date >= $1 AND date <= $2 ORDER BY date"#,
    )
    .bind(q.from).bind(q.to)
    .fetch_all(&state.pool).await.map_err(internal_error)?;

    // Days with a real record win; the remaining holiday dates appear as
    // synthesized HOLIDAY rows in the same list.
    let covered: HashSet<NaiveDate> = records.iter().map(|r| r.date).collect();
    for h in holidays {
        if covered.contains(&h.date) {
            continue;
        }
        records.push(AttendanceRecord {
            record_id: h.holiday_id,
            staff_id: q.staff_id,
            date: h.date,
            check_in: None,
            check_out: None,
            status: AttendanceStatus::Holiday,
            work_hours: None,
            shift_id: None,
            shift_start: None,
            shift_end: None,
            grace_minutes_applied: None,
            criteria_mode: None,
            method: IngestMethod::System,
            created_at: h.created_at,
            updated_at: h.created_at,
        });
    }
    records.sort_by_key(|r| r.date);

    Ok(Json(records))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin correction & recompute
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AdminUpdateBody {
    pub staff_id: Uuid,
    pub date: NaiveDate,
    pub status: Option<AttendanceStatus>,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
}

/// Manual correction. The resulting record is authoritative: automatic
/// ingestion will never touch its punches again.
pub async fn admin_update(
    State(state): State<AppState>,
    Json(b): Json<AdminUpdateBody>,
) -> Result<Json<AttendanceRecord>, (StatusCode, String)> {
    let staff = load_staff(&state, b.staff_id).await?;
    let tz = ingest::staff_tz(&staff, state.cfg.tz_offset_min);
    let today = Utc::now().with_timezone(&tz).date_naive();

    let existing = query_as::<_, AttendanceRecord>(
        r#"SELECT * FROM attendance_records WHERE staff_id=$1 AND date=$2"#,
    )
    .bind(staff.staff_id)
    .bind(b.date)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let check_in = b.check_in.or(existing.as_ref().and_then(|r| r.check_in));
    let check_out = b.check_out.or(existing.as_ref().and_then(|r| r.check_out));

    let shift = state.resolver.resolve(&staff, b.date).await;
    let computed = check_in.map(|ci| {
        status::compute_status(&shift, staff.criteria_mode, ci, check_out, b.date < today, tz)
    });
    let status = b
        .status
        .or(computed.map(|c| c.status))
        .unwrap_or(AttendanceStatus::Absent);
    let work_hours = computed.and_then(|c| c.work_hours);

    let row = query_as::<_, AttendanceRecord>(
        r#"
        INSERT INTO attendance_records
            (staff_id, date, check_in, check_out, status, work_hours,
             shift_id, shift_start, shift_end, grace_minutes_applied,
             criteria_mode, method)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
        ON CONFLICT (staff_id, date) DO UPDATE SET
            check_in = EXCLUDED.check_in,
            check_out = EXCLUDED.check_out,
            status = EXCLUDED.status,
            work_hours = EXCLUDED.work_hours,
            shift_id = EXCLUDED.shift_id,
            shift_start = EXCLUDED.shift_start,
            shift_end = EXCLUDED.shift_end,
            grace_minutes_applied = EXCLUDED.grace_minutes_applied,
            criteria_mode = EXCLUDED.criteria_mode,
            method = EXCLUDED.method,
            updated_at = now()
        RETURNING *
        "#,
    )
    .bind(staff.staff_id)
    .bind(b.date)
    .bind(check_in)
    .bind(check_out)
    .bind(status)
    .bind(work_hours)
    .bind(shift.shift_id)
    .bind(shift.start_time)
    .bind(shift.end_time)
    .bind(shift.grace_minutes)
    .bind(staff.criteria_mode)
    .bind(IngestMethod::ManualAdmin)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(row))
}

#[derive(Deserialize)]
pub struct RecomputeBody {
    pub staff_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

pub async fn recompute(
    State(state): State<AppState>,
    Json(b): Json<RecomputeBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let staff = load_staff(&state, b.staff_id).await?;
    let updated = ingest::recompute_range(
        &state.pool,
        &state.resolver,
        &staff,
        b.from,
        b.to,
        state.cfg.tz_offset_min,
    )
    .await
    .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge ingestion entry point
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct BridgeUploadBody {
    pub logs: Vec<PunchEvent>,
}

fn key_matches(expected: &str, provided: &str) -> bool {
    // Compare digests so the check does not leak length or prefix timing.
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(provided.as_bytes());
    a == b
}

/// Batch upload from a relay agent sitting next to the device. Partial
/// failures are reported per event; the batch never aborts.
pub async fn bridge_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(b): Json<BridgeUploadBody>,
) -> Result<Json<BatchResult>, (StatusCode, String)> {
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !key_matches(&state.cfg.bridge_api_key, provided) {
        return Err((StatusCode::FORBIDDEN, "invalid bridge API key".into()));
    }

    let result = ingest::process_batch(
        &state.pool,
        &state.resolver,
        state.cfg.tz_offset_min,
        &b.logs,
        IngestMethod::Biometric,
    )
    .await;

    if result.failed_count > 0 {
        tracing::warn!(
            "bridge upload: {} of {} events failed",
            result.failed_count,
            result.failed_count + result.success_count
        );
    }
    Ok(Json(result))
}
