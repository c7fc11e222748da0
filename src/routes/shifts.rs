// backend/src/routes/shifts.rs

use axum::{extract::{Path, State}, Json};
use axum::http::StatusCode;
use chrono::{NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use sqlx::{query, query_as};
use uuid::Uuid;

use crate::ingest;
use crate::models::{Shift, ShiftAssignment, StaffProfile};
use crate::AppState;
use super::internal_error;

#[derive(Deserialize)]
pub struct CreateShiftBody {
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub grace_minutes: Option<i32>,
    pub no_break: Option<bool>,
}

pub async fn create_shift(
    State(state): State<AppState>,
    Json(b): Json<CreateShiftBody>,
) -> Result<Json<Shift>, (StatusCode, String)> {
    let row = query_as::<_, Shift>(
        r#"
        INSERT INTO shifts(name, start_time, end_time, grace_minutes, no_break)
        VALUES ($1,$2,$3, COALESCE($4, 15), COALESCE($5, FALSE))
        RETURNING *
        "#,
    )
    .bind(b.name).bind(b.start_time).bind(b.end_time).bind(b.grace_minutes).bind(b.no_break)
    .fetch_one(&state.pool).await.map_err(internal_error)?;
    Ok(Json(row))
}

pub async fn list_shifts(
    State(state): State<AppState>,
) -> Result<Json<Vec<Shift>>, (StatusCode, String)> {
    let rows = query_as::<_, Shift>(r#"SELECT * FROM shifts ORDER BY name"#)
        .fetch_all(&state.pool).await.map_err(internal_error)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
pub struct PatchShiftBody {
    pub name: Option<String>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub grace_minutes: Option<i32>,
    pub no_break: Option<bool>,
}

async fn active_assignment_count(state: &AppState, shift_id: Uuid) -> Result<i64, (StatusCode, String)> {
    sqlx::query_scalar::<_, i64>(
        r#"SELECT count(*) FROM shift_assignments WHERE shift_id = $1 AND is_active"#,
    )
    .bind(shift_id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)
}

pub async fn patch_shift(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(b): Json<PatchShiftBody>,
) -> Result<Json<Shift>, (StatusCode, String)> {
    // Timing edits while assigned would silently rewrite history; the
    // snapshot on old records survives, but resolution for the assigned
    // window would change.
    if active_assignment_count(&state, id).await? > 0 {
        return Err((
            StatusCode::CONFLICT,
            "shift has active assignments; deactivate them before editing".into(),
        ));
    }

    let row = query_as::<_, Shift>(
        r#"
        UPDATE shifts SET
          name = COALESCE($2, name),
          start_time = COALESCE($3, start_time),
          end_time = COALESCE($4, end_time),
          grace_minutes = COALESCE($5, grace_minutes),
          no_break = COALESCE($6, no_break),
          updated_at = now()
        WHERE shift_id = $1
        RETURNING *
        "#,
    )
    .bind(id).bind(b.name).bind(b.start_time).bind(b.end_time).bind(b.grace_minutes).bind(b.no_break)
    .fetch_one(&state.pool).await.map_err(internal_error)?;
    Ok(Json(row))
}

pub async fn delete_shift(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if active_assignment_count(&state, id).await? > 0 {
        return Err((
            StatusCode::CONFLICT,
            "shift has active assignments and cannot be deleted".into(),
        ));
    }
    let res = query(r#"DELETE FROM shifts WHERE shift_id=$1"#)
        .bind(id).execute(&state.pool).await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({"deleted": res.rows_affected() > 0})))
}

// ─────────────────────────────────────────────────────────────────────────────
// Assignments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AssignShiftBody {
    pub staff_id: Uuid,
    pub shift_id: Uuid,
    pub from_date: NaiveDate,
    pub to_date: Option<NaiveDate>,
    pub grace_override: Option<i32>,
}

pub async fn create_assignment(
    State(state): State<AppState>,
    Json(b): Json<AssignShiftBody>,
) -> Result<Json<ShiftAssignment>, (StatusCode, String)> {
    if let Some(existing) = state
        .resolver
        .find_overlap(b.staff_id, b.from_date, b.to_date)
        .await
        .map_err(internal_error)?
    {
        let until = existing
            .to_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "open-ended".into());
        return Err((
            StatusCode::CONFLICT,
            format!(
                "assignment overlaps an active assignment from {} to {}",
                existing.from_date, until
            ),
        ));
    }

    let row = query_as::<_, ShiftAssignment>(
        r#"
        INSERT INTO shift_assignments(staff_id, shift_id, from_date, to_date, grace_override)
        VALUES ($1,$2,$3,$4,$5)
        RETURNING *
        "#,
    )
    .bind(b.staff_id).bind(b.shift_id).bind(b.from_date).bind(b.to_date).bind(b.grace_override)
    .fetch_one(&state.pool).await.map_err(internal_error)?;

    // Shift rules changed for an existing window: re-derive affected days.
    recompute_window(&state, b.staff_id, b.from_date, b.to_date).await;

    Ok(Json(row))
}

pub async fn list_assignments_for_staff(
    State(state): State<AppState>,
    Path(staff_id): Path<Uuid>,
) -> Result<Json<Vec<ShiftAssignment>>, (StatusCode, String)> {
    let rows = query_as::<_, ShiftAssignment>(
        r#"SELECT * FROM shift_assignments WHERE staff_id=$1 AND is_active ORDER BY from_date DESC"#,
    )
    .bind(staff_id)
    .fetch_all(&state.pool).await.map_err(internal_error)?;
    Ok(Json(rows))
}

/// Soft removal: assignments are deactivated, never silently overwritten.
pub async fn deactivate_assignment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let row = query_as::<_, ShiftAssignment>(
        r#"UPDATE shift_assignments SET is_active = FALSE WHERE assignment_id=$1 RETURNING *"#,
    )
    .bind(id)
    .fetch_optional(&state.pool).await.map_err(internal_error)?;

    let Some(assignment) = row else {
        return Err((StatusCode::NOT_FOUND, "assignment not found".into()));
    };

    // Affected days fall back to legacy/default rules.
    recompute_window(&state, assignment.staff_id, assignment.from_date, assignment.to_date).await;

    Ok(Json(serde_json::json!({"deactivated": true})))
}

async fn recompute_window(
    state: &AppState,
    staff_id: Uuid,
    from: NaiveDate,
    to: Option<NaiveDate>,
) {
    let staff = match query_as::<_, StaffProfile>(r#"SELECT * FROM staff_profiles WHERE staff_id=$1"#)
        .bind(staff_id)
        .fetch_optional(&state.pool)
        .await
    {
        Ok(Some(s)) => s,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("retroactive recompute skipped for {staff_id}: {e}");
            return;
        }
    };

    let tz = ingest::staff_tz(&staff, state.cfg.tz_offset_min);
    let today = Utc::now().with_timezone(&tz).date_naive();
    let end = to.map_or(today, |d| d.min(today));
    if from > end {
        return; // entirely in the future, nothing recorded yet
    }

    match ingest::recompute_range(&state.pool, &state.resolver, &staff, from, end, state.cfg.tz_offset_min).await {
        Ok(n) => tracing::info!("recomputed {n} records for {staff_id} after assignment change"),
        Err(e) => tracing::warn!("retroactive recompute failed for {staff_id}: {e}"),
    }
}
