// backend/src/routes/regularisation.rs

use axum::{extract::{Path, Query, State}, Json};
use axum::http::StatusCode;
use chrono::{Datelike, NaiveDate, TimeZone, Utc, Weekday};
use serde::Deserialize;
use sqlx::{query, query_as};
use uuid::Uuid;

use crate::ingest;
use crate::models::{
    AttendanceStatus, IngestMethod, RegularisationRequest, RequestStatus, StaffProfile,
};
use crate::notify;
use crate::AppState;
use super::internal_error;

const MONTHLY_QUOTA: i64 = 3;
const REGULARISED_WORK_HOURS: f64 = 8.0;

#[derive(Deserialize)]
pub struct CreateRequestBody {
    pub staff_id: Uuid,
    pub date: NaiveDate,
    pub kind: String,
    pub reason: String,
}

/// The full-day punch pair a regularised record gets: shift start to shift
/// end in the staff's operating timezone, rolled past midnight when the
/// shift is overnight.
fn synthesized_window(
    date: NaiveDate,
    shift: &crate::status::ResolvedShift,
    tz: chrono::FixedOffset,
) -> Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)> {
    let check_in = tz
        .from_local_datetime(&date.and_time(shift.start_time))
        .single()?
        .with_timezone(&Utc);
    let mut checkout_date = date;
    if shift.end_time < shift.start_time {
        checkout_date = checkout_date.succ_opt()?;
    }
    let check_out = tz
        .from_local_datetime(&checkout_date.and_time(shift.end_time))
        .single()?
        .with_timezone(&Utc);
    Some((check_in, check_out))
}

fn month_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap();
    let next = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1).unwrap()
    };
    (start, next.pred_opt().unwrap())
}

pub async fn create_request(
    State(state): State<AppState>,
    Json(b): Json<CreateRequestBody>,
) -> Result<Json<RegularisationRequest>, (StatusCode, String)> {
    if b.date.weekday() == Weekday::Sun {
        return Err((
            StatusCode::BAD_REQUEST,
            "cannot regularise attendance for Sundays (weekly off)".into(),
        ));
    }
    if let Some(name) = sqlx::query_scalar::<_, String>(r#"SELECT name FROM holidays WHERE date=$1"#)
        .bind(b.date)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?
    {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("cannot regularise attendance for {name} (holiday)"),
        ));
    }

    let staff = query_as::<_, StaffProfile>(r#"SELECT * FROM staff_profiles WHERE staff_id=$1"#)
        .bind(b.staff_id)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?
        .ok_or((StatusCode::NOT_FOUND, "staff profile not found".to_string()))?;

    // The quota flags reviewer attention; it never blocks creation.
    let (month_start, month_end) = month_bounds(b.date);
    let used = sqlx::query_scalar::<_, i64>(
        r#"SELECT count(*) FROM regularisation_requests WHERE staff_id=$1 AND date >= $2 AND date <= $3"#,
    )
    .bind(b.staff_id)
    .bind(month_start)
    .bind(month_end)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;
    let exceeds_quota = used >= MONTHLY_QUOTA;

    let row = query_as::<_, RegularisationRequest>(
        r#"
        INSERT INTO regularisation_requests(staff_id, date, kind, reason, status, exceeds_quota)
        VALUES ($1,$2,$3,$4,'PENDING',$5)
        RETURNING *
        "#,
    )
    .bind(b.staff_id).bind(b.date).bind(b.kind).bind(b.reason).bind(exceeds_quota)
    .fetch_one(&state.pool).await.map_err(internal_error)?;

    let mut msg = format!("{} requested attendance regularisation for {}", staff.full_name, b.date);
    if exceeds_quota {
        msg.push_str(" (monthly quota exceeded)");
    }
    notify::notify_approvers(&state.cfg, msg);

    Ok(Json(row))
}

#[derive(Deserialize)]
pub struct ListQ {
    pub staff_id: Option<Uuid>,
    pub status: Option<RequestStatus>,
}

pub async fn list_requests(
    State(state): State<AppState>,
    Query(q): Query<ListQ>,
) -> Result<Json<Vec<RegularisationRequest>>, (StatusCode, String)> {
    let rows = query_as::<_, RegularisationRequest>(
        r#"
        SELECT * FROM regularisation_requests
         WHERE ($1::uuid IS NULL OR staff_id = $1)
           AND ($2::text IS NULL OR status = $2)
         ORDER BY created_at DESC
        "#,
    )
    .bind(q.staff_id)
    .bind(q.status)
    .fetch_all(&state.pool).await.map_err(internal_error)?;
    Ok(Json(rows))
}

async fn load_request(
    state: &AppState,
    id: Uuid,
) -> Result<RegularisationRequest, (StatusCode, String)> {
    query_as::<_, RegularisationRequest>(
        r#"SELECT * FROM regularisation_requests WHERE request_id=$1"#,
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "request not found".into()))
}

#[derive(Deserialize)]
pub struct EditRequestBody {
    pub date: Option<NaiveDate>,
    pub kind: Option<String>,
    pub reason: Option<String>,
}

pub async fn edit_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(b): Json<EditRequestBody>,
) -> Result<Json<RegularisationRequest>, (StatusCode, String)> {
    let request = load_request(&state, id).await?;
    if request.status != RequestStatus::Pending {
        return Err((
            StatusCode::CONFLICT,
            "cannot edit a processed request; revert it first".into(),
        ));
    }

    let row = query_as::<_, RegularisationRequest>(
        r#"
        UPDATE regularisation_requests SET
          date = COALESCE($2, date),
          kind = COALESCE($3, kind),
          reason = COALESCE($4, reason),
          updated_at = now()
        WHERE request_id = $1
        RETURNING *
        "#,
    )
    .bind(id).bind(b.date).bind(b.kind).bind(b.reason)
    .fetch_one(&state.pool).await.map_err(internal_error)?;
    Ok(Json(row))
}

pub async fn delete_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let request = load_request(&state, id).await?;
    if request.status != RequestStatus::Pending {
        return Err((StatusCode::CONFLICT, "cannot delete a processed request".into()));
    }
    query(r#"DELETE FROM regularisation_requests WHERE request_id=$1"#)
        .bind(id).execute(&state.pool).await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Deserialize)]
pub struct DecisionBody {
    pub approver: String,
}

/// Approval synthesizes a canonical full-day record for the target date,
/// replacing whatever was there.
pub async fn approve_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(b): Json<DecisionBody>,
) -> Result<Json<RegularisationRequest>, (StatusCode, String)> {
    let request = load_request(&state, id).await?;
    if request.status != RequestStatus::Pending {
        return Err((StatusCode::CONFLICT, "request is already processed".into()));
    }

    let staff = query_as::<_, StaffProfile>(r#"SELECT * FROM staff_profiles WHERE staff_id=$1"#)
        .bind(request.staff_id)
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?
        .ok_or((StatusCode::NOT_FOUND, "staff profile not found".to_string()))?;

    let tz = ingest::staff_tz(&staff, state.cfg.tz_offset_min);
    let shift = state.resolver.resolve(&staff, request.date).await;
    let (check_in, check_out) = synthesized_window(request.date, &shift, tz)
        .ok_or_else(|| internal_error("invalid local shift times"))?;

    query(
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
        "#,
    )
    .bind(request.staff_id)
    .bind(request.date)
    .bind(check_in)
    .bind(check_out)
    .bind(AttendanceStatus::Present)
    .bind(REGULARISED_WORK_HOURS)
    .bind(shift.shift_id)
    .bind(shift.start_time)
    .bind(shift.end_time)
    .bind(shift.grace_minutes)
    .bind(staff.criteria_mode)
    .bind(IngestMethod::Regularisation)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    let row = query_as::<_, RegularisationRequest>(
        r#"
        UPDATE regularisation_requests
           SET status = 'APPROVED', approver = $2, updated_at = now()
         WHERE request_id = $1
        RETURNING *
        "#,
    )
    .bind(id).bind(b.approver)
    .fetch_one(&state.pool).await.map_err(internal_error)?;
    Ok(Json(row))
}

pub async fn reject_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(b): Json<DecisionBody>,
) -> Result<Json<RegularisationRequest>, (StatusCode, String)> {
    let request = load_request(&state, id).await?;
    if request.status != RequestStatus::Pending {
        return Err((StatusCode::CONFLICT, "request is already processed".into()));
    }
    let row = query_as::<_, RegularisationRequest>(
        r#"
        UPDATE regularisation_requests
           SET status = 'REJECTED', approver = $2, updated_at = now()
         WHERE request_id = $1
        RETURNING *
        "#,
    )
    .bind(id).bind(b.approver)
    .fetch_one(&state.pool).await.map_err(internal_error)?;
    Ok(Json(row))
}

/// Revert an approval. The synthesized record carries no reliable prior
/// state, so it is deleted outright and the request returns to PENDING.
pub async fn revert_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RegularisationRequest>, (StatusCode, String)> {
    let request = load_request(&state, id).await?;
    if request.status != RequestStatus::Approved {
        return Err((StatusCode::CONFLICT, "only approved requests can be reverted".into()));
    }

    query(
        r#"
        DELETE FROM attendance_records
         WHERE staff_id = $1 AND date = $2 AND method = 'REGULARISATION'
        "#,
    )
    .bind(request.staff_id)
    .bind(request.date)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    let row = query_as::<_, RegularisationRequest>(
        r#"
        UPDATE regularisation_requests
           SET status = 'PENDING', approver = NULL, updated_at = now()
         WHERE request_id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_one(&state.pool).await.map_err(internal_error)?;
    Ok(Json(row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ResolvedShift;
    use chrono::{FixedOffset, NaiveTime, Timelike};

    fn shift(start: (u32, u32), end: (u32, u32)) -> ResolvedShift {
        ResolvedShift {
            shift_id: None,
            name: "Test".into(),
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            grace_minutes: 15,
            no_break: false,
            legacy_fallback: false,
        }
    }

    #[test]
    fn synthesized_window_spans_the_shift() {
        let tz = FixedOffset::east_opt(330 * 60).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 4, 7).unwrap();
        let (check_in, check_out) = synthesized_window(date, &shift((9, 0), (18, 0)), tz).unwrap();
        assert_eq!(check_in.with_timezone(&tz).date_naive(), date);
        assert_eq!(check_in.with_timezone(&tz).time().hour(), 9);
        assert_eq!(check_out.with_timezone(&tz).time().hour(), 18);
        assert_eq!(check_out.with_timezone(&tz).date_naive(), date);
    }

    #[test]
    fn synthesized_window_rolls_overnight_shifts_past_midnight() {
        let tz = FixedOffset::east_opt(330 * 60).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 4, 7).unwrap();
        let (check_in, check_out) = synthesized_window(date, &shift((22, 0), (7, 0)), tz).unwrap();
        assert!(check_out > check_in);
        assert_eq!(
            check_out.with_timezone(&tz).date_naive(),
            date.succ_opt().unwrap()
        );
    }

    #[test]
    fn month_bounds_cover_the_calendar_month() {
        let (start, end) = month_bounds(NaiveDate::from_ymd_opt(2025, 2, 14).unwrap());
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 2, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());

        let (start, end) = month_bounds(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
    }
}
