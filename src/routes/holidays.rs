// backend/src/routes/holidays.rs

use axum::{extract::{Path, State}, Json};
use axum::http::StatusCode;
use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::{query, query_as};
use uuid::Uuid;

use crate::models::Holiday;
use crate::AppState;
use super::internal_error;

#[derive(Deserialize)]
pub struct CreateHolidayBody {
    pub date: NaiveDate,
    pub name: String,
}

pub async fn create_holiday(
    State(state): State<AppState>,
    Json(b): Json<CreateHolidayBody>,
) -> Result<Json<Holiday>, (StatusCode, String)> {
    let row = query_as::<_, Holiday>(
        r#"
        INSERT INTO holidays(date, name)
        VALUES ($1,$2)
        ON CONFLICT (date) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(b.date).bind(b.name)
    .fetch_optional(&state.pool).await.map_err(internal_error)?;

    row.ok_or((StatusCode::CONFLICT, "a holiday already exists on that date".into()))
        .map(Json)
}

pub async fn list_holidays(
    State(state): State<AppState>,
) -> Result<Json<Vec<Holiday>>, (StatusCode, String)> {
    let rows = query_as::<_, Holiday>(r#"SELECT * FROM holidays ORDER BY date"#)
        .fetch_all(&state.pool).await.map_err(internal_error)?;
    Ok(Json(rows))
}

pub async fn delete_holiday(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let res = query(r#"DELETE FROM holidays WHERE holiday_id=$1"#)
        .bind(id).execute(&state.pool).await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({"deleted": res.rows_affected() > 0})))
}
