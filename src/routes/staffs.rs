// backend/src/routes/staffs.rs
//
// The staff directory is HR-owned; this core only reads it, and only ever
// writes the device linkage.

use axum::{extract::{Path, Query, State}, Json};
use axum::http::StatusCode;
use serde::Deserialize;
use sqlx::query_as;
use uuid::Uuid;

use crate::models::StaffProfile;
use crate::AppState;
use super::internal_error;

#[derive(Deserialize)]
pub struct ListQ {
    pub staff_number: Option<String>,
}

pub async fn list_staffs(
    State(state): State<AppState>,
    Query(q): Query<ListQ>,
) -> Result<Json<Vec<StaffProfile>>, (StatusCode, String)> {
    let rows = if let Some(number) = q.staff_number {
        query_as::<_, StaffProfile>(r#"SELECT * FROM staff_profiles WHERE staff_number=$1"#)
            .bind(number)
            .fetch_all(&state.pool).await.map_err(internal_error)?
    } else {
        query_as::<_, StaffProfile>(r#"SELECT * FROM staff_profiles ORDER BY full_name"#)
            .fetch_all(&state.pool).await.map_err(internal_error)?
    };
    Ok(Json(rows))
}

pub async fn get_staff(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StaffProfile>, (StatusCode, String)> {
    query_as::<_, StaffProfile>(r#"SELECT * FROM staff_profiles WHERE staff_id=$1"#)
        .bind(id)
        .fetch_optional(&state.pool).await.map_err(internal_error)?
        .ok_or((StatusCode::NOT_FOUND, "staff profile not found".into()))
        .map(Json)
}

#[derive(Deserialize)]
pub struct DeviceLinkBody {
    pub staff_number: Option<String>,
}

pub async fn set_device_link(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(b): Json<DeviceLinkBody>,
) -> Result<Json<StaffProfile>, (StatusCode, String)> {
    let row = query_as::<_, StaffProfile>(
        r#"UPDATE staff_profiles SET staff_number = $2 WHERE staff_id = $1 RETURNING *"#,
    )
    .bind(id)
    .bind(b.staff_number)
    .fetch_optional(&state.pool).await.map_err(internal_error)?;

    row.ok_or((StatusCode::NOT_FOUND, "staff profile not found".into()))
        .map(Json)
}
