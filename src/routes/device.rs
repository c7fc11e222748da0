// backend/src/routes/device.rs

use axum::{extract::{Path, State}, Json};
use axum::http::StatusCode;
use serde::Deserialize;
use sqlx::query_as;

use crate::device::driver::{DeviceUser, DeviceUserSpec};
use crate::device::{self, DeviceError, DeviceReport};
use crate::models::{StaffProfile, SyncLog, SyncMethod, UserAudit};
use crate::sync::{self, SyncError, SyncSummary};
use crate::AppState;
use super::internal_error;

fn device_error(e: DeviceError) -> (StatusCode, String) {
    match e {
        DeviceError::Unreachable(msg) => (StatusCode::SERVICE_UNAVAILABLE, format!("device unreachable: {msg}")),
        DeviceError::Timeout(d) => (StatusCode::GATEWAY_TIMEOUT, format!("device operation timed out after {d:?}")),
        DeviceError::Protocol(msg) => (StatusCode::BAD_GATEWAY, format!("device protocol failure: {msg}")),
    }
}

fn sync_error(e: SyncError) -> (StatusCode, String) {
    match e {
        SyncError::Device(e) => device_error(e),
        SyncError::Db(e) => internal_error(e),
    }
}

/// Extracts the numeric enrolment uid from a staff number like "EMP042".
fn numeric_uid(staff_number: &str) -> u32 {
    let digits: String = staff_number.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

pub async fn get_info(State(state): State<AppState>) -> Json<DeviceReport> {
    Json(state.device.report(&state.pool).await)
}

pub async fn get_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeviceUser>>, (StatusCode, String)> {
    match state.device.get_users().await {
        Ok(users) => Ok(Json(users)),
        Err(DeviceError::Unreachable(msg)) => {
            // Bridge mode: show the enrolled set the bridge is syncing for,
            // which is the staff directory itself.
            if device::bridge_last_push(&state.pool).await.is_some() {
                let staff = query_as::<_, StaffProfile>(
                    r#"SELECT * FROM staff_profiles WHERE staff_number IS NOT NULL ORDER BY staff_number"#,
                )
                .fetch_all(&state.pool)
                .await
                .map_err(internal_error)?;
                let users = staff
                    .into_iter()
                    .filter_map(|s| {
                        let staff_number = s.staff_number?;
                        Some(DeviceUser {
                            uid: numeric_uid(&staff_number),
                            external_id: staff_number,
                            name: s.full_name,
                            role: 0,
                            card: 0,
                        })
                    })
                    .collect();
                Ok(Json(users))
            } else {
                Err(device_error(DeviceError::Unreachable(msg)))
            }
        }
        Err(e) => Err(device_error(e)),
    }
}

pub async fn trigger_sync(
    State(state): State<AppState>,
) -> Result<Json<SyncSummary>, (StatusCode, String)> {
    sync::run_sync(&state, SyncMethod::Manual)
        .await
        .map(Json)
        .map_err(sync_error)
}

pub async fn sync_history(
    State(state): State<AppState>,
) -> Result<Json<Vec<SyncLog>>, (StatusCode, String)> {
    let rows = query_as::<_, SyncLog>(
        r#"SELECT * FROM sync_logs ORDER BY started_at DESC LIMIT 50"#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;
    Ok(Json(rows))
}

pub async fn audit(
    State(state): State<AppState>,
) -> Result<Json<UserAudit>, (StatusCode, String)> {
    sync::audit_users(&state).await.map(Json).map_err(sync_error)
}

pub async fn restart(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state.device.restart().await.map_err(device_error)?;
    Ok(Json(serde_json::json!({"message": "device restarting"})))
}

pub async fn sync_time(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state.device.sync_time().await.map_err(device_error)?;
    Ok(Json(serde_json::json!({"message": "device time synchronized with server"})))
}

pub async fn clear_logs(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state.device.clear_logs().await.map_err(device_error)?;
    Ok(Json(serde_json::json!({"message": "all attendance logs cleared from device"})))
}

#[derive(Deserialize)]
pub struct SetUserBody {
    pub staff_number: String,
    pub name: String,
    pub uid: Option<u32>,
    pub password: Option<String>,
    pub role: Option<u8>,
    pub card: Option<u32>,
}

pub async fn set_user(
    State(state): State<AppState>,
    Json(b): Json<SetUserBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let uid = b.uid.unwrap_or_else(|| numeric_uid(&b.staff_number));
    if uid == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "staff number must contain digits to derive a device uid".into(),
        ));
    }
    let spec = DeviceUserSpec {
        uid,
        external_id: b.staff_number.clone(),
        name: b.name,
        password: b.password.unwrap_or_default(),
        role: b.role.unwrap_or(0),
        card: b.card.unwrap_or(0),
    };
    state.device.set_user(&spec).await.map_err(device_error)?;
    Ok(Json(serde_json::json!({"message": format!("user {} added/updated", b.staff_number)})))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(uid): Path<u32>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state.device.delete_user(uid).await.map_err(device_error)?;
    Ok(Json(serde_json::json!({"message": format!("user {uid} deleted")})))
}

/// Pushes every device-linked staff profile onto the device.
pub async fn upload_users(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let staff = query_as::<_, StaffProfile>(
        r#"SELECT * FROM staff_profiles WHERE staff_number IS NOT NULL"#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let specs: Vec<DeviceUserSpec> = staff
        .into_iter()
        .filter_map(|s| {
            let staff_number = s.staff_number?;
            let uid = numeric_uid(&staff_number);
            if uid == 0 {
                return None;
            }
            Some(DeviceUserSpec {
                uid,
                external_id: staff_number,
                name: s.full_name,
                password: String::new(),
                role: 0,
                card: 0,
            })
        })
        .collect();

    let pushed = state.device.upload_users(&specs).await.map_err(device_error)?;
    Ok(Json(serde_json::json!({"message": format!("uploaded {pushed} users to device")})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_uid_extracts_digits() {
        assert_eq!(numeric_uid("EMP042"), 42);
        assert_eq!(numeric_uid("7"), 7);
        assert_eq!(numeric_uid("NO-DIGITS"), 0);
    }
}
