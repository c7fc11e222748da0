// backend/src/sync.rs
//
// Periodic heartbeat (device liveness) and periodic bulk sync, plus the
// manual trigger and the device/database user audit. The two loops are
// independent: a tick that fires while a sync is in flight simply queues
// on the device mutex.

use serde::Serialize;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::device::{DeviceError, DeviceReport};
use crate::ingest::{self, PunchEvent};
use crate::models::{AuditMatch, AuditStaff, IngestMethod, StaffProfile, SyncMethod, SyncStatus, UserAudit};
use crate::AppState;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("storage error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub status: SyncStatus,
    pub message: String,
    pub logs_fetched: u32,
    pub logs_saved: u32,
    pub failed: u32,
}

/// Starts the heartbeat and auto-sync background loops.
pub fn spawn(state: AppState) {
    let hb = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(hb.cfg.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let report = hb.device.report(&hb.pool).await;
            if let DeviceReport::Offline { reason } = &report {
                tracing::warn!("device heartbeat: OFFLINE ({reason})");
            } else {
                tracing::debug!("device heartbeat: {}", report.status_label());
            }
            persist_report(&hb.pool, &report).await;
        }
    });

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.cfg.auto_sync_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick; the bridge usually beats us to it.
        tick.tick().await;
        loop {
            tick.tick().await;
            match run_sync(&state, SyncMethod::Auto).await {
                Ok(summary) => tracing::info!(
                    "auto-sync: {} (fetched {}, saved {})",
                    summary.message,
                    summary.logs_fetched,
                    summary.logs_saved
                ),
                Err(e) => tracing::warn!("auto-sync failed: {e}"),
            }
        }
    });
}

async fn persist_report(pool: &Pool<Postgres>, report: &DeviceReport) {
    let detail = serde_json::to_value(report).unwrap_or_default();
    let res = sqlx::query(
        r#"
        INSERT INTO device_status (id, status, last_heartbeat, detail)
        VALUES ('CURRENT', $1, now(), $2)
        ON CONFLICT (id) DO UPDATE
           SET status = EXCLUDED.status,
               last_heartbeat = EXCLUDED.last_heartbeat,
               detail = EXCLUDED.detail
        "#,
    )
    .bind(report.status_label())
    .bind(detail)
    .execute(pool)
    .await;
    if let Err(e) = res {
        tracing::warn!("could not persist device status: {e}");
    }
}

/// One bulk sync pass: probe, pull logs over the direct link when
/// possible, otherwise defer to the bridge. Every attempt appends a
/// sync_logs row.
pub async fn run_sync(state: &AppState, method: SyncMethod) -> Result<SyncSummary, SyncError> {
    let log_id = sqlx::query_scalar::<_, Uuid>(
        r#"INSERT INTO sync_logs (method, status) VALUES ($1, $2) RETURNING sync_log_id"#,
    )
    .bind(method)
    .bind(SyncStatus::Running)
    .fetch_one(&state.pool)
    .await?;

    let outcome = direct_sync(state).await;
    match outcome {
        Ok(Some((fetched, saved, failed, errors))) => {
            finish_log(&state.pool, log_id, SyncStatus::Success, fetched, saved, errors).await?;
            Ok(SyncSummary {
                status: SyncStatus::Success,
                message: format!("processed {saved} of {fetched} device logs"),
                logs_fetched: fetched,
                logs_saved: saved,
                failed,
            })
        }
        Ok(None) => {
            // Direct link down; is the bridge keeping attendance alive?
            if crate::device::bridge_last_push(&state.pool).await.is_some() {
                finish_log(&state.pool, log_id, SyncStatus::Success, 0, 0, None).await?;
                Ok(SyncSummary {
                    status: SyncStatus::Success,
                    message: "sync managed by bridge agent".into(),
                    logs_fetched: 0,
                    logs_saved: 0,
                    failed: 0,
                })
            } else {
                let reason = "device unreachable and no bridge active".to_string();
                finish_log(&state.pool, log_id, SyncStatus::Failed, 0, 0, Some(reason.clone())).await?;
                Ok(SyncSummary {
                    status: SyncStatus::Failed,
                    message: reason,
                    logs_fetched: 0,
                    logs_saved: 0,
                    failed: 0,
                })
            }
        }
        Err(e) => {
            finish_log(&state.pool, log_id, SyncStatus::Failed, 0, 0, Some(e.to_string())).await?;
            Err(e.into())
        }
    }
}

/// Ok(Some(..)) = pulled and processed; Ok(None) = not directly reachable.
async fn direct_sync(
    state: &AppState,
) -> Result<Option<(u32, u32, u32, Option<String>)>, DeviceError> {
    if !state.device.probe().await {
        return Ok(None);
    }
    let logs = match state.device.get_logs().await {
        Ok(logs) => logs,
        Err(DeviceError::Unreachable(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let events: Vec<PunchEvent> = logs
        .into_iter()
        .map(|p| PunchEvent {
            staff_number: p.external_id,
            timestamp: p.timestamp,
        })
        .collect();

    let fetched = events.len() as u32;
    let result = ingest::process_batch(
        &state.pool,
        &state.resolver,
        state.cfg.tz_offset_min,
        &events,
        IngestMethod::Biometric,
    )
    .await;

    let errors = if result.errors.is_empty() {
        None
    } else {
        Some(result.errors.join("; "))
    };
    Ok(Some((fetched, result.success_count, result.failed_count, errors)))
}

async fn finish_log(
    pool: &Pool<Postgres>,
    log_id: Uuid,
    status: SyncStatus,
    fetched: u32,
    saved: u32,
    error: Option<String>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sync_logs
           SET status = $2, logs_fetched = $3, logs_saved = $4, error = $5,
               finished_at = now()
         WHERE sync_log_id = $1
        "#,
    )
    .bind(log_id)
    .bind(status)
    .bind(fetched as i32)
    .bind(saved as i32)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Diffs the device's enrolled users against the staff directory. Used by
/// operators for reconciliation; never mutates either side.
pub async fn audit_users(state: &AppState) -> Result<UserAudit, SyncError> {
    let device_users = state.device.get_users().await?;
    let staff = sqlx::query_as::<_, StaffProfile>(
        r#"SELECT * FROM staff_profiles WHERE staff_number IS NOT NULL ORDER BY staff_number"#,
    )
    .fetch_all(&state.pool)
    .await?;

    let mut matched = Vec::new();
    let mut orphaned_on_device = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for du in device_users {
        seen.insert(du.external_id.clone());
        match staff.iter().find(|s| s.staff_number.as_deref() == Some(du.external_id.as_str())) {
            Some(s) => matched.push(AuditMatch {
                staff_number: du.external_id.clone(),
                db_name: s.full_name.clone(),
                device_name: du.name.clone(),
            }),
            None => orphaned_on_device.push(du),
        }
    }

    let missing_on_device = staff
        .iter()
        .filter(|s| {
            s.staff_number
                .as_deref()
                .map_or(false, |n| !seen.contains(n))
        })
        .map(|s| AuditStaff {
            staff_number: s.staff_number.clone().unwrap_or_default(),
            name: s.full_name.clone(),
            department: s.department.clone(),
        })
        .collect();

    Ok(UserAudit {
        matched,
        missing_on_device,
        orphaned_on_device,
    })
}
