// backend/src/main.rs

use std::env;
use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use sqlx::{Pool, Postgres};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

mod config;
mod db;
mod device;
mod ingest;
mod models;
mod notify;
mod routes;
mod shifts;
mod status;
mod sync;

use config::Config;
use device::DeviceConnector;
use shifts::ShiftResolver;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<Postgres>,
    pub cfg: Arc<Config>,
    pub device: DeviceConnector,
    pub resolver: ShiftResolver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timeclock_api=info,tower_http=info".into()),
        )
        .init();

    // Initialize DB pool + schema
    let pool = db::connect_and_migrate().await?;

    let cfg = Arc::new(Config::from_env());
    // No vendor driver is linked by default; deployments that cannot reach
    // the device directly rely on the bridge agent (see device::driver).
    let device = DeviceConnector::new(&cfg, None);
    let resolver = ShiftResolver::new(pool.clone());

    let state = AppState {
        pool,
        cfg,
        device,
        resolver,
    };

    // Heartbeat + auto-sync loops
    sync::spawn(state.clone());

    // Very permissive CORS for local dev (tighten for prod)
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Root API router
    let api = Router::new()
        // health
        .route("/health", get(routes::health::health))
        // shift catalog
        .route(
            "/api/v1/shifts",
            post(routes::shifts::create_shift).get(routes::shifts::list_shifts),
        )
        .route(
            "/api/v1/shifts/:id",
            patch(routes::shifts::patch_shift).delete(routes::shifts::delete_shift),
        )
        // assignments
        .route(
            "/api/v1/shifts/assignments",
            post(routes::shifts::create_assignment),
        )
        .route(
            "/api/v1/staffs/:id/assignments",
            get(routes::shifts::list_assignments_for_staff),
        )
        .route(
            "/api/v1/shift-assignments/:id",
            delete(routes::shifts::deactivate_assignment),
        )
        // staff directory (external collaborator surface)
        .route("/api/v1/staffs", get(routes::staffs::list_staffs))
        .route("/api/v1/staffs/:id", get(routes::staffs::get_staff))
        .route(
            "/api/v1/staffs/:id/device-link",
            patch(routes::staffs::set_device_link),
        )
        // attendance
        .route("/api/v1/attendance", get(routes::attendance::list_attendance))
        .route("/api/v1/attendance/check-in", post(routes::attendance::check_in))
        .route("/api/v1/attendance/check-out", post(routes::attendance::check_out))
        .route("/api/v1/attendance/admin", post(routes::attendance::admin_update))
        .route("/api/v1/attendance/recompute", post(routes::attendance::recompute))
        .route(
            "/api/v1/attendance/bridge/upload",
            post(routes::attendance::bridge_upload),
        )
        // regularisation workflow
        .route(
            "/api/v1/regularisations",
            post(routes::regularisation::create_request).get(routes::regularisation::list_requests),
        )
        .route(
            "/api/v1/regularisations/:id",
            patch(routes::regularisation::edit_request)
                .delete(routes::regularisation::delete_request),
        )
        .route(
            "/api/v1/regularisations/:id/approve",
            post(routes::regularisation::approve_request),
        )
        .route(
            "/api/v1/regularisations/:id/reject",
            post(routes::regularisation::reject_request),
        )
        .route(
            "/api/v1/regularisations/:id/revert",
            post(routes::regularisation::revert_request),
        )
        // device console
        .route("/api/v1/device/info", get(routes::device::get_info))
        .route("/api/v1/device/users", get(routes::device::get_users).post(routes::device::set_user))
        .route("/api/v1/device/users/:uid", delete(routes::device::delete_user))
        .route("/api/v1/device/users/upload", post(routes::device::upload_users))
        .route("/api/v1/device/sync", post(routes::device::trigger_sync))
        .route("/api/v1/device/sync-history", get(routes::device::sync_history))
        .route("/api/v1/device/audit", get(routes::device::audit))
        .route("/api/v1/device/restart", post(routes::device::restart))
        .route("/api/v1/device/sync-time", post(routes::device::sync_time))
        .route("/api/v1/device/clear-logs", post(routes::device::clear_logs))
        // holiday calendar
        .route(
            "/api/v1/holidays",
            post(routes::holidays::create_holiday).get(routes::holidays::list_holidays),
        )
        .route("/api/v1/holidays/:id", delete(routes::holidays::delete_holiday))
        // state & middleware
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Port (axum 0.7 style)
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080); // default 8080

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("🚀 API listening on http://127.0.0.1:{port}");

    axum::serve(listener, api.into_make_service()).await?;
    Ok(())
}
