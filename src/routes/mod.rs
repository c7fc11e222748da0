use axum::http::StatusCode;

pub mod attendance;
pub mod device;
pub mod health;
pub mod holidays;
pub mod regularisation;
pub mod shifts;
pub mod staffs;

// Common error mapper
pub fn internal_error<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("internal error: {e}"))
}
