// backend/src/models/mod.rs

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ───────────────────────────────────────
// Status & policy enums (TEXT columns)
// ───────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    HalfDay,
    Absent,
    Leave,
    Holiday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriteriaMode {
    #[default]
    GraceTime,
    #[sqlx(rename = "HOURS_8")]
    #[serde(rename = "HOURS_8")]
    Hours8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestMethod {
    Web,
    Biometric,
    ManualAdmin,
    Regularisation,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMethod {
    Auto,
    Manual,
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Running,
    Success,
    Failed,
}

// ───────────────────────────────────────
// Shift catalog
// ───────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Shift {
    pub shift_id: Uuid,
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub grace_minutes: i32,
    pub no_break: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ShiftAssignment {
    pub assignment_id: Uuid,
    pub staff_id: Uuid,
    pub shift_id: Uuid,
    pub from_date: NaiveDate,
    pub to_date: Option<NaiveDate>,
    pub grace_override: Option<i32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ───────────────────────────────────────
// Staff directory (HR-owned; read-only here
// except for the device linkage)
// ───────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StaffProfile {
    pub staff_id: Uuid,
    pub staff_number: Option<String>,
    pub full_name: String,
    pub department: Option<String>,
    pub legacy_shift_timing: Option<String>,
    pub legacy_grace_minutes: Option<i32>,
    pub criteria_mode: CriteriaMode,
    pub tz_offset_min: Option<i32>,
}

// ───────────────────────────────────────
// Attendance
// ───────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AttendanceRecord {
    pub record_id: Uuid,
    pub staff_id: Uuid,
    pub date: NaiveDate,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
    pub work_hours: Option<f64>,
    // Immutable snapshot of the shift resolved at write time; never
    // re-derived from the current catalog.
    pub shift_id: Option<Uuid>,
    pub shift_start: Option<NaiveTime>,
    pub shift_end: Option<NaiveTime>,
    pub grace_minutes_applied: Option<i32>,
    pub criteria_mode: Option<CriteriaMode>,
    pub method: IngestMethod,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ───────────────────────────────────────
// Regularisation
// ───────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RegularisationRequest {
    pub request_id: Uuid,
    pub staff_id: Uuid,
    pub date: NaiveDate,
    pub kind: String,
    pub reason: String,
    pub status: RequestStatus,
    pub approver: Option<String>,
    pub exceeds_quota: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Holiday {
    pub holiday_id: Uuid,
    pub date: NaiveDate,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ───────────────────────────────────────
// Sync bookkeeping
// ───────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncLog {
    pub sync_log_id: Uuid,
    pub method: SyncMethod,
    pub status: SyncStatus,
    pub logs_fetched: i32,
    pub logs_saved: i32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ───────────────────────────────────────
// DTOs helpful for endpoints
// ───────────────────────────────────────
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResult {
    pub success_count: u32,
    pub failed_count: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserAudit {
    pub matched: Vec<AuditMatch>,
    pub missing_on_device: Vec<AuditStaff>,
    pub orphaned_on_device: Vec<crate::device::driver::DeviceUser>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditMatch {
    pub staff_number: String,
    pub db_name: String,
    pub device_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditStaff {
    pub staff_number: String,
    pub name: String,
    pub department: Option<String>,
}
