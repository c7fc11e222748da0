// backend/src/device/driver.rs
//
// Vendor protocol boundary. The connector never speaks the wire protocol
// itself; any vendor SDK plugs in behind these traits. Deployments without
// a linked driver run in bridge mode, where a relay agent next to the
// device pushes punches through the ingestion endpoint instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// A connected operation exceeded the protocol deadline. Fatal for the
    /// call; everything else is degradable.
    #[error("protocol timeout: {0}")]
    Timeout(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub serial_number: String,
    pub firmware: String,
    pub platform: String,
    pub device_time: DateTime<Utc>,
    pub user_count: u32,
    /// Punches recorded on the device for the current day.
    pub log_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUser {
    pub uid: u32,
    /// The staff number enrolled on the device.
    pub external_id: String,
    pub name: String,
    pub role: u8,
    pub card: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUserSpec {
    pub uid: u32,
    pub external_id: String,
    pub name: String,
    pub password: String,
    pub role: u8,
    pub card: u32,
}

/// One raw punch row as read off the device.
#[derive(Debug, Clone)]
pub struct RawPunch {
    pub external_id: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DeviceSession>, DriverError>;
}

/// A live protocol session. Sub-fields the firmware cannot answer come
/// back as "Unknown" rather than failing the call; only a true protocol
/// timeout surfaces as an error.
#[async_trait]
pub trait DeviceSession: Send {
    async fn info(&mut self) -> Result<DeviceInfo, DriverError>;
    async fn users(&mut self) -> Result<Vec<DeviceUser>, DriverError>;
    async fn attendance_logs(&mut self) -> Result<Vec<RawPunch>, DriverError>;
    async fn set_user(&mut self, user: &DeviceUserSpec) -> Result<(), DriverError>;
    async fn delete_user(&mut self, uid: u32) -> Result<(), DriverError>;
    async fn set_time(&mut self, now: DateTime<Utc>) -> Result<(), DriverError>;
    async fn clear_logs(&mut self) -> Result<(), DriverError>;
    async fn restart(&mut self) -> Result<(), DriverError>;
    async fn disconnect(&mut self);
}
