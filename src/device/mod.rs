// backend/src/device/mod.rs
//
// Owns the single logical session to the time-clock device. Every public
// operation serializes through one FIFO mutex and runs a full
// connect → operate → disconnect cycle; disconnection happens on every
// exit path, including timeouts.

pub mod driver;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::Config;
use driver::{DeviceDriver, DeviceInfo, DeviceSession, DeviceUser, DeviceUserSpec, DriverError, RawPunch};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("device operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("device protocol failure: {0}")]
    Protocol(String),
}

impl From<DriverError> for DeviceError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Timeout(msg) => DeviceError::Protocol(format!("protocol timeout: {msg}")),
            DriverError::Connect(msg) => DeviceError::Unreachable(msg),
            DriverError::Protocol(msg) => DeviceError::Protocol(msg),
        }
    }
}

/// Last-known device reachability, as reported to callers and cached in
/// the device_status row.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum DeviceReport {
    #[serde(rename = "ONLINE")]
    Online { info: DeviceInfo },
    /// The device is not directly reachable, but a bridge agent pushed
    /// punches recently, so attendance keeps flowing.
    #[serde(rename = "ONLINE_BRIDGE")]
    OfflineBridge {
        last_push: DateTime<Utc>,
        user_count: i64,
        log_count: i64,
    },
    #[serde(rename = "OFFLINE")]
    Offline { reason: String },
}

impl DeviceReport {
    pub fn status_label(&self) -> &'static str {
        match self {
            DeviceReport::Online { .. } => "ONLINE",
            DeviceReport::OfflineBridge { .. } => "ONLINE_BRIDGE",
            DeviceReport::Offline { .. } => "OFFLINE",
        }
    }
}

struct Inner {
    driver: Option<Box<dyn DeviceDriver>>,
    addr: Option<String>,
    probe_timeout: Duration,
    op_timeout: Duration,
    connect_retries: u32,
    connect_backoff: Duration,
    // FIFO: tokio's mutex queues waiters fairly, so concurrent callers are
    // served in arrival order.
    session: Mutex<()>,
}

#[derive(Clone)]
pub struct DeviceConnector {
    inner: Arc<Inner>,
}

impl DeviceConnector {
    pub fn new(cfg: &Config, driver: Option<Box<dyn DeviceDriver>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                addr: cfg.device_addr.clone(),
                probe_timeout: cfg.probe_timeout,
                op_timeout: cfg.op_timeout,
                connect_retries: cfg.connect_retries.max(1),
                connect_backoff: cfg.connect_backoff,
                session: Mutex::new(()),
            }),
        }
    }

    /// Cheap TCP reachability check. Deliberately much shorter than the
    /// operation timeout so bulk flows never stall on a dead link.
    pub async fn probe(&self) -> bool {
        let Some(addr) = self.inner.addr.as_deref() else {
            // No address configured: nothing to probe. Direct reachability
            // is then decided by whether a driver is linked at all.
            return self.inner.driver.is_some();
        };
        matches!(
            timeout(self.inner.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn open(&self) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let Some(driver) = self.inner.driver.as_ref() else {
            return Err(DeviceError::Unreachable(
                "no vendor driver linked (bridge mode)".into(),
            ));
        };
        let mut last = String::new();
        for attempt in 1..=self.inner.connect_retries {
            match driver.connect().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    last = e.to_string();
                    if attempt < self.inner.connect_retries {
                        tokio::time::sleep(self.inner.connect_backoff).await;
                    }
                }
            }
        }
        Err(DeviceError::Unreachable(format!(
            "connect failed after {} attempts: {last}",
            self.inner.connect_retries
        )))
    }

    fn settle<T>(
        &self,
        out: Result<Result<T, DriverError>, tokio::time::error::Elapsed>,
    ) -> Result<T, DeviceError> {
        match out {
            Err(_) => Err(DeviceError::Timeout(self.inner.op_timeout)),
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    pub async fn get_info(&self) -> Result<DeviceInfo, DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.info()).await;
        s.disconnect().await;
        self.settle(out)
    }

    pub async fn get_users(&self) -> Result<Vec<DeviceUser>, DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.users()).await;
        s.disconnect().await;
        self.settle(out)
    }

    pub async fn get_logs(&self) -> Result<Vec<RawPunch>, DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.attendance_logs()).await;
        s.disconnect().await;
        self.settle(out)
    }

    pub async fn set_user(&self, user: &DeviceUserSpec) -> Result<(), DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.set_user(user)).await;
        s.disconnect().await;
        self.settle(out)
    }

    pub async fn delete_user(&self, uid: u32) -> Result<(), DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.delete_user(uid)).await;
        s.disconnect().await;
        self.settle(out)
    }

    pub async fn sync_time(&self) -> Result<(), DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.set_time(Utc::now())).await;
        s.disconnect().await;
        self.settle(out)
    }

    pub async fn clear_logs(&self) -> Result<(), DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.clear_logs()).await;
        s.disconnect().await;
        self.settle(out)
    }

    pub async fn restart(&self) -> Result<(), DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let out = timeout(self.inner.op_timeout, s.restart()).await;
        s.disconnect().await;
        self.settle(out)
    }

    /// Pushes the staff directory onto the device in one session.
    pub async fn upload_users(&self, users: &[DeviceUserSpec]) -> Result<u32, DeviceError> {
        let _lease = self.inner.session.lock().await;
        if !self.probe().await {
            return Err(DeviceError::Unreachable("probe failed".into()));
        }
        let mut s = self.open().await?;
        let mut pushed = 0u32;
        for user in users {
            let out = timeout(self.inner.op_timeout, s.set_user(user)).await;
            if let Err(e) = self.settle(out) {
                s.disconnect().await;
                return Err(e);
            }
            pushed += 1;
        }
        s.disconnect().await;
        Ok(pushed)
    }

    /// Full status report: direct reachability wins; when the probe fails
    /// the cached liveness signal from recent bridge ingestion decides
    /// between degraded-online and offline.
    pub async fn report(&self, pool: &Pool<Postgres>) -> DeviceReport {
        match self.get_info().await {
            Ok(info) => DeviceReport::Online { info },
            Err(DeviceError::Unreachable(reason)) => match bridge_last_push(pool).await {
                Some(last_push) => {
                    let user_count = count_staff(pool).await;
                    let log_count = count_biometric_records(pool).await;
                    DeviceReport::OfflineBridge { last_push, user_count, log_count }
                }
                None => DeviceReport::Offline {
                    reason: format!("{reason}; no recent bridge data"),
                },
            },
            Err(e) => DeviceReport::Offline { reason: e.to_string() },
        }
    }
}

/// Timestamp of the latest BIOMETRIC-tagged record update within 24 h, if
/// any. This is the bridge liveness signal: the device may be reachable
/// only from the relay process, not from this service.
pub async fn bridge_last_push(pool: &Pool<Postgres>) -> Option<DateTime<Utc>> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        SELECT updated_at FROM attendance_records
         WHERE method = 'BIOMETRIC' AND updated_at >= now() - interval '24 hours'
         ORDER BY updated_at DESC
         LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
}

async fn count_staff(pool: &Pool<Postgres>) -> i64 {
    sqlx::query_scalar::<_, i64>(r#"SELECT count(*) FROM staff_profiles"#)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}

async fn count_biometric_records(pool: &Pool<Postgres>) -> i64 {
    sqlx::query_scalar::<_, i64>(
        r#"SELECT count(*) FROM attendance_records WHERE method = 'BIOMETRIC'"#,
    )
    .fetch_one(pool)
    .await
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    type EventLog = Arc<std::sync::Mutex<Vec<String>>>;

    struct MockDriver {
        events: EventLog,
        fail_connects: AtomicU32,
        op_delay: Duration,
        users: Vec<DeviceUser>,
    }

    struct MockSession {
        events: EventLog,
        op_delay: Duration,
        users: Vec<DeviceUser>,
        label: String,
    }

    impl MockDriver {
        fn new(events: EventLog) -> Self {
            Self {
                events,
                fail_connects: AtomicU32::new(0),
                op_delay: Duration::ZERO,
                users: vec![DeviceUser {
                    uid: 1,
                    external_id: "EMP001".into(),
                    name: "Asha".into(),
                    role: 0,
                    card: 0,
                }],
            }
        }
    }

    #[async_trait]
    impl DeviceDriver for MockDriver {
        async fn connect(&self) -> Result<Box<dyn DeviceSession>, DriverError> {
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(DriverError::Connect("simulated refusal".into()));
            }
            let n = {
                let mut log = self.events.lock().unwrap();
                log.push("connect".into());
                log.iter().filter(|e| e.starts_with("connect")).count()
            };
            Ok(Box::new(MockSession {
                events: self.events.clone(),
                op_delay: self.op_delay,
                users: self.users.clone(),
                label: format!("s{n}"),
            }))
        }
    }

    #[async_trait]
    impl DeviceSession for MockSession {
        async fn info(&mut self) -> Result<DeviceInfo, DriverError> {
            Err(DriverError::Protocol("not modeled".into()))
        }
        async fn users(&mut self) -> Result<Vec<DeviceUser>, DriverError> {
            tokio::time::sleep(self.op_delay).await;
            self.events.lock().unwrap().push(format!("{}:users", self.label));
            Ok(self.users.clone())
        }
        async fn attendance_logs(&mut self) -> Result<Vec<RawPunch>, DriverError> {
            Ok(Vec::new())
        }
        async fn set_user(&mut self, _user: &DeviceUserSpec) -> Result<(), DriverError> {
            Ok(())
        }
        async fn delete_user(&mut self, _uid: u32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn set_time(&mut self, _now: DateTime<Utc>) -> Result<(), DriverError> {
            Ok(())
        }
        async fn clear_logs(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn restart(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn disconnect(&mut self) {
            self.events.lock().unwrap().push(format!("{}:disconnect", self.label));
        }
    }

    fn test_config() -> Config {
        Config {
            device_addr: None,
            probe_timeout: Duration::from_millis(50),
            op_timeout: Duration::from_millis(200),
            connect_retries: 2,
            connect_backoff: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(60),
            auto_sync_interval: Duration::from_secs(900),
            tz_offset_min: 330,
            bridge_api_key: "k".into(),
            notify_webhook_url: None,
        }
    }

    fn connector_with(driver: MockDriver) -> DeviceConnector {
        DeviceConnector::new(&test_config(), Some(Box::new(driver)))
    }

    #[tokio::test]
    async fn callers_queue_in_fifo_order_with_full_cycles() {
        let events: EventLog = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut driver = MockDriver::new(events.clone());
        driver.op_delay = Duration::from_millis(50);
        let conn = connector_with(driver);

        let a = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.get_users().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.get_users().await })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());

        // Second caller only connects after the first has disconnected.
        let log = events.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["connect", "s1:users", "s1:disconnect", "connect", "s2:users", "s2:disconnect"]
        );
    }

    #[tokio::test]
    async fn op_timeout_is_fatal_but_still_disconnects() {
        let events: EventLog = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut driver = MockDriver::new(events.clone());
        driver.op_delay = Duration::from_millis(500); // beyond op_timeout
        let conn = connector_with(driver);

        match conn.get_users().await {
            Err(DeviceError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["connect", "s1:disconnect"]);
    }

    #[tokio::test]
    async fn connect_retries_within_budget_then_succeeds() {
        let events: EventLog = Arc::new(std::sync::Mutex::new(Vec::new()));
        let driver = MockDriver::new(events.clone());
        driver.fail_connects.store(1, Ordering::SeqCst);
        let conn = connector_with(driver);

        let users = conn.get_users().await.unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn connect_failures_exhaust_the_retry_budget() {
        let events: EventLog = Arc::new(std::sync::Mutex::new(Vec::new()));
        let driver = MockDriver::new(events.clone());
        driver.fail_connects.store(5, Ordering::SeqCst);
        let conn = connector_with(driver);

        match conn.get_users().await {
            Err(DeviceError::Unreachable(msg)) => assert!(msg.contains("2 attempts")),
            other => panic!("expected unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bridge_mode_without_driver_reports_unreachable() {
        let conn = DeviceConnector::new(&test_config(), None);
        match conn.get_users().await {
            Err(DeviceError::Unreachable(_)) => {}
            other => panic!("expected unreachable, got {other:?}"),
        }
    }
}
