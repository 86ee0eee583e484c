//! Injectable time, sleep and identifier sources.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;

    fn now_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.now_ms())
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Suspends a retry loop between attempts.
#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    async fn sleep_ms(&self, delay_ms: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep_ms(&self, delay_ms: u64) {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

pub trait EventKeyFactory: Send + Sync + 'static {
    fn new_event_key(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeyFactory;

impl EventKeyFactory for UuidKeyFactory {
    fn new_event_key(&self) -> String {
        format!("evt_{}", uuid::Uuid::new_v4().simple())
    }
}
