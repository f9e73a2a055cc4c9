//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use clustercron::{Event, EventHandler, JobKey};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Config index used by every test cluster.
pub const INDEX: &str = "jobs";

/// A job document firing every `interval`.
pub fn interval_job(interval: &str) -> Value {
    json!({"trigger": {"schedule": {"interval": interval}}})
}

/// A job document pinned to an ownership hash.
pub fn pinned_job(interval: &str, hash: u64) -> Value {
    json!({"hash": hash, "trigger": {"schedule": {"interval": interval}}})
}

pub fn key(name: &str) -> JobKey {
    JobKey::new(INDEX, name)
}

/// Wait for a condition to become true, polling every 10ms.
///
/// This is more reliable than fixed sleeps since scheduling latency can
/// vary.
///
/// # Panics
///
/// Panics if the timeout is reached before the condition holds.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("Timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Recording event handler for verifying events.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn failed_completions(&self) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| matches!(e, Event::JobCompleted { success, .. } if !*success))
            .count()
    }

    /// `fire_now` flags of every misfire seen.
    pub async fn misfires(&self) -> Vec<bool> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::JobMisfired { fire_now, .. } => Some(*fire_now),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}
