//! Lifecycle events and event handling.
//!
//! This module provides event emission for job firings, completions,
//! misfires and config reloads, enabling observability into a scheduler
//! instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobKey, NodeId, RunId};

/// Lifecycle events emitted by a scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A trigger fired and the job was handed to the execution pool.
    JobFired {
        key: JobKey,
        run_id: RunId,
        node: NodeId,
        scheduled_fire_time: DateTime<Utc>,
        timestamp: Instant,
    },

    /// A job run finished (successfully or not).
    JobCompleted {
        key: JobKey,
        run_id: RunId,
        success: bool,
        error: Option<String>,
        duration: Duration,
        timestamp: Instant,
    },

    /// A trigger missed its fire time by more than the misfire threshold.
    JobMisfired {
        key: JobKey,
        /// The fire time that was missed.
        missed_fire_time: DateTime<Utc>,
        /// Whether the job fires once now or the fire was dropped.
        fire_now: bool,
        timestamp: Instant,
    },

    /// The set of scheduled jobs changed after a config reload.
    JobsUpdated {
        new: usize,
        updated: usize,
        deleted: usize,
        timestamp: Instant,
    },

    /// The eligible node set changed.
    OwnershipChanged {
        node: NodeId,
        eligible_nodes: usize,
        local_eligible: bool,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobFired { timestamp, .. } => *timestamp,
            Event::JobCompleted { timestamp, .. } => *timestamp,
            Event::JobMisfired { timestamp, .. } => *timestamp,
            Event::JobsUpdated { timestamp, .. } => *timestamp,
            Event::OwnershipChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Create a JobFired event.
    pub fn job_fired(
        key: JobKey,
        run_id: RunId,
        node: NodeId,
        scheduled_fire_time: DateTime<Utc>,
    ) -> Self {
        Event::JobFired {
            key,
            run_id,
            node,
            scheduled_fire_time,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobCompleted event.
    pub fn job_completed(
        key: JobKey,
        run_id: RunId,
        error: Option<String>,
        duration: Duration,
    ) -> Self {
        Event::JobCompleted {
            key,
            run_id,
            success: error.is_none(),
            error,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobMisfired event.
    pub fn job_misfired(key: JobKey, missed_fire_time: DateTime<Utc>, fire_now: bool) -> Self {
        Event::JobMisfired {
            key,
            missed_fire_time,
            fire_now,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobsUpdated event.
    pub fn jobs_updated(new: usize, updated: usize, deleted: usize) -> Self {
        Event::JobsUpdated {
            new,
            updated,
            deleted,
            timestamp: Instant::now(),
        }
    }

    /// Create an OwnershipChanged event.
    pub fn ownership_changed(node: NodeId, eligible_nodes: usize, local_eligible: bool) -> Self {
        Event::OwnershipChanged {
            node,
            eligible_nodes,
            local_eligible,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
