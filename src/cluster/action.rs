//! Cluster-wide "config updated" signal.
//!
//! Each running scheduler registers itself on a shared [`ConfigUpdateBus`]
//! under its node id and scheduler name. [`SchedulerConfigUpdateAction`]
//! fans a request out to every registration with a given name and collects
//! one response per node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::core::types::NodeId;

/// Default time to wait for a node to answer.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A request delivered to one scheduler instance.
#[derive(Debug)]
pub struct ConfigUpdateRequest {
    /// Receives the update summary or an error message.
    pub respond_to: oneshot::Sender<Result<String, String>>,
}

#[derive(Debug)]
struct Registration {
    id: u64,
    node: NodeId,
    scheduler: String,
    tx: mpsc::Sender<ConfigUpdateRequest>,
}

#[derive(Debug, Default)]
struct BusInner {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

/// Registry of scheduler instances reachable by the update action.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdateBus {
    inner: Arc<BusInner>,
}

impl ConfigUpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scheduler instance. Returns the registration id and the
    /// receiving end for update requests.
    pub fn register(
        &self,
        node: NodeId,
        scheduler: impl Into<String>,
    ) -> (u64, mpsc::Receiver<ConfigUpdateRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut registrations = self
            .inner
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registrations.push(Registration {
            id,
            node,
            scheduler: scheduler.into(),
            tx,
        });
        (id, rx)
    }

    /// Remove a registration.
    pub fn unregister(&self, id: u64) {
        let mut registrations = self
            .inner
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registrations.retain(|r| r.id != id);
    }

    /// Number of live registrations for a scheduler name.
    pub fn instance_count(&self, scheduler: &str) -> usize {
        self.targets(scheduler).len()
    }

    fn targets(&self, scheduler: &str) -> Vec<(NodeId, mpsc::Sender<ConfigUpdateRequest>)> {
        self.inner
            .registrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|r| r.scheduler == scheduler && !r.tx.is_closed())
            .map(|r| (r.node.clone(), r.tx.clone()))
            .collect()
    }
}

/// Answer of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpdateResponse {
    pub node: NodeId,
    /// The update summary, or why the node failed.
    pub result: Result<String, String>,
}

/// Per-node answers to a config update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdateResponse {
    pub nodes: Vec<NodeUpdateResponse>,
}

impl ConfigUpdateResponse {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = &NodeUpdateResponse> {
        self.nodes.iter().filter(|n| n.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeUpdateResponse> {
        self.nodes.iter().filter(|n| n.result.is_err())
    }
}

/// Tells every instance of a named scheduler to reload its config index.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfigUpdateAction;

impl SchedulerConfigUpdateAction {
    pub const NAME: &'static str = "cluster:admin/scheduler/config/update";

    /// Broadcast an update to every instance of `scheduler_name`.
    ///
    /// A name with no running instance yields an empty response.
    pub async fn send(bus: &ConfigUpdateBus, scheduler_name: &str) -> ConfigUpdateResponse {
        Self::send_with_timeout(bus, scheduler_name, DEFAULT_RESPONSE_TIMEOUT).await
    }

    /// Like [`send`](Self::send) with an explicit per-node timeout.
    pub async fn send_with_timeout(
        bus: &ConfigUpdateBus,
        scheduler_name: &str,
        timeout: Duration,
    ) -> ConfigUpdateResponse {
        let mut pending = Vec::new();
        for (node, tx) in bus.targets(scheduler_name) {
            let (respond_to, response) = oneshot::channel();
            match tx.send(ConfigUpdateRequest { respond_to }).await {
                Ok(()) => pending.push((node, Some(response))),
                Err(_) => pending.push((node, None)),
            }
        }

        let mut nodes = Vec::with_capacity(pending.len());
        for (node, response) in pending {
            let result = match response {
                None => Err("scheduler stopped".to_string()),
                Some(rx) => match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err("scheduler dropped the request".to_string()),
                    Err(_) => Err(format!("no response within {:?}", timeout)),
                },
            };
            if let Err(e) = &result {
                tracing::warn!(node = %node, scheduler = scheduler_name, error = %e, "config update failed");
            }
            nodes.push(NodeUpdateResponse { node, result });
        }

        ConfigUpdateResponse { nodes }
    }
}
