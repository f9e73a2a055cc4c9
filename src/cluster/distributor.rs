//! Deterministic job ownership.
//!
//! Every node evaluates the same rule against its own membership snapshot:
//! the eligible nodes are filtered, sorted with the configured comparator,
//! and job `j` belongs to `eligible[hash(j) % eligible.len()]`. There is no
//! coordinator, so two nodes with different snapshots may briefly disagree.

use std::collections::HashSet;
use std::sync::Arc;

use super::comparator::NodeComparator;
use super::filter::NodeFilter;
use super::membership::MembershipProvider;
use super::node::NodeDescriptor;
use crate::core::job::JobConfig;
use crate::core::types::NodeId;

/// Pick the owner of `hash` among the sorted `nodes`.
pub fn resolve_owner(hash: u64, nodes: &[NodeDescriptor]) -> Option<&NodeDescriptor> {
    if nodes.is_empty() {
        return None;
    }
    let index = (hash % nodes.len() as u64) as usize;
    nodes.get(index)
}

/// Decides which jobs the local node is responsible for.
pub struct JobDistributor {
    membership: Arc<dyn MembershipProvider>,
    filter: Option<NodeFilter>,
    comparator: Arc<dyn NodeComparator>,
    local: NodeDescriptor,
    eligible: Vec<NodeDescriptor>,
}

impl JobDistributor {
    /// Create a distributor and take the first membership snapshot.
    ///
    /// Without a filter every live node is eligible.
    pub fn new(
        membership: Arc<dyn MembershipProvider>,
        filter: Option<NodeFilter>,
        comparator: Arc<dyn NodeComparator>,
    ) -> Self {
        let local = membership.local_node();
        let mut distributor = Self {
            membership,
            filter,
            comparator,
            local,
            eligible: Vec::new(),
        };
        distributor.refresh();
        distributor
    }

    /// Take a new membership snapshot. Returns whether the eligible set
    /// changed.
    pub fn refresh(&mut self) -> bool {
        let live = self.membership.live_nodes();
        let mut eligible = match &self.filter {
            Some(filter) => filter.select(&live, &self.local.id),
            None => live,
        };
        eligible.sort_by(|a, b| self.comparator.compare(a, b));
        eligible.dedup_by(|a, b| a.id == b.id);

        let changed = eligible != self.eligible;
        if changed {
            tracing::debug!(
                node = %self.local.id,
                eligible = ?eligible.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
                "eligible node set changed"
            );
        }
        self.eligible = eligible;
        changed
    }

    /// The owner of a job, or `None` when no node is eligible.
    pub fn owner_of(&self, job: &JobConfig) -> Option<&NodeDescriptor> {
        resolve_owner(job.effective_hash(), &self.eligible)
    }

    /// Whether the local node owns the job.
    pub fn is_responsible(&self, job: &JobConfig) -> bool {
        let responsible = self
            .owner_of(job)
            .is_some_and(|owner| owner.id == self.local.id);
        tracing::debug!(
            job = %job.key(),
            node = %self.local.id,
            responsible,
            "ownership decision"
        );
        responsible
    }

    /// Ids of every live node, eligible or not.
    pub fn live_node_ids(&self) -> HashSet<NodeId> {
        self.membership
            .live_nodes()
            .into_iter()
            .map(|node| node.id)
            .collect()
    }

    /// The sorted eligible node set.
    pub fn eligible_nodes(&self) -> &[NodeDescriptor] {
        &self.eligible
    }

    pub fn is_local_node_eligible(&self) -> bool {
        self.eligible.iter().any(|n| n.id == self.local.id)
    }

    pub fn local_node(&self) -> &NodeDescriptor {
        &self.local
    }

    pub fn filter(&self) -> Option<&NodeFilter> {
        self.filter.as_ref()
    }
}
