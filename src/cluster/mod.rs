//! Cluster awareness: membership, node filters and job ownership.

mod action;
mod comparator;
mod distributor;
mod filter;
mod membership;
mod node;

pub use action::{
    ConfigUpdateBus, ConfigUpdateRequest, ConfigUpdateResponse, NodeUpdateResponse,
    SchedulerConfigUpdateAction,
};
pub use comparator::{NodeComparator, NodeIdComparator, NodeNameComparator};
pub use distributor::{JobDistributor, resolve_owner};
pub use filter::{NodeFilter, NodeFilterError};
pub use membership::{LocalMembership, MembershipProvider, StaticMembership};
pub use node::NodeDescriptor;
