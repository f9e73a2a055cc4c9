use std::cmp::Ordering;

use super::node::NodeDescriptor;

/// Total order over nodes. Every node must use the same comparator or the
/// cluster will disagree about ownership.
pub trait NodeComparator: Send + Sync {
    fn compare(&self, a: &NodeDescriptor, b: &NodeDescriptor) -> Ordering;
}

/// Orders nodes by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeIdComparator;

impl NodeComparator for NodeIdComparator {
    fn compare(&self, a: &NodeDescriptor, b: &NodeDescriptor) -> Ordering {
        a.id.cmp(&b.id)
    }
}

/// Orders nodes by name, falling back to the id for equal names.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeNameComparator;

impl NodeComparator for NodeNameComparator {
    fn compare(&self, a: &NodeDescriptor, b: &NodeDescriptor) -> Ordering {
        a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id))
    }
}
