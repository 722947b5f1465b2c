// Topology oracle contract.
// The shuffle never discovers the job layout itself; it asks this trait.

use std::collections::BTreeSet;

use crate::Core::error::ShuffleResult;

/// Identity of a process in the global communication group.
pub type Rank = u32;

/// Identity of a node (a host running one local group of processes).
pub type NodeId = u32;

/// View of the job layout from one process.
///
/// Implementations must be consistent across the whole job: every process has
/// to agree on `node_of` and `representative` for the 3-hop routes to meet.
pub trait Topology: Send + Sync {
    /// My id in the global communication group.
    fn global_rank(&self) -> Rank;

    /// Number of processes in the global communication group.
    fn global_size(&self) -> usize;

    /// My id in my node's local group. Local id 0 is the local master.
    fn local_rank(&self) -> usize;

    /// Number of processes (including me) in my local group.
    fn local_size(&self) -> usize;

    /// The node hosting `rank`, or `None` if the rank is unknown.
    fn node_of(&self, rank: Rank) -> Option<NodeId>;

    /// The process on `on_node` that carries traffic to and from `for_node`.
    fn representative(&self, on_node: NodeId, for_node: NodeId) -> Option<Rank>;

    /// Barrier across my local group.
    fn local_barrier(&self) -> ShuffleResult<()>;

    /// Barrier across the global group.
    fn global_barrier(&self) -> ShuffleResult<()>;

    /// Ranks hosted on `node`, in rank order.
    fn node_members(&self, node: NodeId) -> Vec<Rank> {
        (0..self.global_size() as Rank)
            .filter(|&r| self.node_of(r) == Some(node))
            .collect()
    }

    /// Every node in the job, in id order.
    fn nodes(&self) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = (0..self.global_size() as Rank)
            .filter_map(|r| self.node_of(r))
            .collect();
        set.into_iter().collect()
    }
}
