//! Task-to-node mapping policy.
//!
//! Given the registry occupancy and the host topology, a policy decides
//! how many threads a registering participant gets and how they spread
//! across nodes. The policy runs inside the registry's critical section,
//! serialized against every other committer.
//!
//! [`EqualShare`] is the built-in heuristic; the [`MappingPolicy`] trait
//! is the seam for substituting a history- or model-based strategy
//! without touching the registry.

use crate::error::{Error, Result};
use crate::numa::mask::NodeMask;
use crate::numa::topology::Topology;
use crate::registry::SharedState;
use common::consts::MAX_NODES;

/// One participant's placement: how many threads land on each node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// Total thread count requested by or granted to the participant.
    pub total_tasks: u32,
    /// Threads mapped to node `i`. Entries at or beyond the host's
    /// configured nodes are always zero.
    pub per_node: [u32; MAX_NODES],
}

impl ExecSpec {
    /// The empty placement.
    pub fn empty() -> Self {
        Self {
            total_tasks: 0,
            per_node: [0; MAX_NODES],
        }
    }

    /// A placement of `tasks` threads all on a single node.
    pub fn on_node(node: usize, tasks: u32) -> Result<Self> {
        if node >= MAX_NODES {
            return Err(Error::InvalidNode { node });
        }
        let mut spec = Self::empty();
        spec.total_tasks = tasks;
        spec.per_node[node] = tasks;
        Ok(spec)
    }

    /// Sum of the per-node assignments.
    pub fn assigned_total(&self) -> u32 {
        self.per_node.iter().sum()
    }

    /// The nodes carrying at least one thread.
    pub fn node_mask(&self) -> NodeMask {
        let mut mask = NodeMask::new();
        for (node, &tasks) in self.per_node.iter().enumerate() {
            if tasks > 0 {
                // node < MAX_NODES by construction
                let _ = mask.set(node);
            }
        }
        mask
    }

    /// Check the spec invariants against a host with `num_nodes`
    /// configured nodes.
    pub fn validate(&self, num_nodes: usize) -> Result<()> {
        if let Some(node) = (num_nodes..MAX_NODES).find(|&node| self.per_node[node] > 0) {
            return Err(Error::InvalidNode { node });
        }
        let assigned = self.assigned_total();
        if assigned != self.total_tasks {
            return Err(Error::InvalidSpec {
                reason: format!(
                    "per-node assignments sum to {assigned}, expected {}",
                    self.total_tasks
                ),
            });
        }
        Ok(())
    }
}

impl Default for ExecSpec {
    fn default() -> Self {
        Self::empty()
    }
}

/// Registry occupancy snapshot handed to a policy.
///
/// Captured inside the critical section, after the registering
/// participant has been counted: `num_apps` includes the caller.
#[derive(Debug, Clone)]
pub struct RegistryView {
    /// Registered participants, including the caller.
    pub num_apps: u32,
    /// Tasks committed by all current registrations.
    pub num_tasks: u32,
    /// Per-node committed task counts.
    pub task_count: [u32; MAX_NODES],
}

impl RegistryView {
    /// Snapshot the locked registry state.
    pub fn capture(state: &SharedState) -> Self {
        Self {
            num_apps: state.num_apps,
            num_tasks: state.num_tasks,
            task_count: state.task_count,
        }
    }
}

/// Strategy deciding thread count and per-node distribution.
pub trait MappingPolicy: Send {
    /// Produce a placement for a registering participant.
    ///
    /// `prev` is the participant's last committed placement, usable as a
    /// memory-affinity hint. Runs under the registry lock; must not block.
    fn assign(&self, topo: &Topology, view: &RegistryView, prev: Option<&ExecSpec>) -> ExecSpec;
}

/// The built-in heuristic: give every application an equal share of the
/// host's processors and fill nodes in priority order.
///
/// With `numa_aware` set, nodes used by the participant's previous
/// placement are preferred so already-allocated pages stay local.
#[derive(Debug, Clone, Default)]
pub struct EqualShare {
    /// Prefer re-using the nodes of the previous placement.
    pub numa_aware: bool,
}

impl EqualShare {
    /// Read the NUMA-aware toggle from `OMP_NUMA_AWARE_MAPPING`.
    pub fn from_env() -> Self {
        Self {
            numa_aware: common::config::numa_aware_mapping(),
        }
    }
}

impl MappingPolicy for EqualShare {
    fn assign(&self, topo: &Topology, view: &RegistryView, prev: Option<&ExecSpec>) -> ExecSpec {
        let target = equal_share_target(topo.num_configured_cpus(), view.num_apps);
        distribute(target, topo, view, prev, self.numa_aware)
    }
}

/// `num_procs` for the first application, `ceil(num_procs / num_apps)`
/// afterwards. `num_apps` already counts the caller.
fn equal_share_target(num_procs: usize, num_apps: u32) -> u32 {
    if num_apps == 0 {
        num_procs as u32
    } else {
        num_procs.div_ceil(num_apps as usize) as u32
    }
}

/// Distribute `target` tasks over the configured nodes.
///
/// Nodes are visited in ascending index order within each pass:
///
/// 1. empty nodes from the previous placement (NUMA-aware only)
/// 2. not-full nodes from the previous placement (NUMA-aware only)
/// 3. empty nodes
/// 4. not-full nodes
/// 5. oversubscription: repeatedly round the least-loaded node up to the
///    next multiple of the per-node capacity; ties prefer previous-
///    placement nodes when NUMA-aware, the lowest index otherwise.
fn distribute(
    target: u32,
    topo: &Topology,
    view: &RegistryView,
    prev: Option<&ExecSpec>,
    numa_aware: bool,
) -> ExecSpec {
    let nodes = topo.num_configured_nodes();
    let cap = topo.procs_per_node() as u32;
    let mut local = view.task_count;
    let mut spec = ExecSpec::empty();
    spec.total_tasks = target;
    let mut remaining = target;

    let in_prev = |node: usize| prev.is_some_and(|p| p.per_node[node] > 0);

    if numa_aware {
        fill_pass(&mut remaining, cap, nodes, &mut local, &mut spec.per_node, |node, count| {
            count == 0 && in_prev(node)
        });
        fill_pass(&mut remaining, cap, nodes, &mut local, &mut spec.per_node, |node, count| {
            count < cap && in_prev(node)
        });
    }

    fill_pass(&mut remaining, cap, nodes, &mut local, &mut spec.per_node, |_, count| {
        count == 0
    });
    fill_pass(&mut remaining, cap, nodes, &mut local, &mut spec.per_node, |_, count| {
        count < cap
    });

    // Oversubscription pass.
    while remaining > 0 {
        let mut smallest = 0;
        let mut smallest_count = u32::MAX;
        for node in 0..nodes {
            let better = local[node] < smallest_count
                || (numa_aware
                    && local[node] == smallest_count
                    && in_prev(node)
                    && !in_prev(smallest));
            if better {
                smallest = node;
                smallest_count = local[node];
            }
        }

        let chunk = remaining.min(cap - (local[smallest] % cap));
        spec.per_node[smallest] += chunk;
        local[smallest] += chunk;
        remaining -= chunk;
    }

    spec
}

/// One distribution pass: assign up to the per-node headroom to every
/// eligible node, in ascending index order, until nothing remains.
fn fill_pass(
    remaining: &mut u32,
    cap: u32,
    nodes: usize,
    local: &mut [u32; MAX_NODES],
    per_node: &mut [u32; MAX_NODES],
    eligible: impl Fn(usize, u32) -> bool,
) {
    for node in 0..nodes {
        if *remaining == 0 {
            break;
        }
        if !eligible(node, local[node]) {
            continue;
        }
        let chunk = (*remaining).min(cap - local[node]);
        per_node[node] += chunk;
        local[node] += chunk;
        *remaining -= chunk;
    }
}
