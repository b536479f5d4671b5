//! Portable access to the host NUMA facility.
//!
//! Three layers: [`mask`] holds the node/CPU set value types, [`topology`]
//! probes the host layout from sysfs, and [`bind`] applies CPU-affinity
//! and memory-policy changes to the calling task.

pub mod bind;
pub mod mask;
pub mod topology;

pub use bind::{
    bind, bind_from_env, bind_node, bind_nodes, current_cpu, mem_info, membind_mask,
    preferred_node, run_cpu_mask, run_node_mask, set_cpu_affinity, set_membind,
    set_membind_node, task_info,
};
pub use mask::{CpuMask, NodeMask};
pub use topology::{Topology, available};
