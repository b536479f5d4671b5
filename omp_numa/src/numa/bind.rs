//! CPU-affinity and memory-policy binding for the calling task.
//!
//! Memory policy goes through the raw `set_mempolicy` / `get_mempolicy` /
//! `migrate_pages` syscalls; CPU placement through `sched_setaffinity`.
//! Affinity and policy are per-thread attributes: binding from one thread
//! does not move its siblings.

use crate::error::{Error, Result};
use crate::numa::mask::{CpuMask, NodeMask};
use crate::numa::topology::Topology;
use common::config::{self, Placement};
use common::consts::{ANY_NODE, MAX_NODES};
use std::io;
use std::mem;
use tracing::debug;

// Memory-policy modes, from <numaif.h>.
const MPOL_PREFERRED: libc::c_long = 1;
const MPOL_BIND: libc::c_long = 2;

// Nodemask width handed to the kernel. The kernel transfers
// ceil(MAXNODE / 64) words, so 64 keeps every mask to exactly the one
// u64 word the call sites allocate.
const MAXNODE: libc::c_ulong = MAX_NODES as libc::c_ulong;

fn os_error() -> Error {
    Error::Io {
        source: io::Error::last_os_error(),
    }
}

/// The CPU currently executing the calling thread.
pub fn current_cpu() -> usize {
    // SAFETY: sched_getcpu has no memory-safety preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 { cpu as usize } else { 0 }
}

/// The CPUs the calling thread may run on.
pub fn run_cpu_mask() -> Result<CpuMask> {
    // SAFETY: the kernel writes at most sizeof(cpu_set_t) bytes into set.
    let set = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(os_error());
        }
        set
    };

    let mut cpus = CpuMask::new();
    for cpu in 0..libc::CPU_SETSIZE as usize {
        if unsafe { libc::CPU_ISSET(cpu, &set) } {
            cpus.set(cpu);
        }
    }
    Ok(cpus)
}

/// The nodes the calling thread may run on, derived from its CPU affinity.
pub fn run_node_mask(topo: &Topology) -> Result<NodeMask> {
    let cpus = run_cpu_mask()?;
    let mut nodes = NodeMask::new();
    for cpu in cpus.iter() {
        if let Some(node) = topo.node_of_cpu(cpu) {
            // Configured nodes fit the mask; ignore stray CPUs.
            let _ = nodes.set(node);
        }
    }
    Ok(nodes)
}

/// Restrict the calling thread to the given CPUs.
pub fn set_cpu_affinity(cpus: &CpuMask) -> Result<()> {
    if cpus.is_empty() {
        return Err(Error::InvalidSpec {
            reason: "CPU set for affinity is empty".to_string(),
        });
    }

    // SAFETY: cpu_set_t is plain data; CPU indices are bounded by
    // CPU_SETSIZE before insertion.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in cpus.iter().filter(|&cpu| cpu < libc::CPU_SETSIZE as usize) {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(os_error());
        }
    }
    Ok(())
}

/// Bind the calling thread's memory policy to the given nodes.
pub fn set_membind(nodes: &NodeMask) -> Result<()> {
    if nodes.is_empty() {
        return Err(Error::InvalidSpec {
            reason: "node set for memory policy is empty".to_string(),
        });
    }

    let mask = nodes.to_raw();
    // SAFETY: MAXNODE is 64 bits, so the kernel reads exactly one u64.
    let rc = unsafe { libc::syscall(libc::SYS_set_mempolicy, MPOL_BIND, &mask, MAXNODE) };
    if rc != 0 {
        return Err(os_error());
    }
    Ok(())
}

/// The calling thread's memory-policy node set.
///
/// Threads running under the default local policy report every configured
/// node.
pub fn membind_mask(topo: &Topology) -> Result<NodeMask> {
    let (mode, mask) = get_mempolicy()?;
    if mode == MPOL_BIND as libc::c_int || mode == MPOL_PREFERRED as libc::c_int {
        Ok(NodeMask::from_raw(mask))
    } else {
        Ok(topo.all_nodes())
    }
}

/// The node new allocations prefer.
///
/// Under an explicit policy this is its lowest node; under the default
/// local policy it is the node of the current CPU.
pub fn preferred_node(topo: &Topology) -> Result<usize> {
    let (mode, mask) = get_mempolicy()?;
    if mode == MPOL_BIND as libc::c_int || mode == MPOL_PREFERRED as libc::c_int {
        if let Some(node) = NodeMask::from_raw(mask).first() {
            return Ok(node);
        }
    }
    Ok(topo.node_of_cpu(current_cpu()).unwrap_or(0))
}

fn get_mempolicy() -> Result<(libc::c_int, u64)> {
    let mut mode: libc::c_int = 0;
    let mut mask: u64 = 0;
    // SAFETY: MAXNODE is 64 bits, so the kernel writes one c_int and
    // exactly one u64.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut mode,
            &mut mask,
            MAXNODE,
            std::ptr::null_mut::<libc::c_void>(),
            0u64,
        )
    };
    if rc != 0 {
        return Err(os_error());
    }
    Ok((mode, mask))
}

/// Move the calling task's already-touched pages from `from` to `to`.
pub fn migrate_self(from: &NodeMask, to: &NodeMask) -> Result<()> {
    let from = from.to_raw();
    let to = to.to_raw();
    // SAFETY: pid 0 targets the calling task; MAXNODE is 64 bits, so the
    // kernel reads exactly one u64 from each mask.
    let rc = unsafe { libc::syscall(libc::SYS_migrate_pages, 0, MAXNODE, &from, &to) };
    if rc < 0 {
        return Err(os_error());
    }
    Ok(())
}

/// Bind memory and execution of the calling task.
///
/// When `mem == exec` the combined path is taken: optionally migrate the
/// task's pages from its current membind set to `mem`, then restrict both
/// execution and allocation to it. Otherwise CPU affinity follows `exec`
/// and the memory policy follows `mem`, independently and without
/// migration.
pub fn bind(topo: &Topology, mem: &NodeMask, exec: &NodeMask, migrate: bool) -> Result<()> {
    if mem.is_empty() || exec.is_empty() {
        return Err(Error::InvalidSpec {
            reason: "node sets for binding must be non-empty".to_string(),
        });
    }

    debug!(mem = %mem, exec = %exec, migrate, "binding task");

    if mem == exec && migrate {
        let current = membind_mask(topo)?;
        migrate_self(&current, mem)?;
    }
    set_cpu_affinity(&topo.cpus_for(exec))?;
    set_membind(mem)
}

/// Bind memory and execution to a single node, optionally migrating the
/// task's pages there.
pub fn bind_node(topo: &Topology, node: usize, migrate: bool) -> Result<()> {
    ensure_allowed(topo, node)?;
    let mask = NodeMask::single(node)?;
    bind(topo, &mask, &mask, migrate)
}

/// Bind only the memory policy to a single node, optionally migrating the
/// task's pages there.
pub fn set_membind_node(topo: &Topology, node: usize, migrate: bool) -> Result<()> {
    ensure_allowed(topo, node)?;
    let mask = NodeMask::single(node)?;
    if migrate {
        let current = membind_mask(topo)?;
        migrate_self(&current, &mask)?;
    }
    set_membind(&mask)
}

/// Bind memory and execution to a pair of single nodes.
///
/// [`ANY_NODE`] on either side expands to every configured node, leaving
/// that dimension effectively unconstrained.
pub fn bind_nodes(topo: &Topology, mem_node: usize, exec_node: usize, migrate: bool) -> Result<()> {
    let expand = |node: usize| -> Result<NodeMask> {
        if node == ANY_NODE {
            Ok(topo.all_nodes())
        } else if node >= topo.num_configured_nodes() {
            Err(Error::InvalidNode { node })
        } else {
            NodeMask::single(node)
        }
    };
    bind(topo, &expand(mem_node)?, &expand(exec_node)?, migrate)
}

/// Apply the placement requested through the environment.
///
/// `NUMA_BIND_TO_NODES` binds both dimensions; otherwise `NUMA_CPU_NODES`
/// and `NUMA_MEM_NODES` bind each side, an unset side defaulting to every
/// configured node. With nothing set the current policy is left untouched.
pub fn bind_from_env(topo: &Topology, migrate: bool) -> Result<()> {
    let Some(placement) = config::placement_from_env()? else {
        return Ok(());
    };

    let to_mask = |nodes: &[usize]| -> Result<NodeMask> {
        for &node in nodes {
            if node >= topo.num_configured_nodes() {
                return Err(Error::InvalidNode { node });
            }
        }
        NodeMask::from_nodes(nodes)
    };

    match placement {
        Placement::BindTo(nodes) => {
            let mask = to_mask(&nodes)?;
            bind(topo, &mask, &mask, migrate)
        }
        Placement::Split { cpu, mem } => {
            let exec = match cpu {
                Some(nodes) => to_mask(&nodes)?,
                None => topo.all_nodes(),
            };
            let mem = match mem {
                Some(nodes) => to_mask(&nodes)?,
                None => topo.all_nodes(),
            };
            bind(topo, &mem, &exec, migrate)
        }
    }
}

/// Current memory-policy description, e.g. `"Node(s): 0,1"`.
pub fn mem_info(topo: &Topology) -> Result<String> {
    Ok(format!("Node(s): {}", membind_mask(topo)?))
}

/// Current execution description, e.g.
/// `"Node(s): 0 -> CPU(s): 0,1,2,3 (executing on CPU 2)"`.
pub fn task_info(topo: &Topology) -> Result<String> {
    let nodes = run_node_mask(topo)?;
    let cpus = topo.cpus_for(&nodes);
    Ok(format!(
        "Node(s): {nodes} -> CPU(s): {cpus} (executing on CPU {})",
        current_cpu()
    ))
}

fn ensure_allowed(topo: &Topology, node: usize) -> Result<()> {
    if node >= topo.num_configured_nodes() || !topo.mems_allowed().is_set(node) {
        return Err(Error::InvalidNode { node });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sandboxes (e.g. default container seccomp profiles) deny the
    /// mempolicy syscalls outright; skip policy assertions there.
    fn mempolicy_usable() -> bool {
        get_mempolicy().is_ok()
    }

    #[test]
    fn test_run_cpu_mask_contains_current_cpu() {
        let cpus = run_cpu_mask().unwrap();
        assert!(!cpus.is_empty());
        assert!(cpus.is_set(current_cpu()));
    }

    #[test]
    fn test_bind_rejects_empty_sets() {
        let topo = Topology::probe().unwrap();
        let empty = NodeMask::new();
        let all = topo.all_nodes();
        assert!(matches!(
            bind(&topo, &empty, &all, false),
            Err(Error::InvalidSpec { .. })
        ));
        assert!(matches!(
            bind(&topo, &all, &empty, false),
            Err(Error::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_bind_node_rejects_unconfigured_node() {
        let topo = Topology::probe().unwrap();
        let node = topo.num_configured_nodes();
        assert!(matches!(
            bind_node(&topo, node, false),
            Err(Error::InvalidNode { .. })
        ));
        assert!(matches!(
            set_membind_node(&topo, node, false),
            Err(Error::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_bind_nodes_expands_any_node() {
        if !mempolicy_usable() {
            return;
        }
        let topo = Topology::probe().unwrap();
        // Affinity to every node is a no-op placement-wise; policy becomes
        // an explicit bind over all configured nodes.
        bind_nodes(&topo, ANY_NODE, ANY_NODE, false).unwrap();
        let bound = membind_mask(&topo).unwrap();
        assert_eq!(bound, topo.all_nodes());
    }

    #[test]
    fn test_membind_node_round_trip() {
        if !mempolicy_usable() {
            return;
        }
        let topo = Topology::probe().unwrap();
        set_membind_node(&topo, 0, false).unwrap();
        let bound = membind_mask(&topo).unwrap();
        assert!(bound.is_set(0));
        assert_eq!(preferred_node(&topo).unwrap(), 0);
    }

    #[test]
    fn test_info_strings_have_expected_shape() {
        let topo = Topology::probe().unwrap();
        let task = task_info(&topo).unwrap();
        assert!(task.contains("-> CPU(s): "));
        assert!(task.contains("executing on CPU"));

        if mempolicy_usable() {
            assert!(mem_info(&topo).unwrap().starts_with("Node(s): "));
        }
    }
}
