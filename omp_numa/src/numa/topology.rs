//! Host NUMA topology discovery.
//!
//! Topology is probed once from sysfs/procfs and carried as an explicit
//! context value instead of module globals, so callers control when the
//! snapshot is taken and tests can run against synthetic layouts.
//!
//! Node indices are assumed contiguous from zero, matching the kernel's
//! numbering for configured nodes.

use crate::error::{Error, Result};
use crate::numa::mask::{CpuMask, NodeMask};
use common::config::parse_node_list;
use common::consts::MAX_NODES;
use std::fs;
use std::path::Path;
use tracing::debug;

const NODE_ROOT: &str = "/sys/devices/system/node";
const CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Whether the host exposes a NUMA topology.
pub fn available() -> bool {
    Path::new(NODE_ROOT).join("node0").exists()
}

/// A snapshot of the host's NUMA layout.
///
/// Hosts without an exposed topology degrade to a single node containing
/// every online CPU, mirroring the convention that node 0 always exists.
#[derive(Debug, Clone)]
pub struct Topology {
    num_nodes: usize,
    num_possible_nodes: usize,
    num_cpus: usize,
    num_possible_cpus: usize,
    page_size: usize,
    node_cpus: Vec<CpuMask>,
}

impl Topology {
    /// Probe the running host.
    pub fn probe() -> Result<Self> {
        let num_cpus = online_cpu_count();
        let page_size = page_size();

        if !available() {
            let mut cpus = CpuMask::new();
            for cpu in 0..num_cpus {
                cpus.set(cpu);
            }
            return Ok(Self {
                num_nodes: 1,
                num_possible_nodes: 1,
                num_cpus,
                num_possible_cpus: possible_count(CPU_ROOT).unwrap_or(num_cpus),
                page_size,
                node_cpus: vec![cpus],
            });
        }

        let num_nodes = online_node_count().min(MAX_NODES);
        let mut node_cpus = Vec::with_capacity(num_nodes);
        for node in 0..num_nodes {
            node_cpus.push(read_node_cpulist(node)?);
        }

        debug!(nodes = num_nodes, cpus = num_cpus, "probed NUMA topology");
        Ok(Self {
            num_nodes,
            num_possible_nodes: possible_count(NODE_ROOT).unwrap_or(num_nodes).min(MAX_NODES),
            num_cpus,
            num_possible_cpus: possible_count(CPU_ROOT).unwrap_or(num_cpus),
            page_size,
            node_cpus,
        })
    }

    /// A synthetic, evenly-split topology: `num_nodes` nodes of
    /// `procs_per_node` consecutive CPUs each.
    pub fn uniform(num_nodes: usize, procs_per_node: usize) -> Self {
        let num_nodes = num_nodes.clamp(1, MAX_NODES);
        let procs_per_node = procs_per_node.max(1);
        let node_cpus = (0..num_nodes)
            .map(|node| {
                let mut cpus = CpuMask::new();
                for cpu in node * procs_per_node..(node + 1) * procs_per_node {
                    cpus.set(cpu);
                }
                cpus
            })
            .collect();

        Self {
            num_nodes,
            num_possible_nodes: num_nodes,
            num_cpus: num_nodes * procs_per_node,
            num_possible_cpus: num_nodes * procs_per_node,
            page_size: 4096,
            node_cpus,
        }
    }

    /// Number of configured (online) nodes.
    pub fn num_configured_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Number of nodes the kernel could bring online.
    pub fn num_possible_nodes(&self) -> usize {
        self.num_possible_nodes
    }

    /// Number of online CPUs.
    pub fn num_configured_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Number of CPUs the kernel could bring online.
    pub fn num_possible_cpus(&self) -> usize {
        self.num_possible_cpus
    }

    /// System page size in bytes.
    pub fn pagesize(&self) -> usize {
        self.page_size
    }

    /// CPUs per node, assuming an even split across nodes.
    pub fn procs_per_node(&self) -> usize {
        (self.num_cpus / self.num_nodes).max(1)
    }

    /// Every configured node.
    pub fn all_nodes(&self) -> NodeMask {
        NodeMask::first_n(self.num_nodes)
    }

    /// The CPUs belonging to `node`.
    pub fn node_to_cpus(&self, node: usize) -> Result<&CpuMask> {
        self.node_cpus
            .get(node)
            .ok_or(Error::InvalidNode { node })
    }

    /// The node owning `cpu`, if any configured node contains it.
    pub fn node_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.node_cpus.iter().position(|cpus| cpus.is_set(cpu))
    }

    /// Union of the CPUs of every node in `nodes`.
    pub fn cpus_for(&self, nodes: &NodeMask) -> CpuMask {
        let mut cpus = CpuMask::new();
        for node in nodes.iter() {
            if let Some(node_cpus) = self.node_cpus.get(node) {
                cpus.union_with(node_cpus);
            }
        }
        cpus
    }

    /// Total and free memory of `node`, in bytes.
    pub fn node_size(&self, node: usize) -> Result<(u64, u64)> {
        if node >= self.num_nodes {
            return Err(Error::InvalidNode { node });
        }
        let path = format!("{NODE_ROOT}/node{node}/meminfo");
        let meminfo = fs::read_to_string(path)?;
        let total = meminfo_field(&meminfo, "MemTotal:");
        let free = meminfo_field(&meminfo, "MemFree:");
        match (total, free) {
            (Some(total), Some(free)) => Ok((total, free)),
            _ => Err(Error::Unavailable),
        }
    }

    /// The nodes this task may allocate memory on.
    ///
    /// Falls back to every configured node when the kernel does not report
    /// an allowed set.
    pub fn mems_allowed(&self) -> NodeMask {
        mems_allowed_list()
            .and_then(|list| NodeMask::parse(&list).ok())
            .unwrap_or_else(|| self.all_nodes())
    }
}

/// Parse a `kB`-denominated field out of a per-node meminfo file.
fn meminfo_field(meminfo: &str, field: &str) -> Option<u64> {
    for line in meminfo.lines() {
        let mut tokens = line.split_whitespace().skip_while(|t| *t != field);
        if tokens.next().is_some() {
            return tokens.next()?.parse::<u64>().ok().map(|kb| kb * 1024);
        }
    }
    None
}

fn read_node_cpulist(node: usize) -> Result<CpuMask> {
    let list = fs::read_to_string(format!("{NODE_ROOT}/node{node}/cpulist"))?;
    let mut cpus = CpuMask::new();
    // Memory-only nodes report an empty cpulist.
    if list.trim().is_empty() {
        return Ok(cpus);
    }
    for cpu in parse_node_list(list.trim())? {
        cpus.set(cpu);
    }
    Ok(cpus)
}

/// Count the entries of a sysfs `"0-N"` id list file, e.g. `cpu/online`.
fn id_list_count(path: &str) -> Option<usize> {
    let list = fs::read_to_string(path).ok()?;
    parse_node_list(list.trim()).ok().map(|ids| ids.len())
}

/// Highest possible id + 1 from a sysfs `possible` file.
fn possible_count(root: &str) -> Option<usize> {
    let list = fs::read_to_string(format!("{root}/possible")).ok()?;
    parse_node_list(list.trim())
        .ok()
        .and_then(|ids| ids.last().map(|&last| last + 1))
}

fn online_cpu_count() -> usize {
    id_list_count(&format!("{CPU_ROOT}/online"))
        .unwrap_or_else(|| {
            // SAFETY: sysconf has no memory-safety preconditions.
            let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
            if n > 0 { n as usize } else { 1 }
        })
        .max(1)
}

fn online_node_count() -> usize {
    id_list_count(&format!("{NODE_ROOT}/online")).unwrap_or(1).max(1)
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as usize } else { 4096 }
}

fn mems_allowed_list() -> Option<String> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Mems_allowed_list:"))
        .map(|list| list.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_at_least_one_node() {
        let topo = Topology::probe().unwrap();
        assert!(topo.num_configured_nodes() >= 1);
        assert!(topo.num_configured_cpus() >= 1);
        assert!(topo.pagesize() >= 4096);
        assert!(topo.num_possible_nodes() >= topo.num_configured_nodes());
    }

    #[test]
    fn test_probe_node0_has_cpus() {
        let topo = Topology::probe().unwrap();
        let cpus = topo.node_to_cpus(0).unwrap();
        assert!(!cpus.is_empty());
        let first = cpus.iter().next().unwrap();
        assert_eq!(topo.node_of_cpu(first), Some(0));
    }

    #[test]
    fn test_node_size_reports_memory() {
        if !available() {
            return;
        }
        let topo = Topology::probe().unwrap();
        let (total, free) = topo.node_size(0).unwrap();
        assert!(total > 0);
        assert!(free <= total);
        assert!(topo.node_size(topo.num_configured_nodes()).is_err());
    }

    #[test]
    fn test_mems_allowed_is_not_empty() {
        let topo = Topology::probe().unwrap();
        assert!(!topo.mems_allowed().is_empty());
    }

    #[test]
    fn test_uniform_layout() {
        let topo = Topology::uniform(4, 8);
        assert_eq!(topo.num_configured_nodes(), 4);
        assert_eq!(topo.num_configured_cpus(), 32);
        assert_eq!(topo.procs_per_node(), 8);
        assert_eq!(topo.node_of_cpu(17), Some(2));
        assert_eq!(topo.cpus_for(&topo.all_nodes()).count(), 32);
        assert!(topo.node_to_cpus(4).is_err());
    }

    #[test]
    fn test_meminfo_field_parsing() {
        let meminfo = "Node 0 MemTotal:       16318428 kB\nNode 0 MemFree:        1234 kB\n";
        assert_eq!(meminfo_field(meminfo, "MemTotal:"), Some(16318428 * 1024));
        assert_eq!(meminfo_field(meminfo, "MemFree:"), Some(1234 * 1024));
        assert_eq!(meminfo_field(meminfo, "MemUsed:"), None);
    }
}
