//! Property tests for the mapping policy.

use omp_numa::{EqualShare, ExecSpec, MappingPolicy, RegistryView, Topology};
use proptest::prelude::*;

const MAX_NODES: usize = 64;

fn make_view(num_apps: u32, occupancy: &[u32]) -> RegistryView {
    let mut task_count = [0u32; MAX_NODES];
    task_count[..occupancy.len()].copy_from_slice(occupancy);
    RegistryView {
        num_apps,
        num_tasks: occupancy.iter().sum(),
        task_count,
    }
}

fn make_prev(per_node: &[u32]) -> ExecSpec {
    let mut spec = ExecSpec::empty();
    spec.per_node[..per_node.len()].copy_from_slice(per_node);
    spec.total_tasks = spec.assigned_total();
    spec
}

proptest! {
    /// Whatever the occupancy, every granted task lands on exactly one
    /// configured node.
    #[test]
    fn assignment_is_conserved(
        nodes in 1usize..=8,
        cap in 1usize..=8,
        apps in 1u32..=6,
        occupancy in proptest::collection::vec(0u32..=16, 8),
        numa_aware in any::<bool>(),
    ) {
        let topo = Topology::uniform(nodes, cap);
        let view = make_view(apps, &occupancy[..nodes]);
        let policy = EqualShare { numa_aware };

        let spec = policy.assign(&topo, &view, None);

        prop_assert_eq!(spec.assigned_total(), spec.total_tasks);
        prop_assert!(spec.per_node[nodes..].iter().all(|&n| n == 0));
        prop_assert!(spec.validate(nodes).is_ok());
    }

    /// On an empty registry a single application's share fits the host:
    /// no node is pushed past its capacity.
    #[test]
    fn empty_registry_never_oversubscribes(
        nodes in 1usize..=8,
        cap in 1usize..=8,
        apps in 1u32..=6,
    ) {
        let topo = Topology::uniform(nodes, cap);
        let view = make_view(apps, &[]);
        let policy = EqualShare { numa_aware: false };

        let spec = policy.assign(&topo, &view, None);

        prop_assert!(spec.per_node[..nodes].iter().all(|&n| n <= cap as u32));
    }

    /// With NUMA-aware mapping and room on the previously-used nodes, the
    /// whole assignment stays on those nodes.
    #[test]
    fn numa_aware_prefers_previous_nodes(
        cap in 2usize..=8,
        prev_node in 0usize..4,
    ) {
        let topo = Topology::uniform(4, cap);
        let view = make_view(2, &[]);
        let prev = make_prev(&{
            let mut per_node = [0u32; 4];
            per_node[prev_node] = cap as u32;
            per_node
        });
        let policy = EqualShare { numa_aware: true };

        let spec = policy.assign(&topo, &view, Some(&prev));

        // Share for the second app is at most one node's capacity here
        // only when procs fit; check the weaker containment property.
        if spec.total_tasks <= cap as u32 {
            prop_assert_eq!(spec.per_node[prev_node], spec.total_tasks);
        } else {
            prop_assert!(spec.per_node[prev_node] >= cap as u32);
        }
    }

    /// The oversubscription pass keeps the load spread: after any single
    /// assignment the gap between the fullest and emptiest node never
    /// exceeds one node's capacity.
    #[test]
    fn oversubscription_keeps_nodes_balanced(
        nodes in 1usize..=8,
        cap in 1usize..=8,
    ) {
        let topo = Topology::uniform(nodes, cap);
        let view = make_view(1, &[]);
        let policy = EqualShare { numa_aware: false };

        // A uniformly-loaded registry plus one application whose share
        // exceeds total capacity.
        let spec = policy.assign(&topo, &view, None);
        let mut load: Vec<u32> = spec.per_node[..nodes].to_vec();

        let extra = make_view(2, &load);
        let follow_up = EqualShare { numa_aware: false }.assign(&topo, &extra, None);
        for node in 0..nodes {
            load[node] += follow_up.per_node[node];
        }

        let max = *load.iter().max().unwrap();
        let min = *load.iter().min().unwrap();
        prop_assert!(max - min <= cap as u32, "spread {max}-{min} exceeds cap {cap}");
    }
}
