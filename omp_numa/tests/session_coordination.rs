//! Cross-session coordination tests: multiple participants sharing one
//! registry within a single process.

use omp_numa::{Error, ExecSpec, Registry, Role, Session};

fn test_region(tag: &str) -> String {
    format!("omp_numa_coord_{}_{}", tag, std::process::id())
}

/// Locked snapshot of the global counters, taken through a fresh worker
/// attachment so the session surface stays untouched.
fn counters(region: &str) -> (u32, u32, u32) {
    let registry = Registry::attach(region).unwrap();
    let nodes = registry.num_nodes();
    registry
        .with_lock(|state| {
            let sum = state.task_count[..nodes].iter().sum();
            (state.num_apps, state.num_tasks, sum)
        })
        .unwrap()
}

#[test]
fn test_task_totals_match_per_node_counters() {
    let region = test_region("totals");
    let shepherd = Session::open_named(Role::Shepherd, &region).unwrap();

    let mut first = Session::open_named(Role::Worker, &region).unwrap();
    let mut second = Session::open_named(Role::Worker, &region).unwrap();

    let spec_a = first.map_tasks(None).unwrap();
    let (apps, total, sum) = counters(&region);
    assert_eq!(apps, 1);
    assert_eq!(total, spec_a.total_tasks);
    assert_eq!(total, sum);

    let spec_b = second.map_tasks(None).unwrap();
    let (apps, total, sum) = counters(&region);
    assert_eq!(apps, 2);
    assert_eq!(total, spec_a.total_tasks + spec_b.total_tasks);
    assert_eq!(total, sum);

    first.cleanup(&spec_a).unwrap();
    second.cleanup(&spec_b).unwrap();
    assert_eq!(counters(&region), (0, 0, 0));

    shepherd.close();
}

#[test]
fn test_commits_commute_across_participants() {
    let region = test_region("commute");
    let shepherd = Session::open_named(Role::Shepherd, &region).unwrap();
    let nodes = shepherd.num_nodes();

    let spec_a = ExecSpec::on_node(0, 3).unwrap();
    let spec_b = ExecSpec::on_node(nodes - 1, 5).unwrap();

    // Order 1: A then B committed, A withdrawn — B remains.
    let mut first = Session::open_named(Role::Worker, &region).unwrap();
    let mut second = Session::open_named(Role::Worker, &region).unwrap();
    first.map_tasks(Some(spec_a.clone())).unwrap();
    second.map_tasks(Some(spec_b.clone())).unwrap();
    first.cleanup(&spec_a).unwrap();

    let mut order1 = vec![0u32; nodes];
    shepherd.task_assignment(&mut order1, false).unwrap();
    second.cleanup(&spec_b).unwrap();

    // Order 2: B committed first, then A committed and withdrawn.
    second.map_tasks(Some(spec_b.clone())).unwrap();
    first.map_tasks(Some(spec_a.clone())).unwrap();
    first.cleanup(&spec_a).unwrap();

    let mut order2 = vec![0u32; nodes];
    shepherd.task_assignment(&mut order2, false).unwrap();
    second.cleanup(&spec_b).unwrap();

    // The counter vector depends only on the live specs, not the order.
    assert_eq!(order1, order2);
    assert_eq!(order1[nodes - 1], 5);
    assert_eq!(counters(&region), (0, 0, 0));
}

#[test]
fn test_second_participant_sees_halved_share() {
    let region = test_region("halved");
    let shepherd = Session::open_named(Role::Shepherd, &region).unwrap();
    let procs = shepherd.num_procs() as u32;

    let mut first = Session::open_named(Role::Worker, &region).unwrap();
    let mut second = Session::open_named(Role::Worker, &region).unwrap();

    let spec_a = first.map_tasks(None).unwrap();
    assert_eq!(spec_a.total_tasks, procs);

    let spec_b = second.map_tasks(None).unwrap();
    assert_eq!(spec_b.total_tasks, procs.div_ceil(2));

    second.cleanup(&spec_b).unwrap();
    first.cleanup(&spec_a).unwrap();
}

#[test]
fn test_concurrent_map_cleanup_leaves_registry_clean() {
    let region = test_region("concurrent");
    let shepherd = Session::open_named(Role::Shepherd, &region).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let region = region.clone();
            std::thread::spawn(move || {
                let mut session = Session::open_named(Role::Worker, &region).unwrap();
                for _ in 0..25 {
                    let spec = session.map_tasks(None).unwrap();
                    assert_eq!(spec.assigned_total(), spec.total_tasks);
                    session.cleanup(&spec).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counters(&region), (0, 0, 0));
    shepherd.close();
}

#[test]
fn test_fast_reads_lie_between_locked_reads() {
    let region = test_region("fast_bounds");
    let mut session = Session::open_named(Role::Shepherd, &region).unwrap();

    let spec = ExecSpec::on_node(0, 4).unwrap();
    session.map_tasks(Some(spec.clone())).unwrap();

    let before = session.num_tasks(0, false).unwrap();
    let fast = session.num_tasks(0, true).unwrap();
    let after = session.num_tasks(0, false).unwrap();
    assert!(before <= fast && fast <= after);

    session.cleanup(&spec).unwrap();
}

#[test]
fn test_cleanup_with_foreign_spec_is_stale() {
    let region = test_region("foreign_spec");
    let shepherd = Session::open_named(Role::Shepherd, &region).unwrap();

    let mut worker = Session::open_named(Role::Worker, &region).unwrap();
    let committed = ExecSpec::on_node(0, 2).unwrap();
    worker.map_tasks(Some(committed.clone())).unwrap();

    // A spec larger than anything committed must be rejected.
    let oversized = ExecSpec::on_node(0, 100).unwrap();
    assert!(matches!(
        worker.cleanup(&oversized),
        Err(Error::RegistryStale)
    ));

    // The stale cleanup clamped the counters; repair and verify.
    shepherd.clear_counters().unwrap();
    assert_eq!(shepherd.num_tasks(0, false).unwrap(), 0);
}

#[test]
fn test_shepherd_unlinks_region_for_everyone() {
    let region = test_region("unlink");
    let shepherd = Session::open_named(Role::Shepherd, &region).unwrap();
    let worker = Session::open_named(Role::Worker, &region).unwrap();

    shepherd.close();

    // The existing mapping stays usable for the worker...
    assert_eq!(worker.num_tasks(0, true).unwrap(), 0);
    worker.close();

    // ...but new participants can no longer find the region.
    assert!(matches!(
        Session::open_named(Role::Worker, &region),
        Err(Error::NotFound { .. })
    ));
}
