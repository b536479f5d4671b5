//! Per-participant session handle.
//!
//! A session ties together the registry attachment, the probed topology,
//! the mapping policy and the participant's previous placement. Sharing a
//! session across threads within one process is allowed provided callers
//! serialize their own use of it; the in-region lock only covers
//! inter-call atomicity.
//!
//! Per session the placement moves through
//! `Detached -> Attached(no spec) <-> Attached(committed spec) -> Detached`:
//! [`Session::map_tasks`] commits a placement into the registry counters,
//! [`Session::cleanup`] withdraws it again.

use crate::error::{Error, Result};
use crate::numa;
use crate::numa::topology::Topology;
use crate::policy::{EqualShare, ExecSpec, MappingPolicy, RegistryView};
use crate::registry::{RegionInfo, Registry, Role};
use common::consts::DEFAULT_REGION;
use tracing::{debug, warn};

/// A participant's handle onto the coordination service.
pub struct Session {
    registry: Registry,
    topology: Topology,
    policy: Box<dyn MappingPolicy>,
    prev_spec: Option<ExecSpec>,
}

impl Session {
    /// Open a session on the default region.
    ///
    /// The shepherd creates and initializes the region; workers attach to
    /// it. The NUMA-aware mapping toggle is read from the environment.
    pub fn open(role: Role) -> Result<Self> {
        Self::open_named(role, DEFAULT_REGION)
    }

    /// Open a session on a named region.
    pub fn open_named(role: Role, region: &str) -> Result<Self> {
        Self::with_policy(role, region, Box::new(EqualShare::from_env()))
    }

    /// Open a session with a caller-supplied mapping policy.
    pub fn with_policy(
        role: Role,
        region: &str,
        policy: Box<dyn MappingPolicy>,
    ) -> Result<Self> {
        let topology = Topology::probe()?;
        let registry = match role {
            Role::Shepherd => Registry::create(region, &topology)?,
            Role::Worker => Registry::attach(region)?,
        };

        Ok(Self {
            registry,
            topology,
            policy,
            prev_spec: None,
        })
    }

    /// Lifecycle role of this session.
    pub fn role(&self) -> Role {
        self.registry.role()
    }

    /// Name of the region this session is attached to.
    pub fn region(&self) -> &str {
        self.registry.region()
    }

    /// The topology snapshot taken when the session opened.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of configured NUMA nodes.
    pub fn num_nodes(&self) -> usize {
        self.topology.num_configured_nodes()
    }

    /// Number of online processors.
    pub fn num_procs(&self) -> usize {
        self.topology.num_configured_cpus()
    }

    /// Processors per node, assuming an even split.
    pub fn num_procs_per_node(&self) -> usize {
        self.topology.procs_per_node()
    }

    /// Tasks currently committed to `node`.
    ///
    /// With `fast` set the counter is read without the lock and may be
    /// stale; otherwise the read is serialized with all committers.
    pub fn num_tasks(&self, node: usize, fast: bool) -> Result<u32> {
        if fast {
            self.registry.snapshot_fast(node)
        } else {
            if node >= common::consts::MAX_NODES {
                return Err(Error::InvalidNode { node });
            }
            self.registry.with_lock(|state| state.task_count[node])
        }
    }

    /// Copy the first `min(out.len(), num_nodes)` task counters into
    /// `out`. Returns the number of entries written.
    pub fn task_assignment(&self, out: &mut [u32], fast: bool) -> Result<usize> {
        if fast {
            return Ok(self.registry.assignment_fast(out));
        }
        let n = out.len().min(self.registry.num_nodes());
        self.registry.with_lock(|state| {
            out[..n].copy_from_slice(&state.task_count[..n]);
            n
        })
    }

    /// Zero every per-node task counter.
    ///
    /// Out-of-band repair for a registry that drifted because a
    /// participant died between `map_tasks` and `cleanup`.
    pub fn clear_counters(&self) -> Result<()> {
        self.registry.with_lock(|state| {
            state.task_count = [0; common::consts::MAX_NODES];
        })
    }

    /// Register this participant and commit a placement.
    ///
    /// Without `requested` the session's policy decides the placement from
    /// the occupancy visible inside the critical section; a supplied spec
    /// is validated and committed verbatim. Either way the registry
    /// counters reflect the returned spec until [`Session::cleanup`].
    pub fn map_tasks(&mut self, requested: Option<ExecSpec>) -> Result<ExecSpec> {
        let nodes = self.registry.num_nodes();
        if let Some(spec) = &requested {
            spec.validate(nodes)?;
        }

        let topology = &self.topology;
        let policy = &*self.policy;
        let prev = self.prev_spec.as_ref();

        let spec = self.registry.with_lock(|state| {
            state.num_apps += 1;

            let spec = match requested {
                Some(spec) => spec,
                None => {
                    let view = RegistryView::capture(state);
                    policy.assign(topology, &view, prev)
                }
            };

            state.num_tasks += spec.total_tasks;
            for node in 0..nodes {
                let tasks = spec.per_node[node];
                if tasks > 0 {
                    state.app_count[node] += 1;
                    state.task_count[node] += tasks;
                }
            }
            spec
        })?;

        debug!(
            region = self.region(),
            tasks = spec.total_tasks,
            placement = %spec.node_mask(),
            "mapped tasks"
        );
        Ok(spec)
    }

    /// Withdraw a previously committed placement from the counters.
    ///
    /// Exactly one cleanup must follow each `map_tasks`. A spec that does
    /// not match a live registration underflows the counters: they are
    /// clamped at zero and [`Error::RegistryStale`] is returned. On
    /// success the spec is retained as the memory-affinity hint for the
    /// next mapping.
    pub fn cleanup(&mut self, spec: &ExecSpec) -> Result<()> {
        let nodes = self.registry.num_nodes();

        let stale = self.registry.with_lock(|state| {
            let mut stale = state.num_apps == 0 || state.num_tasks < spec.total_tasks;
            for node in 0..nodes {
                let tasks = spec.per_node[node];
                if tasks > 0 && (state.task_count[node] < tasks || state.app_count[node] == 0) {
                    stale = true;
                }
            }

            state.num_apps = state.num_apps.saturating_sub(1);
            state.num_tasks = state.num_tasks.saturating_sub(spec.total_tasks);
            for node in 0..nodes {
                let tasks = spec.per_node[node];
                if tasks > 0 {
                    state.task_count[node] = state.task_count[node].saturating_sub(tasks);
                    state.app_count[node] = state.app_count[node].saturating_sub(1);
                }
            }
            stale
        })?;

        if stale {
            warn!(
                region = self.region(),
                tasks = spec.total_tasks,
                "cleanup without matching map_tasks; counters clamped"
            );
            return Err(Error::RegistryStale);
        }

        self.prev_spec = Some(spec.clone());
        debug!(region = self.region(), tasks = spec.total_tasks, "cleaned up tasks");
        Ok(())
    }

    /// The placement retained from the last successful cleanup.
    pub fn prev_spec(&self) -> Option<&ExecSpec> {
        self.prev_spec.as_ref()
    }

    /// Bind the calling task to the nodes of a placement.
    ///
    /// Both CPU affinity and memory policy follow the spec's node set;
    /// `migrate` additionally moves already-touched pages there. An empty
    /// placement leaves the current binding untouched.
    pub fn bind(&self, spec: &ExecSpec, migrate: bool) -> Result<()> {
        let mask = spec.node_mask();
        if mask.is_empty() {
            return Ok(());
        }
        numa::bind(&self.topology, &mask, &mask, migrate)
    }

    /// The discovery sidecar the shepherd wrote for this region.
    pub fn region_info(&self) -> Result<RegionInfo> {
        RegionInfo::load(self.region())
    }

    /// Detach from the registry; the shepherd also destroys the region.
    pub fn close(self) {
        drop(self);
    }
}
