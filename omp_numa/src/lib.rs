//! # Cross-process NUMA coordination for co-located parallel applications
//!
//! Co-located OpenMP-style applications on a shared multi-socket host tend
//! to stack their threads onto the same nodes and starve each other. This
//! crate coordinates them: every participant registers its thread
//! population in a process-shared registry and receives a placement that
//! spreads load across sockets, avoids oversubscription where possible and
//! — when NUMA-aware mapping is enabled — re-uses the nodes of the
//! participant's previous run so already-allocated pages stay local.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │  Shepherd    │   │  /dev/shm/omp_numa   │   │  Worker      │
//! │              ├──►│                      │◄──┤              │
//! │ creates,     │   │ sem + per-node       │   │ attaches,    │
//! │ unlinks      │   │ app/task counters    │   │ maps tasks   │
//! └──────────────┘   └──────────────────────┘   └──────────────┘
//!                              │
//!                    ┌─────────┴─────────┐
//!                    │  NUMA facade      │
//!                    │  topology + bind  │
//!                    └───────────────────┘
//! ```
//!
//! One shepherd process owns the region lifetime; workers attach for the
//! duration of their run. All counter mutation is serialized by a
//! process-shared semaphore stored inside the region itself.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use omp_numa::{Role, Session};
//!
//! # fn main() -> omp_numa::Result<()> {
//! // Worker application: take a placement, bind to it, run, withdraw.
//! let mut session = Session::open(Role::Worker)?;
//! let spec = session.map_tasks(None)?;
//! session.bind(&spec, false)?;
//! // ... run spec.total_tasks threads ...
//! session.cleanup(&spec)?;
//! # Ok(())
//! # }
//! ```
//!
//! Queries tolerate staleness when asked to:
//!
//! ```rust,no_run
//! use omp_numa::{Role, Session};
//!
//! # fn main() -> omp_numa::Result<()> {
//! let session = Session::open(Role::Worker)?;
//! for node in 0..session.num_nodes() {
//!     // `fast` reads skip the lock and may be stale.
//!     println!("node {node}: {} tasks", session.num_tasks(node, true)?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Ordering caveat
//!
//! Workers must not be started before the shepherd finished
//! [`Session::open`]: a region that exists but is not yet initialized is
//! rejected with [`Error::NotReady`], and ordering beyond that is the
//! supervisor's responsibility.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod numa;
pub mod policy;
pub mod registry;
pub mod session;

pub use error::{Error, Result};
pub use numa::{CpuMask, NodeMask, Topology};
pub use policy::{EqualShare, ExecSpec, MappingPolicy, RegistryView};
pub use registry::{RegionInfo, Registry, Role, SharedState};
pub use session::Session;

/// Initialize tracing with environment-driven filtering.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
