//! Process-shared scheduling registry.
//!
//! A single fixed-size region under `/dev/shm` holds the per-node
//! application and task counters for every participant on the host,
//! guarded by a process-shared semaphore stored inside the region itself.
//!
//! Exactly one participant — the shepherd — creates and destroys the
//! region; workers attach to it and detach without unlinking. The shepherd
//! publishes a magic word only after the semaphore and the counters are
//! initialized, so a worker attaching too early fails with
//! [`Error::NotReady`] instead of spinning on an uninitialized lock.
//! Workers must retry or be ordered after the shepherd by an external
//! supervisor; no in-band readiness barrier is provided.
//!
//! A participant crashing while holding the semaphore jams the registry;
//! recovery is out-of-band (restart the shepherd, recreating the region).

use crate::error::{Error, Result};
use crate::numa::topology::Topology;
use common::consts::{MAX_NODES, REGION_MAGIC};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::SystemTime;
use tracing::{debug, info};

/// Directory holding POSIX shared-memory objects.
const REGION_DIR: &str = "/dev/shm";

/// Role of a participant with respect to the region lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates, initializes and finally unlinks the region.
    Shepherd,
    /// Attaches to an existing region; never unlinks it.
    Worker,
}

impl Role {
    /// Whether this role owns the region lifetime.
    pub fn is_shepherd(self) -> bool {
        matches!(self, Role::Shepherd)
    }
}

/// The registry state shared between processes.
///
/// Lives at offset zero of the mapped region, in host byte order and
/// natural alignment. All counter mutation happens under [`Registry::with_lock`];
/// the invariants `num_tasks == Σ task_count[i]` and
/// `app_count[i] <= num_apps` hold whenever the lock is free.
#[repr(C, align(64))]
pub struct SharedState {
    /// Process-shared mutual exclusion for every counter below.
    lock: libc::sem_t,
    /// Initialization marker, written last by the shepherd.
    magic: AtomicU64,
    /// Cached topology snapshot taken by the shepherd.
    pub num_nodes: u32,
    /// Number of currently-registered participants.
    pub num_apps: u32,
    /// Sum of `total_tasks` over all registrations.
    pub num_tasks: u32,
    /// Per-node count of registrations with at least one task there.
    pub app_count: [u32; MAX_NODES],
    /// Per-node sum of mapped tasks.
    pub task_count: [u32; MAX_NODES],
}

// The region is a single page.
const_assert!(std::mem::size_of::<SharedState>() <= 4096);

/// Handle to the mapped registry region.
///
/// Each participant owns its mapping independently; dropping a worker's
/// handle does not affect its peers. Dropping the shepherd's handle
/// destroys the in-region lock and unlinks the region.
pub struct Registry {
    region: String,
    path: PathBuf,
    meta_path: PathBuf,
    role: Role,
    state: *mut SharedState,
    // Keeps the mapping (and therefore `state`) alive.
    _mmap: MmapMut,
}

// SAFETY: every mutation of the pointed-to state goes through the
// in-region process-shared semaphore; lock-free reads are volatile and
// documented as potentially stale.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    /// Create the named region exclusively, initialize the lock and zero
    /// the counters (shepherd role).
    pub fn create(region: &str, topo: &Topology) -> Result<Self> {
        let path = region_path(region);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o666) // co-located applications may run as different users
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists {
                    region: region.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let registry = init_region(&file, region, &path, topo).inspect_err(|_| {
            let _ = fs::remove_file(&path);
        })?;

        let meta = RegionInfo {
            region: region.to_string(),
            shepherd_pid: getpid().as_raw() as u32,
            num_nodes: topo.num_configured_nodes(),
            num_cpus: topo.num_configured_cpus(),
            created_at: SystemTime::now(),
        };
        // On failure the registry drops here, tearing the region down again.
        meta.store(&registry.meta_path)?;

        info!(region, nodes = meta.num_nodes, "shared registry created");
        Ok(registry)
    }

    /// Attach to an existing region (worker role).
    pub fn attach(region: &str) -> Result<Self> {
        let path = region_path(region);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    region: region.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        // A region the shepherd has not sized yet must not be mapped:
        // touching pages past EOF raises SIGBUS.
        if (file.metadata()?.len() as usize) < std::mem::size_of::<SharedState>() {
            return Err(Error::NotReady {
                region: region.to_string(),
            });
        }

        let mmap = map_state(&file)?;
        let state = mmap.as_ptr() as *mut SharedState;

        // SAFETY: the mapping covers SharedState; magic is an atomic cell.
        let magic = unsafe { (*state).magic.load(Ordering::Acquire) };
        if magic != REGION_MAGIC {
            return Err(Error::NotReady {
                region: region.to_string(),
            });
        }

        debug!(region, "attached to shared registry");
        Ok(Self {
            region: region.to_string(),
            path,
            meta_path: meta_path(region),
            role: Role::Worker,
            state,
            _mmap: mmap,
        })
    }

    /// Region name this handle is bound to.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Lifecycle role of this handle.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of nodes the shepherd recorded at initialization.
    pub fn num_nodes(&self) -> usize {
        // SAFETY: written once before the magic word was published.
        unsafe { std::ptr::read_volatile(&raw const (*self.state).num_nodes) as usize }
    }

    /// Run `f` on the shared state while holding the in-region lock.
    ///
    /// This is the only mutation path; it blocks until the lock is
    /// acquired and has no timeout.
    pub fn with_lock<T>(&self, f: impl FnOnce(&mut SharedState) -> T) -> Result<T> {
        let lock = unsafe { &raw mut (*self.state).lock };
        lock_sem(lock)?;
        let _guard = SemGuard { lock };
        // SAFETY: the semaphore serializes every &mut to the shared state
        // across processes and threads.
        Ok(f(unsafe { &mut *self.state }))
    }

    /// Lock-free read of one task counter.
    ///
    /// The value may be stale relative to writers holding the lock.
    pub fn snapshot_fast(&self, node: usize) -> Result<u32> {
        if node >= MAX_NODES {
            return Err(Error::InvalidNode { node });
        }
        // SAFETY: in-bounds read of a mapped cell.
        Ok(unsafe { std::ptr::read_volatile(&raw const (*self.state).task_count[node]) })
    }

    /// Lock-free copy of the first `min(out.len(), num_nodes)` task
    /// counters. Returns the number of entries written.
    pub fn assignment_fast(&self, out: &mut [u32]) -> usize {
        let n = out.len().min(self.num_nodes());
        for (node, slot) in out.iter_mut().enumerate().take(n) {
            // SAFETY: node < num_nodes <= MAX_NODES.
            *slot = unsafe { std::ptr::read_volatile(&raw const (*self.state).task_count[node]) };
        }
        n
    }

    /// Detach from the region; the shepherd also destroys it.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if self.role.is_shepherd() {
            // SAFETY: the mapping is still alive; the lock must be
            // destroyed before the region goes away.
            unsafe {
                libc::sem_destroy(&raw mut (*self.state).lock);
            }
            let _ = fs::remove_file(&self.path);
            let _ = fs::remove_file(&self.meta_path);
            info!(region = %self.region, "shared registry destroyed");
        }
        // The mapping and descriptor are released when the fields drop.
    }
}

/// Shepherd-side region initialization: size, map, install the lock, zero
/// the counters, then publish the magic word.
fn init_region(
    file: &fs::File,
    region: &str,
    path: &std::path::Path,
    topo: &Topology,
) -> Result<Registry> {
    file.set_len(std::mem::size_of::<SharedState>() as u64)?;
    let mmap = map_state(file)?;
    let state = mmap.as_ptr() as *mut SharedState;

    // SAFETY: the mapping covers SharedState and nobody else can hold the
    // region yet (exclusive create).
    unsafe {
        if libc::sem_init(&raw mut (*state).lock, 1, 1) != 0 {
            return Err(Error::LockInitFailed {
                errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }

        let lock = &raw mut (*state).lock;
        lock_sem(lock)?;
        (*state).num_nodes = topo.num_configured_nodes() as u32;
        (*state).num_apps = 0;
        (*state).num_tasks = 0;
        (*state).app_count = [0; MAX_NODES];
        (*state).task_count = [0; MAX_NODES];
        libc::sem_post(lock);

        // Publish readiness only after the lock and counters are in place.
        fence(Ordering::Release);
        (*state).magic.store(REGION_MAGIC, Ordering::Release);
    }

    Ok(Registry {
        region: region.to_string(),
        path: path.to_path_buf(),
        meta_path: meta_path(region),
        role: Role::Shepherd,
        state,
        _mmap: mmap,
    })
}

fn map_state(file: &fs::File) -> Result<MmapMut> {
    // SAFETY: the region file is dedicated to this mapping.
    unsafe {
        MmapOptions::new()
            .len(std::mem::size_of::<SharedState>())
            .map_mut(file)
    }
    .map_err(|err| Error::MapFailed { source: err })
}

/// EINTR-safe semaphore acquisition.
fn lock_sem(lock: *mut libc::sem_t) -> Result<()> {
    loop {
        // SAFETY: lock points into the live shared mapping.
        if unsafe { libc::sem_wait(lock) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err.into());
        }
    }
}

/// Posts the semaphore on scope exit, so a panicking closure cannot jam
/// the registry for the whole host.
struct SemGuard {
    lock: *mut libc::sem_t,
}

impl Drop for SemGuard {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while the mapping is alive.
        unsafe {
            libc::sem_post(self.lock);
        }
    }
}

fn region_path(region: &str) -> PathBuf {
    PathBuf::from(format!("{REGION_DIR}/{region}"))
}

fn meta_path(region: &str) -> PathBuf {
    PathBuf::from(format!("{REGION_DIR}/{region}.meta"))
}

/// Discovery sidecar written next to the region by the shepherd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Region name.
    pub region: String,
    /// Process that created the region.
    pub shepherd_pid: u32,
    /// Configured nodes at creation time.
    pub num_nodes: usize,
    /// Online CPUs at creation time.
    pub num_cpus: usize,
    /// Creation timestamp.
    pub created_at: SystemTime,
}

impl RegionInfo {
    /// Load the sidecar for a named region.
    pub fn load(region: &str) -> Result<Self> {
        let content = fs::read_to_string(meta_path(region))?;
        serde_json::from_str(&content).map_err(|err| Error::Io {
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })
    }

    fn store(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|err| Error::Io {
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })?;
        fs::write(path, json)?;
        Ok(())
    }
}
