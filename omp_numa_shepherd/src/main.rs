//! # Registry shepherd
//!
//! The unique participant that creates the shared scheduling registry and
//! destroys it on shutdown. While running it exposes a small signal
//! surface for operators:
//!
//! - `SIGUSR1` prints the current per-node occupancy (lock-free reads)
//! - `SIGUSR2` zeroes the per-node task counters
//! - `SIGINT` / `SIGTERM` unmap and unlink the region, then exit
//!
//! Workers must only be started once the shepherd reports ready; a worker
//! attaching earlier fails with a not-ready error and has to retry.

use clap::Parser;
use common::consts::DEFAULT_REGION;
use nix::sys::signal::{SigSet, Signal};
use omp_numa::{Role, Session};
use std::io;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "omp_numa_shepherd",
    about = "Creates and supervises the shared NUMA scheduling registry",
    version
)]
struct Args {
    /// Name of the shared region under /dev/shm.
    #[arg(long, default_value = DEFAULT_REGION)]
    region: String,

    /// Apply the placement environment (NUMA_BIND_TO_NODES or
    /// NUMA_CPU_NODES / NUMA_MEM_NODES) to the shepherd itself.
    #[arg(long)]
    bind_env: bool,

    /// With --bind-env, also migrate already-touched pages.
    #[arg(long)]
    migrate: bool,
}

fn main() -> ExitCode {
    omp_numa::init_tracing();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, region = %args.region, "shepherd failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> omp_numa::Result<()> {
    if args.bind_env {
        // Surface placement conflicts before the region is created.
        common::config::placement_from_env().map_err(omp_numa::Error::from)?;
    }

    let session = Session::open_named(Role::Shepherd, &args.region)?;
    if args.bind_env {
        omp_numa::numa::bind_from_env(session.topology(), args.migrate)?;
        let placement = omp_numa::numa::task_info(session.topology())?;
        info!(%placement, "environment placement applied");
    }

    info!(
        region = %args.region,
        nodes = session.num_nodes(),
        procs = session.num_procs(),
        "registry created, shepherd ready"
    );

    let mut signals = SigSet::empty();
    signals.add(Signal::SIGUSR1);
    signals.add(Signal::SIGUSR2);
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().map_err(errno_to_error)?;

    loop {
        match signals.wait() {
            Ok(Signal::SIGUSR1) => print_occupancy(&session),
            Ok(Signal::SIGUSR2) => {
                session.clear_counters()?;
                info!("node counters cleared");
            }
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno_to_error(errno)),
        }
    }

    session.close();
    info!("shepherd shut down");
    Ok(())
}

/// Print per-node occupancy from lock-free counter reads, so a jammed
/// registry can still be inspected.
fn print_occupancy(session: &Session) {
    let mut counts = vec![0u32; session.num_nodes()];
    if let Err(err) = session.task_assignment(&mut counts, true) {
        error!(%err, "could not read task assignment");
        return;
    }

    let mut out = String::from("OpenMP task information:\n");
    for (node, tasks) in counts.iter().enumerate() {
        out.push_str(&format!("\t[{node}] {tasks}\n"));
    }
    println!("{out}");
}

fn errno_to_error(errno: nix::errno::Errno) -> omp_numa::Error {
    omp_numa::Error::Io {
        source: io::Error::from_raw_os_error(errno as i32),
    }
}
