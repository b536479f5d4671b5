//! Environment-variable configuration for placement and mapping behavior.
//!
//! Participants are configured exclusively through environment variables:
//! either `NUMA_BIND_TO_NODES` (CPU and memory together) or the
//! `NUMA_CPU_NODES` / `NUMA_MEM_NODES` pair, plus the
//! `OMP_NUMA_AWARE_MAPPING` toggle for the mapping policy.
//!
//! Node lists use a compact grammar of comma-separated indices and
//! inclusive ranges, e.g. `"0,2-3"`.

use crate::consts::{ENV_BIND_TO_NODES, ENV_CPU_NODES, ENV_MEM_NODES, ENV_NUMA_AWARE_MAPPING};
use std::env;
use thiserror::Error;

/// Error type for configuration parsing.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Both the combined and the split placement variables are set.
    #[error(
        "conflicting placement: set either {ENV_BIND_TO_NODES} or \
         {ENV_CPU_NODES} + {ENV_MEM_NODES}, not both"
    )]
    ConflictingPlacement,

    /// A node list does not follow the `"i,j-k"` grammar.
    #[error("malformed node list: {input:?}")]
    Parse {
        /// The offending input string.
        input: String,
    },
}

/// Placement requested through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Bind CPU affinity and memory policy to the same node list.
    BindTo(Vec<usize>),
    /// Bind CPU affinity and memory policy independently. A missing side
    /// is left unconstrained (every configured node).
    Split {
        /// Node list for CPU affinity, if requested.
        cpu: Option<Vec<usize>>,
        /// Node list for the memory policy, if requested.
        mem: Option<Vec<usize>>,
    },
}

/// Parse a node list in the `"i,j-k"` grammar into node indices.
///
/// The empty string, empty tokens and inverted ranges are rejected.
/// Duplicates are preserved; callers collapse them into masks.
pub fn parse_node_list(input: &str) -> Result<Vec<usize>, ConfigError> {
    let malformed = || ConfigError::Parse {
        input: input.to_string(),
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(malformed());
    }

    let mut nodes = Vec::new();
    for token in trimmed.split(',') {
        let token = token.trim();
        match token.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| malformed())?;
                let hi: usize = hi.trim().parse().map_err(|_| malformed())?;
                if lo > hi {
                    return Err(malformed());
                }
                nodes.extend(lo..=hi);
            }
            None => nodes.push(token.parse().map_err(|_| malformed())?),
        }
    }

    Ok(nodes)
}

/// Read the placement configuration from the process environment.
///
/// Returns `Ok(None)` when no placement variable is set. Setting
/// `NUMA_BIND_TO_NODES` together with either of the split pair is a
/// [`ConfigError::ConflictingPlacement`].
pub fn placement_from_env() -> Result<Option<Placement>, ConfigError> {
    placement_from_lookup(|name| env::var(name).ok())
}

/// Placement resolution against an arbitrary variable lookup.
///
/// Factored out of [`placement_from_env`] so the exclusivity rule can be
/// exercised without mutating the process environment.
pub fn placement_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<Placement>, ConfigError> {
    let bind = lookup(ENV_BIND_TO_NODES);
    let cpu = lookup(ENV_CPU_NODES);
    let mem = lookup(ENV_MEM_NODES);

    if bind.is_some() && (cpu.is_some() || mem.is_some()) {
        return Err(ConfigError::ConflictingPlacement);
    }

    if let Some(bind) = bind {
        return Ok(Some(Placement::BindTo(parse_node_list(&bind)?)));
    }

    if cpu.is_none() && mem.is_none() {
        return Ok(None);
    }

    Ok(Some(Placement::Split {
        cpu: cpu.map(|s| parse_node_list(&s)).transpose()?,
        mem: mem.map(|s| parse_node_list(&s)).transpose()?,
    }))
}

/// Whether the NUMA-aware mapping passes are enabled.
///
/// Only the exact value `"1"` enables them.
pub fn numa_aware_mapping() -> bool {
    env::var(ENV_NUMA_AWARE_MAPPING).is_ok_and(|v| v == "1")
}
