//! Common definitions for the omp-numa workspace.
//!
//! This crate provides the shared constants and the environment-variable
//! configuration layer used by the registry, the mapping policy and the
//! shepherd binary.
//!
//! # Module Structure
//!
//! - [`consts`] - Numeric limits, region identifiers and environment names
//! - [`config`] - Node-list grammar and placement environment parsing
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! common = { package = "omp_numa_common", path = "../omp_numa_common" }
//! ```

pub mod config;
pub mod consts;
