//! Command-line front ends for Tally counter replicas.
//!
//! The `tally-server` and `tally-client` binaries share their argument
//! definitions and logging setup through this library.

pub mod cli;

pub use cli::{init_logging, ClientArgs, ServerArgs};
