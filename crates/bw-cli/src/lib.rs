//! bw-cli: Command-line interface for burrow
//!
//! Provides the `burrow` binary: the SSH helper started on the far side of a
//! hop, the agent commands run on the host, the tunnel service and relay,
//! and the orchestrated `ssh` entry point.

pub mod commands;
pub mod logging;
pub mod shutdown;
