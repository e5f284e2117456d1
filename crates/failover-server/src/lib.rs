//! failoverd - two-node failover daemon
//!
//! Wraps the `failover` engine with YAML configuration, a choice of network
//! collaborator and signal handling.
//!
//! # Components
//!
//! - **Config**: YAML loading and validation
//! - **CommandNetwork**: network collaborator driven by shell commands
//! - **FailoverServer**: starts the engine and stops it on shutdown

pub mod config;
pub mod hooks;
pub mod server;

pub use config::{Config, ConfigError, NetworkMode};
pub use hooks::CommandNetwork;
pub use server::FailoverServer;
