//! Raftainer node agent library
//!
//! Claims pod slots through a Consul session and keeps this host's Docker
//! containers converged with the pods it holds.

pub mod agent;
pub mod config;
pub mod container;
pub mod coordination;
pub mod logging;
pub mod metrics;
pub mod models;
