//! kvmscale-core — shared configuration and constants.
//!
//! Everything here is consumed by several crates in the workspace:
//! the environment-derived [`Settings`] and the wire-level constants
//! the instances and the discovery registry must agree on.

mod config;

pub use config::{ConfigError, Settings};

/// Job name the discovery registry is seeded with.
pub const NODE_EXPORTER_JOB: &str = "node_exporter";

/// Port the node-exporter scrape endpoint listens on inside each VM.
pub const NODE_EXPORTER_PORT: u16 = 9100;

/// Base URL instances use to reach the discovery registry.
pub const DISCOVERY_BASE_URL: &str = "http://localhost:9093";
