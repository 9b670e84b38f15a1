//! Hypervisor abstraction.
//!
//! The controller and instances drive libvirt through the [`Hypervisor`]
//! trait: define a domain from rendered XML, start it, query its state
//! and DHCP leases, and tear it down. Two implementations exist —
//! [`VirshHypervisor`] shells out to the `virsh` CLI against a libvirt
//! URI, and [`MemoryHypervisor`] keeps a fake domain table for tests.

mod memory;
mod virsh;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryHypervisor;
pub use virsh::VirshHypervisor;

/// Errors raised by hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("failed to connect to hypervisor at {uri}: {detail}")]
    Connect { uri: String, detail: String },

    #[error("hypervisor {op} failed: {detail}")]
    Command { op: String, detail: String },

    #[error("domain {0} is not defined")]
    DomainNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Coarse domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    /// The guest is shutting down.
    Shutdown,
    ShutOff,
    /// Any state this control plane does not act on (paused, crashed, ...).
    Other,
}

/// Operations the control plane needs from the hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Define a domain from a rendered XML file. The domain name must
    /// match the `<name>` element inside the file.
    async fn define_domain(&self, name: &str, xml_path: &Path) -> Result<(), HypervisorError>;

    /// Start a defined domain.
    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Forcefully stop a running domain.
    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Remove a domain definition.
    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError>;

    /// Current state of a domain.
    async fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError>;

    /// Addresses the domain holds according to the DHCP lease source.
    async fn lease_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError>;

    /// Release the hypervisor connection.
    async fn close(&self);
}
