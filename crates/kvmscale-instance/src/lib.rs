//! Per-VM lifecycle management.
//!
//! An [`InstanceManager`] represents one VM: it can report its state,
//! shut the domain down, discover its primary IP from the DHCP lease
//! view, and announce itself to the load balancer and the metrics
//! discovery registry. Two variants exist — [`VirtInstance`] is backed
//! by the hypervisor, [`StubInstance`] is a state-machine double for
//! tests.

mod stub;
mod virt;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use kvmscale_core::DISCOVERY_BASE_URL;
use kvmscale_hypervisor::HypervisorError;

pub use stub::StubInstance;
pub use virt::VirtInstance;

/// Errors raised by instance operations that are allowed to fail hard.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

/// Abstract VM state as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopping,
    ShuttingDown,
    ShutOff,
}

/// Capability set of a single VM.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// Stable identifier of the form `instance-<uuid>`.
    fn id(&self) -> &str;

    /// Monotonic reference taken when the instance was created.
    fn boot_time(&self) -> Instant;

    /// Current abstract state. Query failures report `ShutOff`.
    async fn status(&self) -> VmState;

    /// Destroy then undefine the domain, failing fast on the first error.
    async fn shutdown(&self) -> Result<(), InstanceError>;

    /// Poll the DHCP lease view for a primary IP until `deadline`
    /// expires, record it, wait out the cold-start interval, then
    /// register with the load balancer at `<lb_base>/backend`.
    async fn register_ip(&self, lb_base: &str, deadline: Duration);

    /// Remove this instance's backend entry from the load balancer.
    async fn deregister_ip(&self, lb_base: &str);

    /// Wait out the cold-start interval, then add `<ip>:9100` to the
    /// discovery registry.
    async fn register_prom_discovery(&self);

    /// Remove `<ip>:9100` from the discovery registry.
    async fn deregister_prom_discovery(&self);
}

/// Shared handle type stored in the controller inventory.
pub type InstanceHandle = Arc<dyn InstanceManager>;

/// Settings a [`VirtInstance`] needs beyond its identity.
#[derive(Clone)]
pub struct InstanceConfig {
    /// Application port exposed by the VM.
    pub target_port: u16,
    /// Wait between boot and LB/discovery registration.
    pub cold_start: Duration,
    /// Base URL of the discovery registry.
    pub discovery_url: String,
    /// DHCP lease poll tick.
    pub poll_interval: Duration,
    /// Shared HTTP client for registration calls.
    pub http: reqwest::Client,
}

impl InstanceConfig {
    pub fn new(target_port: u16, cold_start: Duration) -> Self {
        Self {
            target_port,
            cold_start,
            discovery_url: DISCOVERY_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(2),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
