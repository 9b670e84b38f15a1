//! State-machine instance double for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::info;

use crate::{InstanceError, InstanceManager, VmState};

/// An instance with no domain behind it. Shutdown walks the state
/// machine; registration calls are counted no-ops.
pub struct StubInstance {
    id: String,
    boot_time: Instant,
    state: Mutex<VmState>,
    shutdown_delay: Duration,
    register_calls: AtomicUsize,
    deregister_calls: AtomicUsize,
}

impl StubInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            boot_time: Instant::now(),
            state: Mutex::new(VmState::Running),
            shutdown_delay: Duration::ZERO,
            register_calls: AtomicUsize::new(0),
            deregister_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_boot_time(mut self, boot_time: Instant) -> Self {
        self.boot_time = boot_time;
        self
    }

    /// Simulate a slow guest shutdown.
    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn deregister_calls(&self) -> usize {
        self.deregister_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceManager for StubInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn boot_time(&self) -> Instant {
        self.boot_time
    }

    async fn status(&self) -> VmState {
        *self.state.lock().expect("stub state lock")
    }

    async fn shutdown(&self) -> Result<(), InstanceError> {
        info!(id = %self.id, "shutting down stub vm");
        *self.state.lock().expect("stub state lock") = VmState::ShuttingDown;
        if !self.shutdown_delay.is_zero() {
            tokio::time::sleep(self.shutdown_delay).await;
        }
        *self.state.lock().expect("stub state lock") = VmState::ShutOff;
        info!(id = %self.id, "shut off stub vm");
        Ok(())
    }

    async fn register_ip(&self, _lb_base: &str, _deadline: Duration) {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn deregister_ip(&self, _lb_base: &str) {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn register_prom_discovery(&self) {}

    async fn deregister_prom_discovery(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_walks_the_state_machine() {
        let stub = StubInstance::new("instance-stub");
        assert_eq!(stub.status().await, VmState::Running);

        stub.shutdown().await.unwrap();
        assert_eq!(stub.status().await, VmState::ShutOff);
    }

    #[tokio::test]
    async fn registration_calls_are_counted() {
        let stub = StubInstance::new("instance-stub");
        stub.register_ip("http://localhost:8080", Duration::from_secs(1))
            .await;
        stub.deregister_ip("http://localhost:8080").await;
        stub.deregister_ip("http://localhost:8080").await;

        assert_eq!(stub.register_calls(), 1);
        assert_eq!(stub.deregister_calls(), 2);
    }
}
