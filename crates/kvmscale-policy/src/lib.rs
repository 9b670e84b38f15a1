//! Scaling policies.
//!
//! A [`ScalingPolicy`] is a long-running loop bound to a
//! [`VmController`]: on each decision tick it may scale up, scale
//! down, or do nothing, and it must tolerate cooldown-gated no-ops.
//! The scaling semantics themselves (cooldowns, inventory, lifecycle)
//! live entirely in the controller.
//!
//! [`TargetCountPolicy`] is the reference implementation: it holds the
//! running fleet at a fixed size.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use kvmscale_controller::VmController;
use kvmscale_instance::InstanceManager;

/// A long-running scaling decision loop.
#[async_trait]
pub trait ScalingPolicy: Send {
    /// Bind the controller this policy drives. Called once before
    /// [`apply`](Self::apply).
    fn attach_vm_controller(&mut self, controller: VmController);

    /// Run until the process terminates.
    async fn apply(&mut self);
}

/// Keeps the number of running instances at a fixed target.
///
/// When the fleet is short it scales up by the difference; when it is
/// over it retires the most recently booted instances first. Either
/// call may be a cooldown-gated no-op, which the next tick retries.
pub struct TargetCountPolicy {
    target: usize,
    interval: Duration,
    controller: Option<VmController>,
}

impl TargetCountPolicy {
    pub fn new(target: usize, interval: Duration) -> Self {
        Self {
            target,
            interval,
            controller: None,
        }
    }

    /// One decision tick. Split out of [`apply`](ScalingPolicy::apply)
    /// so tests can drive it directly.
    pub async fn reconcile(&self) {
        let Some(controller) = &self.controller else {
            error!("no controller attached");
            return;
        };

        let (count, mut running) = controller.running_instances().await;
        if count < self.target {
            info!(current = count, target = self.target, "fleet below target, scaling up");
            controller.scale_up(self.target - count).await;
        } else if count > self.target {
            info!(current = count, target = self.target, "fleet above target, scaling down");
            // Oldest instances survive; retire from the youngest end.
            running.sort_by_key(|instance| instance.boot_time());
            let victims = running.split_off(self.target);
            controller.scale_down(victims).await;
        } else {
            debug!(current = count, "fleet at target");
        }
    }
}

#[async_trait]
impl ScalingPolicy for TargetCountPolicy {
    fn attach_vm_controller(&mut self, controller: VmController) {
        self.controller = Some(controller);
    }

    async fn apply(&mut self) {
        info!(
            target = self.target,
            interval_secs = self.interval.as_secs(),
            "target-count policy started"
        );
        loop {
            tokio::time::sleep(self.interval).await;
            self.reconcile().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use kvmscale_artifacts::{ArtifactError, ArtifactGenerator};
    use kvmscale_controller::ControllerConfig;
    use kvmscale_hypervisor::{Hypervisor, MemoryHypervisor};
    use kvmscale_instance::InstanceConfig;

    struct StubArtifacts {
        dir: tempfile::TempDir,
    }

    #[async_trait]
    impl ArtifactGenerator for StubArtifacts {
        async fn generate(
            &self,
            id: &str,
            _ssh_public_key: &str,
        ) -> Result<PathBuf, ArtifactError> {
            let path = self.dir.path().join(format!("instance-{id}"));
            tokio::fs::write(&path, "<domain/>").await?;
            Ok(path)
        }
    }

    fn test_controller(hv: Arc<MemoryHypervisor>) -> VmController {
        let hv_dyn: Arc<dyn Hypervisor> = hv;
        let instance = InstanceConfig::new(3000, Duration::from_millis(1))
            .with_poll_interval(Duration::from_millis(1));
        VmController::new(
            hv_dyn,
            Arc::new(StubArtifacts {
                dir: tempfile::tempdir().unwrap(),
            }),
            ControllerConfig::new(
                Duration::from_millis(20),
                Duration::from_millis(20),
                "ssh-ed25519 AAAA",
                instance,
            ),
        )
    }

    #[tokio::test]
    async fn reconcile_scales_up_to_target() {
        let hv = Arc::new(MemoryHypervisor::new());
        let mut policy = TargetCountPolicy::new(3, Duration::from_secs(60));
        policy.attach_vm_controller(test_controller(hv.clone()));

        policy.reconcile().await;
        assert_eq!(hv.defined_domains().len(), 3);
    }

    #[tokio::test]
    async fn reconcile_scales_down_to_target() {
        let hv = Arc::new(MemoryHypervisor::new());
        let controller = test_controller(hv.clone());
        controller.scale_up(3).await;
        assert_eq!(hv.defined_domains().len(), 3);

        let mut policy = TargetCountPolicy::new(1, Duration::from_secs(60));
        policy.attach_vm_controller(controller);

        // Wait out the cooldown stamped by the scale-up.
        tokio::time::sleep(Duration::from_millis(40)).await;
        policy.reconcile().await;
        assert_eq!(hv.defined_domains().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_tolerates_gated_calls() {
        let hv = Arc::new(MemoryHypervisor::new());
        let controller = test_controller(hv.clone());
        controller.scale_up(2).await;

        let mut policy = TargetCountPolicy::new(0, Duration::from_secs(60));
        policy.attach_vm_controller(controller);

        // Still inside the scale-down cooldown: the call is a no-op.
        policy.reconcile().await;
        assert_eq!(hv.defined_domains().len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        policy.reconcile().await;
        assert!(hv.defined_domains().is_empty());
    }

    #[tokio::test]
    async fn reconcile_is_quiet_at_target() {
        let hv = Arc::new(MemoryHypervisor::new());
        let controller = test_controller(hv.clone());
        controller.scale_up(2).await;

        let mut policy = TargetCountPolicy::new(2, Duration::from_secs(60));
        policy.attach_vm_controller(controller);
        policy.reconcile().await;
        assert_eq!(hv.defined_domains().len(), 2);
    }
}
