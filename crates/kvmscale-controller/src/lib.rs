//! VM controller.
//!
//! Owns the inventory of instances and serializes scaling in both
//! directions behind per-direction cooldown windows. Scale-up mints a
//! fresh instance id, generates boot artifacts, defines and starts the
//! domain, and wires the new instance into the load balancer and the
//! discovery registry through background registration tasks. Scale-down
//! drains, destroys, and undefines the selected victims.
//!
//! The cooldown gate is checked and stamped in a single critical
//! section under the inventory lock; the lock is released before any
//! per-VM work runs, and per-VM tasks reacquire it only to mutate the
//! inventory map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use kvmscale_artifacts::{ArtifactError, ArtifactGenerator};
use kvmscale_hypervisor::{Hypervisor, HypervisorError};
use kvmscale_instance::{
    InstanceConfig, InstanceError, InstanceHandle, InstanceManager, VirtInstance, VmState,
};

/// Errors raised by a single VM creation or retirement task. They are
/// logged by the scale operations and never surface to policies.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("artifact generation failed: {0}")]
    Artifacts(#[from] ArtifactError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Controller construction parameters.
#[derive(Clone)]
pub struct ControllerConfig {
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Load balancer base URL; `None` leaves LB registration unwired.
    pub lb_url: Option<String>,
    /// How long retiring instances drain before the LB entry lapses.
    pub draining_time: Duration,
    /// Deadline for the per-VM background registration tasks.
    pub registration_deadline: Duration,
    /// Public key injected into each VM's user-data.
    pub ssh_public_key: String,
    pub instance: InstanceConfig,
}

impl ControllerConfig {
    pub fn new(
        scale_up_cooldown: Duration,
        scale_down_cooldown: Duration,
        ssh_public_key: impl Into<String>,
        instance: InstanceConfig,
    ) -> Self {
        Self {
            scale_up_cooldown,
            scale_down_cooldown,
            lb_url: None,
            draining_time: Duration::from_secs(30),
            registration_deadline: Duration::from_secs(600),
            ssh_public_key: ssh_public_key.into(),
            instance,
        }
    }

    pub fn with_lb_url(mut self, url: impl Into<String>) -> Self {
        self.lb_url = Some(url.into());
        self
    }

    pub fn with_draining_time(mut self, draining_time: Duration) -> Self {
        self.draining_time = draining_time;
        self
    }

    pub fn with_registration_deadline(mut self, deadline: Duration) -> Self {
        self.registration_deadline = deadline;
        self
    }
}

/// Inventory map plus the cooldown stamps it gates.
struct Inventory {
    instances: HashMap<String, InstanceHandle>,
    /// `None` until the first scale-up; the first call is never gated.
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

struct ControllerInner {
    hypervisor: Arc<dyn Hypervisor>,
    artifacts: Arc<dyn ArtifactGenerator>,
    inventory: Mutex<Inventory>,
    config: ControllerConfig,
}

/// Cheaply cloneable handle to the controller.
#[derive(Clone)]
pub struct VmController {
    inner: Arc<ControllerInner>,
}

impl VmController {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        artifacts: Arc<dyn ArtifactGenerator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                hypervisor,
                artifacts,
                inventory: Mutex::new(Inventory {
                    instances: HashMap::new(),
                    last_scale_up: None,
                    last_scale_down: None,
                }),
                config,
            }),
        }
    }

    /// Create `n` new VMs concurrently. A no-op while the scale-up
    /// cooldown is active. Returns once every creation task has
    /// terminated; individual failures are logged, not surfaced.
    pub async fn scale_up(&self, n: usize) {
        {
            let mut inventory = self.inner.inventory.lock().await;
            if let Some(last) = inventory.last_scale_up {
                if last.elapsed() < self.inner.config.scale_up_cooldown {
                    info!("scale-up gated by cooldown");
                    return;
                }
            }
            // Stamp both directions so a scale-down cannot immediately
            // undo a fresh scale-up.
            let now = Instant::now();
            inventory.last_scale_up = Some(now);
            inventory.last_scale_down = Some(now);
        }

        info!(count = n, "starting scale-up");
        let mut tasks = JoinSet::new();
        for _ in 0..n {
            let controller = self.clone();
            tasks.spawn(async move {
                if let Err(err) = controller.create_vm().await {
                    error!(error = %err, "vm creation failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Retire the given instances concurrently. A no-op while the
    /// scale-down cooldown is active. Returns once every shutdown task
    /// has terminated.
    pub async fn scale_down(&self, victims: Vec<InstanceHandle>) {
        {
            let mut inventory = self.inner.inventory.lock().await;
            if let Some(last) = inventory.last_scale_down {
                if last.elapsed() < self.inner.config.scale_down_cooldown {
                    info!("scale-down gated by cooldown");
                    return;
                }
            }
            inventory.last_scale_down = Some(Instant::now());
        }

        info!(count = victims.len(), "starting scale-down");
        let mut tasks = JoinSet::new();
        for victim in victims {
            let controller = self.clone();
            tasks.spawn(async move {
                let id = victim.id().to_string();
                if let Err(err) = controller.retire(victim).await {
                    error!(%id, error = %err, "vm shutdown failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Count and snapshot of instances currently in the Running state.
    /// The snapshot is taken under the inventory lock; states are
    /// queried after it is released.
    pub async fn running_instances(&self) -> (usize, Vec<InstanceHandle>) {
        let snapshot: Vec<InstanceHandle> = {
            let inventory = self.inner.inventory.lock().await;
            inventory.instances.values().cloned().collect()
        };

        let mut running = Vec::new();
        for instance in snapshot {
            if instance.status().await == VmState::Running {
                running.push(instance);
            }
        }
        (running.len(), running)
    }

    /// Release the hypervisor connection.
    pub async fn close(&self) {
        info!("closing hypervisor connection");
        self.inner.hypervisor.close().await;
    }

    async fn create_vm(&self) -> Result<(), ControllerError> {
        let uuid = Uuid::new_v4().to_string();
        let id = format!("instance-{uuid}");
        info!(%id, "creating vm");

        let xml_path = self
            .inner
            .artifacts
            .generate(&uuid, &self.inner.config.ssh_public_key)
            .await?;

        self.inner.hypervisor.define_domain(&id, &xml_path).await?;

        let instance: InstanceHandle = Arc::new(VirtInstance::new(
            self.inner.hypervisor.clone(),
            id.clone(),
            self.inner.config.instance.clone(),
        ));

        // Insert before starting so the instance is visible during boot.
        {
            let mut inventory = self.inner.inventory.lock().await;
            inventory.instances.insert(id.clone(), instance.clone());
        }

        // On start failure the inventory entry is left in place for
        // manual cleanup; the defined domain still exists.
        self.inner.hypervisor.start_domain(&id).await?;

        self.spawn_registration_tasks(instance);
        info!(%id, "created vm");
        Ok(())
    }

    /// Background registration: IP acquisition + LB registration when a
    /// load balancer is wired in, and discovery registration always.
    /// Both tasks outlive the scale-up call and carry a deadline.
    fn spawn_registration_tasks(&self, instance: InstanceHandle) {
        let deadline = self.inner.config.registration_deadline;

        if let Some(lb_url) = self.inner.config.lb_url.clone() {
            let registrant = instance.clone();
            tokio::spawn(async move {
                registrant.register_ip(&lb_url, deadline).await;
            });
        }

        tokio::spawn(async move {
            if tokio::time::timeout(deadline, instance.register_prom_discovery())
                .await
                .is_err()
            {
                warn!("discovery registration timed out");
            }
        });
    }

    async fn retire(&self, instance: InstanceHandle) -> Result<(), ControllerError> {
        // Best-effort LB drain bookkeeping, concurrent with the
        // destruction below.
        if let Some(lb_url) = self.inner.config.lb_url.clone() {
            let draining = instance.clone();
            let draining_time = self.inner.config.draining_time;
            tokio::spawn(async move {
                draining.deregister_ip(&lb_url).await;
                info!(
                    id = %draining.id(),
                    secs = draining_time.as_secs(),
                    "draining backend connections"
                );
                tokio::time::sleep(draining_time).await;
            });
        }

        let discovery = instance.clone();
        tokio::spawn(async move {
            discovery.deregister_prom_discovery().await;
        });

        instance.shutdown().await?;

        let mut inventory = self.inner.inventory.lock().await;
        inventory.instances.remove(instance.id());
        Ok(())
    }
}
