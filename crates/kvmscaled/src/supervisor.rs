//! Supervisor — starts every loop and tears the system down in order.
//!
//! Policies decide when the system ends: the supervisor runs each
//! policy's loop, the optional load balancer server, and the discovery
//! server concurrently, waits for all policy loops to return, then
//! closes the controller to release the hypervisor connection.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};

use kvmscale_controller::VmController;
use kvmscale_discovery::ServiceDiscovery;
use kvmscale_lb::LoadBalancer;
use kvmscale_policy::ScalingPolicy;

pub struct Supervisor {
    controller: VmController,
    policies: Vec<Box<dyn ScalingPolicy>>,
    load_balancer: Option<LoadBalancer>,
    lb_addr: SocketAddr,
    discovery: ServiceDiscovery,
    discovery_addr: SocketAddr,
}

impl Supervisor {
    pub fn new(
        controller: VmController,
        load_balancer: Option<LoadBalancer>,
        lb_addr: SocketAddr,
        discovery_addr: SocketAddr,
    ) -> Self {
        Self {
            controller,
            policies: Vec::new(),
            load_balancer,
            lb_addr,
            discovery: ServiceDiscovery::new(),
            discovery_addr,
        }
    }

    /// Bind each policy to the controller and take ownership of it.
    pub fn attach_policies(&mut self, policies: Vec<Box<dyn ScalingPolicy>>) {
        for mut policy in policies {
            policy.attach_vm_controller(self.controller.clone());
            self.policies.push(policy);
        }
    }

    /// Run everything; returns once all policy loops have terminated
    /// and the controller is closed.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if let Some(lb) = self.load_balancer.take() {
            let listener = TcpListener::bind(self.lb_addr).await?;
            tokio::spawn(async move {
                if let Err(err) = lb.serve(listener).await {
                    error!(error = %err, "load balancer server failed");
                }
            });
        }

        let listener = TcpListener::bind(self.discovery_addr).await?;
        let discovery = self.discovery.clone();
        tokio::spawn(async move {
            if let Err(err) = discovery.serve(listener).await {
                error!(error = %err, "discovery server failed");
            }
        });

        let mut loops = JoinSet::new();
        for mut policy in self.policies.drain(..) {
            loops.spawn(async move {
                policy.apply().await;
            });
        }
        info!("supervisor running");
        while loops.join_next().await.is_some() {}

        self.controller.close().await;
        info!("supervisor stopped");
        Ok(())
    }
}
