//! kvmscaled — the kvmscale daemon.
//!
//! Connects to the local hypervisor, then runs the scaling policies,
//! the reverse-proxy load balancer, and the metrics service-discovery
//! registry until the policies decide the system ends.
//!
//! # Usage
//!
//! ```text
//! kvmscaled --target-instances 3 --lb-listen 0.0.0.0:8080
//! kvmscaled --connect qemu:///system --no-load-balancer
//! ```
//!
//! Environment (usually via `.env`): `SSH_PUBLIC_KEY`, `TARGET_PORT`
//! (required); `LOAD_BALANCER_URL`, `DRAINING_TIME_SEC`,
//! `COLD_START_TIMEOUT_MIN` (optional).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use kvmscale_artifacts::CloudInitArtifacts;
use kvmscale_controller::{ControllerConfig, VmController};
use kvmscale_core::Settings;
use kvmscale_hypervisor::{Hypervisor, VirshHypervisor};
use kvmscale_instance::InstanceConfig;
use kvmscale_lb::LoadBalancer;
use kvmscale_policy::{ScalingPolicy, TargetCountPolicy};

use kvmscaled::Supervisor;

#[derive(Parser)]
#[command(name = "kvmscaled", about = "KVM autoscaling control plane")]
struct Cli {
    /// Hypervisor connection URI.
    #[arg(long, default_value = "qemu:///system")]
    connect: String,

    /// Load balancer listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    lb_listen: SocketAddr,

    /// Service discovery listen address.
    #[arg(long, default_value = "0.0.0.0:9093")]
    discovery_listen: SocketAddr,

    /// Run without the load balancer (instances skip LB registration).
    #[arg(long)]
    no_load_balancer: bool,

    /// Scale-up cooldown in seconds.
    #[arg(long, default_value = "30")]
    scale_up_cooldown_secs: u64,

    /// Scale-down cooldown in seconds.
    #[arg(long, default_value = "30")]
    scale_down_cooldown_secs: u64,

    /// Fleet size the reference policy maintains.
    #[arg(long, default_value = "2")]
    target_instances: usize,

    /// Decision interval of the reference policy in seconds.
    #[arg(long, default_value = "60")]
    policy_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kvmscaled=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    // A missing environment file is fatal, as is an unreachable
    // hypervisor below.
    dotenvy::dotenv().context("failed to load .env file")?;
    let settings = Settings::from_env().context("invalid environment configuration")?;

    let hypervisor = VirshHypervisor::connect(&cli.connect)
        .await
        .context("failed to connect to hypervisor")?;
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(hypervisor);

    let load_balancer = if cli.no_load_balancer {
        None
    } else {
        Some(LoadBalancer::new())
    };

    let instance_config = InstanceConfig::new(settings.target_port, settings.cold_start_timeout);
    let mut controller_config = ControllerConfig::new(
        Duration::from_secs(cli.scale_up_cooldown_secs),
        Duration::from_secs(cli.scale_down_cooldown_secs),
        settings.ssh_public_key.clone(),
        instance_config,
    )
    .with_draining_time(settings.draining_time);
    if load_balancer.is_some() {
        controller_config = controller_config.with_lb_url(settings.load_balancer_url.clone());
    }

    let controller = VmController::new(
        hypervisor,
        Arc::new(CloudInitArtifacts::new()),
        controller_config,
    );

    let policy = TargetCountPolicy::new(
        cli.target_instances,
        Duration::from_secs(cli.policy_interval_secs),
    );
    let policies: Vec<Box<dyn ScalingPolicy>> = vec![Box::new(policy)];

    let mut supervisor = Supervisor::new(
        controller,
        load_balancer,
        cli.lb_listen,
        cli.discovery_listen,
    );
    supervisor.attach_policies(policies);

    info!("kvmscaled starting");
    supervisor.run().await
}
