//! Hypervisor-backed instance.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use kvmscale_core::{NODE_EXPORTER_JOB, NODE_EXPORTER_PORT};
use kvmscale_hypervisor::{DomainState, Hypervisor};

use crate::{InstanceConfig, InstanceError, InstanceManager, VmState};

/// A VM backed by a defined libvirt domain. The domain name equals the
/// instance id.
pub struct VirtInstance {
    id: String,
    hypervisor: Arc<dyn Hypervisor>,
    boot_time: Instant,
    /// Primary IPv4, written once by the IP-acquisition task.
    ip: OnceLock<String>,
    config: InstanceConfig,
}

impl VirtInstance {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, id: String, config: InstanceConfig) -> Self {
        Self {
            id,
            hypervisor,
            boot_time: Instant::now(),
            ip: OnceLock::new(),
            config,
        }
    }

    /// Recorded primary IP, if the acquisition task has found one.
    pub fn ip_address(&self) -> Option<&str> {
        self.ip.get().map(String::as_str)
    }

    /// Poll the lease source until an address shows up.
    async fn wait_for_address(&self) -> String {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.hypervisor.lease_addresses(&self.id).await {
                Ok(addresses) => {
                    if let Some(address) = addresses.into_iter().find(|a| !a.is_empty()) {
                        info!(id = %self.id, %address, "found instance ip");
                        return address;
                    }
                }
                Err(err) => {
                    debug!(id = %self.id, error = %err, "lease query failed, retrying");
                }
            }
        }
    }

    fn backend_url(&self, ip: &str) -> String {
        format!("http://{ip}:{}", self.config.target_port)
    }

    fn discovery_endpoint(&self) -> String {
        format!("{}/targets/{NODE_EXPORTER_JOB}", self.config.discovery_url)
    }
}

#[async_trait]
impl InstanceManager for VirtInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn boot_time(&self) -> Instant {
        self.boot_time
    }

    async fn status(&self) -> VmState {
        match self.hypervisor.domain_state(&self.id).await {
            Ok(DomainState::Running) => VmState::Running,
            Ok(DomainState::Shutdown) => VmState::ShuttingDown,
            Ok(DomainState::ShutOff) => VmState::ShutOff,
            Ok(DomainState::Other) => VmState::Running,
            Err(err) => {
                warn!(id = %self.id, error = %err, "failed to query domain state");
                VmState::ShutOff
            }
        }
    }

    async fn shutdown(&self) -> Result<(), InstanceError> {
        info!(id = %self.id, "shutting down vm");
        self.hypervisor.destroy_domain(&self.id).await?;
        info!(id = %self.id, "shut off vm");
        self.hypervisor.undefine_domain(&self.id).await?;
        info!(id = %self.id, "undefined vm");
        Ok(())
    }

    async fn register_ip(&self, lb_base: &str, deadline: Duration) {
        info!(id = %self.id, "acquiring instance ip");
        let ip = match tokio::time::timeout(deadline, self.wait_for_address()).await {
            Ok(ip) => ip,
            Err(_) => {
                warn!(id = %self.id, "timed out waiting for a dhcp lease, skipping registration");
                return;
            }
        };
        // First writer wins; later attempts keep the original address.
        let _ = self.ip.set(ip.clone());

        info!(
            id = %self.id,
            secs = self.config.cold_start.as_secs(),
            "waiting for application startup before registration"
        );
        tokio::time::sleep(self.config.cold_start).await;

        let endpoint = format!("{lb_base}/backend");
        let payload = json!({ "name": self.id, "url": self.backend_url(&ip) });
        match self.config.http.post(endpoint).json(&payload).send().await {
            Ok(resp) => {
                info!(id = %self.id, status = %resp.status(), "registered with load balancer")
            }
            Err(err) => warn!(id = %self.id, error = %err, "load balancer registration failed"),
        }
    }

    async fn deregister_ip(&self, lb_base: &str) {
        let Some(ip) = self.ip.get() else {
            warn!(id = %self.id, "no ip recorded, skipping load balancer deregistration");
            return;
        };
        let endpoint = format!("{lb_base}/backend");
        let payload = json!({ "url": self.backend_url(ip) });
        match self
            .config
            .http
            .delete(endpoint)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => {
                info!(id = %self.id, status = %resp.status(), "deregistered from load balancer")
            }
            Err(err) => warn!(id = %self.id, error = %err, "load balancer deregistration failed"),
        }
    }

    async fn register_prom_discovery(&self) {
        tokio::time::sleep(self.config.cold_start).await;
        let Some(ip) = self.ip.get() else {
            warn!(id = %self.id, "no ip recorded, skipping discovery registration");
            return;
        };
        let payload = json!({ "url": format!("{ip}:{NODE_EXPORTER_PORT}") });
        match self
            .config
            .http
            .post(self.discovery_endpoint())
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => info!(id = %self.id, status = %resp.status(), "registered scrape target"),
            Err(err) => warn!(id = %self.id, error = %err, "discovery registration failed"),
        }
    }

    async fn deregister_prom_discovery(&self) {
        let Some(ip) = self.ip.get() else {
            warn!(id = %self.id, "no ip recorded, skipping discovery deregistration");
            return;
        };
        let payload = json!({ "url": format!("{ip}:{NODE_EXPORTER_PORT}") });
        match self
            .config
            .http
            .delete(self.discovery_endpoint())
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => info!(id = %self.id, status = %resp.status(), "removed scrape target"),
            Err(err) => warn!(id = %self.id, error = %err, "discovery deregistration failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::extract::State;
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use kvmscale_hypervisor::MemoryHypervisor;

    type Recorded = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    /// Tiny HTTP sink that records every (method, body) it receives.
    async fn spawn_recorder(route: &'static str) -> (SocketAddr, Recorded) {
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));

        async fn record_post(
            State(recorded): State<Recorded>,
            Json(body): Json<serde_json::Value>,
        ) -> &'static str {
            recorded
                .lock()
                .unwrap()
                .push(("POST".to_string(), body));
            "ok"
        }

        async fn record_delete(
            State(recorded): State<Recorded>,
            Json(body): Json<serde_json::Value>,
        ) -> &'static str {
            recorded
                .lock()
                .unwrap()
                .push(("DELETE".to_string(), body));
            "ok"
        }

        let app = Router::new()
            .route(route, post(record_post))
            .route(route, delete(record_delete))
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, recorded)
    }

    fn fast_config(target_port: u16) -> InstanceConfig {
        InstanceConfig::new(target_port, Duration::from_millis(5))
            .with_poll_interval(Duration::from_millis(5))
    }

    async fn defined_instance(hv: &Arc<MemoryHypervisor>, id: &str) -> VirtInstance {
        let hv_dyn: Arc<dyn Hypervisor> = hv.clone();
        hv.define_domain(id, std::path::Path::new("/tmp/xml"))
            .await
            .unwrap();
        VirtInstance::new(hv_dyn, id.to_string(), fast_config(3000))
    }

    #[tokio::test]
    async fn status_maps_domain_states() {
        let hv = Arc::new(MemoryHypervisor::new());
        let instance = defined_instance(&hv, "instance-a").await;

        assert_eq!(instance.status().await, VmState::ShutOff);
        hv.start_domain("instance-a").await.unwrap();
        assert_eq!(instance.status().await, VmState::Running);
    }

    #[tokio::test]
    async fn status_failure_reports_shut_off() {
        let hv: Arc<dyn Hypervisor> = Arc::new(MemoryHypervisor::new());
        let instance = VirtInstance::new(hv, "instance-ghost".to_string(), fast_config(3000));
        assert_eq!(instance.status().await, VmState::ShutOff);
    }

    #[tokio::test]
    async fn shutdown_destroys_and_undefines() {
        let hv = Arc::new(MemoryHypervisor::new());
        let instance = defined_instance(&hv, "instance-a").await;
        hv.start_domain("instance-a").await.unwrap();

        instance.shutdown().await.unwrap();
        assert!(!hv.is_defined("instance-a"));
    }

    #[tokio::test]
    async fn register_ip_polls_lease_and_posts_backend() {
        let hv = Arc::new(MemoryHypervisor::new());
        let instance = defined_instance(&hv, "instance-a").await;
        let (addr, recorded) = spawn_recorder("/backend").await;

        hv.set_addresses("instance-a", vec!["192.168.122.50".to_string()]);
        instance
            .register_ip(&format!("http://{addr}"), Duration::from_secs(2))
            .await;

        assert_eq!(instance.ip_address(), Some("192.168.122.50"));
        let calls = recorded.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "POST");
        assert_eq!(calls[0].1["name"], "instance-a");
        assert_eq!(calls[0].1["url"], "http://192.168.122.50:3000");
    }

    #[tokio::test]
    async fn register_ip_gives_up_at_deadline() {
        let hv = Arc::new(MemoryHypervisor::new());
        let instance = defined_instance(&hv, "instance-a").await;
        let (addr, recorded) = spawn_recorder("/backend").await;

        // No lease ever appears.
        instance
            .register_ip(&format!("http://{addr}"), Duration::from_millis(30))
            .await;

        assert_eq!(instance.ip_address(), None);
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deregister_ip_without_recorded_ip_is_a_noop() {
        let hv = Arc::new(MemoryHypervisor::new());
        let instance = defined_instance(&hv, "instance-a").await;
        let (addr, recorded) = spawn_recorder("/backend").await;

        instance.deregister_ip(&format!("http://{addr}")).await;
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn discovery_round_trip_uses_node_exporter_port() {
        let hv = Arc::new(MemoryHypervisor::new());
        let (addr, recorded) = spawn_recorder("/targets/node_exporter").await;
        let hv_dyn: Arc<dyn Hypervisor> = hv.clone();
        hv.define_domain("instance-a", std::path::Path::new("/tmp/xml"))
            .await
            .unwrap();
        let instance = VirtInstance::new(
            hv_dyn,
            "instance-a".to_string(),
            fast_config(3000).with_discovery_url(format!("http://{addr}")),
        );

        hv.set_addresses("instance-a", vec!["192.168.122.50".to_string()]);
        let (lb_addr, _lb_recorded) = spawn_recorder("/backend").await;
        instance
            .register_ip(&format!("http://{lb_addr}"), Duration::from_secs(2))
            .await;

        instance.register_prom_discovery().await;
        instance.deregister_prom_discovery().await;

        let calls = recorded.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "POST");
        assert_eq!(calls[0].1["url"], "192.168.122.50:9100");
        assert_eq!(calls[1].0, "DELETE");
        assert_eq!(calls[1].1["url"], "192.168.122.50:9100");
    }
}
