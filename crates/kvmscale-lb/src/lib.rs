//! Reverse-proxy load balancer.
//!
//! Keeps an insertion-ordered registry of backends and dispatches
//! incoming requests round-robin, skipping backends that are draining
//! or no longer alive. Each registered backend gets its own health
//! check task; a failed probe or an explicit deregistration flips the
//! backend to Draining, excludes it from dispatch, and removes it once
//! the drain window has elapsed.

mod backend;
mod handlers;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub use backend::{Backend, BackendState, InvalidBackendUrl, ProbeFailure, ProxyError};
pub use handlers::{BackendInfo, DeregisterBackendRequest, RegisterBackendRequest};

use serde::{Deserialize, Serialize};

/// Synthetic CPU load request fanned out to every alive backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadCpuRequest {
    pub cores: i64,
    pub util: i64,
    pub timeout: i64,
}

/// Timing knobs, injectable for tests.
#[derive(Debug, Clone)]
pub struct LbTimings {
    /// How long a draining backend stays registered before removal.
    pub drain_window: Duration,
    /// Grace period before the first health probe of a new backend.
    pub health_warmup: Duration,
    /// Interval between health probes.
    pub health_interval: Duration,
    /// Per-probe timeout.
    pub probe_timeout: Duration,
}

impl Default for LbTimings {
    fn default() -> Self {
        Self {
            drain_window: Duration::from_secs(30),
            health_warmup: Duration::from_secs(60),
            health_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

struct Registry {
    backends: Vec<Arc<Backend>>,
    cursor: u64,
}

struct LbInner {
    registry: Mutex<Registry>,
    timings: LbTimings,
}

/// Cheaply cloneable handle to the load balancer.
#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<LbInner>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::with_timings(LbTimings::default())
    }

    pub fn with_timings(timings: LbTimings) -> Self {
        Self {
            inner: Arc::new(LbInner {
                registry: Mutex::new(Registry {
                    backends: Vec::new(),
                    cursor: 0,
                }),
                timings,
            }),
        }
    }

    /// Append a backend in state Alive and start its health check task.
    /// No deduplication: registering the same URL twice yields two
    /// entries.
    pub fn register(&self, name: &str, url: &str) -> Result<(), InvalidBackendUrl> {
        let backend = Arc::new(Backend::new(name, url)?);
        {
            let mut registry = self.inner.registry.lock().expect("backend registry lock");
            registry.backends.push(backend.clone());
        }
        info!(%url, %name, "registered backend");

        let lb = self.clone();
        tokio::spawn(async move {
            lb.health_loop(backend).await;
        });
        Ok(())
    }

    /// Flip the backend with this URL to Draining and schedule its
    /// removal after the drain window. Unknown URLs and backends that
    /// are already draining are logged no-ops.
    pub fn deregister(&self, url: &str) {
        let target = {
            let registry = self.inner.registry.lock().expect("backend registry lock");
            registry
                .backends
                .iter()
                .find(|b| b.url() == url)
                .cloned()
        };
        let Some(backend) = target else {
            warn!(%url, "deregister: no such backend");
            return;
        };
        if !backend.begin_draining() {
            debug!(%url, "deregister: backend already draining");
            return;
        }
        info!(%url, "draining backend");

        let lb = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lb.inner.timings.drain_window).await;
            lb.remove(&backend);
            info!(url = %backend.url(), "deregistered backend");
        });
    }

    fn remove(&self, target: &Arc<Backend>) {
        let mut registry = self.inner.registry.lock().expect("backend registry lock");
        registry.backends.retain(|b| !Arc::ptr_eq(b, target));
    }

    /// Round-robin selection. Advances the cursor unconditionally and
    /// returns the first backend that is alive and not draining, giving
    /// up after one full cycle.
    pub fn next_backend(&self) -> Option<Arc<Backend>> {
        let mut registry = self.inner.registry.lock().expect("backend registry lock");
        if registry.backends.is_empty() {
            return None;
        }
        let len = registry.backends.len() as u64;
        for _ in 0..len {
            let index = (registry.cursor % len) as usize;
            registry.cursor = registry.cursor.wrapping_add(1);
            let backend = registry.backends[index].clone();
            if backend.is_alive() && !backend.is_draining() {
                return Some(backend);
            }
        }
        None
    }

    /// Snapshot of backends, optionally filtered by `alive` or
    /// `draining` status. Any other filter returns everything.
    pub fn backend_list(&self, status: Option<&str>) -> Vec<BackendInfo> {
        let registry = self.inner.registry.lock().expect("backend registry lock");
        registry
            .backends
            .iter()
            .filter(|b| match status {
                Some("alive") => b.is_alive(),
                Some("draining") => b.is_draining(),
                _ => true,
            })
            .map(|b| BackendInfo {
                url: b.url().to_string(),
            })
            .collect()
    }

    /// POST the payload to every alive backend's `/load/cpu` in
    /// parallel.
    pub fn fan_out_cpu_load(&self, request: LoadCpuRequest) {
        let alive: Vec<Arc<Backend>> = {
            let registry = self.inner.registry.lock().expect("backend registry lock");
            registry
                .backends
                .iter()
                .filter(|b| b.is_alive() && !b.is_draining())
                .cloned()
                .collect()
        };
        info!(backends = alive.len(), "fanning out cpu load");

        for backend in alive {
            let payload = request.clone();
            tokio::spawn(async move {
                match backend.post_json("/load/cpu", &payload).await {
                    Ok(status) => {
                        debug!(url = %backend.url(), %status, "cpu load dispatched")
                    }
                    Err(err) => {
                        warn!(url = %backend.url(), error = %err, "cpu load dispatch failed")
                    }
                }
            });
        }
    }

    /// Per-backend health check: warm-up, then periodic probes. Any
    /// failure starts the drain-then-remove path and ends the loop.
    async fn health_loop(self, backend: Arc<Backend>) {
        debug!(
            url = %backend.url(),
            secs = self.inner.timings.health_warmup.as_secs(),
            "waiting for backend startup"
        );
        tokio::time::sleep(self.inner.timings.health_warmup).await;
        info!(url = %backend.url(), "starting health checks");

        loop {
            match backend.probe_health(self.inner.timings.probe_timeout).await {
                Ok(()) => backend.confirm_alive(),
                Err(reason) => {
                    warn!(url = %backend.url(), %reason, "backend failed health check");
                    self.deregister(backend.url());
                    break;
                }
            }
            tokio::time::sleep(self.inner.timings.health_interval).await;
        }
    }

    /// Build the HTTP surface.
    pub fn router(&self) -> axum::Router {
        handlers::router(self.clone())
    }

    /// Serve the HTTP surface on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "load balancer listening");
        }
        axum::serve(listener, self.router()).await
    }
}
