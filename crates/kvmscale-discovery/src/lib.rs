//! Prometheus HTTP service-discovery registry.
//!
//! A small HTTP service (port 9093 by convention) that maps a job name
//! to a set of scrape targets in the HTTP-SD shape:
//!
//! ```text
//! GET  /targets/node_exporter  → [{"targets": [...], "labels": {...}}]
//! POST /targets/node_exporter  → 201, body {"url": "<host:port>"}; duplicates ignored
//! DELETE /targets/node_exporter → 202, removes the first occurrence
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info};

use kvmscale_core::NODE_EXPORTER_JOB;

/// One HTTP-SD target group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Body of target mutations: `{"url": "<host:port>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRequest {
    pub url: String,
}

/// Cheaply cloneable handle to the registry.
#[derive(Clone)]
pub struct ServiceDiscovery {
    jobs: Arc<RwLock<HashMap<String, TargetGroup>>>,
}

impl Default for ServiceDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceDiscovery {
    /// Create a registry seeded with an empty `node_exporter` job.
    pub fn new() -> Self {
        let mut jobs = HashMap::new();
        jobs.insert(NODE_EXPORTER_JOB.to_string(), TargetGroup::default());
        Self {
            jobs: Arc::new(RwLock::new(jobs)),
        }
    }

    /// Add a target to a job. First insert wins; duplicates are
    /// ignored. Returns whether the target was added.
    pub async fn add_target(&self, job: &str, url: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let group = jobs.entry(job.to_string()).or_default();
        if group.targets.iter().any(|t| t == url) {
            debug!(%job, %url, "target already registered");
            return false;
        }
        group.targets.push(url.to_string());
        info!(%job, %url, "added scrape target");
        true
    }

    /// Remove the first occurrence of a target from a job. Removing an
    /// absent target is a no-op. Returns whether a target was removed.
    pub async fn remove_target(&self, job: &str, url: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(group) = jobs.get_mut(job) else {
            return false;
        };
        match group.targets.iter().position(|t| t == url) {
            Some(index) => {
                group.targets.remove(index);
                info!(%job, %url, "removed scrape target");
                true
            }
            None => {
                debug!(%job, %url, "target not registered");
                false
            }
        }
    }

    /// The HTTP-SD response for a job: a one-element group list.
    pub async fn target_groups(&self, job: &str) -> Vec<TargetGroup> {
        let jobs = self.jobs.read().await;
        vec![jobs.get(job).cloned().unwrap_or_default()]
    }

    /// Build the HTTP surface.
    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/targets/node_exporter",
                get(get_targets).post(add_target).delete(remove_target),
            )
            .with_state(self.clone())
    }

    /// Serve the HTTP surface on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "service discovery listening");
        }
        axum::serve(listener, self.router()).await
    }
}

async fn get_targets(State(discovery): State<ServiceDiscovery>) -> Json<Vec<TargetGroup>> {
    Json(discovery.target_groups(NODE_EXPORTER_JOB).await)
}

async fn add_target(
    State(discovery): State<ServiceDiscovery>,
    Json(req): Json<TargetRequest>,
) -> StatusCode {
    discovery.add_target(NODE_EXPORTER_JOB, &req.url).await;
    StatusCode::CREATED
}

async fn remove_target(
    State(discovery): State<ServiceDiscovery>,
    Json(req): Json<TargetRequest>,
) -> StatusCode {
    discovery.remove_target(NODE_EXPORTER_JOB, &req.url).await;
    StatusCode::ACCEPTED
}
