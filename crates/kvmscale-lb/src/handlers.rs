//! HTTP surface of the load balancer.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Forward to the next backend (round-robin) |
//! | GET | `/backend?status=` | List backends, optionally filtered |
//! | POST | `/backend` | Register a backend |
//! | DELETE | `/backend` | Start draining a backend |
//! | POST | `/load/cpu` | Fan synthetic CPU load out to alive backends |

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{LoadBalancer, LoadCpuRequest};

/// Registration body: `{"name": ..., "url": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBackendRequest {
    pub name: String,
    pub url: String,
}

/// Deregistration body: `{"url": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterBackendRequest {
    pub url: String,
}

/// One entry of the backend listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusQuery {
    status: Option<String>,
}

pub(crate) fn router(lb: LoadBalancer) -> Router {
    Router::new()
        .route("/", get(dispatch))
        .route(
            "/backend",
            get(list_backends)
                .post(register_backend)
                .delete(deregister_backend),
        )
        .route("/load/cpu", post(cpu_load))
        .with_state(lb)
}

async fn dispatch(State(lb): State<LoadBalancer>, req: Request) -> Response {
    let Some(backend) = lb.next_backend() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "No available backends").into_response();
    };
    match backend.forward(req).await {
        Ok(response) => response,
        Err(err) => {
            error!(url = %backend.url(), error = %err, "forwarding failed");
            (StatusCode::BAD_GATEWAY, "upstream request failed").into_response()
        }
    }
}

async fn list_backends(
    State(lb): State<LoadBalancer>,
    Query(query): Query<StatusQuery>,
) -> Json<Vec<BackendInfo>> {
    Json(lb.backend_list(query.status.as_deref()))
}

async fn register_backend(
    State(lb): State<LoadBalancer>,
    Json(req): Json<RegisterBackendRequest>,
) -> Response {
    match lb.register(&req.name, &req.url) {
        Ok(()) => (StatusCode::OK, "Successfully registered backend").into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn deregister_backend(
    State(lb): State<LoadBalancer>,
    Json(req): Json<DeregisterBackendRequest>,
) -> StatusCode {
    lb.deregister(&req.url);
    StatusCode::ACCEPTED
}

async fn cpu_load(
    State(lb): State<LoadBalancer>,
    Json(req): Json<LoadCpuRequest>,
) -> StatusCode {
    lb.fan_out_cpu_load(req);
    StatusCode::ACCEPTED
}
