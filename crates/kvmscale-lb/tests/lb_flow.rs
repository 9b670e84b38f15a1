//! End-to-end load balancer tests against real backend listeners.
//!
//! Each test spins up small axum apps on ephemeral ports as backends
//! and drives the load balancer's public surface.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt as _;
use tower::ServiceExt;

use kvmscale_lb::{LbTimings, LoadBalancer};

/// Spawn a backend whose `/` returns `body` and `/health` returns
/// `health_status`.
async fn spawn_backend(body: &'static str, health_status: StatusCode) -> SocketAddr {
    let app = Router::new()
        .route("/", get(move || async move { body }))
        .route("/health", get(move || async move { health_status }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fast_timings() -> LbTimings {
    LbTimings {
        drain_window: Duration::from_millis(60),
        health_warmup: Duration::from_millis(20),
        health_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(500),
    }
}

async fn get_root(lb: &LoadBalancer) -> (StatusCode, String) {
    let response = lb
        .router()
        .oneshot(
            http::Request::builder()
                .uri("/")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn dispatch_forwards_to_registered_backend() {
    let backend = spawn_backend("hello from b1", StatusCode::OK).await;
    let lb = LoadBalancer::new();
    lb.register("b1", &format!("http://{backend}")).unwrap();

    let (status, body) = get_root(&lb).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello from b1");
}

#[tokio::test]
async fn dispatch_alternates_between_backends() {
    let b1 = spawn_backend("one", StatusCode::OK).await;
    let b2 = spawn_backend("two", StatusCode::OK).await;

    let lb = LoadBalancer::new();
    lb.register("b1", &format!("http://{b1}")).unwrap();
    lb.register("b2", &format!("http://{b2}")).unwrap();

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let (status, body) = get_root(&lb).await;
        assert_eq!(status, StatusCode::OK);
        bodies.push(body);
    }
    assert_eq!(bodies, vec!["one", "two", "one", "two"]);
}

#[tokio::test]
async fn failing_health_check_drains_and_removes_the_backend() {
    let healthy = spawn_backend("healthy", StatusCode::OK).await;
    let broken = spawn_backend("broken", StatusCode::INTERNAL_SERVER_ERROR).await;

    let lb = LoadBalancer::with_timings(fast_timings());
    lb.register("broken", &format!("http://{broken}")).unwrap();
    lb.register("healthy", &format!("http://{healthy}")).unwrap();

    // Let the warm-up pass and the first probe fail.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The broken backend is draining: every dispatch lands on the
    // healthy one.
    for _ in 0..4 {
        let (status, body) = get_root(&lb).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "healthy");
    }

    // After the drain window it is gone from the listing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let urls: Vec<String> = lb.backend_list(None).into_iter().map(|b| b.url).collect();
    assert_eq!(urls, vec![format!("http://{healthy}")]);
}

#[tokio::test]
async fn healthy_backend_survives_probing() {
    let backend = spawn_backend("ok", StatusCode::OK).await;
    let lb = LoadBalancer::with_timings(fast_timings());
    lb.register("b1", &format!("http://{backend}")).unwrap();

    // Several probe intervals pass without incident.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(lb.backend_list(None).len(), 1);
    assert_eq!(lb.backend_list(Some("alive")).len(), 1);
}

#[tokio::test]
async fn unreachable_backend_is_drained_after_warmup() {
    // Nothing listens on this port.
    let lb = LoadBalancer::with_timings(fast_timings());
    lb.register("ghost", "http://127.0.0.1:1").unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(lb.backend_list(None).is_empty());
}
