use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Provider metrics
    pub static ref KUBERNETES_VERSIONED_UPDATES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_kubernetes_versioned_updates_total",
            "Total number of versioned updates applied to Kubernetes workloads"
        ),
        &["kubernetes"]
    ).unwrap();

    pub static ref HELM_VERSIONED_UPDATES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_helm_versioned_updates_total",
            "Total number of versioned updates applied to Helm releases"
        ),
        &["release"]
    ).unwrap();

    pub static ref GIT_UPDATES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_git_updates_total",
            "Total number of updates committed to the manifest repository"
        ),
        &["resource"]
    ).unwrap();

    pub static ref UPDATE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_update_failures_total",
            "Total number of update plans that failed to apply"
        ),
        &["provider"]
    ).unwrap();

    pub static ref EVENTS_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_events_submitted_total",
            "Total number of repository events submitted to providers"
        ),
        &["provider"]
    ).unwrap();

    // Trigger metrics
    pub static ref WEBHOOK_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_webhook_events_total",
            "Total number of webhook events received"
        ),
        &["source"]
    ).unwrap();

    pub static ref REGISTRIES_SCANNED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_registries_scanned_total",
            "Total number of registry checks performed by poll jobs"
        ),
        &["registry", "image"]
    ).unwrap();

    pub static ref POLL_JOBS: IntGauge = IntGauge::new(
        "bowline_poll_jobs",
        "Number of scheduled registry poll jobs"
    ).unwrap();

    // Approval metrics
    pub static ref APPROVALS_CREATED: IntCounter = IntCounter::new(
        "bowline_approvals_created_total",
        "Total number of approvals created"
    ).unwrap();

    pub static ref APPROVAL_VOTES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_approval_votes_total",
            "Total number of approval votes received"
        ),
        &["vote"]
    ).unwrap();

    pub static ref APPROVALS_EXPIRED: IntCounter = IntCounter::new(
        "bowline_approvals_expired_total",
        "Total number of approvals that expired without enough votes"
    ).unwrap();

    // Notification metrics
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_notifications_sent_total",
            "Total number of notifications sent"
        ),
        &["notifier"]
    ).unwrap();

    pub static ref NOTIFICATIONS_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "bowline_notifications_failed_total",
            "Total number of failed notification attempts"
        ),
        &["notifier"]
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(KUBERNETES_VERSIONED_UPDATES.clone()))
        .ok();
    REGISTRY
        .register(Box::new(HELM_VERSIONED_UPDATES.clone()))
        .ok();
    REGISTRY.register(Box::new(GIT_UPDATES.clone())).ok();
    REGISTRY.register(Box::new(UPDATE_FAILURES.clone())).ok();
    REGISTRY.register(Box::new(EVENTS_SUBMITTED.clone())).ok();
    REGISTRY
        .register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()))
        .ok();
    REGISTRY.register(Box::new(REGISTRIES_SCANNED.clone())).ok();
    REGISTRY.register(Box::new(POLL_JOBS.clone())).ok();
    REGISTRY.register(Box::new(APPROVALS_CREATED.clone())).ok();
    REGISTRY.register(Box::new(APPROVAL_VOTES.clone())).ok();
    REGISTRY.register(Box::new(APPROVALS_EXPIRED.clone())).ok();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_FAILED_TOTAL.clone()))
        .ok();

    info!("Metrics registered");
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
}

pub async fn start_metrics_server(addr: SocketAddr) -> Result<JoinHandle<()>> {
    register_metrics();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    info!("Starting metrics server on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router()).await {
            error!("Metrics server failed: {}", e);
        }
    });

    Ok(handle)
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buffer,
    )
        .into_response()
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_counters() {
        register_metrics();
        APPROVALS_CREATED.inc();

        let response = router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("bowline_approvals_created_total"));
    }
}
