use super::EventSink;
use crate::metrics::WEBHOOK_EVENTS_TOTAL;
use crate::models::{DockerHubWebhook, Event, NativeWebhook, RegistryWebhook};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
struct WebhookState {
    sink: Arc<dyn EventSink>,
}

pub fn router(sink: Arc<dyn EventSink>) -> Router {
    Router::new()
        .route("/v1/webhooks/native", post(handle_native_webhook))
        .route("/v1/webhooks/dockerhub", post(handle_dockerhub_webhook))
        .route("/v1/webhooks/registry", post(handle_registry_webhook))
        .route("/healthz", get(health_check))
        .with_state(WebhookState { sink })
}

/// Serves the webhook endpoints plus `extra` (the approvals API) on `addr`
/// until shutdown.
pub async fn start_webhook_server(
    addr: SocketAddr,
    sink: Arc<dyn EventSink>,
    extra: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let app = router(sink)
        .merge(extra)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", addr))?;
    info!("Starting HTTP server on {}", addr);

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!("HTTP server failed: {}", e);
        }
        info!("HTTP server stopped");
    }))
}

async fn submit(state: &WebhookState, source: &str, events: Vec<Event>) {
    WEBHOOK_EVENTS_TOTAL.with_label_values(&[source]).inc();
    for event in events {
        info!("Received {} webhook for {}", source, event.repository);
        state.sink.submit(event).await;
    }
}

async fn handle_native_webhook(
    State(state): State<WebhookState>,
    Json(payload): Json<NativeWebhook>,
) -> impl IntoResponse {
    if payload.name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "repository name is required");
    }
    submit(&state, "native", vec![payload.into()]).await;
    (StatusCode::OK, "Webhook processed")
}

async fn handle_dockerhub_webhook(
    State(state): State<WebhookState>,
    Json(payload): Json<DockerHubWebhook>,
) -> impl IntoResponse {
    submit(&state, "dockerhub", vec![payload.into()]).await;
    (StatusCode::OK, "Webhook processed")
}

async fn handle_registry_webhook(
    State(state): State<WebhookState>,
    Json(payload): Json<RegistryWebhook>,
) -> impl IntoResponse {
    submit(&state, "registry", payload.into_events()).await;
    (StatusCode::OK, "Webhook processed")
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::testing::RecordingSink;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_native_webhook() {
        let sink = Arc::new(RecordingSink::default());
        let response = router(sink.clone())
            .oneshot(post_json(
                "/v1/webhooks/native",
                serde_json::json!({"name": "gcr.io/v2-namespace/hello-world", "tag": "1.2.0"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].repository.tag, "1.2.0");
        assert_eq!(events[0].trigger_name, "native");
    }

    #[tokio::test]
    async fn test_native_webhook_requires_name() {
        let sink = Arc::new(RecordingSink::default());
        let response = router(sink.clone())
            .oneshot(post_json(
                "/v1/webhooks/native",
                serde_json::json!({"name": " ", "tag": "1.2.0"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_registry_webhook_skips_pulls() {
        let sink = Arc::new(RecordingSink::default());
        let body = serde_json::json!({
            "events": [
                {
                    "action": "push",
                    "target": {"digest": "sha256:abc", "repository": "team/app", "tag": "2.0.0"},
                    "request": {"id": "1", "host": "registry.example.com:5000"}
                },
                {
                    "action": "pull",
                    "target": {"digest": "sha256:abc", "repository": "team/app", "tag": "2.0.0"},
                    "request": {"id": "2"}
                }
            ]
        });
        let response = router(sink.clone())
            .oneshot(post_json("/v1/webhooks/registry", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].repository.name, "registry.example.com:5000/team/app");
        assert_eq!(events[0].repository.digest.as_deref(), Some("sha256:abc"));
    }

    #[tokio::test]
    async fn test_healthz() {
        let sink = Arc::new(RecordingSink::default());
        let response = router(sink)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
