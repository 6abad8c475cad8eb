//! Webhook dispatcher tests against a real local HTTP server: signing,
//! filtering, retry-then-success, and permanent failure.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use fb_hub::event::EventType;
use fb_hub::webhook_service::{SubscriptionUpdate, WebhookService, WebhookServiceConfig};
use fb_hub::webhooks::DeliveryStatus;

#[derive(Default)]
struct Endpoint {
    hits: AtomicUsize,
    /// Status codes to return, in order; the last one repeats.
    responses: Vec<u16>,
    requests: Mutex<Vec<(HeaderMap, String)>>,
}

async fn hook_handler(
    State(endpoint): State<Arc<Endpoint>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let hit = endpoint.hits.fetch_add(1, Ordering::SeqCst);
    endpoint
        .requests
        .lock()
        .await
        .push((headers, String::from_utf8_lossy(&body).into_owned()));
    let code = endpoint
        .responses
        .get(hit)
        .or(endpoint.responses.last())
        .copied()
        .unwrap_or(200);
    StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
}

async fn serve(responses: Vec<u16>) -> (Arc<Endpoint>, String) {
    let endpoint = Arc::new(Endpoint {
        responses,
        ..Endpoint::default()
    });
    let app = Router::new()
        .route("/hook", post(hook_handler))
        .with_state(Arc::clone(&endpoint));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (endpoint, format!("http://{addr}/hook"))
}

async fn service(dir: &tempfile::TempDir) -> WebhookService {
    let mut config = WebhookServiceConfig::new(dir.path().join("webhooks.json"));
    config.timeout = Duration::from_secs(2);
    config.max_retries = 2;
    config.retry_base = Duration::from_millis(10);
    let service = WebhookService::new(config).unwrap();
    service.start().await.unwrap();
    service
}

#[tokio::test]
async fn delivery_is_signed_and_carries_headers() {
    let dir = tempfile::tempdir().unwrap();
    let (endpoint, url) = serve(vec![200]).await;
    let service = service(&dir).await;

    service
        .register(&url, vec!["ticket.created".into()], "my-secret", None, None)
        .await
        .unwrap();

    let deliveries = service
        .deliver(EventType::TicketCreated, serde_json::json!({"ticket_id": "123"}))
        .await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
    assert_eq!(deliveries[0].response_status, Some(200));

    let requests = endpoint.requests.lock().await;
    let (headers, body) = &requests[0];
    assert_eq!(headers.get("x-fastband-event").unwrap(), "ticket.created");
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert_eq!(
        headers.get("x-fastband-delivery").unwrap().to_str().unwrap(),
        deliveries[0].id
    );

    // Receiver-side verification over the raw body.
    let signature = headers
        .get("x-fastband-signature")
        .unwrap()
        .to_str()
        .unwrap();
    let expected = format!("sha256={}", fb_core::signing::sign_bytes(body.as_bytes(), "my-secret"));
    assert_eq!(signature, expected);

    let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["event"], "ticket.created");
    assert_eq!(parsed["data"]["ticket_id"], "123");
    assert_eq!(parsed["delivery_id"], deliveries[0].id);
}

#[tokio::test]
async fn retry_then_success_records_second_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let (endpoint, url) = serve(vec![503, 200]).await;
    let service = service(&dir).await;

    let sub = service
        .register(&url, vec!["ticket.created".into()], "secret", None, None)
        .await
        .unwrap();

    let deliveries = service
        .deliver(EventType::TicketCreated, serde_json::json!({}))
        .await;

    assert_eq!(endpoint.hits.load(Ordering::SeqCst), 2);
    let delivery = &deliveries[0];
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempt, 2);
    assert_eq!(delivery.response_status, Some(200));
    assert!(delivery.attempt <= delivery.max_attempts);

    let sub = service.get_subscription(&sub.id).await.unwrap();
    assert_eq!(sub.total_deliveries, 1);
    assert_eq!(sub.successful_deliveries, 1);
    assert!(sub.last_delivery_at.is_some());
}

#[tokio::test]
async fn exhausted_retries_are_terminal_failed() {
    let dir = tempfile::tempdir().unwrap();
    let (endpoint, url) = serve(vec![500]).await;
    let service = service(&dir).await;

    let sub = service
        .register(&url, vec!["*".into()], "secret", None, None)
        .await
        .unwrap();

    let deliveries = service
        .deliver(EventType::BuildFailed, serde_json::json!({}))
        .await;

    // max_retries = 2, so 3 attempts total.
    assert_eq!(endpoint.hits.load(Ordering::SeqCst), 3);
    let delivery = &deliveries[0];
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt, delivery.max_attempts);
    assert!(delivery.error_message.as_deref().unwrap().contains("500"));

    let sub = service.get_subscription(&sub.id).await.unwrap();
    assert_eq!(sub.failed_deliveries, 1);
    assert!(sub.last_error.is_some());
}

#[tokio::test]
async fn delivery_only_hits_matching_subscriptions() {
    let dir = tempfile::tempdir().unwrap();
    let (created_endpoint, created_url) = serve(vec![200]).await;
    let (completed_endpoint, completed_url) = serve(vec![200]).await;
    let service = service(&dir).await;

    service
        .register(&created_url, vec!["ticket.created".into()], "s1", None, None)
        .await
        .unwrap();
    service
        .register(
            &completed_url,
            vec!["ticket.completed".into()],
            "s2",
            None,
            None,
        )
        .await
        .unwrap();

    let deliveries = service
        .deliver(EventType::TicketCreated, serde_json::json!({}))
        .await;

    assert_eq!(deliveries.len(), 1);
    assert_eq!(created_endpoint.hits.load(Ordering::SeqCst), 1);
    assert_eq!(completed_endpoint.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inactive_subscriptions_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (endpoint, url) = serve(vec![200]).await;
    let service = service(&dir).await;

    let sub = service
        .register(&url, vec!["*".into()], "secret", None, None)
        .await
        .unwrap();
    service
        .update_subscription(
            &sub.id,
            SubscriptionUpdate {
                active: Some(false),
                ..SubscriptionUpdate::default()
            },
        )
        .await
        .unwrap();

    let deliveries = service
        .deliver(EventType::TicketCreated, serde_json::json!({}))
        .await;
    assert!(deliveries.is_empty());
    assert_eq!(endpoint.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn subscriptions_persist_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("webhooks.json");

    {
        let config = WebhookServiceConfig::new(&path);
        let service = WebhookService::new(config).unwrap();
        service.start().await.unwrap();
        service
            .register("http://example.com/hook", vec!["*".into()], "s", Some("keeper".into()), None)
            .await
            .unwrap();
        service.stop().await;
    }

    let config = WebhookServiceConfig::new(&path);
    let service = WebhookService::new(config).unwrap();
    service.start().await.unwrap();

    let subs = service.list_subscriptions(false).await;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].name.as_deref(), Some("keeper"));
}

#[tokio::test]
async fn recent_deliveries_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (_endpoint, url) = serve(vec![200]).await;
    let service = service(&dir).await;
    service
        .register(&url, vec!["*".into()], "secret", None, None)
        .await
        .unwrap();

    service.deliver(EventType::AgentStarted, serde_json::json!({})).await;
    service.deliver(EventType::AgentStopped, serde_json::json!({})).await;

    let history = service.recent_deliveries().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].event, EventType::AgentStarted);
    assert_eq!(history[1].event, EventType::AgentStopped);
}
