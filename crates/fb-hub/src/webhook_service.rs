use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::event::EventType;
use crate::event_bus::EventBus;
use crate::webhooks::{
    backoff_delay, DeliveryStatus, WebhookDelivery, WebhookSubscription,
};
use fb_core::signing;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WebhookServiceConfig {
    /// JSON file holding the subscription set.
    pub storage_path: PathBuf,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after the initial attempt; `max_attempts = max_retries + 1`.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_base: Duration,
}

impl WebhookServiceConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

/// Fields updatable on an existing subscription; `None` leaves the field
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("validation: {0}")]
    Validation(String),
    #[error("http client: {0}")]
    Client(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionFile {
    #[serde(default)]
    subscriptions: Vec<WebhookSubscription>,
}

/// How many recent delivery records to keep in memory.
const DELIVERY_HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// WebhookService
// ---------------------------------------------------------------------------

/// Signed HTTP event delivery with persistent subscriptions and retry.
///
/// Requests carry `X-Fastband-Signature: sha256=<hex HMAC-SHA256 of the
/// raw body>` under the subscription secret, plus the event name and
/// delivery id. Delivery is at-least-once: receivers must be idempotent.
pub struct WebhookService {
    config: WebhookServiceConfig,
    client: reqwest::Client,
    subscriptions: RwLock<Vec<WebhookSubscription>>,
    /// Ring buffer of recent delivery records, newest last.
    history: Mutex<VecDeque<WebhookDelivery>>,
    started: AtomicBool,
}

impl WebhookService {
    pub fn new(config: WebhookServiceConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self {
            config,
            client,
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Load persisted subscriptions and begin accepting deliveries.
    pub async fn start(&self) -> Result<(), WebhookError> {
        let loaded = self.load_subscriptions().await?;
        {
            let mut subs = self.subscriptions.write().await;
            *subs = loaded;
        }
        self.started.store(true, Ordering::SeqCst);
        info!(
            path = %self.config.storage_path.display(),
            "webhook service started"
        );
        Ok(())
    }

    /// Stop accepting new deliveries; in-flight deliveries finish.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        info!("webhook service stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Subscription management
    // -----------------------------------------------------------------------

    async fn load_subscriptions(&self) -> Result<Vec<WebhookSubscription>, WebhookError> {
        if !self.config.storage_path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read(&self.config.storage_path).await?;
        match serde_json::from_slice::<SubscriptionFile>(&raw) {
            Ok(file) => Ok(file.subscriptions),
            Err(e) => {
                warn!(error = %e, "webhook subscription file is corrupt; starting empty");
                Ok(Vec::new())
            }
        }
    }

    /// Persist the subscription set copy-on-write. Caller holds the write
    /// lock.
    async fn save_subscriptions(
        &self,
        subs: &[WebhookSubscription],
    ) -> Result<(), WebhookError> {
        if let Some(parent) = self.config.storage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = SubscriptionFile {
            subscriptions: subs.to_vec(),
        };
        let tmp = self.config.storage_path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&file)?).await?;
        tokio::fs::rename(&tmp, &self.config.storage_path).await?;
        Ok(())
    }

    /// Register a new webhook endpoint.
    pub async fn register(
        &self,
        url: impl Into<String>,
        events: Vec<String>,
        secret: impl Into<String>,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<WebhookSubscription, WebhookError> {
        let subscription = WebhookSubscription::create(url, events, secret, name, description)
            .map_err(WebhookError::Validation)?;
        let mut subs = self.subscriptions.write().await;
        subs.push(subscription.clone());
        self.save_subscriptions(&subs).await?;
        Ok(subscription)
    }

    /// Delete a subscription. Returns `false` when the id is unknown.
    pub async fn unregister(&self, id: &str) -> Result<bool, WebhookError> {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Ok(false);
        }
        self.save_subscriptions(&subs).await?;
        Ok(true)
    }

    /// Apply a partial update. Returns the updated subscription, or `None`
    /// for an unknown id.
    pub async fn update_subscription(
        &self,
        id: &str,
        update: SubscriptionUpdate,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        if let Some(events) = &update.events {
            crate::webhooks::validate_events(events).map_err(WebhookError::Validation)?;
        }
        let mut subs = self.subscriptions.write().await;
        let Some(sub) = subs.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        if let Some(url) = update.url {
            sub.url = url;
        }
        if let Some(events) = update.events {
            sub.events = events;
        }
        if let Some(name) = update.name {
            sub.name = Some(name);
        }
        if let Some(description) = update.description {
            sub.description = Some(description);
        }
        if let Some(active) = update.active {
            sub.active = active;
        }
        let updated = sub.clone();
        self.save_subscriptions(&subs).await?;
        Ok(Some(updated))
    }

    pub async fn get_subscription(&self, id: &str) -> Option<WebhookSubscription> {
        self.subscriptions
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn list_subscriptions(&self, active_only: bool) -> Vec<WebhookSubscription> {
        self.subscriptions
            .read()
            .await
            .iter()
            .filter(|s| !active_only || s.active)
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Deliver an event to every matching active subscription, retrying
    /// failures with jittered exponential backoff until terminal. Returns
    /// one delivery record per matched subscription.
    pub async fn deliver(&self, event: EventType, data: Value) -> Vec<WebhookDelivery> {
        if !self.is_started() {
            return Vec::new();
        }

        let matching: Vec<WebhookSubscription> = {
            let subs = self.subscriptions.read().await;
            subs.iter().filter(|s| s.should_deliver(event)).cloned().collect()
        };

        let mut records = Vec::new();
        for subscription in matching {
            let record = self.deliver_to_subscription(&subscription, event, &data).await;
            records.push(record);
        }
        records
    }

    async fn deliver_to_subscription(
        &self,
        subscription: &WebhookSubscription,
        event: EventType,
        data: &Value,
    ) -> WebhookDelivery {
        let mut delivery = WebhookDelivery::create(
            subscription.id.clone(),
            event,
            data.clone(),
            self.config.max_retries + 1,
        );

        let body = json!({
            "event": event.as_str(),
            "delivery_id": delivery.id,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        })
        .to_string();
        let signature = format!("sha256={}", signing::sign_bytes(body.as_bytes(), &subscription.secret));

        loop {
            let start = Instant::now();
            let response = self
                .client
                .post(&subscription.url)
                .header("Content-Type", "application/json")
                .header("X-Fastband-Signature", &signature)
                .header("X-Fastband-Event", event.as_str())
                .header("X-Fastband-Delivery", &delivery.id)
                .body(body.clone())
                .send()
                .await;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

            match response {
                Ok(response) if response.status().is_success() => {
                    delivery.mark_delivered(response.status().as_u16(), elapsed_ms);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    delivery.mark_failed(
                        format!("unexpected status {status}"),
                        Some(status),
                        self.config.retry_base,
                    );
                }
                Err(e) => {
                    delivery.mark_failed(e.to_string(), None, self.config.retry_base);
                }
            }

            if delivery.is_terminal() {
                break;
            }

            // attempt has already advanced; sleep the backoff for the retry
            // we are about to make, with up to one extra base-delay of jitter.
            let delay = backoff_delay(self.config.retry_base, delivery.attempt.saturating_sub(1));
            let jitter = self
                .config
                .retry_base
                .mul_f64(rand::thread_rng().gen_range(0.0..1.0));
            debug!(
                delivery = %delivery.id,
                attempt = delivery.attempt,
                delay_ms = (delay + jitter).as_millis() as u64,
                "scheduling webhook retry"
            );
            tokio::time::sleep(delay + jitter).await;
        }

        let success = delivery.status == DeliveryStatus::Delivered;
        if !success {
            warn!(
                subscription = %subscription.id,
                url = %subscription.url,
                attempts = delivery.attempt,
                "webhook delivery failed permanently"
            );
        }
        self.record_outcome(&subscription.id, success, delivery.error_message.clone())
            .await;

        let mut history = self.history.lock().await;
        history.push_back(delivery.clone());
        while history.len() > DELIVERY_HISTORY_LIMIT {
            history.pop_front();
        }

        delivery
    }

    async fn record_outcome(&self, subscription_id: &str, success: bool, error: Option<String>) {
        let mut subs = self.subscriptions.write().await;
        if let Some(sub) = subs.iter_mut().find(|s| s.id == subscription_id) {
            sub.record_delivery(success, error);
            if let Err(e) = self.save_subscriptions(&subs).await {
                warn!(error = %e, "failed to persist webhook counters");
            }
        }
    }

    /// Recent delivery records, oldest first.
    pub async fn recent_deliveries(&self) -> Vec<WebhookDelivery> {
        self.history.lock().await.iter().cloned().collect()
    }
}

/// Forward every bus event to the webhook dispatcher. The task ends when
/// the bus is dropped or the service is stopped.
pub fn spawn_bus_forwarder(
    service: Arc<WebhookService>,
    bus: &EventBus,
) -> tokio::task::JoinHandle<()> {
    let rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            if !service.is_started() {
                break;
            }
            service.deliver(event.event_type, event.payload.clone()).await;
        }
    })
}
