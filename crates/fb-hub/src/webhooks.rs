use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::event::EventType;

// ---------------------------------------------------------------------------
// WebhookSubscription
// ---------------------------------------------------------------------------

/// Wildcard event pattern matching every event.
pub const EVENT_WILDCARD: &str = "*";

/// A persisted webhook endpoint: where to POST, which events it wants, and
/// the shared secret its deliveries are signed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub url: String,
    /// Non-empty; `*` subscribes to everything.
    pub events: Vec<String>,
    pub secret: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_delivery_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_deliveries: u64,
    #[serde(default)]
    pub successful_deliveries: u64,
    #[serde(default)]
    pub failed_deliveries: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl WebhookSubscription {
    /// Create a subscription, validating the event list: it must be
    /// non-empty and every entry must be `*` or a known event type.
    pub fn create(
        url: impl Into<String>,
        events: Vec<String>,
        secret: impl Into<String>,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Self, String> {
        validate_events(&events)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            events,
            secret: secret.into(),
            name,
            description,
            active: true,
            created_at: Utc::now(),
            last_delivery_at: None,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_error: None,
        })
    }

    /// Whether this subscription should receive `event` right now.
    pub fn should_deliver(&self, event: EventType) -> bool {
        self.active
            && self
                .events
                .iter()
                .any(|e| e == EVENT_WILDCARD || e == event.as_str())
    }

    /// Record the terminal outcome of one delivery.
    pub fn record_delivery(&mut self, success: bool, error: Option<String>) {
        self.total_deliveries += 1;
        self.last_delivery_at = Some(Utc::now());
        if success {
            self.successful_deliveries += 1;
            self.last_error = None;
        } else {
            self.failed_deliveries += 1;
            self.last_error = error;
        }
    }
}

/// Validate a subscription event list.
pub fn validate_events(events: &[String]) -> Result<(), String> {
    if events.is_empty() {
        return Err("subscription must list at least one event".into());
    }
    for event in events {
        if event != EVENT_WILDCARD && EventType::from_str(event).is_err() {
            return Err(format!("unknown event type: {event}"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    /// Terminal: a 2xx response was received.
    Delivered,
    /// Terminal: every attempt failed.
    Failed,
}

/// Record of delivering one event to one subscription, across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub subscription_id: String,
    pub event: EventType,
    pub payload: Value,
    /// Current attempt number, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub response_status: Option<u16>,
    #[serde(default)]
    pub response_time_ms: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Exponential backoff: 1s base doubling per retry, capped at 60s.
/// The dispatcher adds jitter on top when sleeping.
pub fn backoff_delay(base: Duration, completed_attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(completed_attempts.saturating_sub(1)).min(60);
    (base * factor).min(Duration::from_secs(60))
}

impl WebhookDelivery {
    pub fn create(
        subscription_id: impl Into<String>,
        event: EventType,
        payload: Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subscription_id: subscription_id.into(),
            event,
            payload,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            status: DeliveryStatus::Pending,
            response_status: None,
            response_time_ms: None,
            error_message: None,
            created_at: Utc::now(),
            delivered_at: None,
            next_retry_at: None,
        }
    }

    /// Mark the delivery successfully completed with a 2xx response.
    pub fn mark_delivered(&mut self, status_code: u16, response_time_ms: f64) {
        self.status = DeliveryStatus::Delivered;
        self.response_status = Some(status_code);
        self.response_time_ms = Some(response_time_ms);
        self.delivered_at = Some(Utc::now());
        self.error_message = None;
        self.next_retry_at = None;
    }

    /// Mark the current attempt failed. Schedules a retry while attempts
    /// remain; otherwise the delivery becomes terminal-`failed` with
    /// `attempt == max_attempts`.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        status_code: Option<u16>,
        retry_base: Duration,
    ) {
        self.error_message = Some(error.into());
        self.response_status = status_code;
        if self.attempt < self.max_attempts {
            let delay = backoff_delay(retry_base, self.attempt);
            self.status = DeliveryStatus::Retrying;
            self.attempt += 1;
            self.next_retry_at = Utc::now().checked_add_signed(
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            );
        } else {
            self.status = DeliveryStatus::Failed;
            self.next_retry_at = None;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription(events: &[&str]) -> WebhookSubscription {
        WebhookSubscription::create(
            "https://example.com/hook",
            events.iter().map(|e| e.to_string()).collect(),
            "secret",
            Some("test".into()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn create_validates_event_list() {
        assert!(WebhookSubscription::create("u", vec![], "s", None, None).is_err());
        assert!(
            WebhookSubscription::create("u", vec!["ticket.exploded".into()], "s", None, None)
                .is_err()
        );
        assert!(WebhookSubscription::create("u", vec!["*".into()], "s", None, None).is_ok());
    }

    #[test]
    fn should_deliver_matches_events() {
        let sub = subscription(&["ticket.created"]);
        assert!(sub.should_deliver(EventType::TicketCreated));
        assert!(!sub.should_deliver(EventType::TicketCompleted));
    }

    #[test]
    fn wildcard_matches_everything() {
        let sub = subscription(&["*"]);
        assert!(sub.should_deliver(EventType::TicketCreated));
        assert!(sub.should_deliver(EventType::AgentStarted));
    }

    #[test]
    fn inactive_subscription_never_delivers() {
        let mut sub = subscription(&["ticket.created"]);
        sub.active = false;
        assert!(!sub.should_deliver(EventType::TicketCreated));
    }

    #[test]
    fn record_delivery_updates_counters() {
        let mut sub = subscription(&["*"]);
        sub.record_delivery(true, None);
        assert_eq!(sub.total_deliveries, 1);
        assert_eq!(sub.successful_deliveries, 1);
        assert!(sub.last_delivery_at.is_some());
        assert!(sub.last_error.is_none());

        sub.record_delivery(false, Some("connection refused".into()));
        assert_eq!(sub.total_deliveries, 2);
        assert_eq!(sub.failed_deliveries, 1);
        assert_eq!(sub.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn subscription_roundtrips_through_json() {
        let mut sub = subscription(&["ticket.created", "ticket.completed"]);
        sub.record_delivery(true, None);
        let json = serde_json::to_string(&sub).unwrap();
        let back: WebhookSubscription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
    }

    #[test]
    fn delivery_retries_then_fails_at_max_attempts() {
        let mut delivery = WebhookDelivery::create("sub-1", EventType::TicketCreated, json!({}), 3);
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt, 1);

        delivery.mark_failed("503", Some(503), Duration::from_secs(1));
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.attempt, 2);
        assert!(delivery.next_retry_at.is_some());

        delivery.mark_failed("503", Some(503), Duration::from_secs(1));
        assert_eq!(delivery.attempt, 3);

        delivery.mark_failed("connection reset", None, Duration::from_secs(1));
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.attempt, delivery.max_attempts);
        assert!(delivery.next_retry_at.is_none());
        assert!(delivery.is_terminal());
    }

    #[test]
    fn delivered_is_terminal_with_2xx() {
        let mut delivery = WebhookDelivery::create("sub-1", EventType::TicketCreated, json!({}), 3);
        delivery.mark_delivered(200, 42.0);
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert_eq!(delivery.response_status, Some(200));
        assert!(delivery.delivered_at.is_some());
        assert!(delivery.attempt <= delivery.max_attempts);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 7), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, 30), Duration::from_secs(60));
    }

    #[test]
    fn delivery_roundtrips_through_json() {
        let delivery =
            WebhookDelivery::create("sub-1", EventType::BuildCompleted, json!({"n": 1}), 2);
        let json = serde_json::to_string(&delivery).unwrap();
        let back: WebhookDelivery = serde_json::from_str(&json).unwrap();
        assert_eq!(back, delivery);
    }
}
