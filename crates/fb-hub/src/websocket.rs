use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::event::Event;

// ---------------------------------------------------------------------------
// SubscriptionType
// ---------------------------------------------------------------------------

/// Event families a connection can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// Full control-plane updates.
    All,
    Agents,
    OpsLog,
    Tickets,
    Directives,
}

impl SubscriptionType {
    pub const ALL_TYPES: [SubscriptionType; 5] = [
        SubscriptionType::All,
        SubscriptionType::Agents,
        SubscriptionType::OpsLog,
        SubscriptionType::Tickets,
        SubscriptionType::Directives,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::All => "all",
            SubscriptionType::Agents => "agents",
            SubscriptionType::OpsLog => "ops_log",
            SubscriptionType::Tickets => "tickets",
            SubscriptionType::Directives => "directives",
        }
    }
}

impl FromStr for SubscriptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionType::ALL_TYPES
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown subscription type: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Server-originated system message types. Domain events use the dotted
/// vocabulary from [`crate::event::EventType`].
pub const SYSTEM_CONNECTED: &str = "system:connected";
pub const SYSTEM_PING: &str = "system:ping";
pub const SYSTEM_PONG: &str = "system:pong";
pub const SYSTEM_ERROR: &str = "system:error";

/// WebSocket wire format: `{type, timestamp, data}` with an ISO-8601 UTC
/// timestamp ending in `Z`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default = "now_iso")]
    pub timestamp: String,
    #[serde(default)]
    pub data: Value,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl WsMessage {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            timestamp: now_iso(),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A live WebSocket connection as the hub sees it. The transport layer
/// drains `outbound` into the socket; a closed receiver is a send failure
/// and drops the connection.
struct Connection {
    id: String,
    outbound: flume::Sender<String>,
    subscriptions: HashSet<SubscriptionType>,
    connected_at: DateTime<Utc>,
    client_ip: String,
    last_ping: Option<DateTime<Utc>>,
}

/// Why a connection was refused; `close_code` goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRejection {
    pub close_code: u16,
    pub reason: String,
}

/// Aggregate hub statistics for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub max_connections: usize,
    pub max_per_ip: usize,
    pub unique_ips: usize,
    pub subscriptions: HashMap<String, usize>,
    pub capacity_percent: f64,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, Connection>,
    ip_counts: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// WsHub
// ---------------------------------------------------------------------------

/// Close code sent when admission control rejects a connection.
pub const CLOSE_CAPACITY: u16 = 1013;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket connection pool with subscription-filtered broadcast.
///
/// Admission is capped globally and per client IP. Messages to a single
/// connection are delivered in send order through its outbound queue; a
/// send failure on any broadcast drops that connection synchronously.
pub struct WsHub {
    state: RwLock<HubState>,
    max_connections: usize,
    max_per_ip: usize,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsHub {
    pub fn new(max_connections: usize, max_per_ip: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            max_connections,
            max_per_ip,
            heartbeat: Mutex::new(None),
        }
    }

    /// Register a connection, enforcing the global and per-IP caps before
    /// anything else. On success the client immediately receives a
    /// `system:connected` message carrying its id and subscriptions.
    pub async fn connect(
        &self,
        connection_id: &str,
        client_ip: &str,
        subscriptions: &[String],
        outbound: flume::Sender<String>,
    ) -> Result<(), ConnectRejection> {
        let mut subs: HashSet<SubscriptionType> = HashSet::new();
        for raw in subscriptions {
            match raw.parse() {
                Ok(sub) => {
                    subs.insert(sub);
                }
                Err(_) => warn!(subscription = %raw, "unknown subscription type"),
            }
        }
        if subs.is_empty() {
            subs.insert(SubscriptionType::All);
        }

        {
            let mut state = self.state.write().await;
            if state.connections.len() >= self.max_connections {
                warn!(
                    max = self.max_connections,
                    "websocket connection rejected: global limit reached"
                );
                return Err(ConnectRejection {
                    close_code: CLOSE_CAPACITY,
                    reason: "Server at capacity".into(),
                });
            }
            if state.ip_counts.get(client_ip).copied().unwrap_or(0) >= self.max_per_ip {
                warn!(
                    ip = %client_ip,
                    max = self.max_per_ip,
                    "websocket connection rejected: per-IP limit reached"
                );
                return Err(ConnectRejection {
                    close_code: CLOSE_CAPACITY,
                    reason: "Too many connections from your IP".into(),
                });
            }

            state.connections.insert(
                connection_id.to_string(),
                Connection {
                    id: connection_id.to_string(),
                    outbound: outbound.clone(),
                    subscriptions: subs.clone(),
                    connected_at: Utc::now(),
                    client_ip: client_ip.to_string(),
                    last_ping: None,
                },
            );
            *state.ip_counts.entry(client_ip.to_string()).or_default() += 1;
            info!(
                connection = %connection_id,
                ip = %client_ip,
                total = state.connections.len(),
                "websocket connected"
            );
        }

        let mut sub_names: Vec<&str> = subs.iter().map(|s| s.as_str()).collect();
        sub_names.sort();
        let confirmation = WsMessage::new(
            SYSTEM_CONNECTED,
            json!({
                "connection_id": connection_id,
                "subscriptions": sub_names,
            }),
        );
        if outbound.send(confirmation.to_json()).is_err() {
            self.disconnect(connection_id).await;
            return Err(ConnectRejection {
                close_code: 1011,
                reason: "failed to send connection confirmation".into(),
            });
        }
        Ok(())
    }

    /// Remove a connection and update IP accounting.
    pub async fn disconnect(&self, connection_id: &str) {
        let mut state = self.state.write().await;
        if let Some(conn) = state.connections.remove(connection_id) {
            if let Some(count) = state.ip_counts.get_mut(&conn.client_ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.ip_counts.remove(&conn.client_ip);
                }
            }
            info!(
                connection = %connection_id,
                remaining = state.connections.len(),
                "websocket disconnected"
            );
        }
    }

    /// Send a message to one connection. A send failure drops it.
    pub async fn send_to_connection(&self, connection_id: &str, message: &WsMessage) -> bool {
        let outbound = {
            let state = self.state.read().await;
            state
                .connections
                .get(connection_id)
                .map(|c| c.outbound.clone())
        };
        let Some(outbound) = outbound else {
            return false;
        };
        if outbound.send(message.to_json()).is_err() {
            warn!(connection = %connection_id, "websocket send failed; dropping connection");
            self.disconnect(connection_id).await;
            return false;
        }
        true
    }

    /// Broadcast a domain event to every connection whose subscriptions
    /// intersect the event's target set. Returns the number of successful
    /// sends; failed connections are dropped synchronously.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let message = WsMessage {
            message_type: event.event_type.as_str().to_string(),
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: event.payload.clone(),
        };
        let targets = event.event_type.subscription_targets();
        self.broadcast_where(&message, |subs| targets.iter().any(|t| subs.contains(t)))
            .await
    }

    /// Broadcast to connections holding a specific subscription (or ALL).
    pub async fn broadcast_to_subscription(
        &self,
        subscription: SubscriptionType,
        message: &WsMessage,
    ) -> usize {
        self.broadcast_where(message, |subs| {
            subs.contains(&subscription) || subs.contains(&SubscriptionType::All)
        })
        .await
    }

    /// Broadcast to every connection regardless of subscriptions.
    pub async fn broadcast_all(&self, message: &WsMessage) -> usize {
        self.broadcast_where(message, |_| true).await
    }

    async fn broadcast_where<F>(&self, message: &WsMessage, matches: F) -> usize
    where
        F: Fn(&HashSet<SubscriptionType>) -> bool,
    {
        let payload = message.to_json();
        let recipients: Vec<(String, flume::Sender<String>)> = {
            let state = self.state.read().await;
            state
                .connections
                .values()
                .filter(|conn| matches(&conn.subscriptions))
                .map(|conn| (conn.id.clone(), conn.outbound.clone()))
                .collect()
        };

        let mut sent = 0;
        let mut failed = Vec::new();
        for (id, outbound) in recipients {
            if outbound.send(payload.clone()).is_ok() {
                sent += 1;
            } else {
                failed.push(id);
            }
        }
        for id in failed {
            warn!(connection = %id, "websocket send failed during broadcast; dropping");
            self.disconnect(&id).await;
        }
        sent
    }

    /// Replace a connection's subscription set.
    pub async fn update_subscriptions(
        &self,
        connection_id: &str,
        subscriptions: Vec<SubscriptionType>,
    ) -> bool {
        let mut state = self.state.write().await;
        match state.connections.get_mut(connection_id) {
            Some(conn) => {
                conn.subscriptions = subscriptions.into_iter().collect();
                true
            }
            None => false,
        }
    }

    /// Handle a raw client message: answer pings, track pongs, report
    /// invalid JSON with `system:error` (the connection stays open), and
    /// pass anything else to the optional handler.
    pub async fn handle_client_message(
        &self,
        connection_id: &str,
        raw: &str,
        handler: Option<&(dyn Fn(&str, WsMessage) + Send + Sync)>,
    ) {
        let message = match WsMessage::from_json(raw) {
            Ok(message) => message,
            Err(_) => {
                warn!(connection = %connection_id, "invalid json from websocket client");
                self.send_to_connection(
                    connection_id,
                    &WsMessage::new(SYSTEM_ERROR, json!({"error": "Invalid JSON format"})),
                )
                .await;
                return;
            }
        };

        match message.message_type.as_str() {
            SYSTEM_PING => {
                self.send_to_connection(connection_id, &WsMessage::new(SYSTEM_PONG, json!({})))
                    .await;
            }
            SYSTEM_PONG => {
                let mut state = self.state.write().await;
                if let Some(conn) = state.connections.get_mut(connection_id) {
                    conn.last_ping = Some(Utc::now());
                }
            }
            _ => {
                if let Some(handler) = handler {
                    handler(connection_id, message);
                }
            }
        }
    }

    /// Start the 30-second heartbeat broadcast. Idempotent while running.
    pub async fn start_heartbeat(self: Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            return;
        }
        let hub = Arc::clone(&self);
        *heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                hub.broadcast_all(&WsMessage::new(SYSTEM_PING, json!({}))).await;
            }
        }));
        info!("websocket heartbeat started");
    }

    /// Cancel the heartbeat task.
    pub async fn stop_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock().await;
        if let Some(task) = heartbeat.take() {
            task.abort();
            info!("websocket heartbeat stopped");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Timestamp of the last pong seen from a connection.
    pub async fn last_ping(&self, connection_id: &str) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .connections
            .get(connection_id)
            .and_then(|c| c.last_ping)
    }

    /// Age of a connection, if it exists.
    pub async fn connected_at(&self, connection_id: &str) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|c| c.connected_at)
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.read().await;
        let mut subscriptions = HashMap::new();
        for sub in SubscriptionType::ALL_TYPES {
            let count = state
                .connections
                .values()
                .filter(|c| c.subscriptions.contains(&sub))
                .count();
            subscriptions.insert(sub.as_str().to_string(), count);
        }
        HubStats {
            total_connections: state.connections.len(),
            max_connections: self.max_connections,
            max_per_ip: self.max_per_ip,
            unique_ips: state.ip_counts.len(),
            subscriptions,
            capacity_percent: if self.max_connections > 0 {
                state.connections.len() as f64 / self.max_connections as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
