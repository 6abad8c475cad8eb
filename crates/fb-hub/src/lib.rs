//! Event distribution for fastband — the in-process event bus, the
//! WebSocket hub with subscription-filtered broadcast, and the webhook
//! dispatcher with signed, retried HTTP delivery.
//!
//! Events flow one way: components publish to the [`event_bus::EventBus`];
//! forwarder tasks fan them out to WebSocket connections
//! ([`websocket::WsHub`]) and webhook subscriptions
//! ([`webhook_service::WebhookService`]).

pub mod event;
pub mod event_bus;
pub mod http;
pub mod ops_log;
pub mod webhook_service;
pub mod webhooks;
pub mod websocket;
