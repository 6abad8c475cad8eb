use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::websocket::WsHub;

/// Build the hub's HTTP surface: `GET /ws` for real-time event streaming.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// direct peer address is available as the per-IP cap fallback.
pub fn router(hub: Arc<WsHub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WsQuery {
    /// Comma-separated subscription list, e.g. `?subscriptions=tickets,agents`.
    #[serde(default)]
    subscriptions: Option<String>,
}

/// Client IP: first `X-Forwarded-For` entry if present, else the direct peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<WsHub>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = client_ip(&headers, peer);
    let subscriptions: Vec<String> = query
        .subscriptions
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    ws.on_upgrade(move |socket| handle_socket(socket, hub, ip, subscriptions))
}

/// Bridge one upgraded socket to the hub: register (closing with the
/// rejection code when admission fails), then pump outbound messages and
/// incoming client frames until either side ends.
async fn handle_socket(
    socket: WebSocket,
    hub: Arc<WsHub>,
    client_ip: String,
    subscriptions: Vec<String>,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (outbound_tx, outbound_rx) = flume::unbounded::<String>();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Err(rejection) = hub
        .connect(&connection_id, &client_ip, &subscriptions, outbound_tx)
        .await
    {
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: rejection.close_code,
                reason: rejection.reason.into(),
            })))
            .await;
        return;
    }

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv_async() => {
                match outgoing {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Hub dropped the connection (send failure elsewhere).
                    Err(_) => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        hub.handle_client_message(&connection_id, &text, None).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // Ignore binary/ping/pong frames.
                }
            }
        }
    }

    hub.disconnect(&connection_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_takes_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn direct_peer_is_fallback() {
        let peer: SocketAddr = "192.0.2.7:1234".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), peer), "192.0.2.7");
    }
}
