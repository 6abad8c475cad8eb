//! WebSocket endpoint tests over a real server socket, driving the axum
//! `/ws` route with a tungstenite client.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use fb_hub::event::{Event, EventType};
use fb_hub::http::router;
use fb_hub::websocket::{WsHub, SYSTEM_CONNECTED, SYSTEM_ERROR, SYSTEM_PONG};

async fn serve(hub: Arc<WsHub>) -> SocketAddr {
    let app = router(hub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn next_text(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    loop {
        match ws.next().await.expect("stream open").expect("frame ok") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn connect_receives_confirmation_and_filtered_events() {
    let hub = Arc::new(WsHub::new(10, 5));
    let addr = serve(Arc::clone(&hub)).await;

    let (mut tickets_ws, _) =
        connect_async(format!("ws://{addr}/ws?subscriptions=tickets")).await.unwrap();
    let (mut agents_ws, _) =
        connect_async(format!("ws://{addr}/ws?subscriptions=agents")).await.unwrap();

    let hello = next_text(&mut tickets_ws).await;
    assert_eq!(hello["type"], SYSTEM_CONNECTED);
    assert_eq!(hello["data"]["subscriptions"][0], "tickets");
    assert!(hello["timestamp"].as_str().unwrap().ends_with('Z'));
    let _ = next_text(&mut agents_ws).await;

    // Wait for both registrations to land before broadcasting.
    for _ in 0..50 {
        if hub.connection_count().await == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let sent = hub
        .broadcast(&Event::new(EventType::TicketCreated, serde_json::json!({"id": "7"})))
        .await;
    assert_eq!(sent, 1);

    let event = next_text(&mut tickets_ws).await;
    assert_eq!(event["type"], "ticket.created");
    assert_eq!(event["data"]["id"], "7");
}

#[tokio::test]
async fn client_ping_gets_pong_and_bad_json_gets_error() {
    let hub = Arc::new(WsHub::new(10, 5));
    let addr = serve(Arc::clone(&hub)).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _ = next_text(&mut ws).await; // system:connected

    ws.send(Message::Text(
        serde_json::json!({"type": "system:ping", "data": {}}).to_string().into(),
    ))
    .await
    .unwrap();
    let reply = next_text(&mut ws).await;
    assert_eq!(reply["type"], SYSTEM_PONG);

    ws.send(Message::Text("definitely not json".into())).await.unwrap();
    let reply = next_text(&mut ws).await;
    assert_eq!(reply["type"], SYSTEM_ERROR);

    // Connection survives the invalid message.
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn capacity_rejection_closes_with_1013() {
    let hub = Arc::new(WsHub::new(1, 5));
    let addr = serve(Arc::clone(&hub)).await;

    let (mut first, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _ = next_text(&mut first).await;

    let (mut second, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    match second.next().await.expect("frame").expect("frame ok") {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1013);
            assert_eq!(frame.reason, "Server at capacity");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn disconnect_is_observed_by_hub() {
    let hub = Arc::new(WsHub::new(10, 5));
    let addr = serve(Arc::clone(&hub)).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _ = next_text(&mut ws).await;
    assert_eq!(hub.connection_count().await, 1);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if hub.connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(hub.connection_count().await, 0);
}
