//! Websocket front end for the signaling relay.

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use relay_core::relay::OutboundRx;
use relay_core::{Outbound, RelayConfig, RelayHandle};
use std::future::Future;
use tokio::net::TcpListener;

pub fn router(relay: RelayHandle) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(relay)
}

/// Bind, run the relay and serve until `shutdown` resolves.
pub async fn run(bind: &str, config: RelayConfig, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    let (relay, relay_task) = RelayHandle::spawn(config);

    tracing::info!("Signaling relay listening on {}", listener.local_addr()?);
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server failed")?;

    relay_task.abort();
    Ok(())
}

async fn banner(State(relay): State<RelayHandle>) -> String {
    match relay.stats().await {
        Some(stats) => format!(
            "peerflow signaling relay\npeers: {}\nconnections: {}\n",
            stats.peers, stats.connections
        ),
        None => "peerflow signaling relay\n".to_string(),
    }
}

async fn health(State(relay): State<RelayHandle>) -> Json<serde_json::Value> {
    let stats = relay.stats().await.unwrap_or_default();
    Json(serde_json::json!({
        "status": "ok",
        "peers": stats.peers,
        "connections": stats.connections,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<RelayHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: RelayHandle) {
    let (conn, outbound) = relay.connect();
    let (ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(write_outbound(ws_tx, outbound));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => relay.deliver(conn, text.as_str().to_string()),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!("Ignoring binary frame from connection {}", conn);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("Websocket error on connection {}: {}", conn, e);
                        break;
                    }
                }
            }
            // Relay asked us to close, or the socket died under the writer.
            _ = &mut writer => break,
        }
    }

    relay.disconnect(conn);
    writer.abort();
    tracing::debug!("Connection {} finished", conn);
}

async fn write_outbound(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: OutboundRx,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(text) => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerflow_core::identity::LocalIdentity;
    use peerflow_core::{SignalingClient, SignalingEvent, SignalingTiming};
    use relay_core::{DeviceClass, ServerMessage};
    use std::time::Duration;

    async fn start_server() -> (String, RelayHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (relay, _task) = RelayHandle::spawn(RelayConfig::default());
        let app = router(relay.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{}/ws", addr), relay)
    }

    fn timing() -> SignalingTiming {
        SignalingTiming {
            heartbeat: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_clients_see_each_other_through_server() {
        let (url, relay) = start_server().await;

        let alice = LocalIdentity::generate(Some("Alice".into()), DeviceClass::Desktop);
        let bob = LocalIdentity::generate(Some("Bob".into()), DeviceClass::Mobile);
        let (alice_link, mut alice_events) = SignalingClient::spawn(url.clone(), alice.clone(), timing());
        let (_bob_link, _bob_events) = SignalingClient::spawn(url, bob.clone(), timing());

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = alice_events.recv().await {
                if let SignalingEvent::Message(ServerMessage::PeerList { peers }) = event {
                    if peers.iter().any(|p| p.id == bob.peer_id) {
                        return peers;
                    }
                }
            }
            Vec::new()
        })
        .await
        .unwrap();

        let entry = seen.iter().find(|p| p.id == bob.peer_id).unwrap();
        assert_eq!(entry.name, "Bob");
        assert_eq!(entry.device_type, DeviceClass::Mobile);

        let stats = relay.stats().await.unwrap();
        assert_eq!(stats.peers, 2);

        alice_link.shutdown().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = relay.stats().await.unwrap();
        assert_eq!(stats.peers, 1);
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (relay, _task) = RelayHandle::spawn(RelayConfig::default());
        let Json(body) = health(State(relay)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["peers"], 0);
        assert_eq!(body["connections"], 0);
    }
}
