mod protocol;

use chainflow_metrics::{EngineConfig, MetricsEngine};
use futures::{SinkExt, StreamExt};
use protocol::{Outbound, ServerMessage};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    time::interval,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Host settings, read from the environment.
#[derive(Debug, Clone)]
struct ServerConfig {
    addr: SocketAddr,
    buffer_size: usize,
    sweep_interval: Duration,
}

impl ServerConfig {
    fn from_env() -> Self {
        // Configurable via WS_ADDR env var (default: 0.0.0.0:9001)
        let addr = std::env::var("WS_ADDR")
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9001)));

        // Configurable via WS_BUFFER_SIZE env var (default: 10,000)
        let buffer_size = std::env::var("WS_BUFFER_SIZE")
            .ok()
            .and_then(|size| size.parse().ok())
            .unwrap_or(10_000);

        let sweep_secs = std::env::var("STORE_SWEEP_SECS")
            .ok()
            .and_then(|secs| secs.parse().ok())
            .unwrap_or(30u64);

        Self {
            addr,
            buffer_size,
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting chainflow metrics WebSocket server");

    let config = ServerConfig::from_env();
    let engine = Arc::new(MetricsEngine::new(EngineConfig::from_env()));

    info!("WebSocket broadcast buffer size: {}", config.buffer_size);
    let (tx, _rx) = broadcast::channel::<ServerMessage>(config.buffer_size);
    let tx = Arc::new(tx);

    tokio::spawn(sweep_expired(engine.clone(), config.sweep_interval));

    let listener = match TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(addr = %config.addr, %error, "Failed to bind WebSocket server");
            return;
        }
    };
    info!("WebSocket server listening on ws://{}", config.addr);

    tokio::select! {
        result = start_websocket_server(listener, tx, engine) => {
            if let Err(error) = result {
                error!(addr = %config.addr, %error, "WebSocket server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // LOG_FORMAT=json for structured output
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Periodically drop expired result and version keys.
async fn sweep_expired(engine: Arc<MetricsEngine>, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        let removed = engine.store().sweep_expired();
        if removed > 0 {
            debug!(removed, "swept expired store keys");
        }
    }
}

/// Accept WebSocket clients until the listener fails.
async fn start_websocket_server(
    listener: TcpListener,
    tx: Arc<broadcast::Sender<ServerMessage>>,
    engine: Arc<MetricsEngine>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!("New WebSocket connection from {}", peer_addr);
        tokio::spawn(handle_client(stream, peer_addr, tx.clone(), engine.clone()));
    }
}

/// Handle an individual WebSocket client connection
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tx: Arc<broadcast::Sender<ServerMessage>>,
    engine: Arc<MetricsEngine>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    info!("WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = tx.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let _ = reply_tx.send(ServerMessage::welcome());

    // Forward broadcasts and direct replies to this client
    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Client fell behind, keep it connected
                        warn!("Client {} lagged, skipped {} messages", peer_addr, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcast channel closed for {}", peer_addr);
                        break;
                    }
                },
            };

            match serde_json::to_string(&message) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to serialise message for {}: {}", peer_addr, e),
            }
        }
    });

    // Apply client messages to the engine
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Ok(Message::Text(text)) => {
                    let outbound = match protocol::parse(&text) {
                        Ok(message) => protocol::handle(&engine, message),
                        Err(reply) => {
                            debug!("Rejected message from {}: {}", peer_addr, text);
                            Outbound::Reply(reply)
                        }
                    };

                    match outbound {
                        Outbound::Broadcast(message) => {
                            // Ignore errors if there are no receivers
                            if let Err(e) = tx.send(message) {
                                debug!("No receivers for chain update: {}", e);
                            }
                        }
                        Outbound::Reply(message) => {
                            if reply_tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            info!("Send task completed for {}", peer_addr);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            info!("Receive task completed for {}", peer_addr);
            send_task.abort();
        }
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    async fn next_json<S>(stream: &mut S) -> serde_json::Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _rx) = broadcast::channel::<ServerMessage>(16);
        let engine = Arc::new(MetricsEngine::new(EngineConfig::default()));
        tokio::spawn(start_websocket_server(listener, Arc::new(tx), engine));

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "welcome");

        let admin = r#"{"type":"admin","command":{"action":"set_window","feature":"eaten_delta","secs":6}}"#;
        ws.send(Message::Text(admin.to_string().into())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "config");
        assert_eq!(reply["config"]["eaten_window_secs"], 5);

        let chain = r#"{"type":"chain","symbol":"NIFTY","spot_price":24050.0,"timestamp":"2024-12-02T09:15:03Z"}"#;
        ws.send(Message::Text(chain.to_string().into())).await.unwrap();
        let update = next_json(&mut ws).await;
        assert_eq!(update["type"], "chain_update");
        assert_eq!(update["chain"]["symbol"], "NIFTY");
        assert_eq!(update["chain"]["spot_trend_direction"], "NEUTRAL");

        ws.send(Message::Text("not json".to_string().into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "error");
    }
}
