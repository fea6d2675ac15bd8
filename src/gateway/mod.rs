//! Downstream event hub integration module
//!
//! The hub receives every outbound event the relay produces. Emits are
//! best-effort: when the session is down, messages are dropped and the
//! background task keeps reconnecting with capped exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::Local;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;

pub mod mock;

pub use mock::MockGateway;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Error types for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway connection error: {0}")]
    ConnectionError(String),
    #[error("Emit failed: {0}")]
    EmitError(String),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Outbound event channel to the hub
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Establish the hub session
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Tear down the hub session; idempotent
    fn disconnect(&self);

    /// Emit an event; drops with a debug log when the session is down
    fn emit(&self, event: &str, payload: Value) -> Result<(), GatewayError>;

    /// Whether the hub session is currently live
    fn is_connected(&self) -> bool;
}

/// Reconnecting WebSocket client for the event hub
pub struct GatewayClient {
    url: String,
    config: GatewayConfig,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    frame_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl GatewayClient {
    pub fn new(url: impl Into<String>, config: GatewayConfig) -> Self {
        Self {
            url: url.into(),
            config,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            frame_tx: Mutex::new(None),
        }
    }

    async fn open(endpoint: &str) -> Result<WsStream, GatewayError> {
        let (ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| GatewayError::ConnectionError(e.to_string()))?;
        Ok(ws)
    }

    /// Infinite retry, exponential delay capped by config, ±50% jitter
    fn reconnect_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.reconnect_initial_ms),
            max_interval: Duration::from_secs(self.config.reconnect_max_secs),
            randomization_factor: 0.5,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

#[async_trait::async_trait]
impl EventSink for GatewayClient {
    /// Establish the hub session
    ///
    /// The first connection attempt is made inline so startup failures are
    /// visible to the caller; after that a background task owns the socket
    /// and reconnects on its own whenever the session drops.
    async fn connect(&self) -> Result<(), GatewayError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.store(false, Ordering::SeqCst);

        let endpoint = ws_endpoint(&self.url);
        let ws = Self::open(&endpoint).await?;
        info!("Connected to gateway at {}", self.url);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        *self.frame_tx.lock() = Some(frame_tx);

        let connected = self.connected.clone();
        let shutdown = self.shutdown.clone();
        let backoff = self.reconnect_policy();

        tokio::spawn(async move {
            session_task(endpoint, ws, frame_rx, connected, shutdown, backoff).await;
        });

        Ok(())
    }

    fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if self.frame_tx.lock().take().is_some() {
            info!("Disconnected from gateway");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: &str, mut payload: Value) -> Result<(), GatewayError> {
        if !self.connected.load(Ordering::SeqCst) {
            debug!("Cannot emit {}: not connected", event);
            return Ok(());
        }

        decorate_timestamp(&mut payload);

        let frame = serde_json::to_string(&serde_json::json!({
            "event": event,
            "data": payload,
        }))?;

        let frame_tx = self.frame_tx.lock();
        match frame_tx.as_ref() {
            Some(tx) => tx
                .send(Message::Text(frame))
                .map_err(|e| GatewayError::EmitError(e.to_string())),
            None => {
                debug!("Cannot emit {}: session task not running", event);
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Add an ISO-8601 local timestamp to object payloads that lack one
fn decorate_timestamp(payload: &mut Value) {
    if let Value::Object(map) = payload {
        map.entry("timestamp")
            .or_insert_with(|| Value::String(Local::now().to_rfc3339()));
    }
}

/// Swap an http(s) hub URL to the ws(s) scheme
fn ws_endpoint(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

/// Background task owning the hub socket across reconnects
async fn session_task(
    endpoint: String,
    initial: WsStream,
    mut frame_rx: mpsc::UnboundedReceiver<Message>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    policy: ExponentialBackoff,
) {
    let mut ws = Some(initial);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let stream = match ws.take() {
            Some(stream) => stream,
            None => {
                let reconnected = backoff::future::retry(policy.clone(), || async {
                    if shutdown.load(Ordering::SeqCst) {
                        return Err(backoff::Error::permanent(GatewayError::ConnectionError(
                            "shutdown requested".to_string(),
                        )));
                    }
                    GatewayClient::open(&endpoint).await.map_err(|e| {
                        warn!("Gateway reconnect attempt failed: {}", e);
                        backoff::Error::transient(e)
                    })
                })
                .await;

                match reconnected {
                    Ok(stream) => {
                        info!("Reconnected to gateway");
                        stream
                    }
                    Err(_) => break,
                }
            }
        };

        connected.store(true, Ordering::SeqCst);
        run_session(stream, &mut frame_rx, &shutdown).await;
        connected.store(false, Ordering::SeqCst);
    }

    connected.store(false, Ordering::SeqCst);
    debug!("Gateway session task terminated");
}

/// Pump frames over one established session until it drops
async fn run_session(
    stream: WsStream,
    frame_rx: &mut mpsc::UnboundedReceiver<Message>,
    shutdown: &Arc<AtomicBool>,
) {
    let (mut writer, mut reader) = stream.split();

    // Announce the session to the hub
    let mut status = serde_json::json!({ "status": "connected" });
    decorate_timestamp(&mut status);
    let announce = serde_json::json!({ "event": "python_status", "data": status });
    if let Err(e) = writer.send(Message::Text(announce.to_string())).await {
        warn!("Failed to announce session to hub: {}", e);
        return;
    }

    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(message) => {
                    if let Err(e) = writer.send(message).await {
                        warn!("Failed to send frame to hub: {}", e);
                        return;
                    }
                }
                None => {
                    // Client side dropped the channel; session is over
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    // The relay accepts no inbound commands
                    info!("Received event from hub: {}", text);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    warn!("Hub connection closed");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Hub connection error: {}", e);
                    return;
                }
            },
        }
    }
}
