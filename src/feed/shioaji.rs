//! Shioaji quote bridge adapter
//!
//! Talks to the brokerage quote bridge: REST for session management,
//! contract metadata, and snapshots; WebSocket for the push quote stream.
//! Push frames are parsed here and forwarded as [`PushEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, error, info, warn};

use super::types::{
    Contract, FeedError, FeedMessage, QuoteKind, RawBidAsk, RawSnapshot, RawTick,
    SubscribeRequest, UnsubscribeRequest,
};
use super::{PushEvent, QuoteFeed};
use crate::config::{Credentials, FeedConfig};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Session handle returned by the bridge login endpoint
#[derive(Debug, Clone, Deserialize)]
struct Session {
    token: String,
    version: String,
}

/// Quote feed adapter for the brokerage bridge
pub struct ShioajiFeed {
    config: FeedConfig,
    simulation: bool,
    http: reqwest::Client,
    connected: Arc<AtomicBool>,
    session: RwLock<Option<Session>>,
    directory: RwLock<HashMap<String, Contract>>,
    writer: Mutex<Option<WsWriter>>,
    push_tx: mpsc::Sender<PushEvent>,
}

impl ShioajiFeed {
    /// Create a new feed adapter and the receiving end of its push channel
    pub fn new(config: FeedConfig, simulation: bool) -> (Self, mpsc::Receiver<PushEvent>) {
        let (push_tx, push_rx) = mpsc::channel(1000);

        let feed = Self {
            config,
            simulation,
            http: reqwest::Client::new(),
            connected: Arc::new(AtomicBool::new(false)),
            session: RwLock::new(None),
            directory: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
            push_tx,
        };

        (feed, push_rx)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    fn session_token(&self) -> Result<String, FeedError> {
        self.session
            .read()
            .as_ref()
            .map(|session| session.token.clone())
            .ok_or(FeedError::NotConnected)
    }

    /// Log in to the bridge and obtain a session token
    async fn login(&self, credentials: &Credentials) -> Result<Session, FeedError> {
        let response = self
            .http
            .post(format!("{}/login", self.config.rest_url))
            .timeout(self.request_timeout())
            .json(&serde_json::json!({
                "api_key": credentials.api_key,
                "secret_key": credentials.secret_key,
                "simulation": self.simulation,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::LoginError(format!(
                "login returned status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Activate the signing certificate for the session
    async fn activate_ca(&self, token: &str, credentials: &Credentials) -> Result<(), FeedError> {
        let response = self
            .http
            .post(format!("{}/ca/activate", self.config.rest_url))
            .timeout(self.request_timeout())
            .bearer_auth(token)
            .json(&serde_json::json!({
                "ca_path": credentials.ca_cert_path,
                "ca_password": credentials.ca_password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::CaError(format!(
                "activation returned status {}",
                response.status()
            )));
        }

        Ok(())
    }

    /// Fetch the options contract directory into the local cache
    async fn fetch_directory(&self) -> Result<usize, FeedError> {
        let token = self.session_token()?;

        let response = self
            .http
            .get(format!("{}/contracts/options", self.config.rest_url))
            .timeout(self.request_timeout())
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::ConnectionError(format!(
                "directory fetch returned status {}",
                response.status()
            )));
        }

        let contracts: Vec<Contract> = response.json().await?;
        let mut directory = self.directory.write();
        directory.clear();
        for contract in contracts {
            directory.insert(contract.code.clone(), contract);
        }

        Ok(directory.len())
    }

    /// Send a frame on the quote stream
    async fn send_frame(&self, message: Message) -> Result<(), FeedError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(ws) => ws
                .send(message)
                .await
                .map_err(|e| FeedError::ConnectionError(e.to_string())),
            None => Err(FeedError::NotConnected),
        }
    }

    /// Drain the quote stream, forwarding parsed frames as push events
    fn spawn_listener(&self, mut reader: WsReader) {
        let push_tx = self.push_tx.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => Self::dispatch_frame(&text, &push_tx).await,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => {
                        info!("Quote stream closed by bridge");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Quote stream error: {}", e);
                        break;
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            warn!("Quote stream listener terminated");
        });
    }

    async fn dispatch_frame(text: &str, push_tx: &mpsc::Sender<PushEvent>) {
        let message: FeedMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping unparseable quote frame: {}", e);
                return;
            }
        };

        let exchange = message.exchange.unwrap_or_default();

        match message.topic.as_str() {
            "tick" => match serde_json::from_value::<RawTick>(message.data) {
                Ok(tick) => {
                    if let Err(e) = push_tx.send(PushEvent::Tick { exchange, tick }).await {
                        error!("Failed to forward tick event: {}", e);
                    }
                }
                Err(e) => debug!("Malformed tick payload: {}", e),
            },
            "bidask" => match serde_json::from_value::<RawBidAsk>(message.data) {
                Ok(bidask) => {
                    if let Err(e) = push_tx.send(PushEvent::BidAsk { exchange, bidask }).await {
                        error!("Failed to forward bidask event: {}", e);
                    }
                }
                Err(e) => debug!("Malformed bidask payload: {}", e),
            },
            other => debug!("Unhandled quote topic: {}", other),
        }
    }
}

#[async_trait]
impl QuoteFeed for ShioajiFeed {
    async fn connect(&self, credentials: &Credentials) -> Result<(), FeedError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!("Logging in to quote bridge at {}", self.config.rest_url);
        let session = self.login(credentials).await?;
        info!("Login successful (upstream version {})", session.version);

        self.activate_ca(&session.token, credentials).await?;
        info!("Certificate activated");

        let ws_url = format!("{}/quotes?token={}", self.config.ws_url, session.token);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| FeedError::ConnectionError(e.to_string()))?;
        let (writer, reader) = ws_stream.split();
        *self.writer.lock().await = Some(writer);
        self.spawn_listener(reader);

        *self.session.write() = Some(session);
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to quote stream at {}", self.config.ws_url);

        // Directory fetch is best-effort: a failure leaves the service idle
        // until a later fetch succeeds, which beats refusing to start.
        match self.fetch_directory().await {
            Ok(count) => info!("Loaded {} option contracts", count),
            Err(e) => {
                warn!("Options directory fetch failed: {}", e);
                warn!(
                    "Continuing without contract metadata; no quotes will flow until the directory recovers"
                );
            }
        }

        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                warn!("Error closing quote stream: {}", e);
            }
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Disconnected from quote bridge");
        }

        *self.session.write() = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, contract: &Contract, kind: QuoteKind) -> Result<(), FeedError> {
        let request = SubscribeRequest::new(&contract.code, kind);
        let frame = serde_json::to_string(&request)?;
        self.send_frame(Message::Text(frame)).await?;
        debug!("Subscribed to {:?} stream for {}", kind, contract.code);
        Ok(())
    }

    async fn unsubscribe(&self, contract: &Contract) -> Result<(), FeedError> {
        let request = UnsubscribeRequest::new(&contract.code);
        let frame = serde_json::to_string(&request)?;
        self.send_frame(Message::Text(frame)).await?;
        debug!("Unsubscribed quote streams for {}", contract.code);
        Ok(())
    }

    async fn snapshots(&self, contract: &Contract) -> Result<Vec<RawSnapshot>, FeedError> {
        let token = self.session_token()?;

        let response = self
            .http
            .get(format!("{}/snapshots", self.config.rest_url))
            .timeout(self.request_timeout())
            .query(&[("code", contract.code.as_str())])
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::SnapshotError(format!(
                "snapshot for {} returned status {}",
                contract.code,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    fn resolve(&self, key: &str) -> Option<Contract> {
        self.directory.read().get(key).cloned()
    }

    fn version(&self) -> String {
        self.session
            .read()
            .as_ref()
            .map(|session| session.version.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn simulation(&self) -> bool {
        self.simulation
    }
}
