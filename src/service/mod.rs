//! Connection supervision module
//!
//! Wires the quote feed, the event gateway, the contract manager, and the
//! market data handler together; runs the heartbeat, snapshot-poll, and
//! subscription-refresh loops; owns the shared index price and the service
//! state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError, Credentials};
use crate::contracts::ContractManager;
use crate::feed::{FeedError, PushEvent, QuoteFeed, RawTick};
use crate::gateway::{EventSink, GatewayError};
use crate::handler::MarketDataHandler;

/// Supervisor lifecycle states
///
/// Only `Idle -> Starting` and `Running -> Stopping` are triggered from the
/// outside; the remaining transitions are internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Errors surfaced by the supervisor's startup path
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service already running")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Gateway startup failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Feed startup failed: {0}")]
    Feed(#[from] FeedError),
}

/// Market data relay supervisor
pub struct MarketDataService {
    config: Config,
    feed: Arc<dyn QuoteFeed>,
    gateway: Arc<dyn EventSink>,
    contracts: Arc<ContractManager>,
    handler: Arc<MarketDataHandler>,
    state: Mutex<ServiceState>,
    running: Arc<AtomicBool>,
    current_price: Arc<Mutex<Option<f64>>>,
    push_rx: Mutex<Option<mpsc::Receiver<PushEvent>>>,
    push_task: Mutex<Option<JoinHandle<()>>>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataService {
    /// Create the supervisor and its collaborators
    pub fn new(
        config: Config,
        feed: Arc<dyn QuoteFeed>,
        gateway: Arc<dyn EventSink>,
        push_rx: mpsc::Receiver<PushEvent>,
    ) -> Self {
        let contracts = Arc::new(ContractManager::new(
            feed.clone(),
            config.strike_interval,
            &config.symbol_prefix,
        ));
        let handler = Arc::new(MarketDataHandler::new(gateway.clone()));

        Self {
            config,
            feed,
            gateway,
            contracts,
            handler,
            state: Mutex::new(ServiceState::Idle),
            running: Arc::new(AtomicBool::new(false)),
            current_price: Arc::new(Mutex::new(None)),
            push_rx: Mutex::new(Some(push_rx)),
            push_task: Mutex::new(None),
            snapshot_task: Mutex::new(None),
        }
    }

    /// Validate the environment and start the service
    pub async fn start(&self) -> Result<(), ServiceError> {
        let credentials = Credentials::from_env()?;
        info!("Environment validation passed");
        self.start_with(credentials).await
    }

    /// Start the service with pre-validated credentials
    pub async fn start_with(&self, credentials: Credentials) -> Result<(), ServiceError> {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::Idle {
                return Err(ServiceError::AlreadyRunning);
            }
            *state = ServiceState::Starting;
        }

        match self.start_inner(&credentials).await {
            Ok(()) => {
                *self.state.lock() = ServiceState::Running;
                info!("Market data service started");
                Ok(())
            }
            Err(e) => {
                error!("Service startup failed: {}", e);
                self.emit_error(&e.to_string());
                self.teardown().await;
                *self.state.lock() = ServiceState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self, credentials: &Credentials) -> Result<(), ServiceError> {
        info!("Starting market data service...");
        self.gateway.connect().await?;
        self.feed.connect(credentials).await?;

        self.running.store(true, Ordering::SeqCst);
        self.spawn_push_consumer();
        self.emit_ready();
        self.spawn_snapshot_poller();

        Ok(())
    }

    /// Supervisor loop; returns when `stop` clears the running flag
    ///
    /// Heartbeat and refresh run off explicit next-deadline instants so a
    /// slow iteration delays the schedule instead of double-firing it.
    pub async fn run_until_stopped(&self) {
        info!("Supervisor loop started");

        let heartbeat_every = Duration::from_secs(self.config.heartbeat_interval_secs);
        let refresh_every = Duration::from_secs(self.config.contract_update_interval_secs);
        let mut next_heartbeat = Instant::now() + heartbeat_every;
        let mut next_refresh = Instant::now() + refresh_every;

        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            let now = Instant::now();

            if now >= next_heartbeat {
                next_heartbeat = now + heartbeat_every;
                if let Err(e) = self.send_heartbeat().await {
                    warn!("Failed to send heartbeat: {}", e);
                    self.emit_error(&e.to_string());
                }
            }

            if now >= next_refresh {
                next_refresh = now + refresh_every;
                self.refresh_subscriptions().await;
            }
        }

        info!("Supervisor loop terminated");
    }

    /// Stop the service; idempotent
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::Running {
                return;
            }
            *state = ServiceState::Stopping;
        }

        info!("Stopping market data service...");
        self.running.store(false, Ordering::SeqCst);

        let snapshot_task = self.snapshot_task.lock().take();
        if let Some(task) = snapshot_task {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Snapshot poll task did not stop within 5s; abandoning it");
            }
        }

        let push_task = self.push_task.lock().take();
        if let Some(task) = push_task {
            task.abort();
        }

        self.contracts.unsubscribe_all().await;
        self.feed.disconnect().await;
        self.gateway.disconnect();

        *self.state.lock() = ServiceState::Stopped;
        info!("Market data service stopped");
    }

    /// Best-effort cleanup after a failed startup
    async fn teardown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let snapshot_task = self.snapshot_task.lock().take();
        if let Some(task) = snapshot_task {
            task.abort();
        }
        let push_task = self.push_task.lock().take();
        if let Some(task) = push_task {
            task.abort();
        }

        self.contracts.unsubscribe_all().await;
        self.feed.disconnect().await;
        self.gateway.disconnect();
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drain push events into the handler and the shared price cell
    fn spawn_push_consumer(&self) {
        let receiver = self.push_rx.lock().take();
        let Some(mut push_rx) = receiver else {
            warn!("Push consumer already installed");
            return;
        };

        let handler = self.handler.clone();
        let current_price = self.current_price.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = push_rx.recv().await {
                match event {
                    PushEvent::Tick { exchange, tick } => {
                        handler.handle_tick(&exchange, &tick);
                        update_current_price(&current_price, &tick);
                    }
                    PushEvent::BidAsk { exchange, bidask } => {
                        handler.handle_bidask(&exchange, &bidask);
                    }
                }
            }
            debug!("Push event channel closed");
        });

        *self.push_task.lock() = Some(task);
        info!("Quote callbacks installed");
    }

    /// Poll snapshots for every subscribed contract at a fixed cadence
    fn spawn_snapshot_poller(&self) {
        let running = self.running.clone();
        let contracts = self.contracts.clone();
        let feed = self.feed.clone();
        let handler = self.handler.clone();
        let poll_interval = Duration::from_secs(self.config.snapshot_interval_secs);

        let task = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(poll_interval).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                for contract in contracts.subscribed_contracts().await {
                    match feed.snapshots(&contract).await {
                        Ok(rows) => handler.handle_snapshot(&rows),
                        Err(e) => {
                            warn!("Snapshot fetch failed for {}: {}", contract.code, e);
                            continue;
                        }
                    }
                }
            }
            debug!("Snapshot poll task terminated");
        });

        *self.snapshot_task.lock() = Some(task);
        info!(
            "Snapshot poll task started (every {}s)",
            self.config.snapshot_interval_secs
        );
    }

    /// One subscription-refresh pass; skipped until a valid price is seen
    async fn refresh_subscriptions(&self) {
        let price = *self.current_price.lock();
        match price {
            Some(price) if price > 0.0 => {
                self.contracts
                    .refresh(price, self.config.window_size, self.config.option_type)
                    .await;
            }
            _ => debug!("No valid index price yet; skipping subscription refresh"),
        }
    }

    async fn send_heartbeat(&self) -> Result<(), GatewayError> {
        // Skipped, not buffered, while the hub is down
        if !self.gateway.is_connected() {
            debug!("Gateway disconnected; skipping heartbeat");
            return Ok(());
        }

        let current_price = *self.current_price.lock();
        let payload = serde_json::json!({
            "status": "running",
            "shioaji_connected": self.feed.is_connected(),
            "gateway_connected": self.gateway.is_connected(),
            "current_price": current_price,
            "subscribed_contracts": self.contracts.subscribed_len().await,
        });

        self.gateway.emit("heartbeat", payload)
    }

    fn emit_ready(&self) {
        let payload = serde_json::json!({
            "status": "ready",
            "simulation": self.feed.simulation(),
            "version": self.feed.version(),
            "service_type": "market_data",
        });

        if let Err(e) = self.gateway.emit("shioaji_ready", payload) {
            warn!("Failed to announce readiness: {}", e);
        } else {
            info!("Announced service ready");
        }
    }

    fn emit_error(&self, error: &str) {
        if !self.gateway.is_connected() {
            return;
        }

        let payload = serde_json::json!({
            "error": error,
            "service": "market_data",
        });

        if let Err(e) = self.gateway.emit("python_error", payload) {
            error!("Failed to emit error event: {}", e);
        }
    }
}

/// Track the index price from trade prints carrying a usable price
fn update_current_price(cell: &Mutex<Option<f64>>, tick: &RawTick) {
    let price = tick
        .close
        .filter(|price| *price > 0.0)
        .or(tick.price.filter(|price| *price > 0.0));
    if let Some(price) = price {
        *cell.lock() = Some(price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::mock::MockFeed;
    use crate::feed::OptionType;
    use crate::gateway::MockGateway;

    fn test_config() -> Config {
        Config {
            heartbeat_interval_secs: 1,
            snapshot_interval_secs: 1,
            contract_update_interval_secs: 1,
            window_size: 8,
            ..Config::default()
        }
    }

    fn test_credentials() -> Credentials {
        Credentials {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            ca_cert_path: "/tmp/ca.pfx".to_string(),
            ca_password: "passphrase".to_string(),
            gateway_url: "http://localhost:3001".to_string(),
        }
    }

    struct Fixture {
        service: MarketDataService,
        feed: Arc<MockFeed>,
        gateway: Arc<MockGateway>,
        push_tx: mpsc::Sender<PushEvent>,
    }

    fn fixture_with(feed: MockFeed) -> Fixture {
        let feed = Arc::new(feed);
        let gateway = Arc::new(MockGateway::new());
        let (push_tx, push_rx) = mpsc::channel(16);
        let service = MarketDataService::new(test_config(), feed.clone(), gateway.clone(), push_rx);
        Fixture {
            service,
            feed,
            gateway,
            push_tx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockFeed::new().with_option_chain("TXO", &[18000, 18100]))
    }

    #[tokio::test]
    async fn test_start_twice_fails_with_already_running() {
        let fixture = fixture();
        use tokio_test::assert_ok;
        assert_ok!(fixture.service.start_with(test_credentials()).await);
        assert_eq!(fixture.service.state(), ServiceState::Running);

        let second = fixture.service.start_with(test_credentials()).await;
        assert!(matches!(second, Err(ServiceError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_ready_event_announced_on_start() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();

        let ready = fixture.gateway.last_event("shioaji_ready").unwrap();
        assert_eq!(ready["status"], "ready");
        assert_eq!(ready["simulation"], true);
        assert_eq!(ready["version"], "mock-1.0");
        assert_eq!(ready["service_type"], "market_data");
    }

    #[tokio::test]
    async fn test_heartbeat_content() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();

        fixture
            .service
            .contracts
            .refresh(18050.0, 8, OptionType::Call)
            .await;
        *fixture.service.current_price.lock() = Some(18050.0);

        fixture.service.send_heartbeat().await.unwrap();

        let heartbeat = fixture.gateway.last_event("heartbeat").unwrap();
        assert_eq!(heartbeat["status"], "running");
        assert_eq!(heartbeat["shioaji_connected"], true);
        assert_eq!(heartbeat["gateway_connected"], true);
        assert_eq!(heartbeat["current_price"], 18050.0);
        assert_eq!(heartbeat["subscribed_contracts"], 2);
    }

    #[tokio::test]
    async fn test_heartbeat_skipped_while_gateway_down() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();

        fixture.gateway.set_connected(false);
        fixture.service.send_heartbeat().await.unwrap();

        assert!(fixture.gateway.events_named("heartbeat").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_skipped_without_valid_price() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();
        fixture.feed.clear_calls();

        fixture.service.refresh_subscriptions().await;
        assert!(fixture.feed.subscribe_calls().is_empty());

        *fixture.service.current_price.lock() = Some(18000.0);
        fixture.service.refresh_subscriptions().await;
        assert!(!fixture.feed.subscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_push_events_flow_to_sink_and_price_cell() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();

        let tick = RawTick {
            code: Some("TXO18000C".to_string()),
            close: Some(18050.0),
            ..RawTick::default()
        };
        fixture
            .push_tx
            .send(PushEvent::Tick {
                exchange: "TAIFEX".to_string(),
                tick,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let emitted = fixture.gateway.last_event("market_tick").unwrap();
        assert_eq!(emitted["code"], "TXO18000C");
        assert_eq!(*fixture.service.current_price.lock(), Some(18050.0));
    }

    #[tokio::test]
    async fn test_malformed_tick_does_not_poison_the_stream() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();

        // Code-less tick is dropped, the next well-formed one goes through
        fixture
            .push_tx
            .send(PushEvent::Tick {
                exchange: "TAIFEX".to_string(),
                tick: RawTick::default(),
            })
            .await
            .unwrap();
        fixture
            .push_tx
            .send(PushEvent::Tick {
                exchange: "TAIFEX".to_string(),
                tick: RawTick {
                    code: Some("TXO18000C".to_string()),
                    close: Some(17999.0),
                    ..RawTick::default()
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fixture.gateway.events_named("market_tick").len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_poller_survives_per_contract_failures() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();

        // Two contracts subscribed; one of them keeps failing its snapshot
        fixture
            .service
            .contracts
            .refresh(18050.0, 8, OptionType::Call)
            .await;
        fixture.feed.fail_snapshot("TXO18000C");
        fixture.feed.set_snapshots(
            "TXO18100C",
            vec![crate::feed::RawSnapshot {
                code: Some("TXO18100C".to_string()),
                close: Some(55.0),
                ..Default::default()
            }],
        );

        tokio::time::sleep(Duration::from_millis(1300)).await;

        let snapshot = fixture.gateway.last_event("market_snapshot").unwrap();
        assert_eq!(snapshot["code"], "TXO18100C");
        assert_eq!(snapshot["close"], 55.0);

        fixture.service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_tears_down_in_order() {
        let fixture = fixture();
        fixture.service.start_with(test_credentials()).await.unwrap();
        fixture
            .service
            .contracts
            .refresh(18000.0, 0, OptionType::Call)
            .await;

        fixture.service.stop().await;
        assert_eq!(fixture.service.state(), ServiceState::Stopped);
        assert!(!fixture.feed.is_connected());
        assert!(!fixture.gateway.is_connected());
        assert_eq!(fixture.service.contracts.subscribed_len().await, 0);
        assert_eq!(fixture.feed.unsubscribe_calls(), vec!["TXO18000C"]);

        // Second stop is a no-op
        fixture.service.stop().await;
        assert_eq!(fixture.service.state(), ServiceState::Stopped);
        assert_eq!(fixture.feed.unsubscribe_calls().len(), 1);
    }

    #[test]
    fn test_price_cell_ignores_unusable_ticks() {
        let cell = Mutex::new(None);

        update_current_price(&cell, &RawTick::default());
        assert_eq!(*cell.lock(), None);

        update_current_price(
            &cell,
            &RawTick {
                close: Some(0.0),
                ..RawTick::default()
            },
        );
        assert_eq!(*cell.lock(), None);

        update_current_price(
            &cell,
            &RawTick {
                close: None,
                price: Some(18020.0),
                ..RawTick::default()
            },
        );
        assert_eq!(*cell.lock(), Some(18020.0));

        update_current_price(
            &cell,
            &RawTick {
                close: Some(-1.0),
                ..RawTick::default()
            },
        );
        assert_eq!(*cell.lock(), Some(18020.0));
    }
}
