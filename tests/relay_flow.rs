//! End-to-end relay flow over the mock adapters
//!
//! Drives the full push -> handler -> sink path plus a subscription refresh
//! cycle through the supervisor, without touching the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use optrelay::config::{Config, Credentials};
use optrelay::feed::mock::MockFeed;
use optrelay::feed::{PushEvent, RawBidAsk, RawTick};
use optrelay::gateway::MockGateway;
use optrelay::service::{MarketDataService, ServiceState};

fn fast_config() -> Config {
    Config {
        heartbeat_interval_secs: 1,
        snapshot_interval_secs: 1,
        contract_update_interval_secs: 1,
        ..Config::default()
    }
}

fn credentials() -> Credentials {
    Credentials {
        api_key: "key".to_string(),
        secret_key: "secret".to_string(),
        ca_cert_path: "/tmp/ca.pfx".to_string(),
        ca_password: "passphrase".to_string(),
        gateway_url: "http://localhost:3001".to_string(),
    }
}

fn index_tick(close: f64) -> PushEvent {
    PushEvent::Tick {
        exchange: "TAIFEX".to_string(),
        tick: RawTick {
            code: Some("TXO18000C".to_string()),
            close: Some(close),
            ..RawTick::default()
        },
    }
}

#[tokio::test]
async fn relay_tracks_the_money_and_forwards_quotes() {
    let feed = Arc::new(MockFeed::new().with_option_chain("TXO", &[17900, 18000, 18100]));
    let gateway = Arc::new(MockGateway::new());
    let (push_tx, push_rx) = mpsc::channel(16);

    let service = Arc::new(MarketDataService::new(
        fast_config(),
        feed.clone(),
        gateway.clone(),
        push_rx,
    ));

    service.start_with(credentials()).await.unwrap();
    assert_eq!(service.state(), ServiceState::Running);

    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run_until_stopped().await })
    };

    // The first usable tick seeds the index price and the next refresh pass
    // subscribes the window around it.
    push_tx.send(index_tick(18050.0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let ticks = gateway.events_named("market_tick");
    assert!(!ticks.is_empty());
    assert_eq!(ticks[0]["code"], "TXO18000C");
    assert_eq!(ticks[0]["exchange"], "TAIFEX");

    // ATM 18100 with the default window covers every strike in the chain;
    // each subscribed contract gets both quote kinds.
    assert_eq!(feed.subscribe_calls().len(), 6);

    let heartbeat = gateway.last_event("heartbeat").unwrap();
    assert_eq!(heartbeat["status"], "running");
    assert_eq!(heartbeat["shioaji_connected"], true);
    assert_eq!(heartbeat["subscribed_contracts"], 3);
    assert_eq!(heartbeat["current_price"], 18050.0);

    service.stop().await;
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(feed.unsubscribe_calls().len(), 3);

    tokio::time::timeout(Duration::from_secs(3), runner)
        .await
        .expect("supervisor loop should stop promptly")
        .unwrap();
}

#[tokio::test]
async fn quotes_are_dropped_while_the_hub_is_down() {
    let feed = Arc::new(MockFeed::new().with_option_chain("TXO", &[18000]));
    let gateway = Arc::new(MockGateway::new());
    let (push_tx, push_rx) = mpsc::channel(16);

    let service =
        MarketDataService::new(fast_config(), feed.clone(), gateway.clone(), push_rx);
    service.start_with(credentials()).await.unwrap();

    gateway.set_connected(false);
    push_tx.send(index_tick(18000.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(gateway.events_named("market_tick").is_empty());

    // Hub comes back; the stream resumes without intervention
    gateway.set_connected(true);
    push_tx.send(index_tick(18010.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(gateway.events_named("market_tick").len(), 1);
}

#[tokio::test]
async fn bidask_quotes_flow_with_empty_depth_lists() {
    let feed = Arc::new(MockFeed::new());
    let gateway = Arc::new(MockGateway::new());
    let (push_tx, push_rx) = mpsc::channel(16);

    let service =
        MarketDataService::new(fast_config(), feed.clone(), gateway.clone(), push_rx);
    service.start_with(credentials()).await.unwrap();

    push_tx
        .send(PushEvent::BidAsk {
            exchange: "TAIFEX".to_string(),
            bidask: RawBidAsk {
                code: Some("TXO18000C".to_string()),
                bid_price: vec![12.0],
                bid_volume: vec![7],
                ..RawBidAsk::default()
            },
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let quote = gateway.last_event("market_bidask").unwrap();
    assert_eq!(quote["code"], "TXO18000C");
    assert_eq!(quote["bid_price"], serde_json::json!([12.0]));
    assert_eq!(quote["ask_price"], serde_json::json!([]));
    assert!(quote["dispatch_time"].is_string());
}
