//! Market data dispatch module
//!
//! Normalises raw quote callbacks and polled snapshot rows into outbound
//! records and pushes them through the event sink. Every failure is absorbed
//! here: this code runs on the push-consumer context, and an error escaping
//! it would take the quote feed down with it. Isolation is per-message.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::feed::{RawBidAsk, RawSnapshot, RawTick};
use crate::gateway::EventSink;

/// Normalised trade print forwarded as `market_tick`
#[derive(Debug, Clone, Serialize)]
pub struct TickRecord {
    pub exchange: String,
    pub code: String,
    pub event_time: Option<String>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
    pub total_volume: Option<u64>,
    pub dispatch_time: String,
}

/// Normalised book quote forwarded as `market_bidask`
///
/// The price/volume lists may be empty but are never null.
#[derive(Debug, Clone, Serialize)]
pub struct BidAskRecord {
    pub exchange: String,
    pub code: String,
    pub event_time: Option<String>,
    pub bid_price: Vec<f64>,
    pub bid_volume: Vec<u64>,
    pub ask_price: Vec<f64>,
    pub ask_volume: Vec<u64>,
    pub dispatch_time: String,
}

/// Normalised polled summary forwarded as `market_snapshot`
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRecord {
    pub code: String,
    pub name: Option<String>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
    pub amount: Option<f64>,
    pub total_volume: Option<u64>,
    pub dispatch_time: String,
}

/// Dispatch statistics derived from the last-seen maps
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerStats {
    pub tick_contracts_tracked: usize,
    pub bidask_contracts_tracked: usize,
    pub last_tick_update: Option<f64>,
    pub last_bidask_update: Option<f64>,
}

/// Market data handler sitting between the feed callbacks and the sink
pub struct MarketDataHandler {
    sink: Arc<dyn EventSink>,
    last_tick_time: Mutex<HashMap<String, f64>>,
    last_bidask_time: Mutex<HashMap<String, f64>>,
}

impl MarketDataHandler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            last_tick_time: Mutex::new(HashMap::new()),
            last_bidask_time: Mutex::new(HashMap::new()),
        }
    }

    /// Forward one trade print
    pub fn handle_tick(&self, exchange: &str, tick: &RawTick) {
        let Some(code) = tick.code.clone() else {
            warn!("Tick record missing contract code; dropping");
            return;
        };

        if !self.sink.is_connected() {
            debug!("Gateway disconnected; dropping tick for {}", code);
            return;
        }

        let record = TickRecord {
            exchange: exchange.to_string(),
            code: code.clone(),
            event_time: tick.datetime.clone(),
            open: tick.open,
            high: tick.high,
            low: tick.low,
            close: tick.close,
            volume: tick.volume,
            total_volume: tick.total_volume,
            dispatch_time: Local::now().to_rfc3339(),
        };

        match serde_json::to_value(&record) {
            Ok(payload) => {
                if let Err(e) = self.sink.emit("market_tick", payload) {
                    error!("Failed to emit tick for {}: {}", code, e);
                    return;
                }
                self.last_tick_time.lock().insert(code, epoch_seconds());
            }
            Err(e) => error!("Failed to serialise tick for {}: {}", code, e),
        }
    }

    /// Forward one book quote
    pub fn handle_bidask(&self, exchange: &str, bidask: &RawBidAsk) {
        let Some(code) = bidask.code.clone() else {
            warn!("BidAsk record missing contract code; dropping");
            return;
        };

        if !self.sink.is_connected() {
            debug!("Gateway disconnected; dropping bidask for {}", code);
            return;
        }

        let record = BidAskRecord {
            exchange: exchange.to_string(),
            code: code.clone(),
            event_time: bidask.datetime.clone(),
            bid_price: bidask.bid_price.clone(),
            bid_volume: bidask.bid_volume.clone(),
            ask_price: bidask.ask_price.clone(),
            ask_volume: bidask.ask_volume.clone(),
            dispatch_time: Local::now().to_rfc3339(),
        };

        match serde_json::to_value(&record) {
            Ok(payload) => {
                if let Err(e) = self.sink.emit("market_bidask", payload) {
                    error!("Failed to emit bidask for {}: {}", code, e);
                    return;
                }
                self.last_bidask_time.lock().insert(code, epoch_seconds());
            }
            Err(e) => error!("Failed to serialise bidask for {}: {}", code, e),
        }
    }

    /// Forward a batch of polled snapshot rows
    ///
    /// Per-element failures do not abort the batch.
    pub fn handle_snapshot(&self, snapshots: &[RawSnapshot]) {
        for snapshot in snapshots {
            let Some(code) = snapshot.code.clone() else {
                debug!("Snapshot row missing contract code; dropping");
                continue;
            };

            if !self.sink.is_connected() {
                debug!("Gateway disconnected; dropping snapshot for {}", code);
                continue;
            }

            let record = SnapshotRecord {
                code: code.clone(),
                name: snapshot.name.clone(),
                open: snapshot.open,
                high: snapshot.high,
                low: snapshot.low,
                close: snapshot.close,
                volume: snapshot.volume,
                amount: snapshot.amount,
                total_volume: snapshot.total_volume,
                dispatch_time: Local::now().to_rfc3339(),
            };

            match serde_json::to_value(&record) {
                Ok(payload) => {
                    if let Err(e) = self.sink.emit("market_snapshot", payload) {
                        error!("Failed to emit snapshot for {}: {}", code, e);
                    }
                }
                Err(e) => error!("Failed to serialise snapshot for {}: {}", code, e),
            }
        }
    }

    /// Dispatch statistics over everything seen so far
    pub fn stats(&self) -> HandlerStats {
        let ticks = self.last_tick_time.lock();
        let bidasks = self.last_bidask_time.lock();

        HandlerStats {
            tick_contracts_tracked: ticks.len(),
            bidask_contracts_tracked: bidasks.len(),
            last_tick_update: ticks.values().copied().reduce(f64::max),
            last_bidask_update: bidasks.values().copied().reduce(f64::max),
        }
    }
}

fn epoch_seconds() -> f64 {
    Local::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;

    fn tick(code: Option<&str>, close: Option<f64>) -> RawTick {
        RawTick {
            code: code.map(|c| c.to_string()),
            close,
            ..RawTick::default()
        }
    }

    #[test]
    fn test_tick_without_code_is_not_emitted() {
        let sink = Arc::new(MockGateway::new());
        let handler = MarketDataHandler::new(sink.clone());

        handler.handle_tick("TAIFEX", &tick(None, Some(12.5)));

        assert!(sink.events().is_empty());
        assert_eq!(handler.stats().tick_contracts_tracked, 0);
    }

    #[test]
    fn test_tick_dropped_when_sink_disconnected() {
        let sink = Arc::new(MockGateway::new());
        sink.set_connected(false);
        let handler = MarketDataHandler::new(sink.clone());

        handler.handle_tick("TAIFEX", &tick(Some("TXO18000C"), Some(12.5)));

        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_tick_emitted_with_normalised_fields() {
        let sink = Arc::new(MockGateway::new());
        let handler = MarketDataHandler::new(sink.clone());

        handler.handle_tick("TAIFEX", &tick(Some("TXO18000C"), Some(12.5)));

        let payload = sink.last_event("market_tick").unwrap();
        assert_eq!(payload["exchange"], "TAIFEX");
        assert_eq!(payload["code"], "TXO18000C");
        assert_eq!(payload["close"], 12.5);
        assert!(payload["open"].is_null());
        assert!(payload["dispatch_time"].is_string());

        let stats = handler.stats();
        assert_eq!(stats.tick_contracts_tracked, 1);
        assert!(stats.last_tick_update.is_some());
    }

    #[test]
    fn test_emit_failure_is_absorbed_and_stream_continues() {
        let sink = Arc::new(MockGateway::new());
        let handler = MarketDataHandler::new(sink.clone());

        sink.fail_emits(true);
        handler.handle_tick("TAIFEX", &tick(Some("TXO18000C"), Some(12.5)));
        assert_eq!(handler.stats().tick_contracts_tracked, 0);

        sink.fail_emits(false);
        handler.handle_tick("TAIFEX", &tick(Some("TXO18000C"), Some(12.6)));

        assert_eq!(sink.events_named("market_tick").len(), 1);
        assert_eq!(handler.stats().tick_contracts_tracked, 1);
    }

    #[test]
    fn test_bidask_lists_are_never_null() {
        let sink = Arc::new(MockGateway::new());
        let handler = MarketDataHandler::new(sink.clone());

        let bidask = RawBidAsk {
            code: Some("TXO18000C".to_string()),
            bid_price: vec![12.0, 11.5],
            bid_volume: vec![10, 4],
            ..RawBidAsk::default()
        };
        handler.handle_bidask("TAIFEX", &bidask);

        let payload = sink.last_event("market_bidask").unwrap();
        assert_eq!(payload["bid_price"], serde_json::json!([12.0, 11.5]));
        assert_eq!(payload["ask_price"], serde_json::json!([]));
        assert_eq!(payload["ask_volume"], serde_json::json!([]));
    }

    #[test]
    fn test_snapshot_batch_skips_bad_rows() {
        let sink = Arc::new(MockGateway::new());
        let handler = MarketDataHandler::new(sink.clone());

        let rows = vec![
            RawSnapshot::default(),
            RawSnapshot {
                code: Some("TXO18000C".to_string()),
                close: Some(13.0),
                ..RawSnapshot::default()
            },
        ];
        handler.handle_snapshot(&rows);

        let emitted = sink.events_named("market_snapshot");
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0]["code"], "TXO18000C");
    }

    #[test]
    fn test_stats_track_max_update_per_stream() {
        let sink = Arc::new(MockGateway::new());
        let handler = MarketDataHandler::new(sink.clone());

        let stats = handler.stats();
        assert_eq!(stats.tick_contracts_tracked, 0);
        assert!(stats.last_tick_update.is_none());
        assert!(stats.last_bidask_update.is_none());

        handler.handle_tick("TAIFEX", &tick(Some("TXO18000C"), Some(12.5)));
        handler.handle_tick("TAIFEX", &tick(Some("TXO18100C"), Some(8.0)));

        let stats = handler.stats();
        assert_eq!(stats.tick_contracts_tracked, 2);
        assert_eq!(stats.bidask_contracts_tracked, 0);
        let newest = stats.last_tick_update.unwrap();
        assert!(newest <= epoch_seconds());
    }
}
