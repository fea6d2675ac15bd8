//! Feed data types and wire structures

use serde::{Deserialize, Serialize};

/// Option side of a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Single-character suffix used in contract directory keys
    pub fn key_suffix(&self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }
}

/// Quote stream kinds offered by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteKind {
    Tick,
    BidAsk,
}

/// Exchange-assigned option contract handle
///
/// `code` uniquely identifies the contract within the provider's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub code: String,
    pub strike: u32,
    pub option_type: OptionType,
}

/// Raw trade print as delivered by the quote stream
///
/// Every field except `code` may be absent upstream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTick {
    pub code: Option<String>,
    pub datetime: Option<String>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub price: Option<f64>,
    pub volume: Option<u64>,
    pub total_volume: Option<u64>,
}

/// Raw top-of-book quote as delivered by the quote stream
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBidAsk {
    pub code: Option<String>,
    pub datetime: Option<String>,
    #[serde(default)]
    pub bid_price: Vec<f64>,
    #[serde(default)]
    pub bid_volume: Vec<u64>,
    #[serde(default)]
    pub ask_price: Vec<f64>,
    #[serde(default)]
    pub ask_volume: Vec<u64>,
}

/// Raw polled summary record
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSnapshot {
    pub code: Option<String>,
    pub name: Option<String>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
    pub amount: Option<f64>,
    pub total_volume: Option<u64>,
}

/// Generic quote stream message wrapper
#[derive(Debug, Deserialize)]
pub struct FeedMessage {
    pub topic: String,
    #[serde(default)]
    pub exchange: Option<String>,
    pub data: serde_json::Value,
}

/// Quote stream subscription request
#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    pub action: String,
    pub code: String,
    pub kind: QuoteKind,
}

impl SubscribeRequest {
    pub fn new(code: &str, kind: QuoteKind) -> Self {
        Self {
            action: "subscribe".to_string(),
            code: code.to_string(),
            kind,
        }
    }
}

/// Quote stream unsubscription request
#[derive(Debug, Serialize)]
pub struct UnsubscribeRequest {
    pub action: String,
    pub code: String,
}

impl UnsubscribeRequest {
    pub fn new(code: &str) -> Self {
        Self {
            action: "unsubscribe".to_string(),
            code: code.to_string(),
        }
    }
}

/// Error types for feed operations
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed connection error: {0}")]
    ConnectionError(String),
    #[error("Login rejected: {0}")]
    LoginError(String),
    #[error("Certificate activation failed: {0}")]
    CaError(String),
    #[error("Subscription error: {0}")]
    SubscriptionError(String),
    #[error("Snapshot error: {0}")]
    SnapshotError(String),
    #[error("Not connected to feed")]
    NotConnected,
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_type_key_suffix() {
        assert_eq!(OptionType::Call.key_suffix(), 'C');
        assert_eq!(OptionType::Put.key_suffix(), 'P');
    }

    #[test]
    fn test_raw_tick_sparse_fields() {
        let tick: RawTick = serde_json::from_str(r#"{"code":"TXO18000C","close":12.5}"#).unwrap();
        assert_eq!(tick.code.as_deref(), Some("TXO18000C"));
        assert_eq!(tick.close, Some(12.5));
        assert!(tick.open.is_none());
        assert!(tick.volume.is_none());
    }

    #[test]
    fn test_raw_bidask_missing_lists_are_empty() {
        let bidask: RawBidAsk = serde_json::from_str(r#"{"code":"TXO18000C"}"#).unwrap();
        assert!(bidask.bid_price.is_empty());
        assert!(bidask.ask_volume.is_empty());
    }

    #[test]
    fn test_subscribe_request_wire_shape() {
        let request = SubscribeRequest::new("TXO18000C", QuoteKind::BidAsk);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "subscribe");
        assert_eq!(json["code"], "TXO18000C");
        assert_eq!(json["kind"], "bidask");
    }
}
