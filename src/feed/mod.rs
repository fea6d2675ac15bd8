//! Upstream quote feed integration module
//!
//! Exposes the provider capability set the relay core consumes: subscribe,
//! unsubscribe, per-contract snapshots, and contract resolution. Push quotes
//! are adapted into an internal channel drained by the supervisor's consumer
//! task.

use async_trait::async_trait;

use crate::config::Credentials;

pub mod mock;
pub mod shioaji;
pub mod types;

pub use shioaji::ShioajiFeed;
pub use types::*;

/// Push event delivered by the feed's quote stream
#[derive(Debug, Clone)]
pub enum PushEvent {
    Tick { exchange: String, tick: RawTick },
    BidAsk { exchange: String, bidask: RawBidAsk },
}

/// Capability set of the upstream quote provider
///
/// `resolve` hides the provider's contract directory behind a single keyed
/// lookup; callers never see how the underlying transport addresses
/// contracts.
#[async_trait]
pub trait QuoteFeed: Send + Sync {
    /// Establish the upstream session (login, certificate activation,
    /// contract directory fetch)
    async fn connect(&self, credentials: &Credentials) -> Result<(), FeedError>;

    /// Tear down the upstream session; idempotent
    async fn disconnect(&self);

    /// Whether the session is currently live
    fn is_connected(&self) -> bool;

    /// Subscribe one contract to one quote stream kind
    async fn subscribe(&self, contract: &Contract, kind: QuoteKind) -> Result<(), FeedError>;

    /// Unsubscribe one contract from all quote streams
    async fn unsubscribe(&self, contract: &Contract) -> Result<(), FeedError>;

    /// Fetch the polled snapshot records for one contract
    async fn snapshots(&self, contract: &Contract) -> Result<Vec<RawSnapshot>, FeedError>;

    /// Look up a contract handle by directory key
    fn resolve(&self, key: &str) -> Option<Contract>;

    /// Upstream provider version string
    fn version(&self) -> String;

    /// Whether the session targets the paper-trading endpoint
    fn simulation(&self) -> bool;
}
