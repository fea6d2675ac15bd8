//! Mock quote feed for tests
//!
//! Records subscribe/unsubscribe traffic and serves a scripted contract
//! directory and snapshot results, so the subscription and dispatch logic
//! can be exercised without a bridge connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::types::{Contract, FeedError, OptionType, QuoteKind, RawSnapshot};
use super::QuoteFeed;
use crate::config::Credentials;

/// Scripted in-memory quote feed
#[derive(Default)]
pub struct MockFeed {
    connected: AtomicBool,
    directory: Mutex<HashMap<String, Contract>>,
    subscribe_calls: Mutex<Vec<(String, QuoteKind)>>,
    unsubscribe_calls: Mutex<Vec<String>>,
    fail_subscribe: Mutex<HashSet<String>>,
    fail_unsubscribe: Mutex<HashSet<String>>,
    fail_snapshot: Mutex<HashSet<String>>,
    snapshot_results: Mutex<HashMap<String, Vec<RawSnapshot>>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the directory with a call/put chain over the given strikes
    pub fn with_option_chain(self, prefix: &str, strikes: &[u32]) -> Self {
        {
            let mut directory = self.directory.lock();
            for &strike in strikes {
                for option_type in [OptionType::Call, OptionType::Put] {
                    let code = format!("{}{}{}", prefix, strike, option_type.key_suffix());
                    directory.insert(
                        code.clone(),
                        Contract {
                            code,
                            strike,
                            option_type,
                        },
                    );
                }
            }
        }
        self
    }

    pub fn insert_contract(&self, contract: Contract) {
        self.directory
            .lock()
            .insert(contract.code.clone(), contract);
    }

    /// Drop every directory entry, simulating a directory outage
    pub fn clear_directory(&self) {
        self.directory.lock().clear();
    }

    /// Make subsequent subscribe calls for `code` fail
    pub fn fail_subscribe(&self, code: &str) {
        self.fail_subscribe.lock().insert(code.to_string());
    }

    /// Make subsequent unsubscribe calls for `code` fail
    pub fn fail_unsubscribe(&self, code: &str) {
        self.fail_unsubscribe.lock().insert(code.to_string());
    }

    /// Make subsequent snapshot calls for `code` fail
    pub fn fail_snapshot(&self, code: &str) {
        self.fail_snapshot.lock().insert(code.to_string());
    }

    pub fn set_snapshots(&self, code: &str, snapshots: Vec<RawSnapshot>) {
        self.snapshot_results
            .lock()
            .insert(code.to_string(), snapshots);
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QuoteKind)> {
        self.subscribe_calls.lock().clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribe_calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.subscribe_calls.lock().clear();
        self.unsubscribe_calls.lock().clear();
    }
}

#[async_trait]
impl QuoteFeed for MockFeed {
    async fn connect(&self, _credentials: &Credentials) -> Result<(), FeedError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, contract: &Contract, kind: QuoteKind) -> Result<(), FeedError> {
        if self.fail_subscribe.lock().contains(&contract.code) {
            return Err(FeedError::SubscriptionError(format!(
                "scripted subscribe failure for {}",
                contract.code
            )));
        }
        self.subscribe_calls
            .lock()
            .push((contract.code.clone(), kind));
        Ok(())
    }

    async fn unsubscribe(&self, contract: &Contract) -> Result<(), FeedError> {
        if self.fail_unsubscribe.lock().contains(&contract.code) {
            return Err(FeedError::SubscriptionError(format!(
                "scripted unsubscribe failure for {}",
                contract.code
            )));
        }
        self.unsubscribe_calls.lock().push(contract.code.clone());
        Ok(())
    }

    async fn snapshots(&self, contract: &Contract) -> Result<Vec<RawSnapshot>, FeedError> {
        if self.fail_snapshot.lock().contains(&contract.code) {
            return Err(FeedError::SnapshotError(format!(
                "scripted snapshot failure for {}",
                contract.code
            )));
        }
        Ok(self
            .snapshot_results
            .lock()
            .get(&contract.code)
            .cloned()
            .unwrap_or_default())
    }

    fn resolve(&self, key: &str) -> Option<Contract> {
        self.directory.lock().get(key).cloned()
    }

    fn version(&self) -> String {
        "mock-1.0".to_string()
    }

    fn simulation(&self) -> bool {
        true
    }
}
