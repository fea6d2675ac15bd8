//! Option contract subscription management module
//!
//! Owns the subscribed contract set and keeps it equal to the at-the-money
//! strike window: every refresh recomputes the desired window from the
//! current index price, diffs it against the live set, and issues the
//! subscribe/unsubscribe calls for the difference.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::feed::{Contract, OptionType, QuoteFeed, QuoteKind};

/// Mutable subscription state; mutation is serialised by the outer mutex
#[derive(Default)]
struct SubscriptionState {
    /// code -> contract handle, grown on first successful resolution
    cache: HashMap<String, Contract>,
    /// codes with a submitted subscribe and no unsubscribe since
    subscribed: HashSet<String>,
}

/// Dynamic option contract subscription manager
pub struct ContractManager {
    feed: Arc<dyn QuoteFeed>,
    strike_interval: u32,
    symbol_prefix: String,
    state: Mutex<SubscriptionState>,
}

impl ContractManager {
    pub fn new(feed: Arc<dyn QuoteFeed>, strike_interval: u32, symbol_prefix: &str) -> Self {
        Self {
            feed,
            strike_interval,
            symbol_prefix: symbol_prefix.to_string(),
            state: Mutex::new(SubscriptionState::default()),
        }
    }

    /// Strike closest to the given price; ties round away from the money
    pub fn atm_strike(&self, price: f64) -> i64 {
        let interval = i64::from(self.strike_interval);
        (price / self.strike_interval as f64).round() as i64 * interval
    }

    /// Strikes at `atm ± window` steps, non-positive values dropped
    pub fn target_strikes(&self, atm: i64, window: u32) -> Vec<u32> {
        let interval = i64::from(self.strike_interval);
        let window = i64::from(window);
        (-window..=window)
            .map(|step| atm + step * interval)
            .filter(|&strike| strike > 0)
            .map(|strike| strike as u32)
            .collect()
    }

    /// Directory key for one strike, e.g. `TXO18000C`
    pub fn contract_key(&self, strike: u32, option_type: OptionType) -> String {
        format!(
            "{}{}{}",
            self.symbol_prefix,
            strike,
            option_type.key_suffix()
        )
    }

    /// Reconcile the subscribed set with the window around `price`
    ///
    /// Never fails: unresolved strikes are dropped, per-contract
    /// subscribe failures leave holes that the next refresh retries, and
    /// unsubscribed codes leave the set whether or not the feed call
    /// succeeded.
    pub async fn refresh(&self, price: f64, window_size: u32, option_type: OptionType) {
        if price <= 0.0 {
            debug!("Ignoring refresh with non-positive price {}", price);
            return;
        }

        let atm = self.atm_strike(price);
        let strikes = self.target_strikes(atm, window_size);

        let mut state = self.state.lock().await;

        let mut targets: Vec<Contract> = Vec::new();
        for strike in strikes {
            let key = self.contract_key(strike, option_type);
            match self.feed.resolve(&key) {
                Some(contract) => {
                    state.cache.insert(contract.code.clone(), contract.clone());
                    targets.push(contract);
                }
                None => debug!("No contract in directory for key {}", key),
            }
        }

        if targets.is_empty() {
            warn!(
                "No contracts resolved around ATM {}; leaving subscriptions untouched",
                atm
            );
            return;
        }

        let target_codes: HashSet<String> =
            targets.iter().map(|contract| contract.code.clone()).collect();
        let to_add: Vec<Contract> = targets
            .iter()
            .filter(|contract| !state.subscribed.contains(&contract.code))
            .cloned()
            .collect();
        let to_remove: Vec<String> = state
            .subscribed
            .difference(&target_codes)
            .cloned()
            .collect();

        for contract in to_add {
            match self.subscribe_quote_streams(&contract).await {
                Ok(()) => {
                    debug!("Subscribed contract {}", contract.code);
                    state.subscribed.insert(contract.code.clone());
                }
                Err(e) => warn!("Failed to subscribe {}: {}", contract.code, e),
            }
        }

        for code in to_remove {
            if let Some(contract) = state.cache.get(&code).cloned() {
                if let Err(e) = self.feed.unsubscribe(&contract).await {
                    warn!("Failed to unsubscribe {}: {}", code, e);
                }
            }
            // Removal is unconditional so the set cannot grow unbounded
            state.subscribed.remove(&code);
            debug!("Unsubscribed contract {}", code);
        }

        info!(
            "Subscription refresh complete | ATM: {} | subscribed: {}",
            atm,
            state.subscribed.len()
        );
    }

    async fn subscribe_quote_streams(
        &self,
        contract: &Contract,
    ) -> Result<(), crate::feed::FeedError> {
        self.feed.subscribe(contract, QuoteKind::Tick).await?;
        self.feed.subscribe(contract, QuoteKind::BidAsk).await?;
        Ok(())
    }

    /// Contract handles for every currently subscribed code
    pub async fn subscribed_contracts(&self) -> Vec<Contract> {
        let state = self.state.lock().await;
        state
            .subscribed
            .iter()
            .filter_map(|code| state.cache.get(code).cloned())
            .collect()
    }

    /// Number of currently subscribed codes
    pub async fn subscribed_len(&self) -> usize {
        self.state.lock().await.subscribed.len()
    }

    /// Unsubscribe every contract and empty the set
    ///
    /// Per-code failures are logged and do not halt the iteration.
    pub async fn unsubscribe_all(&self) {
        let mut state = self.state.lock().await;
        if state.subscribed.is_empty() {
            return;
        }

        info!("Unsubscribing {} contracts", state.subscribed.len());

        let codes: Vec<String> = state.subscribed.iter().cloned().collect();
        for code in codes {
            if let Some(contract) = state.cache.get(&code).cloned() {
                if let Err(e) = self.feed.unsubscribe(&contract).await {
                    warn!("Failed to unsubscribe {}: {}", code, e);
                }
            }
            state.subscribed.remove(&code);
        }
    }
}
