//! Persistence traits and in-memory implementations.
//!
//! The facilitator's mutual exclusion lives here, behind two atomic
//! primitives: insert-or-fail (replay keys, ledger hashes) and increment
//! (revenue counters). The in-memory stores perform both under a single
//! write lock, which is what makes concurrent verify calls for the same
//! nonce race-safe. Nothing above this layer does read-then-write.
//!
//! The agent's wallet state ([`WalletState`]) also persists through this
//! module; its consistency is enforced by the wallet's pay cycle rather
//! than by the store.

use crate::errors::Result;
use crate::types::{Currency, Merchant, TransactionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// How long a consumed replay key is retained. A challenge expires long
/// before this, so eviction can never reopen a live nonce.
pub const REPLAY_KEY_TTL_HOURS: i64 = 24;

/// Storage for consumed replay keys.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Atomically claims a replay key.
    ///
    /// Returns `true` iff this call inserted the key. A second claim for
    /// the same key returns `false`, forever (within the TTL). This is the
    /// single correctness-critical mutual-exclusion point of the protocol.
    async fn claim(&self, key: &str) -> Result<bool>;

    /// Releases a claimed key.
    ///
    /// Only called when verification ends without consuming the nonce
    /// (`AWAITING_CONFIRMATIONS` or an infrastructure fault), so the
    /// caller's later retry is not misread as a replay. A verified nonce
    /// is never released.
    async fn release(&self, key: &str) -> Result<()>;
}

/// Per-merchant revenue and request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MerchantCounters {
    /// Successful verifications.
    pub requests: u64,
    /// Revenue in the asset's smallest unit.
    pub revenue_base_units: u128,
}

/// The transaction ledger: one immutable record per verified payment.
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Whether a transaction hash was ever consumed, under any merchant.
    async fn contains(&self, tx_hash: &str) -> Result<bool>;

    /// Inserts the record iff its `tx_hash` was never seen system-wide.
    ///
    /// Returns `true` iff this call inserted it; `false` means the hash
    /// already funded a grant and the caller must deny `TX_REUSED`.
    async fn record(&self, record: TransactionRecord) -> Result<bool>;

    /// Atomically bumps the merchant's request count and revenue.
    async fn add_revenue(&self, merchant_id: &str, amount_base_units: u128) -> Result<()>;

    /// Reads the merchant's counters.
    async fn counters(&self, merchant_id: &str) -> Result<MerchantCounters>;
}

/// The facilitator's authoritative merchant directory.
#[async_trait]
pub trait MerchantDirectory: Send + Sync {
    /// Loads a merchant by id.
    async fn merchant(&self, id: &str) -> Result<Option<Merchant>>;
}

/// In-memory store implementing all three facilitator-side traits.
///
/// Intended for tests and single-process deployments; production swaps in
/// a database-backed implementation with the same atomicity contract.
pub struct MemoryStore {
    replay_keys: RwLock<HashMap<String, DateTime<Utc>>>,
    ledger: RwLock<HashMap<String, TransactionRecord>>,
    counters: RwLock<HashMap<String, MerchantCounters>>,
    merchants: RwLock<HashMap<String, Merchant>>,
    replay_ttl: Duration,
}

impl MemoryStore {
    /// Creates an empty store with the default 24h replay-key TTL.
    pub fn new() -> Self {
        Self::with_replay_ttl(Duration::hours(REPLAY_KEY_TTL_HOURS))
    }

    /// Creates an empty store with a custom replay-key TTL.
    pub fn with_replay_ttl(replay_ttl: Duration) -> Self {
        Self {
            replay_keys: RwLock::new(HashMap::new()),
            ledger: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            merchants: RwLock::new(HashMap::new()),
            replay_ttl,
        }
    }

    /// Registers or replaces a merchant in the directory.
    pub async fn upsert_merchant(&self, merchant: Merchant) {
        self.merchants
            .write()
            .await
            .insert(merchant.id.clone(), merchant);
    }

    /// Number of ledger records, for tests and diagnostics.
    pub async fn ledger_len(&self) -> usize {
        self.ledger.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplayStore for MemoryStore {
    async fn claim(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        let mut keys = self.replay_keys.write().await;
        keys.retain(|_, claimed_at| now - *claimed_at < self.replay_ttl);
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), now);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.replay_keys.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl TransactionLedger for MemoryStore {
    async fn contains(&self, tx_hash: &str) -> Result<bool> {
        Ok(self.ledger.read().await.contains_key(tx_hash))
    }

    async fn record(&self, record: TransactionRecord) -> Result<bool> {
        let mut ledger = self.ledger.write().await;
        if ledger.contains_key(&record.tx_hash) {
            return Ok(false);
        }
        ledger.insert(record.tx_hash.clone(), record);
        Ok(true)
    }

    async fn add_revenue(&self, merchant_id: &str, amount_base_units: u128) -> Result<()> {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(merchant_id.to_string()).or_default();
        entry.requests += 1;
        entry.revenue_base_units = entry.revenue_base_units.saturating_add(amount_base_units);
        Ok(())
    }

    async fn counters(&self, merchant_id: &str) -> Result<MerchantCounters> {
        Ok(self
            .counters
            .read()
            .await
            .get(merchant_id)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl MerchantDirectory for MemoryStore {
    async fn merchant(&self, id: &str) -> Result<Option<Merchant>> {
        Ok(self.merchants.read().await.get(id).cloned())
    }
}

/// Persistent spend and replay state for one agent wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletState {
    /// Base units spent per currency since the last UTC day boundary.
    pub spent_today: HashMap<Currency, u128>,
    /// The UTC date `spent_today` belongs to.
    pub last_reset: NaiveDate,
    /// Paid challenge keys (`merchantId:route:nonce`) and when they were
    /// paid. Terminal: a key in here is never paid again.
    pub paid: HashMap<String, DateTime<Utc>>,
}

impl WalletState {
    /// Fresh state with today's budget at zero.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            spent_today: HashMap::new(),
            last_reset: now.date_naive(),
            paid: HashMap::new(),
        }
    }

    /// Spend counted against today's budget. Stale state from a previous
    /// day counts as zero without needing a mutation.
    pub fn spent_for(&self, currency: Currency, now: DateTime<Utc>) -> u128 {
        if self.last_reset == now.date_naive() {
            self.spent_today.get(&currency).copied().unwrap_or(0)
        } else {
            0
        }
    }

    /// Resets the budget at the UTC day boundary.
    pub fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.last_reset != today {
            self.spent_today.clear();
            self.last_reset = today;
        }
    }

    /// Drops paid keys older than the retention window; merchant-side
    /// nonce consumption covers anything older.
    pub fn prune_paid(&mut self, now: DateTime<Utc>, retention: Duration) {
        let cutoff = now - retention;
        self.paid.retain(|_, paid_at| *paid_at > cutoff);
    }
}

/// Persistence for [`WalletState`].
#[async_trait]
pub trait WalletStateStore: Send + Sync {
    /// Loads the current state.
    async fn load(&self) -> Result<WalletState>;
    /// Persists the state. Must complete before any proof derived from
    /// the state is released.
    async fn save(&self, state: &WalletState) -> Result<()>;
}

/// In-process [`WalletStateStore`].
pub struct MemoryWalletStore {
    state: RwLock<WalletState>,
}

impl MemoryWalletStore {
    /// An empty store starting today's budget at zero.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(WalletState::new(Utc::now())),
        }
    }
}

impl Default for MemoryWalletStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletStateStore for MemoryWalletStore {
    async fn load(&self) -> Result<WalletState> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &WalletState) -> Result<()> {
        *self.state.write().await = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_record(tx_hash: &str, merchant_id: &str) -> TransactionRecord {
        TransactionRecord {
            tx_hash: tx_hash.to_string(),
            merchant_id: merchant_id.to_string(),
            payer: "0xpayer".to_string(),
            amount: "1.0".to_string(),
            currency: Currency::Usdc,
            path: "/premium".to_string(),
            method: "GET".to_string(),
            verified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_replay_key_single_claim() {
        let store = MemoryStore::new();
        assert!(store.claim("key1").await.unwrap());
        assert!(!store.claim("key1").await.unwrap());
        assert!(store.claim("key2").await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_key_concurrent_claims_admit_one() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(
                async move { store.claim("shared").await.unwrap() },
            ));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_replay_key_release_reopens() {
        let store = MemoryStore::new();
        assert!(store.claim("key1").await.unwrap());
        store.release("key1").await.unwrap();
        assert!(store.claim("key1").await.unwrap());
        assert!(!store.claim("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_key_ttl_eviction() {
        let store = MemoryStore::with_replay_ttl(Duration::zero());
        assert!(store.claim("key1").await.unwrap());
        // TTL of zero: the key is already expired on the next claim
        assert!(store.claim("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ledger_global_uniqueness() {
        let store = MemoryStore::new();
        assert!(store.record(sample_record("0xaaa", "mer_1")).await.unwrap());
        // Same hash, different merchant: still rejected
        assert!(!store.record(sample_record("0xaaa", "mer_2")).await.unwrap());
        assert!(store.contains("0xaaa").await.unwrap());
        assert!(!store.contains("0xbbb").await.unwrap());
        assert_eq!(store.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.add_revenue("mer_1", 1_000_000).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let counters = store.counters("mer_1").await.unwrap();
        assert_eq!(counters.requests, 8);
        assert_eq!(counters.revenue_base_units, 8_000_000);

        let other = store.counters("mer_2").await.unwrap();
        assert_eq!(other, MerchantCounters::default());
    }

    #[test]
    fn test_wallet_day_rollover_resets_budget() {
        let mut state = WalletState::new(Utc::now());
        state.spent_today.insert(Currency::Usdc, 4_000_000);
        state.last_reset = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        // Stale state counts as zero even before any mutation
        assert_eq!(state.spent_for(Currency::Usdc, Utc::now()), 0);

        state.roll_over(Utc::now());
        assert!(state.spent_today.is_empty());
        assert_eq!(state.last_reset, Utc::now().date_naive());
    }

    #[test]
    fn test_wallet_paid_keys_pruned_after_retention() {
        let now = Utc::now();
        let mut state = WalletState::new(now);
        state
            .paid
            .insert("old".to_string(), now - Duration::hours(25));
        state
            .paid
            .insert("recent".to_string(), now - Duration::hours(1));

        state.prune_paid(now, Duration::hours(24));
        assert!(!state.paid.contains_key("old"));
        assert!(state.paid.contains_key("recent"));
    }

    #[tokio::test]
    async fn test_wallet_store_round_trip() {
        let store = MemoryWalletStore::new();
        let mut state = store.load().await.unwrap();
        state.spent_today.insert(Currency::Eth, 42);
        store.save(&state).await.unwrap();
        assert_eq!(
            store.load().await.unwrap().spent_today.get(&Currency::Eth),
            Some(&42)
        );
    }
}
