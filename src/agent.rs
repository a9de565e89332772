//! Agent-side wallet with a spending policy.
//!
//! [`AgentWallet`] decides whether a 402 challenge is worth paying
//! ([`WalletPolicy`]), executes the payment through a [`PaymentExecutor`],
//! and tracks spend and paid challenges in a [`WalletStateStore`]. The
//! policy evaluates before any chain interaction; a challenge that fails
//! any check never reaches the executor.

use crate::errors::{Result, X402Error};
use crate::store::{MemoryWalletStore, WalletState, WalletStateStore};
use crate::types::{Currency, PaymentChallenge, ProofSubmission};
use crate::utils::{parse_address, parse_decimal_amount};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

/// Paid-challenge keys are pruned after this long; merchant-side nonce
/// consumption covers anything older.
const PAID_RETENTION_HOURS: i64 = 24;

/// Per-currency spending caps, as decimal strings in that currency's
/// natural precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendLimit {
    /// Maximum total spend per UTC day.
    pub daily_limit: String,
    /// Maximum spend in a single payment.
    pub max_per_transaction: String,
}

/// What an agent is willing to pay, to whom, and on which chain.
///
/// Every field denies by default: a currency with no limit entry is not
/// payable, and an empty trusted-facilitator set trusts no one.
#[derive(Debug, Clone)]
pub struct WalletPolicy {
    chain_id: u64,
    limits: HashMap<Currency, SpendLimit>,
    trusted_facilitators: HashSet<String>,
    allowed_merchants: Option<HashSet<String>>,
}

impl WalletPolicy {
    /// A policy for one chain that allows nothing yet.
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            limits: HashMap::new(),
            trusted_facilitators: HashSet::new(),
            allowed_merchants: None,
        }
    }

    /// Allows paying in `currency` under the given caps.
    pub fn allow_currency(
        mut self,
        currency: Currency,
        daily_limit: impl Into<String>,
        max_per_transaction: impl Into<String>,
    ) -> Self {
        self.limits.insert(
            currency,
            SpendLimit {
                daily_limit: daily_limit.into(),
                max_per_transaction: max_per_transaction.into(),
            },
        );
        self
    }

    /// Trusts a facilitator by origin (scheme, host, port).
    pub fn trust_facilitator(mut self, url: &str) -> Result<Self> {
        self.trusted_facilitators.insert(origin_of(url)?);
        Ok(self)
    }

    /// Restricts payments to the listed merchants. Without an allowlist
    /// any merchant passing the other checks is payable.
    pub fn allow_merchant(mut self, merchant_id: impl Into<String>) -> Self {
        self.allowed_merchants
            .get_or_insert_with(HashSet::new)
            .insert(merchant_id.into());
        self
    }
}

fn origin_of(raw: &str) -> Result<String> {
    let url = Url::parse(raw)?;
    Ok(url.origin().ascii_serialization())
}

/// Parses a 402 response into a challenge: headers first, body fallback.
///
/// Headers are the primary channel; the JSON body exists for clients that
/// cannot read custom response headers. A 402 carrying neither is
/// malformed.
pub fn parse_challenge(
    headers: &reqwest::header::HeaderMap,
    body: Option<&serde_json::Value>,
) -> Result<PaymentChallenge> {
    match PaymentChallenge::from_headers(headers) {
        Ok(challenge) => Ok(challenge),
        Err(_) => {
            let body = body.ok_or_else(|| {
                X402Error::InvalidChallenge(
                    "402 carried no challenge in headers or body".to_string(),
                )
            })?;
            PaymentChallenge::from_body(body).map_err(|e| {
                X402Error::InvalidChallenge(format!("malformed challenge body: {}", e))
            })
        }
    }
}

/// Broadcasts a payment for a challenge and returns the transaction hash.
#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    /// Sends the payment described by `challenge`.
    async fn execute(&self, challenge: &PaymentChallenge) -> Result<String>;
}

/// [`PaymentExecutor`] over an EVM chain via a local signing key.
pub struct EvmPaymentExecutor {
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    /// ERC-20 contract addresses for non-native currencies.
    tokens: HashMap<Currency, Address>,
}

impl EvmPaymentExecutor {
    /// Builds an executor from an RPC endpoint and a hex private key.
    pub fn new(rpc_url: &str, private_key: &str, chain_id: u64) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| X402Error::ConfigError(format!("Invalid RPC URL: {}", e)))?;
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| X402Error::ConfigError(format!("Invalid private key: {}", e)))?;
        Ok(Self {
            client: SignerMiddleware::new(provider, wallet.with_chain_id(chain_id)),
            tokens: HashMap::new(),
        })
    }

    /// Registers the token contract used to pay in `currency`.
    pub fn with_token(mut self, currency: Currency, token: Address) -> Self {
        self.tokens.insert(currency, token);
        self
    }
}

/// `transfer(address,uint256)` calldata.
fn erc20_transfer_calldata(to: Address, amount: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&[0xa9, 0x05, 0x9c, 0xbb]);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to.as_bytes());
    let mut value = [0u8; 32];
    amount.to_big_endian(&mut value);
    data.extend_from_slice(&value);
    data.into()
}

#[async_trait]
impl PaymentExecutor for EvmPaymentExecutor {
    async fn execute(&self, challenge: &PaymentChallenge) -> Result<String> {
        let pay_to = parse_address(&challenge.pay_to)?;
        let amount = U256::from(challenge.amount_base_units()?);

        let tx = if challenge.currency.is_native() {
            TransactionRequest::new().to(pay_to).value(amount)
        } else {
            let token = self.tokens.get(&challenge.currency).ok_or_else(|| {
                X402Error::UnsupportedCurrency(format!(
                    "no token contract registered for {}",
                    challenge.currency
                ))
            })?;
            TransactionRequest::new()
                .to(*token)
                .data(erc20_transfer_calldata(pay_to, amount))
        };

        let pending_tx = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| X402Error::ExecutionError(format!("Transaction failed: {}", e)))?;

        let receipt = pending_tx
            .await
            .map_err(|e| X402Error::ExecutionError(format!("Receipt error: {}", e)))?
            .ok_or_else(|| X402Error::ExecutionError("Transaction dropped".to_string()))?;

        Ok(format!("{:?}", receipt.transaction_hash))
    }
}

/// A paying agent: policy, executor, persistent state.
pub struct AgentWallet {
    policy: WalletPolicy,
    store: Arc<dyn WalletStateStore>,
    executor: Arc<dyn PaymentExecutor>,
    // Serializes the load-check-execute-save cycle in pay()
    pay_lock: Mutex<()>,
}

impl AgentWallet {
    /// Builds a wallet with in-memory state.
    pub fn new(policy: WalletPolicy, executor: Arc<dyn PaymentExecutor>) -> Self {
        Self::with_store(policy, Arc::new(MemoryWalletStore::new()), executor)
    }

    /// Builds a wallet over an external state store.
    pub fn with_store(
        policy: WalletPolicy,
        store: Arc<dyn WalletStateStore>,
        executor: Arc<dyn PaymentExecutor>,
    ) -> Self {
        Self {
            policy,
            store,
            executor,
            pay_lock: Mutex::new(()),
        }
    }

    /// Evaluates the policy against a challenge without paying.
    ///
    /// `requested_route` is the route the agent actually asked for, in
    /// `"METHOD /path"` form; a challenge naming any other route is a
    /// spoof attempt and is rejected first.
    pub async fn should_pay(
        &self,
        challenge: &PaymentChallenge,
        requested_route: &str,
    ) -> Result<()> {
        if challenge.route != requested_route {
            return Err(X402Error::PolicyRejected {
                code: "ROUTE_MISMATCH",
                reason: format!(
                    "challenge names route {:?} but {:?} was requested",
                    challenge.route, requested_route
                ),
            });
        }

        if !self.policy.limits.contains_key(&challenge.currency) {
            return Err(X402Error::PolicyRejected {
                code: "CURRENCY_NOT_ALLOWED",
                reason: format!("policy has no spending limit for {}", challenge.currency),
            });
        }

        if challenge.chain_id != self.policy.chain_id {
            return Err(X402Error::PolicyRejected {
                code: "WRONG_CHAIN",
                reason: format!(
                    "challenge is for chain {} but policy pays on {}",
                    challenge.chain_id, self.policy.chain_id
                ),
            });
        }

        let facilitator = challenge.facilitator_url.as_deref().ok_or_else(|| {
            X402Error::PolicyRejected {
                code: "UNTRUSTED_FACILITATOR",
                reason: "challenge names no facilitator".to_string(),
            }
        })?;
        let origin = origin_of(facilitator)?;
        if !self.policy.trusted_facilitators.contains(&origin) {
            return Err(X402Error::PolicyRejected {
                code: "UNTRUSTED_FACILITATOR",
                reason: format!("facilitator origin {} is not trusted", origin),
            });
        }

        if let Some(allowed) = &self.policy.allowed_merchants {
            if !allowed.contains(&challenge.merchant_id) {
                return Err(X402Error::PolicyRejected {
                    code: "MERCHANT_NOT_ALLOWED",
                    reason: format!("merchant {} is not on the allowlist", challenge.merchant_id),
                });
            }
        }

        let state = self.store.load().await?;
        self.check_budget(challenge, &state, Utc::now())?;

        debug!(
            merchant = %challenge.merchant_id,
            route = %challenge.route,
            "policy accepts challenge"
        );
        Ok(())
    }

    /// Checks the daily and per-transaction caps against a given wallet
    /// state. Exact integer arithmetic in base units; at the cap is
    /// allowed, one unit over is not.
    fn check_budget(
        &self,
        challenge: &PaymentChallenge,
        state: &WalletState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let limit = self.policy.limits.get(&challenge.currency).ok_or_else(|| {
            X402Error::PolicyRejected {
                code: "CURRENCY_NOT_ALLOWED",
                reason: format!("policy has no spending limit for {}", challenge.currency),
            }
        })?;
        let decimals = challenge.currency.decimals();
        let amount = challenge.amount_base_units()?;
        let daily = parse_decimal_amount(&limit.daily_limit, decimals)?;
        let per_tx = parse_decimal_amount(&limit.max_per_transaction, decimals)?;

        let spent = state.spent_for(challenge.currency, now);
        if spent.saturating_add(amount) > daily {
            return Err(X402Error::PolicyRejected {
                code: "DAILY_LIMIT",
                reason: format!(
                    "paying {} would exceed the daily limit of {} {}",
                    challenge.amount, limit.daily_limit, challenge.currency
                ),
            });
        }
        if amount > per_tx {
            return Err(X402Error::PolicyRejected {
                code: "PER_TX_LIMIT",
                reason: format!(
                    "{} exceeds the per-transaction limit of {} {}",
                    challenge.amount, limit.max_per_transaction, challenge.currency
                ),
            });
        }
        Ok(())
    }

    /// Pays a challenge and returns the proof to submit.
    ///
    /// A challenge key that was already paid is never paid twice, even if
    /// the resource was not delivered. State is persisted before the
    /// proof is returned, so a crash after the send never forgets a spend.
    pub async fn pay(
        &self,
        challenge: &PaymentChallenge,
        requested_route: &str,
    ) -> Result<ProofSubmission> {
        self.should_pay(challenge, requested_route).await?;

        let _guard = self.pay_lock.lock().await;
        let now = Utc::now();
        let key = challenge.payment_key();

        let mut state = self.store.load().await?;
        state.roll_over(now);
        if state.paid.contains_key(&key) {
            return Err(X402Error::AlreadyPaid(key));
        }
        // Concurrent pay calls pass should_pay against the same snapshot;
        // the caps must hold against the state this payment will commit to.
        self.check_budget(challenge, &state, now)?;

        let amount = challenge.amount_base_units()?;
        let proof = self.executor.execute(challenge).await?;

        let spent = state.spent_today.entry(challenge.currency).or_insert(0);
        *spent = spent.saturating_add(amount);
        state.paid.insert(key, now);
        state.prune_paid(now, Duration::hours(PAID_RETENTION_HOURS));
        self.store.save(&state).await?;

        info!(
            merchant = %challenge.merchant_id,
            amount = %challenge.amount,
            currency = %challenge.currency,
            tx = %proof,
            "payment executed"
        );

        Ok(ProofSubmission {
            proof,
            nonce: challenge.nonce.clone(),
            payer_hint: None,
        })
    }

    /// Base units spent today in `currency`.
    pub async fn spent_today(&self, currency: Currency) -> Result<u128> {
        let state = self.store.load().await?;
        Ok(state.spent_for(currency, Utc::now()))
    }
}
