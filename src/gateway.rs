//! Merchant middleware for the x402 protocol.
//!
//! [`PaymentGate`] gates one or more routes behind payment: it looks up the
//! route's price (cached, with bounded retry), issues 402 challenges with a
//! fresh nonce, forwards submitted proofs to the facilitator, and attaches
//! a verified receipt on grant. It is framework-agnostic: the embedding
//! server extracts a [`ProofSubmission`] from request headers, calls
//! [`PaymentGate::gate`], and maps the returned [`GateOutcome`] onto its
//! response type.

use crate::errors::{DenialCode, Result, X402Error};
use crate::types::{
    PaymentChallenge, PaymentReceipt, PriceCheckRequest, PriceQuote, ProofSubmission,
    VerifyRequest, VerifyResponse, HDR_MERCHANT_ID, HDR_NONCE,
};
use crate::utils::{canonical_path, generate_nonce};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Operator-chosen behavior when verification infrastructure is unreachable.
///
/// Applies only to infrastructure faults; protocol denials are never
/// subject to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Deny access on infrastructure faults (502). The default.
    #[default]
    Closed,
    /// Log loudly and admit the request without a receipt.
    Open,
}

/// Bounded retry with exponential backoff for idempotent call sites.
///
/// Applied at exactly two places: price lookup and the verify call. Retries
/// only transport-level failures; protocol denials pass through untouched.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 1 initial attempt + 2 retries
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Runs `op`, retrying transient failures with exponential backoff.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.max_attempts && is_transient(&e) => {
                    warn!(attempt, "transient failure, backing off: {}", e);
                    tokio::time::sleep(self.backoff_base * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transport-level failures are retried; everything else is final.
fn is_transient(err: &X402Error) -> bool {
    matches!(
        err,
        X402Error::HttpError(_)
            | X402Error::GatewayError(_)
            | X402Error::BlockchainError(_)
            | X402Error::StorageError(_)
    )
}

/// The merchant's pricing source.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Prices a route, or fails with a protocol denial (e.g. a disabled
    /// route) carried as [`X402Error::PaymentDenied`].
    async fn quote(&self, request: &PriceCheckRequest) -> Result<PriceQuote>;
}

/// [`PriceSource`] over the merchant's `POST /price-check` endpoint.
pub struct HttpPriceSource {
    url: String,
    client: reqwest::Client,
}

impl HttpPriceSource {
    /// Points at a `POST /price-check` endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: default_client(),
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn quote(&self, request: &PriceCheckRequest) -> Result<PriceQuote> {
        let response = self.client.post(&self.url).json(request).send().await?;
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if let Some(code) = body
            .get("error")
            .and_then(|v| serde_json::from_value::<DenialCode>(v.clone()).ok())
        {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("price check denied")
                .to_string();
            return Err(X402Error::PaymentDenied { code, message });
        }
        Err(X402Error::GatewayError(format!(
            "price check failed with status {}",
            status
        )))
    }
}

/// Client for the facilitator's `/verify` endpoint.
#[async_trait]
pub trait FacilitatorClient: Send + Sync {
    /// Submits a verification request.
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse>;
}

/// [`FacilitatorClient`] over HTTP.
pub struct HttpFacilitatorClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFacilitatorClient {
    /// Points at a facilitator's base URL (`{base}/verify` is called).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: default_client(),
        }
    }
}

#[async_trait]
impl FacilitatorClient for HttpFacilitatorClient {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse> {
        let url = format!("{}/verify", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header(HDR_NONCE, &request.nonce)
            .header(HDR_MERCHANT_ID, &request.merchant_id)
            .json(request)
            .send()
            .await?;
        // 402s carry a structured VerifyResponse body too
        if response.status().is_server_error() {
            return Err(X402Error::GatewayError(format!(
                "facilitator answered {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

fn default_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .unwrap_or_default()
}

/// Price cache keyed by `(merchant, method, canonical path)` with a TTL.
///
/// Never correctness-critical: the facilitator re-verifies the amount
/// against the merchant's authoritative route table.
pub struct PriceCache {
    entries: RwLock<HashMap<(String, String, String), (PriceQuote, Instant)>>,
    ttl: Duration,
}

impl PriceCache {
    /// Creates an empty cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    async fn get(&self, key: &(String, String, String)) -> Option<PriceQuote> {
        let entries = self.entries.read().await;
        let (quote, cached_at) = entries.get(key)?;
        if cached_at.elapsed() < self.ttl {
            Some(quote.clone())
        } else {
            None
        }
    }

    async fn put(&self, key: (String, String, String), quote: PriceQuote) {
        self.entries
            .write()
            .await
            .insert(key, (quote, Instant::now()));
    }
}

/// Outcome of gating one request.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// No valid proof; respond 402 with this challenge in headers and body.
    Challenge(PaymentChallenge),
    /// Payment verified; attach the receipt and serve the resource.
    Granted(PaymentReceipt),
    /// Infrastructure fault admitted under [`FailureMode::Open`]; there is
    /// no receipt and the admission has already been logged loudly.
    GrantedUnverified,
    /// Protocol denial; respond with the code's HTTP status.
    Denied {
        /// Machine-readable denial code.
        code: DenialCode,
        /// Human-readable message.
        message: String,
    },
}

/// Payment middleware for one merchant.
#[derive(Clone)]
pub struct PaymentGate {
    merchant_id: String,
    facilitator_url: String,
    chain_id: u64,
    network: Option<String>,
    challenge_ttl: chrono::Duration,
    fail_mode: FailureMode,
    retry: RetryPolicy,
    price_source: Arc<dyn PriceSource>,
    facilitator: Arc<dyn FacilitatorClient>,
    cache: Arc<PriceCache>,
}

impl std::fmt::Debug for PaymentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGate")
            .field("merchant_id", &self.merchant_id)
            .field("facilitator_url", &self.facilitator_url)
            .field("chain_id", &self.chain_id)
            .field("network", &self.network)
            .field("challenge_ttl", &self.challenge_ttl)
            .field("fail_mode", &self.fail_mode)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PaymentGate {
    /// Creates a gate for one merchant.
    ///
    /// Missing identifiers fail here, at construction, never per-request:
    /// a misconfigured gate refuses to start serving.
    pub fn new(
        merchant_id: impl Into<String>,
        facilitator_url: impl Into<String>,
        chain_id: u64,
        price_source: Arc<dyn PriceSource>,
        facilitator: Arc<dyn FacilitatorClient>,
    ) -> Result<Self> {
        let merchant_id = merchant_id.into();
        let facilitator_url = facilitator_url.into();
        if merchant_id.is_empty() {
            return Err(X402Error::ConfigError(
                "merchant id must not be empty".to_string(),
            ));
        }
        if facilitator_url.is_empty() {
            return Err(X402Error::ConfigError(
                "facilitator URL must not be empty".to_string(),
            ));
        }
        url::Url::parse(&facilitator_url)?;

        Ok(Self {
            merchant_id,
            facilitator_url,
            chain_id,
            network: None,
            challenge_ttl: chrono::Duration::seconds(300),
            fail_mode: FailureMode::default(),
            retry: RetryPolicy::default(),
            price_source,
            facilitator,
            cache: Arc::new(PriceCache::new(Duration::from_secs(30))),
        })
    }

    /// Sets the failure mode (default: closed).
    pub fn with_fail_mode(mut self, mode: FailureMode) -> Self {
        self.fail_mode = mode;
        self
    }

    /// Sets the retry policy for the two idempotent call sites.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the price cache TTL (default 30s).
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Arc::new(PriceCache::new(ttl));
        self
    }

    /// Sets the human network name advertised in challenges.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Sets the challenge validity window (default 300s).
    pub fn with_challenge_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    /// The exact `Access-Control-Expose-Headers` value for 402 responses,
    /// so browser-based agents can read the challenge headers.
    pub fn cors_expose_headers(&self) -> String {
        PaymentChallenge::expose_headers()
    }

    /// Gates one request.
    ///
    /// `proof` is the submission extracted from the request headers, if
    /// any. Errors are infrastructure faults that survived the configured
    /// [`FailureMode`]; map them to 502.
    pub async fn gate(
        &self,
        method: &str,
        path: &str,
        proof: Option<ProofSubmission>,
    ) -> Result<GateOutcome> {
        let method = method.to_uppercase();
        let path = canonical_path(path);

        let quote = match self.price_for(&method, &path).await {
            Ok(quote) => quote,
            Err(X402Error::PaymentDenied { code, message }) => {
                // Protocol denial from the pricing source: no challenge is
                // ever minted for e.g. a disabled route.
                return Ok(GateOutcome::Denied { code, message });
            }
            Err(e) => return self.apply_fail_mode("price lookup", e),
        };

        match proof {
            None => Ok(GateOutcome::Challenge(self.mint_challenge(
                &method, &path, &quote,
            ))),
            Some(submission) => self.verify_submission(&method, &path, &quote, submission).await,
        }
    }

    /// Price lookup through the cache, with bounded retry on miss.
    async fn price_for(&self, method: &str, path: &str) -> Result<PriceQuote> {
        let key = (
            self.merchant_id.clone(),
            method.to_string(),
            path.to_string(),
        );
        if let Some(quote) = self.cache.get(&key).await {
            return Ok(quote);
        }

        let request = PriceCheckRequest {
            merchant_id: self.merchant_id.clone(),
            method: method.to_string(),
            path: path.to_string(),
        };
        let quote = self
            .retry
            .run(|| self.price_source.quote(&request))
            .await?;
        self.cache.put(key, quote.clone()).await;
        Ok(quote)
    }

    /// Mints a 402 challenge with a fresh, single-use nonce.
    fn mint_challenge(&self, method: &str, path: &str, quote: &PriceQuote) -> PaymentChallenge {
        PaymentChallenge {
            amount: quote.price.clone(),
            currency: quote.currency,
            pay_to: quote.pay_to.clone(),
            merchant_id: self.merchant_id.clone(),
            facilitator_url: Some(self.facilitator_url.clone()),
            network: quote.network.clone().or_else(|| self.network.clone()),
            chain_id: self.chain_id,
            route: format!("{} {}", method, path),
            nonce: generate_nonce(),
            expires_at: Some(Utc::now() + self.challenge_ttl),
            description: quote.description.clone(),
        }
    }

    /// Forwards a proof to the facilitator and maps its verdict.
    async fn verify_submission(
        &self,
        method: &str,
        path: &str,
        quote: &PriceQuote,
        submission: ProofSubmission,
    ) -> Result<GateOutcome> {
        let request = VerifyRequest {
            payment_proof: submission.proof.clone(),
            nonce: submission.nonce.clone(),
            merchant_id: self.merchant_id.clone(),
            expected_amount: quote.price.clone(),
            currency: quote.currency,
            path: path.to_string(),
            method: method.to_string(),
        };

        let response = match self.retry.run(|| self.facilitator.verify(&request)).await {
            Ok(response) => response,
            Err(e) => return self.apply_fail_mode("verify call", e),
        };

        if response.verified {
            // The payer comes exclusively from the facilitator's chain
            // data; the advisory x-payment-payer header is never consulted.
            let receipt = PaymentReceipt {
                tx_hash: response.tx_hash.unwrap_or_else(|| submission.proof.clone()),
                payer: response.payer.unwrap_or_default(),
                amount: quote.price.clone(),
                currency: quote.currency,
            };
            info!(merchant = %self.merchant_id, tx = %receipt.tx_hash, "payment granted");
            return Ok(GateOutcome::Granted(receipt));
        }

        let code = response
            .error
            .unwrap_or(DenialCode::PaymentVerificationFailed);
        if code == DenialCode::FacilitatorFault {
            return self.apply_fail_mode(
                "facilitator fault",
                X402Error::GatewayError(
                    response
                        .message
                        .unwrap_or_else(|| "facilitator fault".to_string()),
                ),
            );
        }

        warn!(merchant = %self.merchant_id, %code, "payment denied");
        Ok(GateOutcome::Denied {
            code,
            message: response
                .message
                .unwrap_or_else(|| "payment verification failed".to_string()),
        })
    }

    /// The single place [`FailureMode`] is evaluated.
    fn apply_fail_mode(&self, context: &str, err: X402Error) -> Result<GateOutcome> {
        match self.fail_mode {
            FailureMode::Closed => Err(X402Error::GatewayError(format!("{}: {}", context, err))),
            FailureMode::Open => {
                error!(
                    merchant = %self.merchant_id,
                    "FAIL-OPEN: admitting request despite {} failure: {}",
                    context, err
                );
                Ok(GateOutcome::GrantedUnverified)
            }
        }
    }
}
