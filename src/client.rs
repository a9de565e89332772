//! Request orchestration: fetch, pay on 402, retry once.
//!
//! [`X402Client`] drives the full protocol cycle against a paid resource:
//! the initial request, challenge parsing (headers first, body as
//! fallback), the policy-gated payment through an [`AgentWallet`], and
//! exactly one retried request carrying the proof. A second 402 with a
//! fresh challenge after a completed payment is a protocol violation and
//! surfaces as [`X402Error::Recursive402`] rather than another payment.

use crate::agent::{self, AgentWallet};
use crate::errors::{DenialCode, Result, X402Error};
use crate::types::{PaymentChallenge, ProofSubmission};
use crate::utils::canonical_route;
use chrono::Utc;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Client that transparently pays 402 challenges.
pub struct X402Client {
    http_client: Client,
    wallet: Arc<AgentWallet>,
    /// How many times to re-submit a proof still awaiting confirmations.
    confirmation_attempts: u32,
    confirmation_interval: Duration,
}

impl X402Client {
    /// Creates a client around a wallet, with a default HTTP client.
    pub fn new(wallet: Arc<AgentWallet>) -> Self {
        Self {
            http_client: Client::new(),
            wallet,
            confirmation_attempts: 5,
            confirmation_interval: Duration::from_secs(2),
        }
    }

    /// Uses a caller-provided HTTP client (proxies, timeouts, TLS config).
    pub fn with_http_client(mut self, http_client: Client) -> Self {
        self.http_client = http_client;
        self
    }

    /// Tunes polling for proofs answered with `AWAITING_CONFIRMATIONS`.
    pub fn with_confirmation_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.confirmation_attempts = attempts;
        self.confirmation_interval = interval;
        self
    }

    /// Makes a request, paying at most one 402 challenge along the way.
    ///
    /// Returns the final response for anything that is not a payment
    /// protocol failure; terminal denials and policy rejections are
    /// errors.
    pub async fn request_with_payment(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<Response> {
        let parsed_url = Url::parse(url)?;
        let requested_route = canonical_route(method.as_str(), parsed_url.path());

        let response = self.send(method.clone(), url, &body, None).await?;
        if response.status() != StatusCode::PAYMENT_REQUIRED {
            return Ok(response);
        }

        let mut challenge = parse_challenge(response).await?;
        if challenge.is_expired(Utc::now()) {
            // A stale challenge is refetched once; paying it would burn
            // funds on a nonce the merchant no longer accepts.
            debug!(route = %requested_route, "challenge expired, refetching");
            let refreshed = self.send(method.clone(), url, &body, None).await?;
            if refreshed.status() != StatusCode::PAYMENT_REQUIRED {
                return Ok(refreshed);
            }
            challenge = parse_challenge(refreshed).await?;
            if challenge.is_expired(Utc::now()) {
                return Err(X402Error::InvalidChallenge(
                    "challenge expired immediately after refetch".to_string(),
                ));
            }
        }

        info!(
            merchant = %challenge.merchant_id,
            amount = %challenge.amount,
            currency = %challenge.currency,
            "payment required"
        );
        let proof = self.wallet.pay(&challenge, &requested_route).await?;

        // Exactly one paid retry; AWAITING_CONFIRMATIONS re-submits the
        // same proof, it never pays again.
        let mut attempts_left = self.confirmation_attempts;
        loop {
            let response = self
                .send(method.clone(), url, &body, Some((&proof, &challenge)))
                .await?;
            if response.status() != StatusCode::PAYMENT_REQUIRED {
                return Ok(response);
            }

            let body_json: Value = response.json().await.unwrap_or_default();
            match classify_paid_402(&body_json) {
                Paid402::AwaitingConfirmations if attempts_left > 0 => {
                    attempts_left -= 1;
                    warn!(
                        attempts_left,
                        "payment not final yet, re-submitting proof"
                    );
                    tokio::time::sleep(self.confirmation_interval).await;
                }
                Paid402::AwaitingConfirmations => {
                    return Err(X402Error::PaymentDenied {
                        code: DenialCode::AwaitingConfirmations,
                        message: "payment did not finalize within the polling budget"
                            .to_string(),
                    });
                }
                Paid402::Denied { code, message } => {
                    return Err(X402Error::PaymentDenied { code, message });
                }
                Paid402::FreshChallenge => return Err(X402Error::Recursive402),
            }
        }
    }

    /// Convenience GET.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request_with_payment(Method::GET, url, None).await
    }

    /// Convenience POST with a JSON body.
    pub async fn post(&self, url: &str, body: Value) -> Result<Response> {
        self.request_with_payment(Method::POST, url, Some(body)).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: &Option<Value>,
        payment: Option<(&ProofSubmission, &PaymentChallenge)>,
    ) -> Result<Response> {
        let mut request = self.http_client.request(method, url);
        if let Some(json) = body {
            request = request.json(json);
        }
        if let Some((proof, challenge)) = payment {
            for (name, value) in proof.to_headers(&challenge.merchant_id) {
                request = request.header(name, value);
            }
        }
        Ok(request.send().await?)
    }
}

/// What a 402 after payment means.
enum Paid402 {
    /// The proof is being confirmed; same proof, try again later.
    AwaitingConfirmations,
    /// Terminal denial from the merchant or facilitator.
    Denied {
        code: DenialCode,
        message: String,
    },
    /// A brand-new challenge: the resource is demanding a second payment.
    FreshChallenge,
}

fn classify_paid_402(body: &Value) -> Paid402 {
    if body.get("paymentRequest").is_some() {
        return Paid402::FreshChallenge;
    }
    if let Some(code) = body
        .get("error")
        .and_then(|v| serde_json::from_value::<DenialCode>(v.clone()).ok())
    {
        if code == DenialCode::AwaitingConfirmations {
            return Paid402::AwaitingConfirmations;
        }
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("payment denied")
            .to_string();
        return Paid402::Denied { code, message };
    }
    // An unstructured 402 after payment still means "pay again"
    Paid402::FreshChallenge
}

/// Drains a 402 response and parses its challenge.
async fn parse_challenge(response: Response) -> Result<PaymentChallenge> {
    let headers = response.headers().clone();
    let body: Option<Value> = response.json().await.ok();
    agent::parse_challenge(&headers, body.as_ref())
}
