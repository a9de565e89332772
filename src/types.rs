//! Wire and domain types for the x402 protocol.
//!
//! This module contains the data structures exchanged between the merchant
//! middleware, the agent, and the facilitator: the payment challenge and its
//! dual header/body codec, the verify request/response pair, price quotes,
//! merchant route records, and the facilitator's transaction ledger record.

use crate::errors::{DenialCode, Result, X402Error};
use crate::utils::{canonical_route, parse_decimal_amount, parse_proof};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version advertised in quotes and challenges.
pub const X402_VERSION: u32 = 1;

/// Challenge response header: marker that payment is required.
pub const HDR_PAYMENT_REQUIRED: &str = "X-Payment-Required";
/// Challenge response header: decimal amount in asset-native precision.
pub const HDR_PAYMENT_AMOUNT: &str = "X-Payment-Amount";
/// Challenge response header: currency wire string ("ETH" / "USDC").
pub const HDR_PAYMENT_CURRENCY: &str = "X-Payment-Currency";
/// Challenge response header: human network name (e.g. "base-sepolia").
pub const HDR_PAYMENT_NETWORK: &str = "X-Payment-Network";
/// Challenge response header: payee address.
pub const HDR_PAYMENT_PAY_TO: &str = "X-Payment-PayTo";
/// Challenge response header: merchant identifier.
pub const HDR_MERCHANT_ID: &str = "X-Merchant-ID";
/// Challenge response header: facilitator base URL.
pub const HDR_FACILITATOR_URL: &str = "X-Facilitator-URL";
/// Challenge response header: human-readable description.
pub const HDR_PAYMENT_DESCRIPTION: &str = "X-Payment-Description";
/// Challenge response header: server-minted single-use nonce.
pub const HDR_NONCE: &str = "X-Nonce";
/// Challenge response header: numeric chain id.
pub const HDR_CHAIN_ID: &str = "X-Chain-ID";
/// Challenge response header: canonical `METHOD path` route.
pub const HDR_ROUTE: &str = "X-Route";
/// Challenge response header: challenge expiry (RFC 3339).
pub const HDR_PAYMENT_EXPIRES: &str = "X-Payment-Expires";

/// Retry request header: payment proof (transaction hash).
pub const HDR_PAYMENT_PROOF: &str = "x-payment-proof";
/// Retry request header: advisory payer address (never trusted).
pub const HDR_PAYMENT_PAYER: &str = "x-payment-payer";

/// HTTP verbs accepted by the verify endpoint's schema validation.
pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Assets the protocol understands.
///
/// `Eth` is the chain's native gas asset (matched against the transaction's
/// own `to`/`value`); `Usdc` is the stable token (matched against ERC-20
/// Transfer logs on the merchant's configured contract).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    /// Native gas asset, 18 decimals.
    #[serde(rename = "ETH")]
    Eth,
    /// Stable asset (ERC-20), 6 decimals.
    #[serde(rename = "USDC")]
    Usdc,
}

impl Currency {
    /// Smallest-unit decimals for this asset.
    pub fn decimals(&self) -> u8 {
        match self {
            Currency::Eth => 18,
            Currency::Usdc => 6,
        }
    }

    /// Whether payment matching uses the transaction's own value transfer.
    pub fn is_native(&self) -> bool {
        matches!(self, Currency::Eth)
    }

    /// Wire string for headers and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Eth => "ETH",
            Currency::Usdc => "USDC",
        }
    }
}

impl std::str::FromStr for Currency {
    type Err = X402Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ETH" => Ok(Currency::Eth),
            "USDC" => Ok(Currency::Usdc),
            other => Err(X402Error::UnsupportedCurrency(other.to_string())),
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment challenge issued by the merchant middleware on 402.
///
/// Travels both as response headers and as a structured JSON body, so agents
/// behind header-stripping infrastructure can still read it. The nonce is
/// minted fresh per unpaid request and is the sole replay-protection anchor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    /// Decimal amount in asset-native precision (e.g. "1.0").
    pub amount: String,
    /// Asset the payment must be made in.
    pub currency: Currency,
    /// Payee address.
    pub pay_to: String,
    /// Merchant identifier.
    pub merchant_id: String,
    /// Facilitator the merchant will verify through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facilitator_url: Option<String>,
    /// Human network name, informational only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Chain id the payment must land on.
    pub chain_id: u64,
    /// Canonical `METHOD path` route this challenge is bound to.
    pub route: String,
    /// Server-minted, unguessable, single-use nonce.
    pub nonce: String,
    /// Challenge expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// What the payment buys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentChallenge {
    /// Names of every challenge header, for CORS `Access-Control-Expose-Headers`.
    pub fn header_names() -> &'static [&'static str] {
        &[
            HDR_PAYMENT_REQUIRED,
            HDR_PAYMENT_AMOUNT,
            HDR_PAYMENT_CURRENCY,
            HDR_PAYMENT_NETWORK,
            HDR_PAYMENT_PAY_TO,
            HDR_MERCHANT_ID,
            HDR_FACILITATOR_URL,
            HDR_PAYMENT_DESCRIPTION,
            HDR_NONCE,
            HDR_CHAIN_ID,
            HDR_ROUTE,
            HDR_PAYMENT_EXPIRES,
        ]
    }

    /// Comma-joined header list, the exact `Access-Control-Expose-Headers` value.
    pub fn expose_headers() -> String {
        Self::header_names().join(", ")
    }

    /// Encodes the challenge as response header pairs.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HDR_PAYMENT_REQUIRED, "true".to_string()),
            (HDR_PAYMENT_AMOUNT, self.amount.clone()),
            (HDR_PAYMENT_CURRENCY, self.currency.as_str().to_string()),
            (HDR_PAYMENT_PAY_TO, self.pay_to.clone()),
            (HDR_MERCHANT_ID, self.merchant_id.clone()),
            (HDR_CHAIN_ID, self.chain_id.to_string()),
            (HDR_ROUTE, self.route.clone()),
            (HDR_NONCE, self.nonce.clone()),
        ];
        if let Some(network) = &self.network {
            headers.push((HDR_PAYMENT_NETWORK, network.clone()));
        }
        if let Some(url) = &self.facilitator_url {
            headers.push((HDR_FACILITATOR_URL, url.clone()));
        }
        if let Some(desc) = &self.description {
            headers.push((HDR_PAYMENT_DESCRIPTION, desc.clone()));
        }
        if let Some(exp) = &self.expires_at {
            headers.push((HDR_PAYMENT_EXPIRES, exp.to_rfc3339()));
        }
        headers
    }

    /// Parses a challenge from response headers via a lookup closure.
    ///
    /// Fails loudly on any missing required field; there are no silent
    /// defaults for amount, currency, payee, merchant, chain, route or nonce.
    pub fn from_header_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String> {
            lookup(name).ok_or_else(|| X402Error::MissingField(name.to_string()))
        };

        let currency: Currency = required(HDR_PAYMENT_CURRENCY)?.parse()?;
        let chain_id: u64 = required(HDR_CHAIN_ID)?
            .parse()
            .map_err(|_| X402Error::InvalidChallenge("chain id is not numeric".to_string()))?;
        let expires_at = match lookup(HDR_PAYMENT_EXPIRES) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| X402Error::InvalidChallenge(format!("bad expiry: {}", e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(Self {
            amount: required(HDR_PAYMENT_AMOUNT)?,
            currency,
            pay_to: required(HDR_PAYMENT_PAY_TO)?,
            merchant_id: required(HDR_MERCHANT_ID)?,
            facilitator_url: lookup(HDR_FACILITATOR_URL),
            network: lookup(HDR_PAYMENT_NETWORK),
            chain_id,
            route: required(HDR_ROUTE)?,
            nonce: required(HDR_NONCE)?,
            expires_at,
            description: lookup(HDR_PAYMENT_DESCRIPTION),
        })
    }

    /// Parses a challenge from a reqwest response header map.
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Result<Self> {
        Self::from_header_lookup(|name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
    }

    /// Encodes the challenge as the structured 402 body.
    pub fn to_body(&self) -> Value {
        json!({
            "error": DenialCode::PaymentRequired,
            "message": format!(
                "Payment of {} {} required for {}",
                self.amount, self.currency, self.route
            ),
            "paymentRequest": self,
        })
    }

    /// Parses a challenge from the 402 body fallback transport.
    ///
    /// The nonce authority is solely the issuer: a body without a nonce is a
    /// hard error, never something the agent may derive client-side.
    pub fn from_body(body: &Value) -> Result<Self> {
        let request = body
            .get("paymentRequest")
            .ok_or_else(|| X402Error::MissingField("paymentRequest".to_string()))?;

        // Surface the first missing field by name rather than a generic
        // serde error, matching the header-side parser.
        for field in [
            "amount",
            "currency",
            "payTo",
            "merchantId",
            "chainId",
            "route",
            "nonce",
        ] {
            if request.get(field).is_none() {
                return Err(X402Error::MissingField(field.to_string()));
            }
        }

        let challenge: PaymentChallenge = serde_json::from_value(request.clone())?;
        if challenge.nonce.is_empty() {
            return Err(X402Error::MissingField("nonce".to_string()));
        }
        Ok(challenge)
    }

    /// The challenge amount in the asset's smallest unit.
    pub fn amount_base_units(&self) -> Result<u128> {
        parse_decimal_amount(&self.amount, self.currency.decimals())
    }

    /// The agent-side replay key: `merchantId:route:nonce`.
    pub fn payment_key(&self) -> String {
        format!("{}:{}:{}", self.merchant_id, self.route, self.nonce)
    }

    /// Whether the challenge has expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now > exp)
    }
}

/// Proof material an agent attaches when retrying a gated request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProofSubmission {
    /// Transaction hash offered as evidence of payment.
    pub proof: String,
    /// The nonce from the challenge being answered.
    pub nonce: String,
    /// Advisory payer address. Never trusted for identity; the canonical
    /// payer always comes from chain data via the facilitator.
    pub payer_hint: Option<String>,
}

impl ProofSubmission {
    /// Extracts a proof submission from request headers, if one is present.
    pub fn from_header_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let proof = lookup(HDR_PAYMENT_PROOF)?;
        let nonce = lookup(HDR_NONCE)?;
        Some(Self {
            proof,
            nonce,
            payer_hint: lookup(HDR_PAYMENT_PAYER),
        })
    }

    /// Header pairs for the retried request.
    pub fn to_headers(&self, merchant_id: &str) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HDR_PAYMENT_PROOF, self.proof.clone()),
            (HDR_NONCE, self.nonce.clone()),
            (HDR_MERCHANT_ID, merchant_id.to_string()),
        ];
        if let Some(payer) = &self.payer_hint {
            headers.push((HDR_PAYMENT_PAYER, payer.clone()));
        }
        headers
    }
}

/// Request to the facilitator's `/verify` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Transaction hash submitted as payment evidence.
    pub payment_proof: String,
    /// The challenge nonce being consumed.
    pub nonce: String,
    /// Merchant the payment is claimed for.
    pub merchant_id: String,
    /// Expected decimal amount in asset-native precision.
    pub expected_amount: String,
    /// Expected currency.
    pub currency: Currency,
    /// Request path (canonicalized by the facilitator).
    pub path: String,
    /// Request method.
    pub method: String,
}

impl VerifyRequest {
    /// Schema validation: well-formed proof hash, known verb, non-empty ids.
    pub fn validate(&self) -> Result<()> {
        parse_proof(&self.payment_proof)?;
        if self.nonce.is_empty() {
            return Err(X402Error::MissingField("nonce".to_string()));
        }
        if self.merchant_id.is_empty() {
            return Err(X402Error::MissingField("merchantId".to_string()));
        }
        let method = self.method.to_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(X402Error::InvalidChallenge(format!(
                "unknown HTTP method: {}",
                self.method
            )));
        }
        parse_decimal_amount(&self.expected_amount, self.currency.decimals())?;
        Ok(())
    }
}

/// Verdict returned by the facilitator's `/verify` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    /// Whether the payment is verified and final.
    pub verified: bool,
    /// The consumed transaction hash, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Canonical payer address derived from chain data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Confirmations observed at verification time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
    /// Confirmations required before success, echoed on `AWAITING_CONFIRMATIONS`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_confirmations: Option<u64>,
    /// Denial code when not verified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DenialCode>,
    /// Human-readable explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VerifyResponse {
    /// A successful, final verification.
    pub fn verified(tx_hash: String, payer: String, confirmations: u64) -> Self {
        Self {
            verified: true,
            tx_hash: Some(tx_hash),
            payer: Some(payer),
            confirmations: Some(confirmations),
            required_confirmations: None,
            error: None,
            message: None,
        }
    }

    /// A terminal protocol denial.
    pub fn denied(code: DenialCode, message: impl Into<String>) -> Self {
        Self {
            verified: false,
            tx_hash: None,
            payer: None,
            confirmations: None,
            required_confirmations: None,
            error: Some(code),
            message: Some(message.into()),
        }
    }

    /// The payment exists but is not final yet; the caller should poll.
    pub fn awaiting(confirmations: u64, required: u64) -> Self {
        Self {
            verified: false,
            tx_hash: None,
            payer: None,
            confirmations: Some(confirmations),
            required_confirmations: Some(required),
            error: Some(DenialCode::AwaitingConfirmations),
            message: Some(format!(
                "{} of {} confirmations; retry later",
                confirmations, required
            )),
        }
    }
}

/// Request to the merchant's pricing source (`POST /price-check`).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PriceCheckRequest {
    /// Merchant identifier.
    pub merchant_id: String,
    /// Request method.
    pub method: String,
    /// Canonical request path.
    pub path: String,
}

/// A priced route, as answered by the pricing source and cached by the gate.
///
/// Bounded staleness only: the facilitator re-verifies amount and route
/// against the merchant's authoritative table, so a stale quote can never
/// grant underpriced access.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    /// Decimal price in asset-native precision.
    pub price: String,
    /// Currency of the price.
    pub currency: Currency,
    /// Payee address for this route.
    pub pay_to: String,
    /// Human network name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// What the payment buys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Pricing schema version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Lifecycle state of a merchant account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerchantStatus {
    /// Verifications proceed normally.
    Active,
    /// All verifications are rejected with `MERCHANT_SUSPENDED`.
    Suspended,
}

/// A merchant as known to the facilitator's authoritative directory.
#[derive(Debug, Clone)]
pub struct Merchant {
    /// Merchant identifier.
    pub id: String,
    /// Address payments must land on.
    pub pay_to: Address,
    /// Chain the merchant settles on.
    pub chain_id: u64,
    /// Stable-asset contract the merchant accepts.
    pub token: Address,
    /// Account status.
    pub status: MerchantStatus,
    /// Registered monetized routes.
    pub routes: Vec<RouteRecord>,
}

impl Merchant {
    /// Finds the registered route matching the canonical (method, path).
    pub fn route(&self, method: &str, path: &str) -> Option<&RouteRecord> {
        let wanted = canonical_route(method, path);
        self.routes
            .iter()
            .find(|r| canonical_route(&r.method, &r.path) == wanted)
    }
}

/// One monetized route in a merchant's table.
#[derive(Debug, Clone)]
pub struct RouteRecord {
    /// HTTP method.
    pub method: String,
    /// Route path.
    pub path: String,
    /// Decimal price in asset-native precision.
    pub price: String,
    /// Currency the route is priced in.
    pub currency: Currency,
    /// Disabled routes reject with `ROUTE_DISABLED`.
    pub enabled: bool,
}

/// Immutable ledger record created exactly once per verified payment.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Globally unique transaction hash; a consumed hash can never fund a
    /// second grant, for any merchant.
    pub tx_hash: String,
    /// Merchant the payment was verified for.
    pub merchant_id: String,
    /// Payer derived from chain data, never from a client header.
    pub payer: String,
    /// Decimal amount actually transferred.
    pub amount: String,
    /// Currency of the payment.
    pub currency: Currency,
    /// Canonical path the payment bought.
    pub path: String,
    /// Method the payment bought.
    pub method: String,
    /// Verification timestamp.
    pub verified_at: DateTime<Utc>,
}

/// Receipt the middleware attaches to the request context on grant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    /// Verified transaction hash.
    pub tx_hash: String,
    /// Canonical payer address from the facilitator.
    pub payer: String,
    /// Decimal amount paid.
    pub amount: String,
    /// Currency paid in.
    pub currency: Currency,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_challenge() -> PaymentChallenge {
        PaymentChallenge {
            amount: "1.0".to_string(),
            currency: Currency::Usdc,
            pay_to: "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEbb".to_string(),
            merchant_id: "mer_123".to_string(),
            facilitator_url: Some("https://facilitator.test".to_string()),
            network: Some("base-sepolia".to_string()),
            chain_id: 84532,
            route: "GET /premium".to_string(),
            nonce: "0xn1".to_string(),
            expires_at: None,
            description: Some("Premium data".to_string()),
        }
    }

    #[test]
    fn test_currency_wire_strings() {
        assert_eq!(Currency::Usdc.as_str(), "USDC");
        assert_eq!(Currency::Eth.decimals(), 18);
        assert!(Currency::Eth.is_native());
        assert!(!Currency::Usdc.is_native());

        let c: Currency = "usdc".parse().unwrap();
        assert_eq!(c, Currency::Usdc);
        assert!("DOGE".parse::<Currency>().is_err());
    }

    #[test]
    fn test_challenge_header_round_trip() {
        let challenge = sample_challenge();
        let headers: HashMap<String, String> = challenge
            .to_headers()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(headers[HDR_PAYMENT_REQUIRED], "true");
        assert_eq!(headers[HDR_PAYMENT_AMOUNT], "1.0");
        assert_eq!(headers[HDR_ROUTE], "GET /premium");

        let parsed =
            PaymentChallenge::from_header_lookup(|name| headers.get(name).cloned()).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_challenge_header_missing_nonce() {
        let challenge = sample_challenge();
        let headers: HashMap<String, String> = challenge
            .to_headers()
            .into_iter()
            .filter(|(k, _)| *k != HDR_NONCE)
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let err =
            PaymentChallenge::from_header_lookup(|name| headers.get(name).cloned()).unwrap_err();
        assert!(matches!(err, X402Error::MissingField(f) if f == HDR_NONCE));
    }

    #[test]
    fn test_challenge_body_round_trip() {
        let challenge = sample_challenge();
        let body = challenge.to_body();

        assert_eq!(body["error"], "PAYMENT_REQUIRED");
        assert_eq!(body["paymentRequest"]["nonce"], "0xn1");

        let parsed = PaymentChallenge::from_body(&body).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_challenge_body_rejects_missing_nonce() {
        let challenge = sample_challenge();
        let mut body = challenge.to_body();
        body["paymentRequest"]
            .as_object_mut()
            .unwrap()
            .remove("nonce");

        let err = PaymentChallenge::from_body(&body).unwrap_err();
        assert!(matches!(err, X402Error::MissingField(f) if f == "nonce"));
    }

    #[test]
    fn test_challenge_amount_and_key() {
        let challenge = sample_challenge();
        assert_eq!(challenge.amount_base_units().unwrap(), 1_000_000);
        assert_eq!(challenge.payment_key(), "mer_123:GET /premium:0xn1");
    }

    #[test]
    fn test_challenge_expiry() {
        let mut challenge = sample_challenge();
        let now = Utc::now();
        assert!(!challenge.is_expired(now));

        challenge.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(challenge.is_expired(now));
        challenge.expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(!challenge.is_expired(now));
    }

    #[test]
    fn test_expose_headers_lists_nonce() {
        let exposed = PaymentChallenge::expose_headers();
        assert!(exposed.contains("X-Nonce"));
        assert!(exposed.contains("X-Payment-Amount"));
    }

    #[test]
    fn test_proof_submission_headers() {
        let submission = ProofSubmission {
            proof: "0xabc".to_string(),
            nonce: "0xn1".to_string(),
            payer_hint: None,
        };
        let headers: HashMap<String, String> = submission
            .to_headers("mer_123")
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(headers[HDR_PAYMENT_PROOF], "0xabc");
        assert_eq!(headers[HDR_MERCHANT_ID], "mer_123");

        let parsed = ProofSubmission::from_header_lookup(|n| headers.get(n).cloned()).unwrap();
        assert_eq!(parsed, submission);

        // No proof header means no submission, not an error
        assert!(ProofSubmission::from_header_lookup(|_| None).is_none());
    }

    #[test]
    fn test_verify_request_validation() {
        let mut request = VerifyRequest {
            payment_proof: format!("0x{}", "ab".repeat(32)),
            nonce: "0xn1".to_string(),
            merchant_id: "mer_123".to_string(),
            expected_amount: "1.0".to_string(),
            currency: Currency::Usdc,
            path: "/premium".to_string(),
            method: "GET".to_string(),
        };
        assert!(request.validate().is_ok());

        request.method = "FETCH".to_string();
        assert!(request.validate().is_err());
        request.method = "GET".to_string();

        request.payment_proof = "0x1234".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_verify_response_constructors() {
        let ok = VerifyResponse::verified("0xhash".to_string(), "0xpayer".to_string(), 5);
        assert!(ok.verified);
        assert_eq!(ok.confirmations, Some(5));

        let denied = VerifyResponse::denied(DenialCode::TxReused, "hash consumed");
        assert!(!denied.verified);
        assert_eq!(denied.error, Some(DenialCode::TxReused));

        let waiting = VerifyResponse::awaiting(1, 3);
        assert!(!waiting.verified);
        assert_eq!(waiting.error, Some(DenialCode::AwaitingConfirmations));
        assert_eq!(waiting.required_confirmations, Some(3));
    }

    #[test]
    fn test_merchant_route_matching() {
        let merchant = Merchant {
            id: "mer_123".to_string(),
            pay_to: Address::zero(),
            chain_id: 84532,
            token: Address::zero(),
            status: MerchantStatus::Active,
            routes: vec![RouteRecord {
                method: "GET".to_string(),
                path: "/premium".to_string(),
                price: "1.0".to_string(),
                currency: Currency::Usdc,
                enabled: true,
            }],
        };

        assert!(merchant.route("get", "/premium/").is_some());
        assert!(merchant.route("GET", "/premium?x=1").is_some());
        assert!(merchant.route("POST", "/premium").is_none());
        assert!(merchant.route("GET", "/other").is_none());
    }

    #[test]
    fn test_verify_request_wire_shape() {
        let request = VerifyRequest {
            payment_proof: format!("0x{}", "ab".repeat(32)),
            nonce: "0xn1".to_string(),
            merchant_id: "mer_123".to_string(),
            expected_amount: "1.0".to_string(),
            currency: Currency::Usdc,
            path: "/premium".to_string(),
            method: "GET".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("paymentProof").is_some());
        assert!(json.get("expectedAmount").is_some());
        assert_eq!(json["currency"], "USDC");
    }
}
