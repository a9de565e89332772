//! Error types for the x402-gate library.
//!
//! Two layers are kept deliberately distinct: [`DenialCode`] is the
//! machine-readable protocol taxonomy (expected denials, surfaced as 4xx
//! payloads, never retried), while [`X402Error`] covers infrastructure
//! faults, configuration mistakes, and agent-side policy rejections.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable denial codes defined by the x402 protocol.
///
/// These are data, not errors: a facilitator that rejects a payment is
/// operating correctly, so denials travel inside `VerifyResponse` /
/// `GateOutcome` rather than through `Result`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    /// No payment proof was presented; a challenge is being issued.
    PaymentRequired,
    /// The facilitator rejected the proof for a reason it did not refine.
    PaymentVerificationFailed,
    /// The (merchant, method, path, nonce) tuple was already consumed.
    ReplayDetected,
    /// The transaction hash already funded an access grant, anywhere.
    TxReused,
    /// No registered route matches the canonical (method, path).
    RouteNotRegistered,
    /// The route exists but the merchant has disabled it.
    RouteDisabled,
    /// The merchant account is suspended or inactive.
    MerchantSuspended,
    /// The receipt's chain id does not match the merchant's chain.
    WrongNetwork,
    /// The payment exists but has too few confirmations; retry later.
    AwaitingConfirmations,
    /// The transaction is absent from the chain or reverted.
    TxNotFoundOrFailed,
    /// The verify request itself was malformed.
    ValidationFailed,
    /// Chain RPC or storage failed mid-verification.
    FacilitatorFault,
}

impl DenialCode {
    /// Wire string, e.g. `"REPLAY_DETECTED"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialCode::PaymentRequired => "PAYMENT_REQUIRED",
            DenialCode::PaymentVerificationFailed => "PAYMENT_VERIFICATION_FAILED",
            DenialCode::ReplayDetected => "REPLAY_DETECTED",
            DenialCode::TxReused => "TX_REUSED",
            DenialCode::RouteNotRegistered => "ROUTE_NOT_REGISTERED",
            DenialCode::RouteDisabled => "ROUTE_DISABLED",
            DenialCode::MerchantSuspended => "MERCHANT_SUSPENDED",
            DenialCode::WrongNetwork => "WRONG_NETWORK",
            DenialCode::AwaitingConfirmations => "AWAITING_CONFIRMATIONS",
            DenialCode::TxNotFoundOrFailed => "TX_NOT_FOUND_OR_FAILED",
            DenialCode::ValidationFailed => "VALIDATION_FAILED",
            DenialCode::FacilitatorFault => "FACILITATOR_FAULT",
        }
    }

    /// HTTP status an edge layer should map this denial to.
    ///
    /// `AWAITING_CONFIRMATIONS` is also 402: it is not a final denial,
    /// the caller is expected to poll again.
    pub fn http_status(&self) -> u16 {
        match self {
            DenialCode::ValidationFailed => 400,
            DenialCode::FacilitatorFault => 500,
            _ => 402,
        }
    }

    /// Whether a caller may usefully resubmit the same proof later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DenialCode::AwaitingConfirmations | DenialCode::FacilitatorFault
        )
    }
}

impl std::fmt::Display for DenialCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for x402-gate operations.
#[derive(Error, Debug)]
pub enum X402Error {
    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON encoding or decoding failure
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A URL could not be parsed
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    /// JSON-RPC or provider failure while reading the chain
    #[error("Blockchain error: {0}")]
    BlockchainError(String),

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A challenge could not be parsed from headers or body
    #[error("Invalid challenge: {0}")]
    InvalidChallenge(String),

    /// Missing required challenge field (no silent defaults)
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A payment proof is not a well-formed 32-byte transaction hash
    #[error("Invalid payment proof: {0}")]
    InvalidProof(String),

    /// Invalid amount string or precision overflow
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// A string is not a well-formed EVM address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Unsupported currency string on the wire
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// The agent's payment policy denied the challenge
    #[error("Policy rejected ({code}): {reason}")]
    PolicyRejected {
        /// Stable subtype, e.g. "DAILY_LIMIT" or "UNTRUSTED_FACILITATOR"
        code: &'static str,
        /// Human-readable reason
        reason: String,
    },

    /// Agent-side replay guard: this (merchant, route, nonce) was already paid
    #[error("Already paid: {0}")]
    AlreadyPaid(String),

    /// The facilitator or the middleware denied the payment
    #[error("Payment denied ({code}): {message}")]
    PaymentDenied {
        /// Protocol denial code
        code: DenialCode,
        /// Facilitator-provided message
        message: String,
    },

    /// The resource answered 402 again after a completed payment attempt
    #[error("Recursive 402 detected: resource demanded payment after a payment was made")]
    Recursive402,

    /// The middleware could not reach its collaborators (failMode applies)
    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    /// Chain-side payment execution failed
    #[error("Payment execution failed: {0}")]
    ExecutionError(String),

    /// Configuration error, raised at construction time
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for failures with no dedicated variant
    #[error("{0}")]
    Other(String),
}

/// Result type alias for x402-gate operations.
pub type Result<T> = std::result::Result<T, X402Error>;

impl From<ethers::providers::ProviderError> for X402Error {
    fn from(err: ethers::providers::ProviderError) -> Self {
        X402Error::BlockchainError(err.to_string())
    }
}
