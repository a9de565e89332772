//! # x402-gate
//!
//! A Rust implementation of the x402 machine-to-machine micropayment
//! protocol: HTTP 402 "Payment Required" challenges settled with on-chain
//! payments, verified by a facilitator, and paid autonomously by agents
//! under a spending policy.
//!
//! ## Roles
//!
//! - **Merchant middleware** ([`gateway`]): prices routes, issues 402
//!   challenges with single-use nonces, forwards payment proofs to a
//!   facilitator, and grants access with a verified receipt.
//! - **Facilitator** ([`facilitator`]): checks a claimed transaction
//!   against chain state (recipient, amount, success, confirmations) and
//!   enforces replay protection and transaction-hash uniqueness.
//! - **Agent wallet** ([`agent`]): decides whether a challenge is worth
//!   paying under daily and per-transaction caps, executes the payment,
//!   and never pays the same challenge twice.
//! - **Orchestrator** ([`client`]): drives the fetch, pay, retry-once
//!   cycle end to end.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use x402_gate::agent::{AgentWallet, EvmPaymentExecutor, WalletPolicy};
//! use x402_gate::client::X402Client;
//! use x402_gate::types::Currency;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = WalletPolicy::new(8453)
//!     .allow_currency(Currency::Usdc, "5.00", "1.00")
//!     .trust_facilitator("https://facilitator.example.com")?;
//!
//! let executor = EvmPaymentExecutor::new(
//!     "https://mainnet.base.org",
//!     "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
//!     8453,
//! )?;
//!
//! let wallet = Arc::new(AgentWallet::new(policy, Arc::new(executor)));
//! let client = X402Client::new(wallet);
//!
//! let response = client.get("https://api.example.com/premium").await?;
//! let report = response.text().await?;
//! println!("paid resource: {report}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol Flow
//!
//! 1. **Agent requests resource**: standard HTTP request
//! 2. **Merchant responds 402**: challenge in headers and JSON body,
//!    carrying price, payee, chain, and a fresh nonce
//! 3. **Agent evaluates policy**: route, currency, chain, facilitator
//!    trust, merchant allowlist, spending caps
//! 4. **Agent pays on chain** and retries once with `x-payment-proof`
//!    and `x-nonce` headers
//! 5. **Merchant forwards to facilitator**, which verifies the
//!    transaction against chain state and consumes the nonce
//! 6. **Merchant responds 200** with the resource
//!
//! ## Security
//!
//! - **Replay protection**: each nonce is bound to one merchant, route,
//!   and payment, and is atomically consumed on first use
//! - **Transaction uniqueness**: a transaction hash settles at most one
//!   payment, across all merchants
//! - **No trusted client input**: payer identity comes from chain data,
//!   never from request headers
//! - **Fail closed**: verification infrastructure faults deny by default

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod agent;
pub mod chain;
pub mod client;
pub mod errors;
pub mod facilitator;
pub mod gateway;
pub mod store;
pub mod types;
pub mod utils;

// Flat re-exports for the common protocol types
pub use errors::{DenialCode, Result, X402Error};
pub use types::{
    Currency, PaymentChallenge, PaymentReceipt, PriceCheckRequest, PriceQuote, ProofSubmission,
    VerifyRequest, VerifyResponse, X402_VERSION,
};
