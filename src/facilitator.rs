//! Facilitator verification service for the x402 protocol.
//!
//! The facilitator is the trusted third party that authoritatively confirms
//! a payment happened on-chain and was never consumed before. [`handle_verify`]
//! runs the verification pipeline in strict, short-circuiting order:
//!
//! 1. atomic replay-key claim
//! 2. global transaction-hash reuse check
//! 3. merchant and route validation
//! 4. chain resolution (receipt, status, network)
//! 5. asset-specific payment matching in smallest units
//! 6. confirmation threshold
//! 7. ledger persistence and counter updates
//!
//! Steps 1 and 7 are the two independent atomic guards; everything between
//! them is read-only. A claim that does not end in a consumed nonce
//! (awaiting confirmations, infrastructure fault) is released so the caller
//! can poll again.

use crate::chain::{
    confirmations, match_native_transfer, match_token_transfer, receipt_succeeded, ChainRpc,
    MatchedPayment,
};
use crate::errors::{DenialCode, Result};
use crate::store::{MerchantDirectory, ReplayStore, TransactionLedger};
use crate::types::{MerchantStatus, TransactionRecord, VerifyRequest, VerifyResponse};
use crate::utils::{
    canonical_path, format_base_units, parse_decimal_amount, parse_proof, replay_key,
};
use chrono::Utc;
use ethers::types::U256;
use std::cmp;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Default confirmation threshold; production deployments raise this.
pub const DEFAULT_CONFIRMATIONS_REQUIRED: u64 = 3;

/// Configuration for a facilitator verification service.
#[derive(Clone)]
pub struct FacilitatorConfig {
    /// Chain read capability.
    pub chain: Arc<dyn ChainRpc>,
    /// Consumed-nonce store (atomic claim).
    pub replay_store: Arc<dyn ReplayStore>,
    /// Transaction ledger (atomic unique insert, atomic counters).
    pub ledger: Arc<dyn TransactionLedger>,
    /// Authoritative merchant directory.
    pub merchants: Arc<dyn MerchantDirectory>,
    /// Confirmations required before a payment is final.
    pub confirmations_required: u64,
}

impl FacilitatorConfig {
    /// Creates a facilitator configuration with the default confirmation
    /// threshold.
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        replay_store: Arc<dyn ReplayStore>,
        ledger: Arc<dyn TransactionLedger>,
        merchants: Arc<dyn MerchantDirectory>,
    ) -> Self {
        Self {
            chain,
            replay_store,
            ledger,
            merchants,
            confirmations_required: DEFAULT_CONFIRMATIONS_REQUIRED,
        }
    }

    /// Sets the confirmation threshold (environment-tunable; test networks
    /// run lower than production).
    pub fn with_confirmations(mut self, required: u64) -> Self {
        self.confirmations_required = required;
        self
    }
}

/// Entry point for the facilitator's `/verify` operation.
///
/// Protocol denials come back as `Ok` responses carrying a [`DenialCode`];
/// chain or storage failures surface as a generic `FACILITATOR_FAULT`
/// response, never as a silent `verified: true`.
pub async fn handle_verify(
    request: VerifyRequest,
    config: &FacilitatorConfig,
) -> Result<VerifyResponse> {
    if let Err(e) = request.validate() {
        warn!(merchant = %request.merchant_id, "verify request failed validation: {}", e);
        return Ok(VerifyResponse::denied(
            DenialCode::ValidationFailed,
            e.to_string(),
        ));
    }

    // Step 1: atomic replay-key claim. A constraint violation here is the
    // sole defense against replaying an old challenge.
    let key = replay_key(
        &request.merchant_id,
        &request.method,
        &request.path,
        &request.nonce,
    );
    if !config.replay_store.claim(&key).await? {
        warn!(merchant = %request.merchant_id, nonce = %request.nonce, "replay detected");
        return Ok(VerifyResponse::denied(
            DenialCode::ReplayDetected,
            "this challenge nonce was already consumed for this route",
        ));
    }

    match verify_claimed(&request, config).await {
        Ok(response) => {
            // The nonce is only consumed by a final outcome. Awaiting
            // confirmations must leave the key free for the poll retry.
            if response.error == Some(DenialCode::AwaitingConfirmations) {
                release_claim(config, &key).await;
            }
            Ok(response)
        }
        Err(e) => {
            error!(merchant = %request.merchant_id, "verification fault: {}", e);
            release_claim(config, &key).await;
            Ok(VerifyResponse::denied(
                DenialCode::FacilitatorFault,
                "verification infrastructure fault; retry later",
            ))
        }
    }
}

/// Returns a claimed replay key to the store. The computed verdict is
/// already decided; a failing release only delays the poll retry until
/// the key's TTL, so it is logged rather than surfaced.
async fn release_claim(config: &FacilitatorConfig, key: &str) {
    if let Err(e) = config.replay_store.release(key).await {
        warn!(key, "replay key release failed: {}", e);
    }
}

/// Steps 2-7, run after the replay key has been claimed.
async fn verify_claimed(
    request: &VerifyRequest,
    config: &FacilitatorConfig,
) -> Result<VerifyResponse> {
    // Step 2: global double-spend check. One on-chain payment funds exactly
    // one access grant, ever, across all merchants.
    let tx_hash = canonical_tx_hash(&request.payment_proof)?;
    if config.ledger.contains(&tx_hash).await? {
        return Ok(VerifyResponse::denied(
            DenialCode::TxReused,
            "transaction hash already funded an access grant",
        ));
    }

    // Step 3: merchant and route validation against the authoritative table.
    let merchant = match config.merchants.merchant(&request.merchant_id).await? {
        Some(m) => m,
        None => {
            return Ok(VerifyResponse::denied(
                DenialCode::ValidationFailed,
                format!("unknown merchant: {}", request.merchant_id),
            ));
        }
    };
    if merchant.status != MerchantStatus::Active {
        return Ok(VerifyResponse::denied(
            DenialCode::MerchantSuspended,
            "merchant account is suspended",
        ));
    }
    let route = match merchant.route(&request.method, &request.path) {
        Some(r) => r.clone(),
        None => {
            return Ok(VerifyResponse::denied(
                DenialCode::RouteNotRegistered,
                format!(
                    "no registered route matches {} {}",
                    request.method.to_uppercase(),
                    canonical_path(&request.path)
                ),
            ));
        }
    };
    if !route.enabled {
        return Ok(VerifyResponse::denied(
            DenialCode::RouteDisabled,
            "route has been disabled by the merchant",
        ));
    }
    if route.currency != request.currency {
        return Ok(VerifyResponse::denied(
            DenialCode::ValidationFailed,
            format!(
                "route is priced in {}, not {}",
                route.currency, request.currency
            ),
        ));
    }

    // The stricter of the middleware's expectation and the registered price
    // wins; a stale gateway quote can never grant underpriced access.
    let decimals = route.currency.decimals();
    let expected_units = cmp::max(
        parse_decimal_amount(&request.expected_amount, decimals)?,
        parse_decimal_amount(&route.price, decimals)?,
    );
    let expected = U256::from(expected_units);

    // Step 4: chain resolution. The provider's chain id is checked against
    // the merchant's configured chain to block cross-chain hash replay.
    let chain_id = config.chain.chain_id().await?;
    if chain_id != merchant.chain_id {
        return Ok(VerifyResponse::denied(
            DenialCode::WrongNetwork,
            format!(
                "payment is on chain {}, merchant settles on {}",
                chain_id, merchant.chain_id
            ),
        ));
    }
    let proof = parse_proof(&request.payment_proof)?;
    let receipt = match config.chain.transaction_receipt(proof).await? {
        Some(r) if receipt_succeeded(&r) => r,
        _ => {
            return Ok(VerifyResponse::denied(
                DenialCode::TxNotFoundOrFailed,
                "transaction not found on chain, or execution failed",
            ));
        }
    };

    // Step 5: asset-specific matching. The payer always comes from chain
    // data, never from a client-supplied header.
    let matched: Option<MatchedPayment> = if route.currency.is_native() {
        match config.chain.transaction(proof).await? {
            Some(tx) => match_native_transfer(&tx, merchant.pay_to, expected),
            None => None,
        }
    } else {
        match_token_transfer(&receipt, merchant.token, merchant.pay_to, expected)
    };
    let matched = match matched {
        Some(m) => m,
        None => {
            return Ok(VerifyResponse::denied(
                DenialCode::PaymentVerificationFailed,
                format!(
                    "no transfer of at least {} {} to the merchant address found",
                    request.expected_amount, route.currency
                ),
            ));
        }
    };

    // Step 6: confirmation threshold. Not a final denial; the caller polls.
    let head = config.chain.block_number().await?;
    let confirmed = confirmations(&receipt, head).unwrap_or(0);
    if confirmed < config.confirmations_required {
        return Ok(VerifyResponse::awaiting(
            confirmed,
            config.confirmations_required,
        ));
    }

    // Step 7: persist the ledger record (second independent atomic guard)
    // and bump counters.
    let paid_units = u128::try_from(matched.amount).unwrap_or(u128::MAX);
    let record = TransactionRecord {
        tx_hash: tx_hash.clone(),
        merchant_id: merchant.id.clone(),
        payer: format!("{:?}", matched.payer),
        amount: format_base_units(paid_units, decimals),
        currency: route.currency,
        path: canonical_path(&request.path),
        method: request.method.to_uppercase(),
        verified_at: Utc::now(),
    };
    let payer = record.payer.clone();
    if !config.ledger.record(record).await? {
        // Lost the race to a concurrent verification of the same hash.
        return Ok(VerifyResponse::denied(
            DenialCode::TxReused,
            "transaction hash already funded an access grant",
        ));
    }
    config.ledger.add_revenue(&merchant.id, paid_units).await?;

    info!(
        merchant = %merchant.id,
        tx = %tx_hash,
        payer = %payer,
        confirmations = confirmed,
        "payment verified"
    );
    Ok(VerifyResponse::verified(tx_hash, payer, confirmed))
}

/// Normalizes a proof string into the canonical lowercase ledger form.
fn canonical_tx_hash(proof: &str) -> Result<String> {
    let hash = parse_proof(proof)?;
    Ok(format!("{:?}", hash))
}
