//! Chain access for the facilitator.
//!
//! [`ChainRpc`] is the narrow read-only capability the verifier consumes:
//! receipt by hash, transaction by hash, head block number, and chain id.
//! [`HttpRpc`] implements it over an ethers JSON-RPC provider; tests drive
//! mock chains through the same trait.
//!
//! The module also holds the asset-specific payment matchers: ERC-20
//! Transfer log scanning for token payments, and the transaction's own
//! `to`/`value` for native payments. Both compare amounts as `U256` in the
//! asset's smallest unit.

use crate::errors::Result;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Transaction, TransactionReceipt, H256, U256};
use ethers::utils::keccak256;

/// Read-only chain capability consumed by the verifier.
#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
    /// Fetches the receipt for a transaction hash, if mined.
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>>;

    /// Fetches the transaction body for a hash, if known.
    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>>;

    /// Current head block number.
    async fn block_number(&self) -> Result<u64>;

    /// Chain id the provider is connected to.
    async fn chain_id(&self) -> Result<u64>;
}

/// [`ChainRpc`] over an ethers HTTP JSON-RPC provider.
pub struct HttpRpc {
    provider: Provider<Http>,
}

impl HttpRpc {
    /// Connects to an HTTP JSON-RPC endpoint.
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_gate::chain::HttpRpc;
    ///
    /// let rpc = HttpRpc::new("https://sepolia.base.org").unwrap();
    /// # let _ = rpc;
    /// ```
    pub fn new(rpc_url: &str) -> Result<Self> {
        Ok(Self {
            provider: Provider::<Http>::try_from(rpc_url)?,
        })
    }
}

#[async_trait::async_trait]
impl ChainRpc for HttpRpc {
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        Ok(self.provider.get_transaction_receipt(hash).await?)
    }

    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        Ok(self.provider.get_transaction(hash).await?)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }
}

/// A payment located on-chain: the canonical payer and the amount moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedPayment {
    /// Payer derived from chain data (`log` from-topic or `tx.from`).
    pub payer: Address,
    /// Amount transferred, in the asset's smallest unit.
    pub amount: U256,
}

/// Event topic for `Transfer(address,address,uint256)`.
pub fn transfer_event_topic() -> H256 {
    H256::from(keccak256(b"Transfer(address,address,uint256)"))
}

/// Left-pads an address into an indexed event topic.
pub fn address_topic(addr: Address) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(addr.as_bytes());
    H256::from(bytes)
}

/// Whether the receipt reports a successful execution.
pub fn receipt_succeeded(receipt: &TransactionReceipt) -> bool {
    receipt.status == Some(1u64.into())
}

/// Confirmations at the given head: `current_block - receipt.block`.
///
/// `None` for a pending receipt with no block number.
pub fn confirmations(receipt: &TransactionReceipt, current_block: u64) -> Option<u64> {
    receipt
        .block_number
        .map(|block| current_block.saturating_sub(block.as_u64()))
}

/// Scans receipt logs for an ERC-20 transfer on `token` paying `pay_to` at
/// least `expected` units.
///
/// The payer is the log's from-topic; any client-supplied payer header is
/// ignored by construction.
pub fn match_token_transfer(
    receipt: &TransactionReceipt,
    token: Address,
    pay_to: Address,
    expected: U256,
) -> Option<MatchedPayment> {
    let topic = transfer_event_topic();
    for log in &receipt.logs {
        if log.address != token {
            continue;
        }
        if log.topics.len() != 3 || log.topics[0] != topic {
            continue;
        }
        let from = Address::from_slice(&log.topics[1].as_bytes()[12..]);
        let to = Address::from_slice(&log.topics[2].as_bytes()[12..]);
        if to != pay_to {
            continue;
        }
        if log.data.len() != 32 {
            continue;
        }
        let value = U256::from_big_endian(log.data.as_ref());
        if value >= expected {
            return Some(MatchedPayment {
                payer: from,
                amount: value,
            });
        }
    }
    None
}

/// Matches a native transfer: the transaction itself must pay `pay_to` at
/// least `expected` wei.
pub fn match_native_transfer(
    tx: &Transaction,
    pay_to: Address,
    expected: U256,
) -> Option<MatchedPayment> {
    if tx.to != Some(pay_to) {
        return None;
    }
    if tx.value >= expected {
        Some(MatchedPayment {
            payer: tx.from,
            amount: tx.value,
        })
    } else {
        None
    }
}
