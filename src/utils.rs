//! Shared helpers used across the protocol roles.
//!
//! Route canonicalization, nonce generation, replay-key derivation, and
//! fixed-point amount handling. Everything that touches money works in the
//! asset's smallest unit as integers; no floating point is used anywhere
//! on the comparison path.

use crate::errors::{Result, X402Error};
use ethers::types::{Address, H256};
use sha3::{Digest, Keccak256};
use std::str::FromStr;

/// Canonicalizes a request path: strips the query string and fragment,
/// forces a leading slash, and drops the trailing slash (except for `/`).
///
/// The gateway, the facilitator, and price lookups must all use this one
/// function; route matching silently fragments if they disagree.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::canonical_path;
///
/// assert_eq!(canonical_path("/premium/?page=2"), "/premium");
/// assert_eq!(canonical_path("premium"), "/premium");
/// assert_eq!(canonical_path("/"), "/");
/// ```
pub fn canonical_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return "/".to_string();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Canonical `METHOD path` route form shared verbatim across all parties.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::canonical_route;
///
/// assert_eq!(canonical_route("get", "/premium/?q=1"), "GET /premium");
/// ```
pub fn canonical_route(method: &str, path: &str) -> String {
    format!("{} {}", method.to_uppercase(), canonical_path(path))
}

/// Generates a cryptographically random 32-byte nonce as a hex string.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::generate_nonce;
///
/// let nonce = generate_nonce();
/// assert_eq!(nonce.len(), 66); // "0x" + 64 hex chars
/// ```
pub fn generate_nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let nonce: [u8; 32] = rng.gen();
    format!("0x{}", hex::encode(nonce))
}

/// Derives the deterministic replay key for a challenge.
///
/// `keccak256(merchantId | METHOD | canonicalPath | nonce)`, hex encoded.
/// At most one successful store insert per key ever succeeds; this hash is
/// the sole replay-protection anchor on the facilitator side.
pub fn replay_key(merchant_id: &str, method: &str, path: &str, nonce: &str) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(merchant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(method.to_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_path(path).as_bytes());
    hasher.update(b"|");
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validates and parses a payment proof as a 32-byte transaction hash.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::parse_proof;
///
/// let hash = "0x".to_string() + &"ab".repeat(32);
/// assert!(parse_proof(&hash).is_ok());
/// assert!(parse_proof("0xabc").is_err());
/// ```
pub fn parse_proof(proof: &str) -> Result<H256> {
    let hex_part = proof
        .strip_prefix("0x")
        .ok_or_else(|| X402Error::InvalidProof(format!("missing 0x prefix: {}", proof)))?;
    if hex_part.len() != 64 {
        return Err(X402Error::InvalidProof(format!(
            "expected 32-byte hash, got {} hex chars",
            hex_part.len()
        )));
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hex_part, &mut bytes)
        .map_err(|e| X402Error::InvalidProof(format!("{}: {}", proof, e)))?;
    Ok(H256::from(bytes))
}

/// Validates and parses an EVM address.
pub fn parse_address(addr: &str) -> Result<Address> {
    Address::from_str(addr).map_err(|e| X402Error::InvalidAddress(format!("{}: {}", addr, e)))
}

/// Parses a decimal amount string into the asset's smallest unit.
///
/// Pure string arithmetic: `"1.5"` with 6 decimals is `1_500_000`. More
/// fractional digits than the asset carries is an error, not a rounding.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::parse_decimal_amount;
///
/// assert_eq!(parse_decimal_amount("1.0", 6).unwrap(), 1_000_000);
/// assert_eq!(parse_decimal_amount("0.000001", 6).unwrap(), 1);
/// assert!(parse_decimal_amount("0.0000001", 6).is_err());
/// ```
pub fn parse_decimal_amount(amount: &str, decimals: u8) -> Result<u128> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(X402Error::InvalidAmount("empty amount".to_string()));
    }

    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(X402Error::InvalidAmount(amount.to_string()));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(X402Error::InvalidAmount(format!(
            "not a decimal number: {}",
            amount
        )));
    }
    if frac.len() > decimals as usize {
        return Err(X402Error::InvalidAmount(format!(
            "{} has more than {} fractional digits",
            amount, decimals
        )));
    }

    let whole_units: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| X402Error::InvalidAmount(format!("overflow: {}", amount)))?
    };
    let mut frac_units: u128 = if frac.is_empty() {
        0
    } else {
        frac.parse()
            .map_err(|_| X402Error::InvalidAmount(format!("overflow: {}", amount)))?
    };
    for _ in frac.len()..decimals as usize {
        frac_units = frac_units
            .checked_mul(10)
            .ok_or_else(|| X402Error::InvalidAmount(format!("overflow: {}", amount)))?;
    }

    let scale = 10u128
        .checked_pow(decimals as u32)
        .ok_or_else(|| X402Error::InvalidAmount(format!("decimals too large: {}", decimals)))?;
    whole_units
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| X402Error::InvalidAmount(format!("overflow: {}", amount)))
}

/// Formats a smallest-unit amount back into a decimal string.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::format_base_units;
///
/// assert_eq!(format_base_units(1_500_000, 6), "1.5");
/// assert_eq!(format_base_units(3_000_000, 6), "3");
/// ```
pub fn format_base_units(units: u128, decimals: u8) -> String {
    let scale = 10u128.pow(decimals as u32);
    let whole = units / scale;
    let frac = units % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac_str = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac_str.trim_end_matches('0'))
}
