//! Integration tests for the x402-gate library.
//!
//! These tests wire the real components together: the payment gate, the
//! facilitator verification path, the agent wallet, and the orchestrating
//! client against a live axum server.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use ethers::types::{Address, Bytes, Log, Transaction, TransactionReceipt, H256, U256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use x402_gate::agent::{AgentWallet, PaymentExecutor, WalletPolicy};
use x402_gate::chain::{address_topic, transfer_event_topic, ChainRpc};
use x402_gate::client::X402Client;
use x402_gate::errors::{DenialCode, Result, X402Error};
use x402_gate::facilitator::{handle_verify, FacilitatorConfig};
use x402_gate::gateway::{FacilitatorClient, GateOutcome, PaymentGate, PriceSource};
use x402_gate::store::{MemoryStore, MerchantDirectory, ReplayStore, TransactionLedger};
use x402_gate::types::{
    Currency, Merchant, MerchantStatus, PaymentChallenge, PriceCheckRequest, PriceQuote,
    RouteRecord, VerifyRequest, VerifyResponse,
};

const TOKEN: [u8; 20] = [0x11; 20];
const PAYEE: [u8; 20] = [0x22; 20];
const PAYER: [u8; 20] = [0x33; 20];
const CHAIN_ID: u64 = 84532;

/// The transaction hash every mock payment broadcasts.
fn known_proof() -> String {
    format!("0x{}", "ab".repeat(32))
}

/// Chain stub that knows exactly one confirmed USDC transfer.
struct ScriptedChain {
    receipt: TransactionReceipt,
}

impl ScriptedChain {
    fn with_transfer(amount_units: u64) -> Self {
        let mut data = [0u8; 32];
        U256::from(amount_units).to_big_endian(&mut data);
        Self {
            receipt: TransactionReceipt {
                status: Some(1u64.into()),
                block_number: Some(100u64.into()),
                logs: vec![Log {
                    address: Address::from(TOKEN),
                    topics: vec![
                        transfer_event_topic(),
                        address_topic(Address::from(PAYER)),
                        address_topic(Address::from(PAYEE)),
                    ],
                    data: Bytes::from(data.to_vec()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl ChainRpc for ScriptedChain {
    async fn transaction_receipt(&self, _hash: H256) -> Result<Option<TransactionReceipt>> {
        Ok(Some(self.receipt.clone()))
    }

    async fn transaction(&self, _hash: H256) -> Result<Option<Transaction>> {
        Ok(None)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(110)
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(CHAIN_ID)
    }
}

fn merchant(price: &str) -> Merchant {
    Merchant {
        id: "mer_123".to_string(),
        pay_to: Address::from(PAYEE),
        chain_id: CHAIN_ID,
        token: Address::from(TOKEN),
        status: MerchantStatus::Active,
        routes: vec![
            RouteRecord {
                method: "GET".to_string(),
                path: "/premium".to_string(),
                price: price.to_string(),
                currency: Currency::Usdc,
                enabled: true,
            },
            RouteRecord {
                method: "GET".to_string(),
                path: "/retired".to_string(),
                price: price.to_string(),
                currency: Currency::Usdc,
                enabled: false,
            },
        ],
    }
}

/// Prices routes straight from the merchant's route table.
struct TablePrices {
    merchant: Merchant,
}

#[async_trait]
impl PriceSource for TablePrices {
    async fn quote(&self, request: &PriceCheckRequest) -> Result<PriceQuote> {
        match self.merchant.route(&request.method, &request.path) {
            Some(route) if route.enabled => Ok(PriceQuote {
                price: route.price.clone(),
                currency: route.currency,
                pay_to: format!("{:?}", self.merchant.pay_to),
                network: Some("base-sepolia".to_string()),
                description: None,
                version: Some(1),
            }),
            Some(_) => Err(X402Error::PaymentDenied {
                code: DenialCode::RouteDisabled,
                message: "route is disabled".to_string(),
            }),
            None => Err(X402Error::PaymentDenied {
                code: DenialCode::RouteNotRegistered,
                message: "route is not registered".to_string(),
            }),
        }
    }
}

/// Calls the verification path in-process instead of over HTTP.
struct InProcessFacilitator {
    config: FacilitatorConfig,
}

#[async_trait]
impl FacilitatorClient for InProcessFacilitator {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse> {
        handle_verify(request.clone(), &self.config).await
    }
}

/// Executor that broadcasts nothing and returns the scripted hash.
struct MockExecutor {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl PaymentExecutor for MockExecutor {
    async fn execute(&self, _challenge: &PaymentChallenge) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(known_proof())
    }
}

async fn gate_over(merchant: Merchant, amount_units: u64) -> (PaymentGate, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.upsert_merchant(merchant.clone()).await;

    let facilitator_config = FacilitatorConfig::new(
        Arc::new(ScriptedChain::with_transfer(amount_units)),
        Arc::clone(&store) as Arc<dyn ReplayStore>,
        Arc::clone(&store) as Arc<dyn TransactionLedger>,
        Arc::clone(&store) as Arc<dyn MerchantDirectory>,
    )
    .with_confirmations(3);

    let gate = PaymentGate::new(
        "mer_123",
        "https://facilitator.test",
        CHAIN_ID,
        Arc::new(TablePrices { merchant }),
        Arc::new(InProcessFacilitator {
            config: facilitator_config,
        }),
    )
    .unwrap();
    (gate, store)
}

fn wallet(daily: &str, per_tx: &str) -> (Arc<AgentWallet>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = WalletPolicy::new(CHAIN_ID)
        .allow_currency(Currency::Usdc, daily, per_tx)
        .trust_facilitator("https://facilitator.test")
        .unwrap();
    let wallet = Arc::new(AgentWallet::new(
        policy,
        Arc::new(MockExecutor {
            calls: Arc::clone(&calls),
        }),
    ));
    (wallet, calls)
}

#[tokio::test]
async fn test_full_challenge_pay_verify_cycle() {
    let (gate, store) = gate_over(merchant("1.0"), 1_000_000).await;
    let (wallet, _) = wallet("5.0", "2.0");

    // Unpaid request yields a challenge
    let outcome = gate.gate("GET", "/premium", None).await.unwrap();
    let challenge = match outcome {
        GateOutcome::Challenge(c) => c,
        other => panic!("expected challenge, got {:?}", other),
    };
    assert_eq!(challenge.amount, "1.0");
    assert_eq!(challenge.route, "GET /premium");

    // The agent pays it and submits the proof
    let proof = wallet.pay(&challenge, "GET /premium").await.unwrap();
    let outcome = gate
        .gate("GET", "/premium", Some(proof))
        .await
        .unwrap();

    let receipt = match outcome {
        GateOutcome::Granted(r) => r,
        other => panic!("expected grant, got {:?}", other),
    };
    assert_eq!(receipt.tx_hash, known_proof());
    // Payer identity comes from the chain log
    assert_eq!(receipt.payer, format!("{:?}", Address::from(PAYER)));

    // Revenue was recorded for the merchant
    let counters = store.counters("mer_123").await.unwrap();
    assert_eq!(counters.revenue_base_units, 1_000_000);
}

#[tokio::test]
async fn test_replayed_proof_is_denied() {
    let (gate, _store) = gate_over(merchant("1.0"), 1_000_000).await;
    let (wallet, _) = wallet("5.0", "2.0");

    let challenge = match gate.gate("GET", "/premium", None).await.unwrap() {
        GateOutcome::Challenge(c) => c,
        other => panic!("expected challenge, got {:?}", other),
    };
    let proof = wallet.pay(&challenge, "GET /premium").await.unwrap();

    let first = gate.gate("GET", "/premium", Some(proof.clone())).await.unwrap();
    assert!(matches!(first, GateOutcome::Granted(_)));

    // Same nonce again: the replay key is already consumed
    let second = gate.gate("GET", "/premium", Some(proof.clone())).await.unwrap();
    match second {
        GateOutcome::Denied { code, .. } => assert_eq!(code, DenialCode::ReplayDetected),
        other => panic!("expected replay denial, got {:?}", other),
    }

    // A fresh nonce with the same transaction hash: the hash is spent
    let fresh = match gate.gate("GET", "/premium", None).await.unwrap() {
        GateOutcome::Challenge(c) => c,
        other => panic!("expected challenge, got {:?}", other),
    };
    let mut reused = proof;
    reused.nonce = fresh.nonce;
    let third = gate.gate("GET", "/premium", Some(reused)).await.unwrap();
    match third {
        GateOutcome::Denied { code, .. } => assert_eq!(code, DenialCode::TxReused),
        other => panic!("expected reuse denial, got {:?}", other),
    }
}

#[tokio::test]
async fn test_spend_cap_holds_across_payments() {
    let (gate, _store) = gate_over(merchant("3.0"), 3_000_000).await;
    let (wallet, calls) = wallet("5.0", "3.0");

    let first = match gate.gate("GET", "/premium", None).await.unwrap() {
        GateOutcome::Challenge(c) => c,
        other => panic!("expected challenge, got {:?}", other),
    };
    wallet.pay(&first, "GET /premium").await.unwrap();
    assert_eq!(wallet.spent_today(Currency::Usdc).await.unwrap(), 3_000_000);

    // A second 3.0 would exceed the 5.0 daily budget
    let second = match gate.gate("GET", "/premium", None).await.unwrap() {
        GateOutcome::Challenge(c) => c,
        other => panic!("expected challenge, got {:?}", other),
    };
    let err = wallet.pay(&second, "GET /premium").await.unwrap_err();
    assert!(matches!(
        err,
        X402Error::PolicyRejected {
            code: "DAILY_LIMIT",
            ..
        }
    ));
    // The denied payment spent nothing and never reached the chain
    assert_eq!(wallet.spent_today(Currency::Usdc).await.unwrap(), 3_000_000);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disabled_route_yields_denial_not_challenge() {
    let (gate, _store) = gate_over(merchant("1.0"), 1_000_000).await;
    let outcome = gate.gate("GET", "/retired", None).await.unwrap();
    match outcome {
        GateOutcome::Denied { code, .. } => assert_eq!(code, DenialCode::RouteDisabled),
        other => panic!("expected denial, got {:?}", other),
    }
}

// Live-server tests for the orchestrating client.

#[derive(Clone)]
struct ServerState {
    hits: Arc<AtomicU32>,
    /// When set, every response is a fresh 402 even after payment.
    always_charge: bool,
}

fn server_challenge(nonce: &str) -> PaymentChallenge {
    PaymentChallenge {
        amount: "0.5".to_string(),
        currency: Currency::Usdc,
        pay_to: format!("{:?}", Address::from(PAYEE)),
        merchant_id: "mer_live".to_string(),
        facilitator_url: Some("https://facilitator.test/verify".to_string()),
        network: Some("base-sepolia".to_string()),
        chain_id: CHAIN_ID,
        route: "GET /premium".to_string(),
        nonce: nonce.to_string(),
        expires_at: None,
        description: Some("Premium content".to_string()),
    }
}

fn challenge_response(challenge: &PaymentChallenge) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in challenge.to_headers() {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
    }
    (
        StatusCode::PAYMENT_REQUIRED,
        headers,
        Json(challenge.to_body()),
    )
        .into_response()
}

async fn premium(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    let paid = headers.get("x-payment-proof").is_some() && headers.get("x-nonce").is_some();
    if paid && !state.always_charge {
        return (StatusCode::OK, "premium content").into_response();
    }
    challenge_response(&server_challenge(&format!("0xn{}", hit)))
}

async fn spawn_server(always_charge: bool) -> (String, Arc<AtomicU32>) {
    // Repeated try_init calls across tests are fine; only the first wins.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route("/premium", get(premium)).with_state(ServerState {
        hits: Arc::clone(&hits),
        always_charge,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), hits)
}

#[tokio::test]
async fn test_client_pays_and_gets_resource() {
    let (base, hits) = spawn_server(false).await;
    let (wallet, calls) = wallet("5.0", "1.0");
    let client = X402Client::new(wallet);

    let response = client.get(&format!("{}/premium", base)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "premium content");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Initial request plus exactly one paid retry
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_client_refuses_second_payment_for_one_request() {
    let (base, hits) = spawn_server(true).await;
    let (wallet, calls) = wallet("5.0", "1.0");
    let client = X402Client::new(wallet);

    let err = client.get(&format!("{}/premium", base)).await.unwrap_err();
    assert!(matches!(err, X402Error::Recursive402));
    // One payment, one retry; the second challenge is never paid
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
