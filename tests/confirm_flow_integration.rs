//! End-to-end tests for the confirmation orchestrator.
//!
//! Every collaborator is an in-process stub with call counters, so each test
//! can assert both the single posted response and which side effects ran:
//! - signing happy path with nonce reservation and freshness rebinding
//! - the credential signing exactly the returned VRF challenge
//! - missing PRF result aborting without any response
//! - caller cancel during seed handoff releasing reserved nonces
//! - schema rejection before any chain query
//! - warm-session shortcut and its rollback, UI cancel, auto-proceed,
//!   duplicate ids
//! - every other kind end to end, and the embedded-context clamp

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tokio::time::timeout;

use passkey_confirm::channel::{SecureChannelHub, SignerPort};
use passkey_confirm::credential::{
    AssertionOptions, AttestationOptions, Authenticator, CredentialCollector, CredentialStore,
    PasskeySelection, RawCredential, RawPrfResults, StoredAuthenticator,
};
use passkey_confirm::error::{ChainError, ChannelError, CredentialError, FreshnessError, SessionError};
use passkey_confirm::freshness::{FreshnessProvider, VrfEngine, VrfOutput};
use passkey_confirm::nonce::NonceSequencer;
use passkey_confirm::orchestrator::{
    Collaborators, ConfirmUi, ConfirmationOrchestrator, ResponseSink, UiDecision,
};
use passkey_confirm::policy::{
    Behavior, ConfirmationPolicy, EmbeddingContext, MemoryPreferenceStore, UiMode,
};
use passkey_confirm::rpc::{AccessKeyInfo, BlockHeader, BlockInfo, ChainRpc};
use passkey_confirm::sanitize::UiHandle;
use passkey_confirm::session::{SessionKeyDispenser, WarmSessionLedger, WarmSessionPolicy};
use passkey_confirm::types::{
    ConfirmationRequest, ControlMessage, TransactionInput, WarmSessionGrant, compute_intent_digest,
};

const ACCOUNT: &str = "alice.testnet";
const PUBLIC_KEY: &str = "ed25519:8hSHprDq2StXwMtNd43wDTXQYsjXcD4MJTXQYsjXcc";
const TIMEOUT: Duration = Duration::from_secs(5);

// ── Stubs ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct StubRpc {
    fail: bool,
    access_key_calls: AtomicUsize,
    block_calls: AtomicUsize,
}

impl StubRpc {
    fn calls(&self) -> usize {
        self.access_key_calls.load(Ordering::SeqCst) + self.block_calls.load(Ordering::SeqCst)
    }

    fn unavailable(method: &str) -> ChainError {
        ChainError::RequestFailed {
            method: method.to_string(),
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl ChainRpc for StubRpc {
    async fn view_block(&self) -> Result<BlockInfo, ChainError> {
        let n = self.block_calls.fetch_add(1, Ordering::SeqCst) as u64;
        if self.fail {
            return Err(Self::unavailable("block"));
        }
        Ok(BlockInfo {
            header: BlockHeader {
                height: 1000 + n,
                hash: format!("hash-{}", 1000 + n),
            },
        })
    }

    async fn view_access_key(
        &self,
        _account_id: &str,
        _public_key: &str,
    ) -> Result<AccessKeyInfo, ChainError> {
        self.access_key_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Self::unavailable("query"));
        }
        Ok(AccessKeyInfo {
            nonce: 100,
            block_height: 999,
            block_hash: "hash-999".to_string(),
        })
    }

    async fn send_transaction(&self, _signed_tx_base64: &str) -> Result<Value, ChainError> {
        Ok(json!({}))
    }
}

#[derive(Default)]
struct StubVrf {
    /// Evaluations beyond this count fail.
    fail_after: Option<usize>,
    calls: AtomicUsize,
    keypair_calls: AtomicUsize,
}

impl StubVrf {
    fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst) + self.keypair_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VrfEngine for StubVrf {
    async fn evaluate(&self, input: &[u8]) -> Result<VrfOutput, FreshnessError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_after.is_some_and(|limit| n > limit) {
            return Err(FreshnessError::GenerationFailed("vrf worker busy".to_string()));
        }
        Ok(VrfOutput {
            output: input.to_vec(),
            proof: vec![1; 16],
            public_key: vec![2; 32],
        })
    }

    async fn evaluate_with_new_keypair(&self, input: &[u8]) -> Result<VrfOutput, FreshnessError> {
        self.keypair_calls.fetch_add(1, Ordering::SeqCst);
        Ok(VrfOutput {
            output: input.to_vec(),
            proof: vec![3; 16],
            public_key: vec![4; 32],
        })
    }
}

#[derive(Default)]
struct StubAuthenticator {
    omit_prf: bool,
    calls: AtomicUsize,
    /// Challenge of every prompt, in order.
    challenges: Mutex<Vec<Vec<u8>>>,
}

impl StubAuthenticator {
    fn credential(&self, challenge: &[u8]) -> RawCredential {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.challenges.lock().unwrap().push(challenge.to_vec());
        RawCredential {
            id: "cred-1".to_string(),
            raw_id: vec![1, 2, 3],
            credential_type: "public-key".to_string(),
            client_data_json: br#"{"type":"webauthn.get"}"#.to_vec(),
            authenticator_data: Some(vec![5; 37]),
            signature: Some(vec![6; 64]),
            prf: (!self.omit_prf).then(|| RawPrfResults {
                first: Some(vec![7; 32]),
                second: Some(vec![8; 32]),
            }),
            ..RawCredential::default()
        }
    }
}

#[async_trait]
impl Authenticator for StubAuthenticator {
    async fn get_assertion(
        &self,
        options: &AssertionOptions,
    ) -> Result<RawCredential, CredentialError> {
        Ok(self.credential(&options.challenge))
    }

    async fn create_attestation(
        &self,
        options: &AttestationOptions,
    ) -> Result<RawCredential, CredentialError> {
        let mut raw = self.credential(&options.challenge);
        raw.attestation_object = Some(vec![0xa0]);
        Ok(raw)
    }
}

struct StubStore {
    wrong_passkey: bool,
}

#[async_trait]
impl CredentialStore for StubStore {
    async fn get_authenticators_by_user(
        &self,
        _account_id: &str,
    ) -> Result<Vec<StoredAuthenticator>, CredentialError> {
        Ok(vec![StoredAuthenticator {
            credential_id: "cred-1".to_string(),
            device_number: 1,
            transports: vec!["internal".to_string()],
        }])
    }

    async fn ensure_current_passkey(
        &self,
        _account_id: &str,
        authenticators: Vec<StoredAuthenticator>,
    ) -> Result<PasskeySelection, CredentialError> {
        if self.wrong_passkey {
            return Ok(PasskeySelection {
                authenticators_for_prompt: vec![],
                wrong_passkey_error: Some("This passkey belongs to another account".to_string()),
            });
        }
        Ok(PasskeySelection {
            authenticators_for_prompt: authenticators,
            wrong_passkey_error: None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum UiScript {
    Proceed,
    Cancel,
    /// Never decides.
    Hang,
}

struct StubUi {
    script: UiScript,
    next_handle: AtomicU64,
    mounted: AtomicUsize,
    unmounted: AtomicUsize,
    policies: Mutex<Vec<ConfirmationPolicy>>,
}

#[async_trait]
impl ConfirmUi for StubUi {
    async fn mount(
        &self,
        _request: &ConfirmationRequest,
        policy: &ConfirmationPolicy,
    ) -> UiHandle {
        self.mounted.fetch_add(1, Ordering::SeqCst);
        self.policies.lock().unwrap().push(*policy);
        UiHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    async fn decision(&self, _handle: UiHandle) -> UiDecision {
        match self.script {
            UiScript::Proceed => UiDecision::Proceed,
            UiScript::Cancel => UiDecision::Cancel,
            UiScript::Hang => std::future::pending().await,
        }
    }

    async fn unmount(&self, _handle: UiHandle) {
        self.unmounted.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<Value>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<Value> {
        self.messages.lock().unwrap().clone()
    }

    fn only(&self) -> Value {
        let messages = self.messages();
        assert_eq!(messages.len(), 1, "expected exactly one response: {messages:?}");
        messages.into_iter().next().unwrap()
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn post(&self, message: Value) -> Result<(), ChannelError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
struct CountingDispenser {
    /// Never finishes a dispense once it has started.
    hang: bool,
    calls: AtomicUsize,
    reclaimed: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionKeyDispenser for CountingDispenser {
    async fn dispense(
        &self,
        _grant: &WarmSessionGrant,
        _account_id: &str,
    ) -> Result<(), SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn reclaim(&self, grant: &WarmSessionGrant, _account_id: &str) {
        self.reclaimed.lock().unwrap().push(grant.session_id.clone());
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Setup {
    policy: ConfirmationPolicy,
    ui: UiScript,
    omit_prf: bool,
    wrong_passkey: bool,
    chain_down: bool,
    vrf_fail_after: Option<usize>,
    with_signer: bool,
    dispense_hangs: bool,
    embedding: EmbeddingContext,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            policy: ConfirmationPolicy {
                ui_mode: UiMode::Skip,
                ..ConfirmationPolicy::default()
            },
            ui: UiScript::Proceed,
            omit_prf: false,
            wrong_passkey: false,
            chain_down: false,
            vrf_fail_after: None,
            with_signer: false,
            dispense_hangs: false,
            embedding: EmbeddingContext::TopLevel,
        }
    }
}

struct Harness {
    orchestrator: Arc<ConfirmationOrchestrator>,
    rpc: Arc<StubRpc>,
    vrf: Arc<StubVrf>,
    authenticator: Arc<StubAuthenticator>,
    ui: Arc<StubUi>,
    sink: Arc<RecordingSink>,
    dispenser: Arc<CountingDispenser>,
    sequencer: Arc<NonceSequencer>,
    ledger: Arc<WarmSessionLedger>,
    signer: Option<SignerPort>,
}

async fn harness(setup: Setup) -> Harness {
    let rpc = Arc::new(StubRpc {
        fail: setup.chain_down,
        ..StubRpc::default()
    });
    let vrf = Arc::new(StubVrf {
        fail_after: setup.vrf_fail_after,
        ..StubVrf::default()
    });
    let authenticator = Arc::new(StubAuthenticator {
        omit_prf: setup.omit_prf,
        ..StubAuthenticator::default()
    });
    let ui = Arc::new(StubUi {
        script: setup.ui,
        next_handle: AtomicU64::new(1),
        mounted: AtomicUsize::new(0),
        unmounted: AtomicUsize::new(0),
        policies: Mutex::new(Vec::new()),
    });
    let sink = Arc::new(RecordingSink::default());
    let dispenser = Arc::new(CountingDispenser {
        hang: setup.dispense_hangs,
        ..CountingDispenser::default()
    });
    let ledger = Arc::new(WarmSessionLedger::new(WarmSessionPolicy::default()));

    let sequencer = Arc::new(NonceSequencer::new(Duration::from_secs(30)));
    sequencer.initialize(ACCOUNT, PUBLIC_KEY).await;

    let (secure_channel, signer) = if setup.with_signer {
        let (hub, port) = SecureChannelHub::new(Duration::from_secs(2));
        (Some(Arc::new(hub)), Some(port))
    } else {
        (None, None)
    };

    let deps = Collaborators {
        rpc: rpc.clone(),
        sequencer: sequencer.clone(),
        freshness: Arc::new(FreshnessProvider::new(vrf.clone())),
        credentials: Arc::new(CredentialCollector::new(
            authenticator.clone(),
            Arc::new(StubStore {
                wrong_passkey: setup.wrong_passkey,
            }),
            "wallet.example.com",
        )),
        preferences: Arc::new(MemoryPreferenceStore::new(setup.policy)),
        ui: ui.clone(),
        sink: sink.clone(),
        warm_sessions: ledger.clone(),
        dispenser: dispenser.clone(),
        secure_channel,
    };

    Harness {
        orchestrator: Arc::new(ConfirmationOrchestrator::new(deps, setup.embedding)),
        rpc,
        vrf,
        authenticator,
        ui,
        sink,
        dispenser,
        sequencer,
        ledger,
        signer,
    }
}

fn request(request_id: &str, kind: &str, payload: Value) -> Value {
    json!({
        "schemaVersion": 2,
        "requestId": request_id,
        "type": kind,
        "summary": { "title": "Confirm" },
        "payload": payload,
    })
}

fn sign_request(request_id: &str) -> Value {
    request(
        request_id,
        "signTransaction",
        json!({
            "nearAccountId": ACCOUNT,
            "txSigningRequests": [{ "receiverId": "bob.testnet", "actions": [] }],
        }),
    )
}

/// The challenge the authenticator was last prompted with must be the
/// decoded `vrfChallenge.vrfOutput` of the response.
fn assert_signed_over_returned_challenge(h: &Harness, message: &Value) {
    let vrf_output = message["vrfChallenge"]["vrfOutput"]
        .as_str()
        .expect("response carries a vrfChallenge");
    let returned = URL_SAFE_NO_PAD.decode(vrf_output).unwrap();
    let signed = h.authenticator.challenges.lock().unwrap().last().cloned();
    assert_eq!(signed, Some(returned), "credential signed a different challenge");
}

fn assert_declined(message: &Value, code: &str) {
    assert_eq!(message["confirmed"], json!(false), "{message}");
    assert_eq!(message["errorCode"], json!(code), "{message}");
    assert!(message.get("credential").is_none());
    assert!(message.get("prfOutput").is_none());
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn sign_transaction_reserves_next_nonce_and_binds_fresh_block() {
    let h = harness(Setup::default()).await;

    h.orchestrator.handle(&sign_request("req-a")).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["requestId"], "req-a");
    assert_eq!(message["confirmed"], json!(true));
    assert_eq!(message["credential"]["id"], "cred-1");
    assert_eq!(message["transactionContext"]["nextNonce"], "101");
    assert_eq!(message["transactionContext"]["reservedNonces"], json!(["101"]));
    assert_eq!(message["transactionContext"]["nearPublicKeyStr"], PUBLIC_KEY);
    // Bootstrap bound to the turn block, refresh to the next one.
    assert_eq!(message["transactionContext"]["txBlockHeight"], "1000");
    assert_eq!(message["vrfChallenge"]["blockHeight"], "1001");
    assert!(message["vrfChallenge"]["intentDigest"].is_string());
    assert!(message.get("prfOutput").is_none());
    assert!(message.get("_confirmHandle").is_none());

    assert_eq!(h.rpc.access_key_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sequencer.reserved(), vec!["101".to_string()]);
    assert!(h.orchestrator.pending_requests().is_empty());
    assert_signed_over_returned_challenge(&h, &message);
}

#[tokio::test]
async fn vrf_binding_uses_digest_of_the_signed_transactions() {
    let h = harness(Setup::default()).await;

    h.orchestrator.handle(&sign_request("req-digest")).await.unwrap();

    let expected = compute_intent_digest(&[TransactionInput {
        receiver_id: "bob.testnet".to_string(),
        actions: vec![],
    }]);
    let message = h.sink.only();
    assert_eq!(message["vrfChallenge"]["intentDigest"], json!(expected));
}

#[tokio::test]
async fn caller_supplied_intent_digest_cannot_diverge_from_transactions() {
    let h = harness(Setup::default()).await;
    let mut raw = sign_request("req-forged");
    raw["summary"]["intentDigest"] = json!("forged-digest");

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_declined(&message, "validation_failed");
    assert!(message["error"].as_str().unwrap().contains("intentDigest"));
    assert_eq!(h.rpc.calls(), 0);
    assert_eq!(h.vrf.total_calls(), 0);
}

#[tokio::test]
async fn batch_reserves_one_nonce_per_transaction() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-batch",
        "signTransaction",
        json!({
            "nearAccountId": ACCOUNT,
            "txSigningRequests": [
                { "receiverId": "bob.testnet", "actions": [] },
                { "receiverId": "carol.testnet", "actions": [] },
                { "receiverId": "dave.testnet", "actions": [] },
            ],
        }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(
        message["transactionContext"]["reservedNonces"],
        json!(["101", "102", "103"])
    );
}

#[tokio::test]
async fn missing_prf_result_rejects_without_posting() {
    let h = harness(Setup {
        omit_prf: true,
        ..Setup::default()
    })
    .await;

    let err = h
        .orchestrator
        .handle(&sign_request("req-b"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Missing PRF result"), "{err}");
    assert!(h.sink.messages().is_empty());
    assert!(h.sequencer.reserved().is_empty());
    assert!(h.orchestrator.pending_requests().is_empty());
}

#[tokio::test]
async fn cancel_during_seed_handoff_releases_reserved_nonces() {
    let mut h = harness(Setup {
        with_signer: true,
        ..Setup::default()
    })
    .await;
    let mut port = h.signer.take().unwrap();

    let orchestrator = h.orchestrator.clone();
    let sequencer = h.sequencer.clone();
    let signer = tokio::spawn(async move {
        let envelope = port.inbox.recv().await.expect("attach envelope");
        assert!(matches!(envelope.message, ControlMessage::Attach { .. }));
        let reserved = sequencer.reserved();
        assert!(orchestrator.cancel("req-c"));
        (reserved, port)
    });

    timeout(TIMEOUT, h.orchestrator.handle(&sign_request("req-c")))
        .await
        .expect("handle timed out")
        .unwrap();
    let (reserved_at_cancel, _port) = signer.await.unwrap();

    assert_eq!(reserved_at_cancel, vec!["101".to_string()]);
    assert!(h.sequencer.reserved().is_empty());
    assert!(!h.sequencer.is_reserved("101"));

    let message = h.sink.only();
    assert_declined(&message, "user_cancelled");
    assert!(message.get("transactionContext").is_none());
    assert!(!h.orchestrator.cancel("req-c"));
}

#[tokio::test]
async fn wrong_schema_version_is_rejected_before_any_chain_query() {
    let h = harness(Setup::default()).await;
    let mut raw = sign_request("req-d");
    raw["schemaVersion"] = json!(1);

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["requestId"], "req-d");
    assert_declined(&message, "validation_failed");
    assert!(
        message["error"]
            .as_str()
            .unwrap()
            .contains("schemaVersion must be 2")
    );
    assert_eq!(h.rpc.calls(), 0);
    assert_eq!(h.authenticator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn warm_session_skips_authenticator_and_freshness() {
    let h = harness(Setup::default()).await;
    h.ledger.grant("session-1", ACCOUNT);
    let raw = request(
        "req-warm",
        "signTransaction",
        json!({
            "nearAccountId": ACCOUNT,
            "txSigningRequests": [{ "receiverId": "bob.testnet", "actions": [] }],
            "signingAuthMode": "warmSession",
            "sessionId": "session-1",
        }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert_eq!(message["warmSession"]["remainingUses"], json!(2));
    assert_eq!(message["transactionContext"]["nextNonce"], "101");
    assert!(message.get("credential").is_none());
    assert!(message.get("vrfChallenge").is_none());
    assert_eq!(h.dispenser.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.authenticator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.vrf.total_calls(), 0);
}

#[tokio::test]
async fn unknown_warm_session_is_declined() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-cold",
        "signTransaction",
        json!({
            "nearAccountId": ACCOUNT,
            "txSigningRequests": [{ "receiverId": "bob.testnet", "actions": [] }],
            "signingAuthMode": "warmSession",
            "sessionId": "never-granted",
        }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    assert_declined(&h.sink.only(), "warm_session_unavailable");
    assert_eq!(h.dispenser.calls.load(Ordering::SeqCst), 0);
    assert!(h.dispenser.reclaimed.lock().unwrap().is_empty());
    assert!(h.sequencer.reserved().is_empty());
}

#[tokio::test]
async fn cancel_after_dispense_returns_the_warm_session_use() {
    let h = harness(Setup {
        dispense_hangs: true,
        ..Setup::default()
    })
    .await;
    h.ledger.grant("session-3", ACCOUNT);
    let raw = request(
        "req-warm-cancel",
        "signTransaction",
        json!({
            "nearAccountId": ACCOUNT,
            "txSigningRequests": [{ "receiverId": "bob.testnet", "actions": [] }],
            "signingAuthMode": "warmSession",
            "sessionId": "session-3",
        }),
    );

    let flow = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle(&raw).await })
    };
    timeout(TIMEOUT, async {
        while h.dispenser.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("dispense never started");
    assert_eq!(h.ledger.status("session-3").unwrap().remaining_uses, 2);

    assert!(h.orchestrator.cancel("req-warm-cancel"));
    timeout(TIMEOUT, flow)
        .await
        .expect("handle timed out")
        .unwrap()
        .unwrap();

    assert_declined(&h.sink.only(), "user_cancelled");
    assert_eq!(h.ledger.status("session-3").unwrap().remaining_uses, 3);
    assert_eq!(
        *h.dispenser.reclaimed.lock().unwrap(),
        vec!["session-3".to_string()]
    );
    assert!(h.sequencer.reserved().is_empty());
}

#[tokio::test]
async fn webauthn_sign_with_session_id_opens_warm_session() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-open",
        "signTransaction",
        json!({
            "nearAccountId": ACCOUNT,
            "txSigningRequests": [{ "receiverId": "bob.testnet", "actions": [] }],
            "sessionId": "session-2",
        }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["warmSession"]["sessionId"], "session-2");
    assert_eq!(h.ledger.status("session-2").unwrap().remaining_uses, 3);
}

#[tokio::test]
async fn user_cancel_in_modal_closes_ui_and_reserves_nothing() {
    let h = harness(Setup {
        policy: ConfirmationPolicy::default(),
        ui: UiScript::Cancel,
        ..Setup::default()
    })
    .await;

    h.orchestrator.handle(&sign_request("req-ui")).await.unwrap();

    let message = h.sink.only();
    assert_declined(&message, "user_cancelled");
    assert!(message.get("_confirmHandle").is_none());
    assert_eq!(h.ui.mounted.load(Ordering::SeqCst), 1);
    assert_eq!(h.ui.unmounted.load(Ordering::SeqCst), 1);
    assert_eq!(h.authenticator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.rpc.calls(), 0);
}

#[tokio::test]
async fn auto_proceed_continues_without_a_click() {
    let h = harness(Setup {
        policy: ConfirmationPolicy {
            ui_mode: UiMode::Drawer,
            behavior: Behavior::AutoProceed,
            auto_proceed_delay_ms: 10,
            ..ConfirmationPolicy::default()
        },
        ui: UiScript::Hang,
        ..Setup::default()
    })
    .await;

    timeout(TIMEOUT, h.orchestrator.handle(&sign_request("req-auto")))
        .await
        .expect("auto-proceed never fired")
        .unwrap();

    assert_eq!(h.sink.only()["confirmed"], json!(true));
    assert_eq!(h.ui.unmounted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_request_id_is_rejected_while_pending() {
    let h = harness(Setup {
        policy: ConfirmationPolicy::default(),
        ui: UiScript::Hang,
        ..Setup::default()
    })
    .await;

    let first = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle(&sign_request("dup")).await })
    };
    timeout(TIMEOUT, async {
        while h.ui.mounted.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("first request never reached the UI");
    assert_eq!(h.orchestrator.pending_requests(), vec!["dup".to_string()]);

    let err = h.orchestrator.handle(&sign_request("dup")).await.unwrap_err();
    assert!(err.to_string().contains("already pending"), "{err}");
    assert!(h.sink.messages().is_empty());
    assert_eq!(h.orchestrator.pending_requests(), vec!["dup".to_string()]);

    assert!(h.orchestrator.cancel("dup"));
    first.await.unwrap().unwrap();

    // Only the original request answers under its id.
    assert_declined(&h.sink.only(), "user_cancelled");
    assert_eq!(h.ui.mounted.load(Ordering::SeqCst), 1);
    assert_eq!(h.ui.unmounted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chain_outage_is_declined_before_prompting() {
    let h = harness(Setup {
        chain_down: true,
        ..Setup::default()
    })
    .await;

    h.orchestrator.handle(&sign_request("req-down")).await.unwrap();

    assert_declined(&h.sink.only(), "chain_unavailable");
    assert_eq!(h.authenticator.calls.load(Ordering::SeqCst), 0);
    assert!(h.sequencer.reserved().is_empty());
}

#[tokio::test]
async fn failed_refresh_falls_back_to_bootstrap_challenge() {
    let h = harness(Setup {
        vrf_fail_after: Some(1),
        ..Setup::default()
    })
    .await;

    h.orchestrator.handle(&sign_request("req-fb")).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert_eq!(message["vrfChallenge"]["blockHeight"], "1000");
    assert_eq!(h.vrf.calls.load(Ordering::SeqCst), 2);
    assert_signed_over_returned_challenge(&h, &message);
}

#[tokio::test]
async fn wrong_passkey_is_declined_without_prompt() {
    let h = harness(Setup {
        wrong_passkey: true,
        ..Setup::default()
    })
    .await;

    h.orchestrator.handle(&sign_request("req-wp")).await.unwrap();

    let message = h.sink.only();
    assert_declined(&message, "wrong_passkey");
    assert!(message["error"].as_str().unwrap().contains("another account"));
    assert_eq!(h.authenticator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn local_only_decrypt_returns_prf_output() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-dec",
        "decryptPrivateKey",
        json!({ "nearAccountId": ACCOUNT, "flow": "localOnly" }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert!(message["prfOutput"].as_str().is_some_and(|s| !s.is_empty()));
    assert!(message.get("vrfChallenge").is_none());
    assert!(message.get("transactionContext").is_none());
    assert_eq!(h.rpc.calls(), 0);
    // Decrypt skips the UI unless explicitly overridden.
    assert_eq!(h.ui.mounted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn worker_only_decrypt_withholds_prf_output() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-dec-w",
        "decryptPrivateKey",
        json!({ "nearAccountId": ACCOUNT }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert!(message.get("prfOutput").is_none());
}

#[tokio::test]
async fn registration_uses_keypair_bootstrap_path() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-reg",
        "registerAccount",
        json!({ "nearAccountId": "new-user.testnet", "deviceNumber": 1 }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert!(message["credential"]["response"]["attestationObject"].is_string());
    assert!(message["vrfChallenge"].is_object());
    assert!(message.get("transactionContext").is_none());
    // One keypair minted at bootstrap, then a rebind that evaluates with it.
    assert_eq!(h.vrf.keypair_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.vrf.calls.load(Ordering::SeqCst), 1);
    assert_eq!(message["vrfChallenge"]["blockHeight"], "1001");
    assert_signed_over_returned_challenge(&h, &message);
}

#[tokio::test]
async fn repeated_registration_mints_a_fresh_keypair_each_time() {
    let h = harness(Setup::default()).await;
    for request_id in ["req-reg-1", "req-reg-2"] {
        let raw = request(
            request_id,
            "registerAccount",
            json!({ "nearAccountId": "new-user.testnet" }),
        );
        h.orchestrator.handle(&raw).await.unwrap();
    }

    assert_eq!(h.sink.messages().len(), 2);
    assert_eq!(h.vrf.keypair_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.vrf.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn link_device_reserves_nonces_and_returns_transaction_context() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-link",
        "linkDevice",
        json!({
            "nearAccountId": ACCOUNT,
            "deviceNumber": 2,
            "txSigningRequests": [
                { "receiverId": ACCOUNT, "actions": [] },
                { "receiverId": "device-registry.testnet", "actions": [] },
            ],
        }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert_eq!(message["credential"]["id"], "cred-1");
    assert_eq!(
        message["transactionContext"]["reservedNonces"],
        json!(["101", "102"])
    );
    assert_eq!(message["transactionContext"]["nextNonce"], "101");
    assert_eq!(message["vrfChallenge"]["blockHeight"], "1001");
    assert!(message.get("prfOutput").is_none());
    assert_eq!(
        h.sequencer.reserved(),
        vec!["101".to_string(), "102".to_string()]
    );
    assert_signed_over_returned_challenge(&h, &message);
}

#[tokio::test]
async fn sign_message_binds_the_message_without_touching_nonces() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-msg",
        "signMessage",
        json!({
            "nearAccountId": ACCOUNT,
            "message": "Sign in to app.example",
            "recipient": "app.example",
        }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert!(message["vrfChallenge"]["intentDigest"].is_string());
    assert!(message.get("transactionContext").is_none());
    assert!(message.get("prfOutput").is_none());
    assert_eq!(h.rpc.access_key_calls.load(Ordering::SeqCst), 0);
    assert!(h.sequencer.reserved().is_empty());
    assert_signed_over_returned_challenge(&h, &message);
}

#[tokio::test]
async fn show_private_key_collects_credential_without_chain_or_vrf() {
    let h = harness(Setup::default()).await;
    let raw = request(
        "req-show",
        "showPrivateKey",
        json!({ "nearAccountId": ACCOUNT }),
    );

    h.orchestrator.handle(&raw).await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert_eq!(message["credential"]["id"], "cred-1");
    assert!(message.get("prfOutput").is_none());
    assert!(message.get("vrfChallenge").is_none());
    assert!(message.get("transactionContext").is_none());
    assert_eq!(h.rpc.calls(), 0);
    assert_eq!(h.vrf.total_calls(), 0);
    assert_eq!(h.authenticator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn embedded_context_forces_a_click_for_high_risk_kinds() {
    let h = harness(Setup {
        policy: ConfirmationPolicy {
            ui_mode: UiMode::Skip,
            behavior: Behavior::AutoProceed,
            ..ConfirmationPolicy::default()
        },
        embedding: EmbeddingContext::Embedded,
        ..Setup::default()
    })
    .await;
    let register = request(
        "req-emb-reg",
        "registerAccount",
        json!({ "nearAccountId": "new-user.testnet" }),
    );
    let link = request(
        "req-emb-link",
        "linkDevice",
        json!({ "nearAccountId": ACCOUNT, "deviceNumber": 2 }),
    );

    h.orchestrator.handle(&register).await.unwrap();
    h.orchestrator.handle(&link).await.unwrap();

    let policies = h.ui.policies.lock().unwrap().clone();
    assert_eq!(policies.len(), 2);
    for policy in &policies {
        assert_eq!(policy.ui_mode, UiMode::Modal);
        assert_eq!(policy.behavior, Behavior::RequireClick);
    }
    assert_eq!(h.ui.unmounted.load(Ordering::SeqCst), 2);
    assert!(h.sink.messages().iter().all(|m| m["confirmed"] == json!(true)));

    // Low-risk kinds keep the stored skip.
    h.orchestrator.handle(&sign_request("req-emb-sign")).await.unwrap();
    assert_eq!(h.ui.mounted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn seed_reaches_signer_and_never_the_response() {
    let mut h = harness(Setup {
        with_signer: true,
        ..Setup::default()
    })
    .await;
    let mut port = h.signer.take().unwrap();

    let signer = tokio::spawn(async move {
        let mut endpoint = None;
        while let Some(envelope) = port.inbox.recv().await {
            match envelope.message {
                ControlMessage::Attach { session_id } => {
                    endpoint = envelope.endpoint;
                    port.acks
                        .send(ControlMessage::AttachOk { session_id })
                        .await
                        .unwrap();
                }
                ControlMessage::SeedReady { .. } => {
                    let seed = endpoint.as_mut().unwrap().take().await.unwrap();
                    return seed.wrap_key_seed.expose_secret().to_string();
                }
                ControlMessage::AttachOk { .. } => {}
            }
        }
        panic!("signer inbox closed before SEED_READY");
    });

    timeout(TIMEOUT, h.orchestrator.handle(&sign_request("req-seed")))
        .await
        .expect("handle timed out")
        .unwrap();
    let seed = signer.await.unwrap();

    let message = h.sink.only();
    assert_eq!(message["confirmed"], json!(true));
    assert!(!seed.is_empty());
    assert!(!message.to_string().contains(&seed));
}
