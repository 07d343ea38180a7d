//! Confirmation orchestrator.
//!
//! Drives one request through the flow:
//!
//! ```text
//! Validating ─► PolicyResolved ─► [UiWait] ─► FreshnessBinding ─► Collecting
//!                                                                   │
//!                               Responding ◄── NonceReserving ◄─────┘
//! ```
//!
//! Any state after `PolicyResolved` can end in `Cancelled` (user or caller
//! abort) or `Failed`. Both terminal paths release reserved nonces, return
//! a consumed warm-session use, detach the secure channel and close the UI
//! before the single response is posted.
//! A missing PRF result is the one failure that posts nothing and is
//! returned to the caller instead.
//!
//! Per-kind flows live in [`flows`].

mod flows;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{AbortController, AbortSignal, SecureChannelHub};
use crate::credential::CredentialCollector;
use crate::error::{ChannelError, ConfirmErrorCode, Error, ValidationError};
use crate::freshness::FreshnessProvider;
use crate::nonce::NonceSequencer;
use crate::policy::{self, Behavior, ConfirmationPolicy, EmbeddingContext, PreferenceStore};
use crate::rpc::ChainRpc;
use crate::sanitize::{self, Transferable, UiHandle, redact_sensitive_detail};
use crate::session::{SessionKeyDispenser, WarmSessionLedger};
use crate::types::{ConfirmationRequest, ConfirmationResponse, WarmSessionGrant};

/// Flow states, in the order a successful request passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Validating,
    PolicyResolved,
    UiWait,
    Collecting,
    FreshnessBinding,
    NonceReserving,
    Responding,
    Cancelled,
    Failed,
}

impl ConfirmState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::PolicyResolved => "policy_resolved",
            Self::UiWait => "ui_wait",
            Self::Collecting => "collecting",
            Self::FreshnessBinding => "freshness_binding",
            Self::NonceReserving => "nonce_reserving",
            Self::Responding => "responding",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Responding | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for ConfirmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User decision reported by the confirmation UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiDecision {
    Proceed,
    Cancel,
}

/// The confirmation surface (modal or drawer).
#[async_trait]
pub trait ConfirmUi: Send + Sync {
    /// Show the summary for `request` styled by `policy`.
    async fn mount(&self, request: &ConfirmationRequest, policy: &ConfirmationPolicy)
    -> UiHandle;

    /// Resolves once the user confirms or cancels.
    async fn decision(&self, handle: UiHandle) -> UiDecision;

    async fn unmount(&self, handle: UiHandle);
}

/// Destination of the single response per request.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn post(&self, message: serde_json::Value) -> Result<(), ChannelError>;
}

/// [`ResponseSink`] over an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<serde_json::Value>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<serde_json::Value>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn post(&self, message: serde_json::Value) -> Result<(), ChannelError> {
        self.tx
            .send(message)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "confirmation_response".to_string(),
                reason: e.to_string(),
            })
    }
}

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub rpc: Arc<dyn ChainRpc>,
    pub sequencer: Arc<NonceSequencer>,
    pub freshness: Arc<FreshnessProvider>,
    pub credentials: Arc<CredentialCollector>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub ui: Arc<dyn ConfirmUi>,
    pub sink: Arc<dyn ResponseSink>,
    pub warm_sessions: Arc<WarmSessionLedger>,
    pub dispenser: Arc<dyn SessionKeyDispenser>,
    /// Absent when the host has no separate signing worker.
    pub secure_channel: Option<Arc<SecureChannelHub>>,
}

/// Why a flow stopped before producing an approval.
#[derive(Debug)]
enum Stop {
    /// Ends in a `confirmed:false` response.
    Declined {
        code: ConfirmErrorCode,
        message: String,
    },
    /// Ends without any response.
    Fatal(Error),
}

impl Stop {
    fn declined(code: ConfirmErrorCode, message: impl Into<String>) -> Self {
        Self::Declined {
            code,
            message: redact_sensitive_detail(&message.into()),
        }
    }
}

/// Side effects to undo when a flow does not reach `Responding`.
#[derive(Debug, Default)]
struct Rollback {
    nonces: Vec<String>,
    channel_session: Option<String>,
    ui: Option<UiHandle>,
    /// Consumed warm-session use and its account, until the flow succeeds.
    warm_grant: Option<(WarmSessionGrant, String)>,
}

type Pending = Mutex<HashMap<String, AbortController>>;

/// Removes a request from the pending map when its flow ends.
struct PendingEntry<'a> {
    pending: &'a Pending,
    request_id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.request_id);
    }
}

/// Runs confirmation requests end to end.
pub struct ConfirmationOrchestrator {
    deps: Collaborators,
    embedding: EmbeddingContext,
    pending: Pending,
}

impl ConfirmationOrchestrator {
    pub fn new(deps: Collaborators, embedding: EmbeddingContext) -> Self {
        Self {
            deps,
            embedding,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, AbortController>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request ids whose flow has not finished yet.
    pub fn pending_requests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Abort an in-flight request. Returns false if it is not pending.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.pending().get(request_id) {
            Some(controller) => {
                controller.abort();
                tracing::info!(request_id, "confirmation cancelled by caller");
                true
            }
            None => false,
        }
    }

    fn register(&self, request_id: &str) -> Result<(PendingEntry<'_>, AbortSignal), ValidationError> {
        let mut pending = self.pending();
        if pending.contains_key(request_id) {
            return Err(ValidationError::DuplicateRequestId(request_id.to_string()));
        }
        let controller = AbortController::new();
        let signal = controller.signal();
        pending.insert(request_id.to_string(), controller);
        Ok((
            PendingEntry {
                pending: &self.pending,
                request_id: request_id.to_string(),
            },
            signal,
        ))
    }

    fn enter(request_id: &str, state: ConfirmState) {
        tracing::debug!(request_id, state = %state, "confirmation state");
    }

    /// Handle one raw request envelope.
    ///
    /// Exactly one response is posted to the sink, with two exceptions that
    /// post nothing and return the error instead: the authenticator omitting
    /// the PRF result, and a `requestId` that is already pending (its
    /// correlation id belongs to the original request). A sink failure is
    /// also returned.
    pub async fn handle(&self, raw: &serde_json::Value) -> Result<(), Error> {
        let request = match ConfirmationRequest::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                let request_id = ConfirmationRequest::peek_request_id(raw);
                tracing::warn!(request_id = %request_id, error = %e, "rejected confirmation request");
                let response = ConfirmationResponse::declined(
                    request_id,
                    ConfirmErrorCode::ValidationFailed,
                    e.to_string(),
                );
                return self.post(response).await;
            }
        };
        let request_id = request.request_id.clone();
        Self::enter(&request_id, ConfirmState::Validating);

        let (_entry, signal) = match self.register(&request_id) {
            Ok(registered) => registered,
            Err(e) => {
                tracing::warn!(request_id = %request_id, "duplicate confirmation request");
                return Err(e.into());
            }
        };

        let stored = self.deps.preferences.get_confirmation_config().await;
        let policy = policy::resolve(
            &stored,
            request.policy_override.as_ref(),
            request.kind(),
            self.embedding,
        );
        Self::enter(&request_id, ConfirmState::PolicyResolved);
        tracing::info!(
            request_id = %request_id,
            kind = %request.kind(),
            ui_mode = ?policy.ui_mode,
            behavior = ?policy.behavior,
            "confirmation started"
        );

        let rollback = Mutex::new(Rollback::default());
        let outcome = tokio::select! {
            biased;
            _ = signal.aborted() => Err(Stop::declined(
                ConfirmErrorCode::UserCancelled,
                "Confirmation was cancelled",
            )),
            result = self.run(&request, &policy, &rollback) => result,
        };
        let mut rollback = rollback.into_inner().unwrap_or_else(|e| e.into_inner());

        match outcome {
            Ok(response) => {
                Self::enter(&request_id, ConfirmState::Responding);
                if let Some(handle) = rollback.ui.take() {
                    self.deps.ui.unmount(handle).await;
                }
                self.post(response).await
            }
            Err(Stop::Declined { code, message }) => {
                let state = if code == ConfirmErrorCode::UserCancelled {
                    ConfirmState::Cancelled
                } else {
                    ConfirmState::Failed
                };
                Self::enter(&request_id, state);
                tracing::info!(
                    request_id = %request_id,
                    code = code.as_str(),
                    error = %message,
                    "confirmation declined"
                );
                self.roll_back(&request_id, &mut rollback).await;
                self.post(ConfirmationResponse::declined(&request_id, code, message)).await
            }
            Err(Stop::Fatal(err)) => {
                Self::enter(&request_id, ConfirmState::Failed);
                tracing::error!(request_id = %request_id, error = %err, "confirmation aborted");
                self.roll_back(&request_id, &mut rollback).await;
                Err(err)
            }
        }
    }

    /// Undo side effects.
    async fn roll_back(&self, request_id: &str, rollback: &mut Rollback) {
        for nonce in &rollback.nonces {
            self.deps.sequencer.release(nonce);
        }
        if let Some((grant, account_id)) = rollback.warm_grant.take() {
            self.deps.dispenser.reclaim(&grant, &account_id).await;
            let remaining_uses = self.deps.warm_sessions.restore(&grant.session_id);
            tracing::debug!(
                request_id,
                session_id = %grant.session_id,
                ?remaining_uses,
                "returned warm session use"
            );
        }
        if let Some(session_id) = rollback.channel_session.take()
            && let Some(hub) = &self.deps.secure_channel
        {
            hub.detach(&session_id);
        }
        if let Some(handle) = rollback.ui.take() {
            self.deps.ui.unmount(handle).await;
        }
        if !rollback.nonces.is_empty() {
            tracing::debug!(
                request_id,
                released = rollback.nonces.len(),
                "released reserved nonces"
            );
        }
        rollback.nonces.clear();
    }

    /// Serialize, strip non-transferable values and post.
    ///
    /// The UI handle never crosses the boundary; the far side correlates by
    /// `requestId` alone.
    async fn post(&self, response: ConfirmationResponse) -> Result<(), Error> {
        let value = serde_json::to_value(&response).map_err(ChannelError::from)?;
        self.deps
            .sink
            .post(sanitize::sanitize(Transferable::from(value)))
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        request: &ConfirmationRequest,
        policy: &ConfirmationPolicy,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        if policy.shows_ui() {
            self.await_user(request, policy, rollback).await?;
        }
        self.dispatch(request, rollback).await
    }

    async fn await_user(
        &self,
        request: &ConfirmationRequest,
        policy: &ConfirmationPolicy,
        rollback: &Mutex<Rollback>,
    ) -> Result<(), Stop> {
        Self::enter(&request.request_id, ConfirmState::UiWait);
        let handle = self.deps.ui.mount(request, policy).await;
        lock(rollback).ui = Some(handle);

        let decision = match policy.behavior {
            Behavior::RequireClick => self.deps.ui.decision(handle).await,
            Behavior::AutoProceed => {
                let delay = Duration::from_millis(policy.auto_proceed_delay_ms);
                tokio::select! {
                    decision = self.deps.ui.decision(handle) => decision,
                    _ = tokio::time::sleep(delay) => UiDecision::Proceed,
                }
            }
        };

        match decision {
            UiDecision::Proceed => Ok(()),
            UiDecision::Cancel => Err(Stop::declined(
                ConfirmErrorCode::UserCancelled,
                "User rejected the confirmation",
            )),
        }
    }
}

fn lock(rollback: &Mutex<Rollback>) -> MutexGuard<'_, Rollback> {
    rollback.lock().unwrap_or_else(|e| e.into_inner())
}
