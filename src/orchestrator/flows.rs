//! Per-kind flows, entered once the user (or the policy) has approved.
//!
//! Chain-bound flows rebind freshness just before the authenticator prompt,
//! so the credential always signs the exact challenge the response carries.

use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};

use super::{ConfirmState, ConfirmationOrchestrator, Rollback, Stop, lock};
use crate::channel::SeedMaterial;
use crate::credential::{AssertionOutcome, CollectedCredential, PrfOutputs};
use crate::error::{ConfirmErrorCode, CredentialError, SessionError};
use crate::freshness::{ChallengePath, FreshnessChallenge, VrfInputData};
use crate::nonce::{BaseContext, BaseContextOptions};
use crate::types::{
    ConfirmationRequest, ConfirmationResponse, DecryptFlow, DecryptPrivateKeyPayload,
    LinkDevicePayload, RegisterAccountPayload, RequestPayload, ShowPrivateKeyPayload,
    SignMessagePayload, SignTransactionPayload, SigningAuthMode, compute_intent_digest,
};

const LOCAL_UNLOCK_DOMAIN: &[u8] = b"passkey_confirm_local_unlock_v1";

/// Freshness cache key for registration, kept apart from the account's
/// session bootstrap.
fn registration_key(account_id: &str) -> String {
    format!("reg:{account_id}")
}

/// Challenge for kinds that never touch the chain.
fn local_unlock_challenge(request_id: &str, account_id: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(LOCAL_UNLOCK_DOMAIN);
    hasher.update(request_id.as_bytes());
    hasher.update(account_id.as_bytes());
    hasher.finalize().to_vec()
}

fn message_digest(payload: &SignMessagePayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.recipient.as_bytes());
    hasher.update([0]);
    hasher.update(payload.message.as_bytes());
    if let Some(state) = &payload.state {
        hasher.update([0]);
        hasher.update(state.as_bytes());
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn credential_stop(err: CredentialError) -> Stop {
    if err.is_fatal() {
        return Stop::Fatal(err.into());
    }
    match err {
        CredentialError::Dismissed => Stop::declined(ConfirmErrorCode::UserCancelled, err.to_string()),
        other => Stop::declined(ConfirmErrorCode::CredentialFailed, other.to_string()),
    }
}

impl ConfirmationOrchestrator {
    pub(super) async fn dispatch(
        &self,
        request: &ConfirmationRequest,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        match &request.payload {
            RequestPayload::SignTransaction(p) => match p.signing_auth_mode {
                SigningAuthMode::WebAuthn => self.sign_transaction(request, p, rollback).await,
                SigningAuthMode::WarmSession => {
                    self.sign_with_warm_session(request, p, rollback).await
                }
            },
            RequestPayload::RegisterAccount(p) => self.register_account(request, p, rollback).await,
            RequestPayload::DecryptPrivateKey(p) => {
                self.decrypt_private_key(request, p, rollback).await
            }
            RequestPayload::SignMessage(p) => self.sign_message(request, p, rollback).await,
            RequestPayload::LinkDevice(p) => self.link_device(request, p, rollback).await,
            RequestPayload::ShowPrivateKey(p) => {
                self.show_private_key(request, p, rollback).await
            }
        }
    }

    async fn sign_transaction(
        &self,
        request: &ConfirmationRequest,
        payload: &SignTransactionPayload,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        let request_id = &request.request_id;
        let account_id = &payload.near_account_id;

        let base = self.turn_context(account_id).await?;
        let input = self.vrf_input(account_id, base.block_height, &base.block_hash, None);
        self.session_bootstrap(account_id, &input, ChallengePath::Session).await?;

        let bound_input = VrfInputData {
            intent_digest: Some(compute_intent_digest(&payload.tx_signing_requests)),
            ..input
        };
        let challenge = self
            .bind_freshness(request_id, account_id, bound_input, ChallengePath::Session)
            .await?;
        let collected = self
            .collect_assertion(request_id, account_id, &challenge.webauthn_challenge())
            .await?;

        let nonces = self.reserve_nonces(request_id, request.payload.nonce_count(), rollback)?;
        self.deliver_seed(request_id, &collected.prf, rollback).await?;

        let warm_session = payload
            .session_id
            .as_deref()
            .map(|session_id| self.deps.warm_sessions.grant(session_id, account_id));

        Ok(ConfirmationResponse {
            credential: Some(collected.record),
            vrf_challenge: Some(challenge),
            transaction_context: Some(base.to_transaction_context(&nonces)),
            warm_session,
            ..ConfirmationResponse::approved(request_id)
        })
    }

    /// Warm-session shortcut: no authenticator prompt and no freshness
    /// binding. The session key is dispensed exactly once per request.
    async fn sign_with_warm_session(
        &self,
        request: &ConfirmationRequest,
        payload: &SignTransactionPayload,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        let request_id = &request.request_id;
        let account_id = &payload.near_account_id;
        let session_id = payload.session_id.as_deref().unwrap_or_default();

        let base = self.turn_context(account_id).await?;

        let unavailable =
            |e: SessionError| Stop::declined(ConfirmErrorCode::WarmSessionUnavailable, e.to_string());
        let grant = self
            .deps
            .warm_sessions
            .consume(session_id, account_id)
            .map_err(unavailable)?;
        lock(rollback).warm_grant = Some((grant.clone(), account_id.clone()));
        self.deps
            .dispenser
            .dispense(&grant, account_id)
            .await
            .map_err(unavailable)?;
        tracing::debug!(
            request_id = %request_id,
            session_id,
            remaining_uses = grant.remaining_uses,
            "warm session key dispensed"
        );

        let nonces = self.reserve_nonces(request_id, request.payload.nonce_count(), rollback)?;
        lock(rollback).warm_grant = None;

        Ok(ConfirmationResponse {
            transaction_context: Some(base.to_transaction_context(&nonces)),
            warm_session: Some(grant),
            ..ConfirmationResponse::approved(request_id)
        })
    }

    async fn register_account(
        &self,
        request: &ConfirmationRequest,
        payload: &RegisterAccountPayload,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        let request_id = &request.request_id;
        let account_id = &payload.near_account_id;
        let session_key = registration_key(account_id);

        // One keypair per registration attempt; the rebind evaluates with it.
        let block = self.latest_block().await?;
        let input = self.vrf_input(account_id, block.0, &block.1, None);
        self.deps.freshness.forget(&session_key);
        self.session_bootstrap(&session_key, &input, ChallengePath::KeypairBootstrap).await?;

        let challenge = self
            .bind_freshness(request_id, &session_key, input, ChallengePath::KeypairBootstrap)
            .await?;
        Self::enter(request_id, ConfirmState::Collecting);
        let collected = self
            .deps
            .credentials
            .collect_attestation(account_id, &challenge.webauthn_challenge())
            .await
            .map_err(credential_stop)?;
        self.deliver_seed(request_id, &collected.prf, rollback).await?;

        tracing::info!(
            request_id = %request_id,
            account_id = %account_id,
            device_number = ?payload.device_number,
            "registration credential collected"
        );
        Ok(ConfirmationResponse {
            credential: Some(collected.record),
            vrf_challenge: Some(challenge),
            ..ConfirmationResponse::approved(request_id)
        })
    }

    async fn decrypt_private_key(
        &self,
        request: &ConfirmationRequest,
        payload: &DecryptPrivateKeyPayload,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        let request_id = &request.request_id;
        let account_id = &payload.near_account_id;

        let challenge = local_unlock_challenge(request_id, account_id);
        let collected = self
            .collect_assertion(request_id, account_id, &challenge)
            .await?;

        let prf_output = match payload.flow {
            DecryptFlow::LocalOnly => Some(collected.prf.first.expose_secret().to_string()),
            DecryptFlow::WorkerOnly => {
                self.deliver_seed(request_id, &collected.prf, rollback).await?;
                None
            }
        };

        Ok(ConfirmationResponse {
            credential: Some(collected.record),
            prf_output,
            ..ConfirmationResponse::approved(request_id)
        })
    }

    async fn sign_message(
        &self,
        request: &ConfirmationRequest,
        payload: &SignMessagePayload,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        let request_id = &request.request_id;
        let account_id = &payload.near_account_id;

        let block = self.latest_block().await?;
        let input = self.vrf_input(account_id, block.0, &block.1, None);
        self.session_bootstrap(account_id, &input, ChallengePath::Session).await?;

        let bound_input = VrfInputData {
            intent_digest: Some(message_digest(payload)),
            ..input
        };
        let challenge = self
            .bind_freshness(request_id, account_id, bound_input, ChallengePath::Session)
            .await?;
        let collected = self
            .collect_assertion(request_id, account_id, &challenge.webauthn_challenge())
            .await?;
        self.deliver_seed(request_id, &collected.prf, rollback).await?;

        Ok(ConfirmationResponse {
            credential: Some(collected.record),
            vrf_challenge: Some(challenge),
            ..ConfirmationResponse::approved(request_id)
        })
    }

    async fn link_device(
        &self,
        request: &ConfirmationRequest,
        payload: &LinkDevicePayload,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        let request_id = &request.request_id;
        let account_id = &payload.near_account_id;

        let base = self.turn_context(account_id).await?;
        let input = self.vrf_input(account_id, base.block_height, &base.block_hash, None);
        self.session_bootstrap(account_id, &input, ChallengePath::Session).await?;

        let challenge = self
            .bind_freshness(request_id, account_id, input, ChallengePath::Session)
            .await?;
        let collected = self
            .collect_assertion(request_id, account_id, &challenge.webauthn_challenge())
            .await?;
        let nonces = self.reserve_nonces(request_id, request.payload.nonce_count(), rollback)?;
        self.deliver_seed(request_id, &collected.prf, rollback).await?;

        tracing::info!(
            request_id = %request_id,
            account_id = %account_id,
            device_number = payload.device_number,
            "device link confirmed"
        );
        Ok(ConfirmationResponse {
            credential: Some(collected.record),
            vrf_challenge: Some(challenge),
            transaction_context: Some(base.to_transaction_context(&nonces)),
            ..ConfirmationResponse::approved(request_id)
        })
    }

    async fn show_private_key(
        &self,
        request: &ConfirmationRequest,
        payload: &ShowPrivateKeyPayload,
        rollback: &Mutex<Rollback>,
    ) -> Result<ConfirmationResponse, Stop> {
        let request_id = &request.request_id;
        let account_id = &payload.near_account_id;

        let challenge = local_unlock_challenge(request_id, account_id);
        let collected = self
            .collect_assertion(request_id, account_id, &challenge)
            .await?;
        self.deliver_seed(request_id, &collected.prf, rollback).await?;

        Ok(ConfirmationResponse {
            credential: Some(collected.record),
            ..ConfirmationResponse::approved(request_id)
        })
    }

    /// Access-key and block context for the current turn. The sequencer
    /// must already be bound to `account_id`.
    async fn turn_context(&self, account_id: &str) -> Result<BaseContext, Stop> {
        if self.deps.sequencer.account_id().as_deref() != Some(account_id) {
            return Err(Stop::declined(
                ConfirmErrorCode::ChainUnavailable,
                format!("No access key is loaded for {account_id}"),
            ));
        }
        self.deps
            .sequencer
            .base_context(self.deps.rpc.as_ref(), BaseContextOptions::default())
            .await
            .map_err(|e| Stop::declined(ConfirmErrorCode::ChainUnavailable, e.to_string()))
    }

    async fn latest_block(&self) -> Result<(u64, String), Stop> {
        self.deps
            .rpc
            .view_block()
            .await
            .map(|block| (block.header.height, block.header.hash))
            .map_err(|e| Stop::declined(ConfirmErrorCode::ChainUnavailable, e.to_string()))
    }

    fn vrf_input(
        &self,
        account_id: &str,
        block_height: u64,
        block_hash: &str,
        intent_digest: Option<String>,
    ) -> VrfInputData {
        VrfInputData {
            user_id: account_id.to_string(),
            rp_id: self.deps.credentials.rp_id().to_string(),
            block_height,
            block_hash: block_hash.to_string(),
            intent_digest,
        }
    }

    /// Ensure a bootstrap exists for `session_key`, minting it on first use.
    /// It is the fallback [`bind_freshness`](Self::bind_freshness) returns
    /// when the refresh fails.
    async fn session_bootstrap(
        &self,
        session_key: &str,
        input: &VrfInputData,
        path: ChallengePath,
    ) -> Result<(), Stop> {
        if self.deps.freshness.cached_bootstrap(session_key).is_some() {
            return Ok(());
        }
        self.deps
            .freshness
            .bootstrap(session_key, input, path)
            .await
            .map(|_| ())
            .map_err(|e| Stop::declined(ConfirmErrorCode::ChallengeUnavailable, e.to_string()))
    }

    async fn collect_assertion(
        &self,
        request_id: &str,
        account_id: &str,
        challenge: &[u8],
    ) -> Result<CollectedCredential, Stop> {
        Self::enter(request_id, ConfirmState::Collecting);
        match self
            .deps
            .credentials
            .collect_assertion(account_id, None, challenge)
            .await
        {
            Ok(AssertionOutcome::Collected(collected)) => Ok(collected),
            Ok(AssertionOutcome::WrongPasskey(message)) => {
                Err(Stop::declined(ConfirmErrorCode::WrongPasskey, message))
            }
            Err(e) => Err(credential_stop(e)),
        }
    }

    /// Rebind to the latest block. The result is the challenge the
    /// authenticator signs.
    ///
    /// Best effort on both legs: when the block query fails the turn's block
    /// is used, and when the refresh fails the provider falls back to the
    /// cached bootstrap. Neither failure reaches the caller.
    async fn bind_freshness(
        &self,
        request_id: &str,
        session_key: &str,
        input: VrfInputData,
        path: ChallengePath,
    ) -> Result<FreshnessChallenge, Stop> {
        Self::enter(request_id, ConfirmState::FreshnessBinding);
        let input = match self.deps.rpc.view_block().await {
            Ok(block) => VrfInputData {
                block_height: block.header.height,
                block_hash: block.header.hash,
                ..input
            },
            Err(e) => {
                tracing::warn!(
                    request_id,
                    error = %e,
                    "latest block unavailable, refreshing against the turn block"
                );
                input
            }
        };
        self.deps
            .freshness
            .bind(session_key, &input, path)
            .await
            .map_err(|e| Stop::declined(ConfirmErrorCode::ChallengeUnavailable, e.to_string()))
    }

    fn reserve_nonces(
        &self,
        request_id: &str,
        count: usize,
        rollback: &Mutex<Rollback>,
    ) -> Result<Vec<String>, Stop> {
        Self::enter(request_id, ConfirmState::NonceReserving);
        let nonces = self
            .deps
            .sequencer
            .reserve(count)
            .map_err(|e| Stop::declined(ConfirmErrorCode::ChainUnavailable, e.to_string()))?;
        lock(rollback).nonces.extend(nonces.iter().cloned());
        Ok(nonces)
    }

    /// Hand the PRF outputs to the signing worker over a fresh session
    /// channel. No-op when no signing worker is attached to this host.
    async fn deliver_seed(
        &self,
        request_id: &str,
        prf: &PrfOutputs,
        rollback: &Mutex<Rollback>,
    ) -> Result<(), Stop> {
        let Some(hub) = &self.deps.secure_channel else {
            return Ok(());
        };
        lock(rollback).channel_session = Some(request_id.to_string());

        let seed = SeedMaterial {
            wrap_key_seed: prf.first.clone(),
            prf_second: prf.second.clone(),
        };
        let delivered = async {
            hub.attach(request_id).await?;
            hub.deposit(request_id, seed).await
        }
        .await;
        delivered
            .map_err(|e| Stop::declined(ConfirmErrorCode::SignerUnavailable, e.to_string()))?;

        lock(rollback).channel_session = None;
        tracing::debug!(request_id, "seed delivered to signing worker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_challenge_is_scoped_to_request_and_account() {
        let a = local_unlock_challenge("r1", "alice.testnet");
        assert_eq!(a.len(), 32);
        assert_ne!(a, local_unlock_challenge("r2", "alice.testnet"));
        assert_ne!(a, local_unlock_challenge("r1", "bob.testnet"));
    }

    #[test]
    fn message_digest_covers_state() {
        let mut payload = SignMessagePayload {
            near_account_id: "alice.testnet".to_string(),
            message: "hello".to_string(),
            recipient: "app.example".to_string(),
            state: None,
        };
        let without = message_digest(&payload);
        payload.state = Some("s".to_string());
        assert_ne!(without, message_digest(&payload));
    }

    #[test]
    fn dismissed_prompt_is_a_user_cancel_and_missing_prf_is_fatal() {
        assert!(matches!(
            credential_stop(CredentialError::Dismissed),
            Stop::Declined {
                code: ConfirmErrorCode::UserCancelled,
                ..
            }
        ));
        assert!(matches!(
            credential_stop(CredentialError::Store("db locked".to_string())),
            Stop::Declined {
                code: ConfirmErrorCode::CredentialFailed,
                ..
            }
        ));
        assert!(matches!(
            credential_stop(CredentialError::MissingPrfResult),
            Stop::Fatal(_)
        ));
    }

    #[test]
    fn registration_key_is_separate_from_account_key() {
        assert_ne!(registration_key("alice.testnet"), "alice.testnet");
    }
}
