//! Freshness challenges bound to recent chain state.
//!
//! The VRF primitive itself is a black box behind [`VrfEngine`]. This module
//! derives the VRF input from the block context, caches the bootstrap
//! challenge minted once per session, and performs the just-in-time refresh
//! that rebinds a challenge to a newer block.
//!
//! The refresh is an optimization only. [`FreshnessProvider::bind`] swallows
//! refresh failures and falls back to the bootstrap challenge; callers must
//! never make the refresh a hard dependency.
//!
//! A keypair is generated at most once per session key: the keypair-bootstrap
//! path mints it, and every later refresh evaluates with that loaded keypair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FreshnessError;

const VRF_DOMAIN_SEPARATOR: &[u8] = b"passkey_confirm_vrf_challenge_v1";

/// Raw VRF evaluation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfOutput {
    pub output: Vec<u8>,
    pub proof: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// Deterministic, verifiable pseudorandom function bound to a keypair.
#[async_trait]
pub trait VrfEngine: Send + Sync {
    /// Evaluate with the already loaded VRF keypair.
    async fn evaluate(&self, input: &[u8]) -> Result<VrfOutput, FreshnessError>;

    /// Create a fresh VRF keypair and evaluate with it. Used for
    /// registration, where no keypair exists yet. The new keypair becomes
    /// the loaded one for later [`evaluate`](Self::evaluate) calls.
    async fn evaluate_with_new_keypair(&self, input: &[u8]) -> Result<VrfOutput, FreshnessError>;
}

/// Inputs a challenge is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfInputData {
    pub user_id: String,
    pub rp_id: String,
    pub block_height: u64,
    pub block_hash: String,
    pub intent_digest: Option<String>,
}

impl VrfInputData {
    /// SHA-256 over the domain separator and every bound field.
    pub fn derive_input(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(VRF_DOMAIN_SEPARATOR);
        hasher.update(self.user_id.as_bytes());
        hasher.update(self.rp_id.as_bytes());
        hasher.update(self.block_height.to_le_bytes());
        hasher.update(self.block_hash.as_bytes());
        if let Some(digest) = &self.intent_digest {
            hasher.update(digest.as_bytes());
        }
        hasher.finalize().to_vec()
    }
}

/// A challenge bound to a block, in wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessChallenge {
    pub vrf_input: String,
    pub vrf_output: String,
    pub vrf_proof: String,
    pub vrf_public_key: String,
    pub user_id: String,
    pub rp_id: String,
    pub block_height: String,
    pub block_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_digest: Option<String>,
}

impl FreshnessChallenge {
    fn from_output(input: &VrfInputData, raw_input: &[u8], output: VrfOutput) -> Self {
        Self {
            vrf_input: URL_SAFE_NO_PAD.encode(raw_input),
            vrf_output: URL_SAFE_NO_PAD.encode(&output.output),
            vrf_proof: URL_SAFE_NO_PAD.encode(&output.proof),
            vrf_public_key: URL_SAFE_NO_PAD.encode(&output.public_key),
            user_id: input.user_id.clone(),
            rp_id: input.rp_id.clone(),
            block_height: input.block_height.to_string(),
            block_hash: input.block_hash.clone(),
            intent_digest: input.intent_digest.clone(),
        }
    }

    /// Bytes the authenticator signs over: the raw VRF output.
    pub fn webauthn_challenge(&self) -> Vec<u8> {
        URL_SAFE_NO_PAD
            .decode(&self.vrf_output)
            .unwrap_or_else(|_| self.vrf_output.as_bytes().to_vec())
    }
}

/// Which keypair path a challenge is minted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePath {
    /// The session's loaded VRF keypair.
    Session,
    /// A keypair generated on the spot (registration).
    KeypairBootstrap,
}

/// Mints, caches and refreshes freshness challenges.
pub struct FreshnessProvider {
    engine: Arc<dyn VrfEngine>,
    bootstraps: Mutex<HashMap<String, FreshnessChallenge>>,
}

impl FreshnessProvider {
    pub fn new(engine: Arc<dyn VrfEngine>) -> Self {
        Self {
            engine,
            bootstraps: Mutex::new(HashMap::new()),
        }
    }

    async fn mint(
        &self,
        input: &VrfInputData,
        path: ChallengePath,
    ) -> Result<FreshnessChallenge, FreshnessError> {
        let raw_input = input.derive_input();
        let output = match path {
            ChallengePath::Session => self.engine.evaluate(&raw_input).await?,
            ChallengePath::KeypairBootstrap => {
                self.engine.evaluate_with_new_keypair(&raw_input).await?
            }
        };
        Ok(FreshnessChallenge::from_output(input, &raw_input, output))
    }

    /// Mint a challenge for the currently known block and cache it under
    /// `session_key` for reuse.
    pub async fn bootstrap(
        &self,
        session_key: &str,
        input: &VrfInputData,
        path: ChallengePath,
    ) -> Result<FreshnessChallenge, FreshnessError> {
        let challenge = self.mint(input, path).await?;
        self.bootstraps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_key.to_string(), challenge.clone());
        tracing::debug!(
            session_key,
            block_height = input.block_height,
            "minted bootstrap freshness challenge"
        );
        Ok(challenge)
    }

    pub fn cached_bootstrap(&self, session_key: &str) -> Option<FreshnessChallenge> {
        self.bootstraps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_key)
            .cloned()
    }

    pub fn forget(&self, session_key: &str) {
        self.bootstraps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_key);
    }

    /// Regenerate a challenge bound to a more recent block with the loaded
    /// keypair.
    pub async fn refresh(
        &self,
        input: &VrfInputData,
    ) -> Result<FreshnessChallenge, FreshnessError> {
        self.mint(input, ChallengePath::Session).await
    }

    /// Bind to the freshest available challenge.
    ///
    /// With a cached bootstrap, tries [`refresh`](Self::refresh) and falls
    /// back to the bootstrap on failure. Without one, mints the bootstrap
    /// through `path`; only that failure is surfaced.
    pub async fn bind(
        &self,
        session_key: &str,
        input: &VrfInputData,
        path: ChallengePath,
    ) -> Result<FreshnessChallenge, FreshnessError> {
        let Some(bootstrap) = self.cached_bootstrap(session_key) else {
            return self.bootstrap(session_key, input, path).await;
        };
        match self.refresh(input).await {
            Ok(challenge) => Ok(challenge),
            Err(e) => {
                tracing::warn!(
                    session_key,
                    error = %e,
                    "freshness refresh failed, falling back to bootstrap challenge"
                );
                Ok(bootstrap)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct StubVrf {
        fail: AtomicBool,
        calls: AtomicUsize,
        keypair_calls: AtomicUsize,
    }

    impl StubVrf {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                keypair_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VrfEngine for StubVrf {
        async fn evaluate(&self, input: &[u8]) -> Result<VrfOutput, FreshnessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FreshnessError::GenerationFailed("worker busy".to_string()));
            }
            Ok(VrfOutput {
                output: input.to_vec(),
                proof: vec![1, 2, 3],
                public_key: vec![9; 32],
            })
        }

        async fn evaluate_with_new_keypair(
            &self,
            input: &[u8],
        ) -> Result<VrfOutput, FreshnessError> {
            self.keypair_calls.fetch_add(1, Ordering::SeqCst);
            Ok(VrfOutput {
                output: input.to_vec(),
                proof: vec![4],
                public_key: vec![7; 32],
            })
        }
    }

    fn input_at(height: u64) -> VrfInputData {
        VrfInputData {
            user_id: "alice.testnet".to_string(),
            rp_id: "example.com".to_string(),
            block_height: height,
            block_hash: format!("hash-{height}"),
            intent_digest: None,
        }
    }

    #[test]
    fn derived_input_depends_on_block() {
        assert_ne!(input_at(1).derive_input(), input_at(2).derive_input());
        assert_eq!(input_at(1).derive_input(), input_at(1).derive_input());
        assert_eq!(input_at(1).derive_input().len(), 32);
    }

    #[tokio::test]
    async fn bind_prefers_refreshed_challenge() {
        let vrf = Arc::new(StubVrf::new());
        let provider = FreshnessProvider::new(vrf.clone());
        provider
            .bootstrap("s1", &input_at(10), ChallengePath::Session)
            .await
            .unwrap();

        let bound = provider
            .bind("s1", &input_at(12), ChallengePath::Session)
            .await
            .unwrap();
        assert_eq!(bound.block_height, "12");
    }

    #[tokio::test]
    async fn bind_falls_back_to_bootstrap_on_refresh_failure() {
        let vrf = Arc::new(StubVrf::new());
        let provider = FreshnessProvider::new(vrf.clone());
        let bootstrap = provider
            .bootstrap("s1", &input_at(10), ChallengePath::Session)
            .await
            .unwrap();

        vrf.fail.store(true, Ordering::SeqCst);
        let bound = provider
            .bind("s1", &input_at(12), ChallengePath::Session)
            .await
            .expect("refresh failure must not surface");
        assert_eq!(bound, bootstrap);
    }

    #[tokio::test]
    async fn bind_without_bootstrap_surfaces_failure() {
        let vrf = Arc::new(StubVrf::new());
        vrf.fail.store(true, Ordering::SeqCst);
        let provider = FreshnessProvider::new(vrf);
        let err = provider
            .bind("s1", &input_at(12), ChallengePath::Session)
            .await
            .unwrap_err();
        assert!(matches!(err, FreshnessError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn keypair_bootstrap_path_never_uses_session_keypair() {
        let vrf = Arc::new(StubVrf::new());
        let provider = FreshnessProvider::new(vrf.clone());
        provider
            .bind("reg", &input_at(3), ChallengePath::KeypairBootstrap)
            .await
            .unwrap();
        assert_eq!(vrf.calls.load(Ordering::SeqCst), 0);
        assert_eq!(vrf.keypair_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keypair_is_minted_once_then_refreshed_with_it() {
        let vrf = Arc::new(StubVrf::new());
        let provider = FreshnessProvider::new(vrf.clone());
        let minted = provider
            .bootstrap("reg", &input_at(3), ChallengePath::KeypairBootstrap)
            .await
            .unwrap();

        let bound = provider
            .bind("reg", &input_at(4), ChallengePath::KeypairBootstrap)
            .await
            .unwrap();
        assert_eq!(vrf.keypair_calls.load(Ordering::SeqCst), 1);
        assert_eq!(vrf.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bound.block_height, "4");
        assert_ne!(bound, minted);
    }

    #[tokio::test]
    async fn forget_drops_cached_bootstrap() {
        let provider = FreshnessProvider::new(Arc::new(StubVrf::new()));
        provider
            .bootstrap("s1", &input_at(1), ChallengePath::Session)
            .await
            .unwrap();
        assert!(provider.cached_bootstrap("s1").is_some());
        provider.forget("s1");
        assert!(provider.cached_bootstrap("s1").is_none());
    }
}
