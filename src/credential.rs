//! Credential collection over the platform authenticator.
//!
//! [`Authenticator`] is the WebAuthn capability ("produce an assertion or an
//! attestation for this challenge"). [`CredentialCollector`] wraps it with the
//! account's allow-list, normalizes the result into a serializable
//! [`CredentialRecord`], and pulls the PRF outputs into [`PrfOutputs`], which
//! are never serialized.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CredentialError;

/// Authenticator registered for an account, as known to the local store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredAuthenticator {
    pub credential_id: String,
    pub device_number: u32,
    #[serde(default)]
    pub transports: Vec<String>,
}

/// Result of matching the account's authenticators against this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasskeySelection {
    pub authenticators_for_prompt: Vec<StoredAuthenticator>,
    pub wrong_passkey_error: Option<String>,
}

/// Local credential metadata store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_authenticators_by_user(
        &self,
        account_id: &str,
    ) -> Result<Vec<StoredAuthenticator>, CredentialError>;

    /// Narrow `authenticators` to the ones belonging to this device.
    async fn ensure_current_passkey(
        &self,
        account_id: &str,
        authenticators: Vec<StoredAuthenticator>,
    ) -> Result<PasskeySelection, CredentialError>;
}

/// PRF extension salts, derived per account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrfSalts {
    pub first: Vec<u8>,
    pub second: Vec<u8>,
}

impl PrfSalts {
    pub fn for_account(account_id: &str) -> Self {
        let salt = |label: &str| {
            let mut hasher = Sha256::new();
            hasher.update(b"passkey_confirm:prf:");
            hasher.update(label.as_bytes());
            hasher.update(b":");
            hasher.update(account_id.as_bytes());
            hasher.finalize().to_vec()
        };
        Self {
            first: salt("first"),
            second: salt("second"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOptions {
    pub rp_id: String,
    pub challenge: Vec<u8>,
    pub allow_credentials: Vec<String>,
    pub prf_salts: PrfSalts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationOptions {
    pub rp_id: String,
    pub user_id: String,
    pub user_name: String,
    pub challenge: Vec<u8>,
    pub exclude_credentials: Vec<String>,
    pub prf_salts: PrfSalts,
}

/// PRF outputs as returned by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPrfResults {
    pub first: Option<Vec<u8>>,
    pub second: Option<Vec<u8>>,
}

/// Credential exactly as returned by the platform authenticator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCredential {
    pub id: String,
    pub raw_id: Vec<u8>,
    pub credential_type: String,
    pub authenticator_attachment: Option<String>,
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    pub user_handle: Option<Vec<u8>>,
    pub attestation_object: Option<Vec<u8>>,
    pub transports: Vec<String>,
    pub prf: Option<RawPrfResults>,
}

/// Platform WebAuthn capability.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn get_assertion(&self, options: &AssertionOptions)
    -> Result<RawCredential, CredentialError>;

    async fn create_attestation(
        &self,
        options: &AttestationOptions,
    ) -> Result<RawCredential, CredentialError>;
}

/// Response block of a normalized credential; all byte fields base64url.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialResponse {
    pub client_data_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_object: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transports: Vec<String>,
}

/// Serializable credential. Carries no PRF material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,
    pub raw_id: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_attachment: Option<String>,
    pub response: CredentialResponse,
}

/// PRF outputs, base64url, kept out of every serialized envelope.
#[derive(Debug, Clone)]
pub struct PrfOutputs {
    pub first: SecretString,
    pub second: Option<SecretString>,
}

/// A normalized credential plus its secret extension outputs.
#[derive(Debug, Clone)]
pub struct CollectedCredential {
    pub record: CredentialRecord,
    pub prf: PrfOutputs,
}

/// Outcome of an assertion attempt.
#[derive(Debug, Clone)]
pub enum AssertionOutcome {
    Collected(CollectedCredential),
    /// The account's passkey on this device does not match the stored ones.
    WrongPasskey(String),
}

fn normalize(raw: RawCredential) -> Result<CollectedCredential, CredentialError> {
    let prf = raw.prf.unwrap_or_default();
    let first = prf.first.ok_or(CredentialError::MissingPrfResult)?;

    let b64 = |bytes: &[u8]| URL_SAFE_NO_PAD.encode(bytes);
    let record = CredentialRecord {
        id: raw.id,
        raw_id: b64(&raw.raw_id),
        credential_type: if raw.credential_type.is_empty() {
            "public-key".to_string()
        } else {
            raw.credential_type
        },
        authenticator_attachment: raw.authenticator_attachment,
        response: CredentialResponse {
            client_data_json: b64(&raw.client_data_json),
            authenticator_data: raw.authenticator_data.as_deref().map(b64),
            signature: raw.signature.as_deref().map(b64),
            user_handle: raw.user_handle.as_deref().map(b64),
            attestation_object: raw.attestation_object.as_deref().map(b64),
            transports: raw.transports,
        },
    };

    Ok(CollectedCredential {
        record,
        prf: PrfOutputs {
            first: SecretString::from(b64(&first)),
            second: prf.second.map(|s| SecretString::from(b64(&s))),
        },
    })
}

/// Collects assertions and attestations for one relying party.
pub struct CredentialCollector {
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn CredentialStore>,
    rp_id: String,
}

impl CredentialCollector {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn CredentialStore>,
        rp_id: impl Into<String>,
    ) -> Self {
        Self {
            authenticator,
            store,
            rp_id: rp_id.into(),
        }
    }

    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    /// Prompt for an assertion with one of this device's credentials.
    ///
    /// `allowed` further narrows the prompt to specific credential ids. The
    /// prompt never includes credentials the store attributes to other
    /// devices.
    pub async fn collect_assertion(
        &self,
        account_id: &str,
        allowed: Option<&[String]>,
        challenge: &[u8],
    ) -> Result<AssertionOutcome, CredentialError> {
        let authenticators = self.store.get_authenticators_by_user(account_id).await?;
        let selection = self
            .store
            .ensure_current_passkey(account_id, authenticators)
            .await?;

        if let Some(message) = selection.wrong_passkey_error {
            tracing::info!(account_id, "current passkey does not match stored authenticators");
            return Ok(AssertionOutcome::WrongPasskey(message));
        }

        let allow_credentials: Vec<String> = selection
            .authenticators_for_prompt
            .into_iter()
            .map(|a| a.credential_id)
            .filter(|id| allowed.is_none_or(|list| list.contains(id)))
            .collect();

        if allow_credentials.is_empty() {
            return Err(CredentialError::NoCredentials {
                account_id: account_id.to_string(),
            });
        }

        let options = AssertionOptions {
            rp_id: self.rp_id.clone(),
            challenge: challenge.to_vec(),
            allow_credentials,
            prf_salts: PrfSalts::for_account(account_id),
        };

        tracing::debug!(
            account_id,
            credentials = options.allow_credentials.len(),
            "prompting authenticator for assertion"
        );
        let raw = self.authenticator.get_assertion(&options).await?;
        normalize(raw).map(AssertionOutcome::Collected)
    }

    /// Prompt for a new credential.
    pub async fn collect_attestation(
        &self,
        account_id: &str,
        challenge: &[u8],
    ) -> Result<CollectedCredential, CredentialError> {
        let exclude_credentials = self
            .store
            .get_authenticators_by_user(account_id)
            .await?
            .into_iter()
            .map(|a| a.credential_id)
            .collect();

        let options = AttestationOptions {
            rp_id: self.rp_id.clone(),
            user_id: account_id.to_string(),
            user_name: account_id.to_string(),
            challenge: challenge.to_vec(),
            exclude_credentials,
            prf_salts: PrfSalts::for_account(account_id),
        };

        tracing::debug!(account_id, "prompting authenticator for attestation");
        let raw = self.authenticator.create_attestation(&options).await?;
        normalize(raw)
    }
}
