//! Wire envelopes exchanged between the wallet UI, the credential worker and
//! the signing worker.
//!
//! Requests arrive as loosely-typed JSON so that malformed envelopes can be
//! answered with a structured `confirmed:false` response instead of a
//! deserialization failure. [`ConfirmationRequest::parse`] performs that
//! validation before any side effect happens.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::credential::CredentialRecord;
use crate::error::{ConfirmErrorCode, ValidationError};
use crate::freshness::FreshnessChallenge;
use crate::policy::PolicyOverride;

/// Envelope schema version accepted by the orchestrator.
pub const CONFIRMATION_SCHEMA_VERSION: u32 = 2;

/// Operation kinds that can be confirmed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationKind {
    #[serde(rename = "signTransaction")]
    SignTransaction,
    #[serde(rename = "registerAccount")]
    RegisterAccount,
    #[serde(rename = "decryptPrivateKey")]
    DecryptPrivateKey,
    #[serde(rename = "signMessage")]
    SignMessage,
    #[serde(rename = "linkDevice")]
    LinkDevice,
    #[serde(rename = "showPrivateKey")]
    ShowPrivateKey,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        Self::SignTransaction,
        Self::RegisterAccount,
        Self::DecryptPrivateKey,
        Self::SignMessage,
        Self::LinkDevice,
        Self::ShowPrivateKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SignTransaction => "signTransaction",
            Self::RegisterAccount => "registerAccount",
            Self::DecryptPrivateKey => "decryptPrivateKey",
            Self::SignMessage => "signMessage",
            Self::LinkDevice => "linkDevice",
            Self::ShowPrivateKey => "showPrivateKey",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    /// High-consequence kinds that get clamped to an explicit UI when
    /// running inside an embedded browsing context.
    pub fn is_high_risk(self) -> bool {
        matches!(self, Self::RegisterAccount | Self::LinkDevice)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a signing request authenticates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SigningAuthMode {
    /// Fresh WebAuthn ceremony per request.
    #[default]
    WebAuthn,
    /// Reuse a pre-authorized session key; skips the authenticator prompt.
    WarmSession,
}

/// One transaction inside a signing batch. Actions are opaque to this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInput {
    pub receiver_id: String,
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignTransactionPayload {
    pub near_account_id: String,
    pub tx_signing_requests: Vec<TransactionInput>,
    #[serde(default)]
    pub signing_auth_mode: SigningAuthMode,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Optional caller echo of [`compute_intent_digest`]; rejected on mismatch.
    #[serde(default)]
    pub intent_digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAccountPayload {
    pub near_account_id: String,
    #[serde(default)]
    pub device_number: Option<u32>,
}

/// Who is allowed to receive the derived secret of a decrypt operation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DecryptFlow {
    /// The derived secret stays inside the worker that asked for it.
    #[default]
    WorkerOnly,
    /// The caller explicitly opted into receiving the derived secret.
    LocalOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecryptPrivateKeyPayload {
    pub near_account_id: String,
    #[serde(default)]
    pub flow: DecryptFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignMessagePayload {
    pub near_account_id: String,
    pub message: String,
    pub recipient: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkDevicePayload {
    pub near_account_id: String,
    pub device_number: u32,
    #[serde(default)]
    pub tx_signing_requests: Vec<TransactionInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShowPrivateKeyPayload {
    pub near_account_id: String,
}

/// Kind-specific request payload, validated.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    SignTransaction(SignTransactionPayload),
    RegisterAccount(RegisterAccountPayload),
    DecryptPrivateKey(DecryptPrivateKeyPayload),
    SignMessage(SignMessagePayload),
    LinkDevice(LinkDevicePayload),
    ShowPrivateKey(ShowPrivateKeyPayload),
}

impl RequestPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::SignTransaction(_) => OperationKind::SignTransaction,
            Self::RegisterAccount(_) => OperationKind::RegisterAccount,
            Self::DecryptPrivateKey(_) => OperationKind::DecryptPrivateKey,
            Self::SignMessage(_) => OperationKind::SignMessage,
            Self::LinkDevice(_) => OperationKind::LinkDevice,
            Self::ShowPrivateKey(_) => OperationKind::ShowPrivateKey,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            Self::SignTransaction(p) => &p.near_account_id,
            Self::RegisterAccount(p) => &p.near_account_id,
            Self::DecryptPrivateKey(p) => &p.near_account_id,
            Self::SignMessage(p) => &p.near_account_id,
            Self::LinkDevice(p) => &p.near_account_id,
            Self::ShowPrivateKey(p) => &p.near_account_id,
        }
    }

    /// Number of sequence numbers this request needs (minimum 1 for kinds
    /// that reserve at all).
    pub fn nonce_count(&self) -> usize {
        match self {
            Self::SignTransaction(p) => p.tx_signing_requests.len().max(1),
            Self::LinkDevice(p) => p.tx_signing_requests.len().max(1),
            _ => 0,
        }
    }

    fn parse(kind: OperationKind, raw: serde_json::Value) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidPayload {
            kind: kind.as_str().to_string(),
            reason,
        };

        let payload = match kind {
            OperationKind::SignTransaction => {
                let p: SignTransactionPayload =
                    serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
                if p.tx_signing_requests.is_empty() {
                    return Err(invalid("txSigningRequests must not be empty".to_string()));
                }
                if let Some(tx) = p
                    .tx_signing_requests
                    .iter()
                    .find(|tx| tx.receiver_id.trim().is_empty())
                {
                    return Err(invalid(format!(
                        "transaction receiverId must not be empty (actions: {})",
                        tx.actions.len()
                    )));
                }
                if p.signing_auth_mode == SigningAuthMode::WarmSession
                    && p.session_id.as_deref().is_none_or(|s| s.trim().is_empty())
                {
                    return Err(invalid("warmSession signing requires sessionId".to_string()));
                }
                Self::SignTransaction(p)
            }
            OperationKind::RegisterAccount => Self::RegisterAccount(
                serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?,
            ),
            OperationKind::DecryptPrivateKey => Self::DecryptPrivateKey(
                serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?,
            ),
            OperationKind::SignMessage => {
                let p: SignMessagePayload =
                    serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
                if p.recipient.trim().is_empty() {
                    return Err(invalid("recipient must not be empty".to_string()));
                }
                Self::SignMessage(p)
            }
            OperationKind::LinkDevice => Self::LinkDevice(
                serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?,
            ),
            OperationKind::ShowPrivateKey => Self::ShowPrivateKey(
                serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?,
            ),
        };

        if payload.account_id().trim().is_empty() {
            return Err(invalid("nearAccountId must not be empty".to_string()));
        }
        Ok(payload)
    }
}

/// A validated confirmation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub request_id: String,
    pub summary: serde_json::Value,
    pub payload: RequestPayload,
    pub policy_override: Option<PolicyOverride>,
}

impl ConfirmationRequest {
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// Best-effort extraction of the correlation id, used to address an
    /// error response when validation fails.
    pub fn peek_request_id(raw: &serde_json::Value) -> String {
        raw.get("requestId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Validate a raw request envelope.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, ValidationError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| ValidationError::Malformed("envelope must be an object".to_string()))?;

        let version = obj.get("schemaVersion");
        if version.and_then(|v| v.as_u64()) != Some(u64::from(CONFIRMATION_SCHEMA_VERSION)) {
            return Err(ValidationError::SchemaVersion {
                expected: CONFIRMATION_SCHEMA_VERSION,
                actual: version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            });
        }

        let request_id = obj
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingRequestId)?
            .to_string();

        let kind_raw = obj
            .get("type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or(ValidationError::MissingKind)?;
        let kind = OperationKind::parse(kind_raw)
            .ok_or_else(|| ValidationError::UnsupportedKind(kind_raw.to_string()))?;

        let payload_raw = obj
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if !payload_raw.is_object() {
            return Err(ValidationError::InvalidPayload {
                kind: kind.as_str().to_string(),
                reason: "payload must be an object".to_string(),
            });
        }
        let payload = RequestPayload::parse(kind, payload_raw)?;

        let policy_override = match obj.get("confirmationConfig") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(serde_json::from_value(value.clone()).map_err(|e| {
                ValidationError::InvalidPayload {
                    kind: kind.as_str().to_string(),
                    reason: format!("confirmationConfig: {e}"),
                }
            })?),
        };

        let mut summary = obj
            .get("summary")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        if let RequestPayload::SignTransaction(p) = &payload {
            let digest = compute_intent_digest(&p.tx_signing_requests);
            let claimed = [
                p.intent_digest.as_deref(),
                summary.get("intentDigest").and_then(|v| v.as_str()),
            ];
            if claimed.into_iter().flatten().any(|c| c != digest) {
                return Err(ValidationError::InvalidPayload {
                    kind: kind.as_str().to_string(),
                    reason: "intentDigest does not match txSigningRequests".to_string(),
                });
            }
            if let Some(map) = summary.as_object_mut() {
                map.insert("intentDigest".to_string(), serde_json::Value::String(digest));
            }
        }

        Ok(Self {
            request_id,
            summary,
            payload,
            policy_override,
        })
    }
}

/// Access-key and block context for building transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    pub near_public_key_str: String,
    pub access_key_nonce: String,
    pub next_nonce: String,
    pub tx_block_height: String,
    pub tx_block_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_nonces: Vec<String>,
}

/// Grant describing a dispensed warm-session signing capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WarmSessionGrant {
    pub session_id: String,
    pub remaining_uses: u32,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Response envelope posted back across the thread boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationResponse {
    pub request_id: String,
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ConfirmErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_challenge: Option<FreshnessChallenge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_context: Option<TransactionContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prf_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_session: Option<WarmSessionGrant>,
}

impl ConfirmationResponse {
    pub fn approved(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            confirmed: true,
            error: None,
            error_code: None,
            credential: None,
            vrf_challenge: None,
            transaction_context: None,
            prf_output: None,
            warm_session: None,
        }
    }

    pub fn declined(
        request_id: impl Into<String>,
        code: ConfirmErrorCode,
        error: impl Into<String>,
    ) -> Self {
        Self {
            confirmed: false,
            error: Some(error.into()),
            error_code: Some(code),
            ..Self::approved(request_id)
        }
    }
}

/// Control messages for attaching a session-scoped secure channel between the
/// credential context and the signing worker. The channel endpoint itself is
/// transferred alongside `Attach`, never inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Attach { session_id: String },
    #[serde(rename_all = "camelCase")]
    AttachOk { session_id: String },
    #[serde(rename_all = "camelCase")]
    SeedReady { session_id: String },
}

impl ControlMessage {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Attach { session_id }
            | Self::AttachOk { session_id }
            | Self::SeedReady { session_id } => session_id,
        }
    }
}

/// Generate a fresh request correlation id.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Base64url SHA-256 digest over the canonical JSON of a transaction batch.
///
/// Keys of every object are sorted so that the digest is independent of the
/// field order the caller used.
pub fn compute_intent_digest(transactions: &[TransactionInput]) -> String {
    let canonical: Vec<serde_json::Value> = transactions
        .iter()
        .map(|tx| {
            canonicalize(&serde_json::json!({
                "receiverId": tx.receiver_id,
                "actions": tx.actions,
            }))
        })
        .collect();
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(Sha256::digest(&bytes))
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<_, _> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}
