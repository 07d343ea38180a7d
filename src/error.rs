//! Error types for the secure confirmation flow.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Freshness error: {0}")]
    Freshness(#[from] FreshnessError),

    #[error("Wait error: {0}")]
    Wait(#[from] WaitError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// Stable machine code carried by negative confirmation responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmErrorCode {
    ValidationFailed,
    UserCancelled,
    ChainUnavailable,
    WrongPasskey,
    WarmSessionUnavailable,
    ChallengeUnavailable,
    CredentialFailed,
    SignerUnavailable,
}

impl ConfirmErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::UserCancelled => "user_cancelled",
            Self::ChainUnavailable => "chain_unavailable",
            Self::WrongPasskey => "wrong_passkey",
            Self::WarmSessionUnavailable => "warm_session_unavailable",
            Self::ChallengeUnavailable => "challenge_unavailable",
            Self::CredentialFailed => "credential_failed",
            Self::SignerUnavailable => "signer_unavailable",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reading, writing or editing persisted settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no setting at '{0}'")]
    UnknownPath(String),

    #[error("'{path}' expects {expected}, got '{value}'")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        value: String,
    },

    #[error("'{path}' rejected: {message}")]
    Rejected { path: String, message: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("cannot encode settings: {0}")]
    Encode(String),
}

/// Request envelope validation errors. Rendered into `confirmed:false`
/// responses, never thrown across the orchestrator boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("schemaVersion must be {expected}, got {actual}")]
    SchemaVersion { expected: u32, actual: String },

    #[error("requestId is required")]
    MissingRequestId,

    #[error("type is required")]
    MissingKind,

    #[error("unsupported confirmation type: {0}")]
    UnsupportedKind(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("request {0} is already pending")]
    DuplicateRequestId(String),

    #[error("malformed request envelope: {0}")]
    Malformed(String),
}

/// Chain RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC request {method} failed: {reason}")]
    RequestFailed { method: String, reason: String },

    #[error("Invalid RPC response for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("Access key {public_key} not found for {account_id}")]
    AccessKeyNotFound {
        account_id: String,
        public_key: String,
    },

    #[error("Nonce sequencer is not initialized for an account")]
    NotInitialized,

    #[error("Invalid nonce value: {0}")]
    InvalidNonce(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Credential collection errors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The PRF extension was requested but the authenticator returned no
    /// result. The ceremony cannot be trusted; callers must not convert this
    /// into a declined confirmation.
    #[error("Missing PRF result in authenticator response")]
    MissingPrfResult,

    #[error("No passkey registered for {account_id} on this device")]
    NoCredentials { account_id: String },

    #[error("Authenticator prompt failed: {0}")]
    AuthenticatorFailed(String),

    #[error("Authenticator prompt was dismissed")]
    Dismissed,

    #[error("Credential store error: {0}")]
    Store(String),
}

impl CredentialError {
    /// Whether the orchestrator must abort without emitting any response.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingPrfResult)
    }
}

/// Freshness challenge generation errors.
#[derive(Debug, thiserror::Error)]
pub enum FreshnessError {
    #[error("No bootstrap challenge is available")]
    NoBootstrap,

    #[error("VRF keypair is not loaded")]
    KeypairNotLoaded,

    #[error("VRF generation failed: {0}")]
    GenerationFailed(String),
}

/// Errors from the awaiting-a-response primitive. The two variants have
/// disjoint messages so callers can branch on cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("Request {request_id} timed out after {timeout:?}")]
    TimedOut {
        request_id: String,
        timeout: Duration,
    },

    #[error("Request {request_id} aborted")]
    Aborted { request_id: String },

    #[error("Response channel closed while waiting for {request_id}")]
    Closed { request_id: String },
}

/// Cross-context channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Session {session_id} is not attached")]
    NotAttached { session_id: String },

    #[error("Session {session_id} is already attached")]
    AlreadyAttached { session_id: String },

    #[error("Seed for session {session_id} was already consumed")]
    SeedConsumed { session_id: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel handshake failed: {0}")]
    Handshake(#[from] WaitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Warm-session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Warm session {session_id} not found")]
    NotFound { session_id: String },

    #[error("Warm session {session_id} expired")]
    Expired { session_id: String },

    #[error("Warm session {session_id} has no remaining uses")]
    Exhausted { session_id: String },

    #[error("Session key dispense failed: {0}")]
    DispenseFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
