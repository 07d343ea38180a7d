//! Secure confirmation flow for passkey wallets.
//!
//! A request to sign, register, link a device or unlock key material passes
//! through the [`orchestrator`]: policy resolution, an optional confirmation
//! UI, WebAuthn credential collection, VRF freshness binding and nonce
//! reservation. Exactly one sanitized response comes back per request, and
//! PRF-derived seed material travels to the signing worker over a dedicated
//! [`channel`] instead of the response.

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod freshness;
pub mod logging;
pub mod nonce;
pub mod orchestrator;
pub mod policy;
pub mod rpc;
pub mod sanitize;
pub mod session;
pub mod settings;
pub mod types;

pub use config::Config;
pub use error::{ConfirmErrorCode, Error, Result};
pub use orchestrator::{
    ChannelSink, Collaborators, ConfirmState, ConfirmUi, ConfirmationOrchestrator, ResponseSink,
    UiDecision,
};
pub use types::{ConfirmationRequest, ConfirmationResponse, OperationKind};
