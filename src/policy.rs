//! Confirmation UI policy resolution.
//!
//! [`resolve`] is pure: stored preferences, an optional per-request override,
//! the operation kind and the embedding context go in, the effective
//! [`ConfirmationPolicy`] comes out. Preference storage sits behind
//! [`PreferenceStore`].

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::helpers::normalize_variant;
use crate::error::ConfigError;
use crate::settings::Settings;
use crate::types::OperationKind;

/// How the confirmation is presented.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UiMode {
    /// No UI; the request proceeds immediately.
    Skip,
    #[default]
    Modal,
    Drawer,
}

impl UiMode {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "skip" | "none" => Ok(Self::Skip),
            "modal" => Ok(Self::Modal),
            "drawer" => Ok(Self::Drawer),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'skip', 'modal', or 'drawer', got '{value}'"),
            }),
        }
    }
}

/// Whether a visible confirmation waits for a click.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Behavior {
    AutoProceed,
    #[default]
    RequireClick,
}

impl Behavior {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "auto_proceed" | "autoproceed" | "auto" => Ok(Self::AutoProceed),
            "require_click" | "requireclick" | "click" => Ok(Self::RequireClick),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'auto_proceed' or 'require_click', got '{value}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "dark" => Ok(Self::Dark),
            "light" => Ok(Self::Light),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'dark' or 'light', got '{value}'"),
            }),
        }
    }
}

pub const DEFAULT_AUTO_PROCEED_DELAY_MS: u64 = 1_000;

fn default_auto_proceed_delay_ms() -> u64 {
    DEFAULT_AUTO_PROCEED_DELAY_MS
}

/// Effective presentation policy for one request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPolicy {
    #[serde(default)]
    pub ui_mode: UiMode,
    #[serde(default)]
    pub behavior: Behavior,
    #[serde(default = "default_auto_proceed_delay_ms", alias = "autoProceedDelay")]
    pub auto_proceed_delay_ms: u64,
    #[serde(default)]
    pub theme: Theme,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            ui_mode: UiMode::default(),
            behavior: Behavior::default(),
            auto_proceed_delay_ms: DEFAULT_AUTO_PROCEED_DELAY_MS,
            theme: Theme::default(),
        }
    }
}

impl ConfirmationPolicy {
    /// Whether a UI step is shown at all.
    pub fn shows_ui(&self) -> bool {
        self.ui_mode != UiMode::Skip
    }
}

/// Per-request partial override. Unset fields fall through to stored
/// preferences.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyOverride {
    #[serde(default)]
    pub ui_mode: Option<UiMode>,
    #[serde(default)]
    pub behavior: Option<Behavior>,
    #[serde(default, alias = "autoProceedDelay")]
    pub auto_proceed_delay_ms: Option<u64>,
    #[serde(default)]
    pub theme: Option<Theme>,
}

impl PolicyOverride {
    fn apply(&self, base: ConfirmationPolicy) -> ConfirmationPolicy {
        ConfirmationPolicy {
            ui_mode: self.ui_mode.unwrap_or(base.ui_mode),
            behavior: self.behavior.unwrap_or(base.behavior),
            auto_proceed_delay_ms: self.auto_proceed_delay_ms.unwrap_or(base.auto_proceed_delay_ms),
            theme: self.theme.unwrap_or(base.theme),
        }
    }
}

/// Where the wallet runs relative to the embedding application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmbeddingContext {
    #[default]
    TopLevel,
    /// Cross-origin iframe. The host page can overlay or obscure the wallet,
    /// so high-risk kinds must not run without an explicit click.
    Embedded,
}

/// Compute the effective policy for one request.
///
/// - `decryptPrivateKey` skips the UI unless an override sets `uiMode`.
/// - `registerAccount` / `linkDevice` in an embedded context without an
///   override are clamped to a modal that requires a click. The stored
///   theme is kept.
/// - Otherwise the override is layered over stored preferences.
pub fn resolve(
    stored: &ConfirmationPolicy,
    policy_override: Option<&PolicyOverride>,
    kind: OperationKind,
    embedding: EmbeddingContext,
) -> ConfirmationPolicy {
    let base = match kind {
        OperationKind::DecryptPrivateKey => ConfirmationPolicy {
            ui_mode: UiMode::Skip,
            ..*stored
        },
        _ => *stored,
    };
    if let Some(o) = policy_override {
        return o.apply(base);
    }

    match kind {
        kind if kind.is_high_risk() && embedding == EmbeddingContext::Embedded => {
            ConfirmationPolicy {
                ui_mode: UiMode::Modal,
                behavior: Behavior::RequireClick,
                ..*stored
            }
        }
        _ => base,
    }
}

/// Source of stored confirmation preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_confirmation_config(&self) -> ConfirmationPolicy;
}

/// Preferences read from the settings file on every call.
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Self {
        Self::new(Settings::default_path())
    }
}

#[async_trait]
impl PreferenceStore for FilePreferenceStore {
    async fn get_confirmation_config(&self) -> ConfirmationPolicy {
        Settings::load_from(&self.path).confirmation
    }
}

/// In-memory preferences, updated by the host application.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    policy: RwLock<ConfirmationPolicy>,
}

impl MemoryPreferenceStore {
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    pub async fn set(&self, policy: ConfirmationPolicy) {
        *self.policy.write().await = policy;
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get_confirmation_config(&self) -> ConfirmationPolicy {
        *self.policy.read().await
    }
}
