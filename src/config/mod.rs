//! Configuration for the confirmation flow.
//!
//! Settings are loaded with priority: env var > settings file > default.
//! Bootstrap vars may live in `~/.passkey-confirm/.env` (loaded via dotenvy
//! before resolution).

pub(crate) mod helpers;

use std::time::Duration;

use crate::channel::{SecureChannelHub, SignerPort};
use crate::error::ConfigError;
use crate::logging::{LogFormat, LoggingConfig};
use crate::nonce::NonceSequencer;
use crate::policy::{
    Behavior, ConfirmationPolicy, EmbeddingContext, MemoryPreferenceStore, Theme, UiMode,
};
use crate::rpc::NearRpcClient;
use crate::session::{WarmSessionLedger, WarmSessionPolicy};
use crate::settings::Settings;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc: RpcConfig,
    pub webauthn: WebAuthnConfig,
    pub confirmation: ConfirmationPolicy,
    pub warm_session: WarmSessionPolicy,
    pub nonce: NonceConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainNetwork {
    Mainnet,
    Testnet,
}

impl ChainNetwork {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match helpers::normalize_variant(value).as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'mainnet' or 'testnet', got '{value}'"),
            }),
        }
    }

    fn default_rpc_url(self) -> &'static str {
        match self {
            Self::Mainnet => "https://rpc.mainnet.near.org",
            Self::Testnet => "https://rpc.testnet.near.org",
        }
    }
}

/// Chain RPC resolved config.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub network: ChainNetwork,
    pub url: url::Url,
    pub timeout: Duration,
}

impl RpcConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let network = ChainNetwork::parse(
            &helpers::optional_env("CONFIRM_NETWORK")?
                .unwrap_or_else(|| settings.rpc.network.clone()),
            "CONFIRM_NETWORK",
        )?;

        let raw_url = helpers::optional_env("CONFIRM_RPC_URL")?
            .or_else(|| settings.rpc.url.clone())
            .unwrap_or_else(|| network.default_rpc_url().to_string());
        let url = crate::rpc::validate_rpc_url(&raw_url, "CONFIRM_RPC_URL")?;

        let timeout_ms = helpers::require_positive(
            helpers::parse_optional_env("CONFIRM_RPC_TIMEOUT_MS", settings.rpc.timeout_ms)?,
            "CONFIRM_RPC_TIMEOUT_MS",
        )?;

        Ok(Self {
            network,
            url,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebAuthnConfig {
    pub rp_id: String,
    pub embedding: EmbeddingContext,
}

impl WebAuthnConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let rp_id = helpers::optional_env("CONFIRM_RP_ID")?
            .unwrap_or_else(|| settings.webauthn.rp_id.clone());
        if rp_id.contains("://") || rp_id.contains('/') {
            return Err(ConfigError::InvalidValue {
                key: "CONFIRM_RP_ID".to_string(),
                message: format!("must be a bare domain, got '{rp_id}'"),
            });
        }

        let embedding = match helpers::optional_env("CONFIRM_EMBEDDED")? {
            Some(v) => match helpers::normalize_variant(&v).as_str() {
                "1" | "true" | "yes" => EmbeddingContext::Embedded,
                "0" | "false" | "no" => EmbeddingContext::TopLevel,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "CONFIRM_EMBEDDED".to_string(),
                        message: format!("expected a boolean, got '{v}'"),
                    });
                }
            },
            None => EmbeddingContext::TopLevel,
        };

        Ok(Self { rp_id, embedding })
    }
}

/// Stored confirmation preferences with env overrides applied.
fn resolve_confirmation(settings: &Settings) -> Result<ConfirmationPolicy, ConfigError> {
    let stored = settings.confirmation;

    let ui_mode = match helpers::optional_env("CONFIRM_UI_MODE")? {
        Some(v) => UiMode::parse(&v, "CONFIRM_UI_MODE")?,
        None => stored.ui_mode,
    };
    let behavior = match helpers::optional_env("CONFIRM_BEHAVIOR")? {
        Some(v) => Behavior::parse(&v, "CONFIRM_BEHAVIOR")?,
        None => stored.behavior,
    };
    let theme = match helpers::optional_env("CONFIRM_THEME")? {
        Some(v) => Theme::parse(&v, "CONFIRM_THEME")?,
        None => stored.theme,
    };
    let auto_proceed_delay_ms =
        helpers::parse_optional_env("CONFIRM_AUTO_PROCEED_DELAY_MS", stored.auto_proceed_delay_ms)?;

    Ok(ConfirmationPolicy {
        ui_mode,
        behavior,
        auto_proceed_delay_ms,
        theme,
    })
}

fn resolve_warm_session(settings: &Settings) -> Result<WarmSessionPolicy, ConfigError> {
    let max_uses: u32 = helpers::parse_optional_env(
        "CONFIRM_WARM_SESSION_MAX_USES",
        settings.warm_session.max_uses,
    )?;
    let ttl_secs = helpers::parse_optional_env(
        "CONFIRM_WARM_SESSION_TTL_SECS",
        settings.warm_session.ttl_secs,
    )?;
    helpers::require_positive(u64::from(max_uses), "CONFIRM_WARM_SESSION_MAX_USES")?;
    helpers::require_positive(ttl_secs, "CONFIRM_WARM_SESSION_TTL_SECS")?;

    Ok(WarmSessionPolicy {
        max_uses,
        ttl: Duration::from_secs(ttl_secs),
    })
}

#[derive(Debug, Clone)]
pub struct NonceConfig {
    pub base_context_max_age: Duration,
}

impl NonceConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let ms = helpers::parse_optional_env(
            "CONFIRM_BASE_CONTEXT_MAX_AGE_MS",
            settings.nonce.base_context_max_age_ms,
        )?;
        Ok(Self {
            base_context_max_age: Duration::from_millis(ms),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub wait_timeout: Duration,
}

impl WorkerConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let ms = helpers::require_positive(
            helpers::parse_optional_env("CONFIRM_WAIT_TIMEOUT_MS", settings.worker.wait_timeout_ms)?,
            "CONFIRM_WAIT_TIMEOUT_MS",
        )?;
        Ok(Self {
            wait_timeout: Duration::from_millis(ms),
        })
    }
}

fn resolve_logging(settings: &Settings) -> Result<LoggingConfig, ConfigError> {
    let format = LogFormat::parse(
        &helpers::optional_env("CONFIRM_LOG_FORMAT")?
            .unwrap_or_else(|| settings.logging.format.clone()),
        "CONFIRM_LOG_FORMAT",
    )?;
    Ok(LoggingConfig {
        format,
        ..LoggingConfig::default()
    })
}

impl Config {
    /// Load configuration from env vars over the default settings file.
    ///
    /// Loads both `./.env` (higher priority) and `~/.passkey-confirm/.env`
    /// (lower priority) via dotenvy, which never overwrites existing vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        crate::bootstrap::load_env();
        let mut settings = Settings::load();

        Self::apply_toml_overlay(&mut settings, toml_path)?;

        Self::from_settings(&settings)
    }

    /// Overlay a TOML file onto `settings`.
    ///
    /// An explicit path must exist and parse. The default
    /// `~/.passkey-confirm/config.toml` is optional and a broken one is only
    /// logged.
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&std::path::Path>,
    ) -> Result<(), ConfigError> {
        let required = explicit_path.is_some();
        let path = explicit_path
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(Settings::default_toml_path);

        let overlay = match Settings::load_toml(&path) {
            Ok(overlay) => overlay,
            Err(e) if required => return Err(ConfigError::ParseError(e.to_string())),
            Err(e) => {
                tracing::warn!(error = %e, "skipping default TOML config");
                None
            }
        };

        match overlay {
            Some(overlay) => {
                settings.merge_from(&overlay);
                tracing::debug!(path = %path.display(), "applied TOML config");
            }
            None if required => {
                return Err(ConfigError::ParseError(format!(
                    "no config file at {}",
                    path.display()
                )));
            }
            None => {}
        }
        Ok(())
    }

    /// Resolve every section against `settings`, env vars taking priority.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            rpc: RpcConfig::resolve(settings)?,
            webauthn: WebAuthnConfig::resolve(settings)?,
            confirmation: resolve_confirmation(settings)?,
            warm_session: resolve_warm_session(settings)?,
            nonce: NonceConfig::resolve(settings)?,
            worker: WorkerConfig::resolve(settings)?,
            logging: resolve_logging(settings)?,
        })
    }

    pub fn rpc_client(&self) -> NearRpcClient {
        NearRpcClient::new(self.rpc.url.clone(), self.rpc.timeout)
    }

    pub fn nonce_sequencer(&self) -> NonceSequencer {
        NonceSequencer::new(self.nonce.base_context_max_age)
    }

    pub fn warm_session_ledger(&self) -> WarmSessionLedger {
        WarmSessionLedger::new(self.warm_session)
    }

    /// Preferences seeded from the resolved confirmation defaults.
    pub fn preference_store(&self) -> MemoryPreferenceStore {
        MemoryPreferenceStore::new(self.confirmation)
    }

    /// Session channel to the signing worker, using the worker round-trip
    /// timeout for the attach handshake.
    pub fn secure_channel(&self) -> (SecureChannelHub, SignerPort) {
        SecureChannelHub::new(self.worker.wait_timeout)
    }
}
