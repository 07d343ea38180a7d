//! User settings persistence.
//!
//! Stores preferences in ~/.passkey-confirm/settings.json.
//! Settings are loaded with env var > settings.json > default priority.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SettingsError;
use crate::policy::ConfirmationPolicy;

/// User settings persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Chain RPC selection.
    #[serde(default)]
    pub rpc: RpcSettings,

    /// WebAuthn relying party.
    #[serde(default)]
    pub webauthn: WebAuthnSettings,

    /// Stored confirmation UI preferences.
    #[serde(default)]
    pub confirmation: ConfirmationPolicy,

    /// Warm-session capability limits.
    #[serde(default)]
    pub warm_session: WarmSessionSettings,

    /// Nonce sequencer tuning.
    #[serde(default)]
    pub nonce: NonceSettings,

    /// Worker round-trip tuning.
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcSettings {
    /// "mainnet" or "testnet".
    #[serde(default = "default_network")]
    pub network: String,

    /// Explicit endpoint; falls back to the network default.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            url: None,
            timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebAuthnSettings {
    #[serde(default = "default_rp_id")]
    pub rp_id: String,
}

fn default_rp_id() -> String {
    "localhost".to_string()
}

impl Default for WebAuthnSettings {
    fn default() -> Self {
        Self {
            rp_id: default_rp_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WarmSessionSettings {
    #[serde(default = "default_warm_max_uses")]
    pub max_uses: u32,

    #[serde(default = "default_warm_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_warm_max_uses() -> u32 {
    3
}

fn default_warm_ttl_secs() -> u64 {
    300
}

impl Default for WarmSessionSettings {
    fn default() -> Self {
        Self {
            max_uses: default_warm_max_uses(),
            ttl_secs: default_warm_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NonceSettings {
    /// Max age of a cached base context within one turn.
    #[serde(default = "default_base_context_max_age_ms")]
    pub base_context_max_age_ms: u64,
}

fn default_base_context_max_age_ms() -> u64 {
    30_000
}

impl Default for NonceSettings {
    fn default() -> Self {
        Self {
            base_context_max_age_ms: default_base_context_max_age_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSettings {
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    60_000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSettings {
    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl Settings {
    /// `~/.passkey-confirm/settings.json`
    pub fn default_path() -> PathBuf {
        crate::bootstrap::base_dir().join("settings.json")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Missing files give defaults silently; a corrupt file is logged and
    /// also falls back to defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings file");
            Self::default()
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let body =
            serde_json::to_string_pretty(self).map_err(|e| SettingsError::Encode(e.to_string()))?;
        write_creating_dirs(path, body)
    }

    /// `~/.passkey-confirm/config.toml`
    pub fn default_toml_path() -> PathBuf {
        crate::bootstrap::base_dir().join("config.toml")
    }

    /// `Ok(None)` when the file is absent; parse failures are errors.
    pub fn load_toml(path: &Path) -> Result<Option<Self>, SettingsError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&raw)
            .map(Some)
            .map_err(|e| SettingsError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Export as TOML under a short header naming the load priority.
    pub fn save_toml(&self, path: &Path) -> Result<(), SettingsError> {
        let body =
            toml::to_string_pretty(self).map_err(|e| SettingsError::Encode(e.to_string()))?;
        write_creating_dirs(path, format!("{TOML_HEADER}\n{body}"))
    }

    /// Overlay every leaf of `other` that was changed from its default.
    ///
    /// Leaves `other` left at their default never clobber values already
    /// set on `self`, so a sparse TOML file only touches what it names.
    pub fn merge_from(&mut self, other: &Self) {
        let (Ok(mut tree), Ok(incoming), Ok(baseline)) = (
            serde_json::to_value(&*self),
            serde_json::to_value(other),
            serde_json::to_value(Self::default()),
        ) else {
            return;
        };

        for (pointer, leaf) in leaves(&incoming) {
            if baseline.pointer(&pointer) == Some(leaf) {
                continue;
            }
            if let Some(slot) = tree.pointer_mut(&pointer) {
                *slot = leaf.clone();
            }
        }

        if let Ok(merged) = serde_json::from_value(tree) {
            *self = merged;
        }
    }

    /// Read one value by dotted path, e.g. `confirmation.uiMode`.
    pub fn get(&self, path: &str) -> Option<String> {
        let tree = serde_json::to_value(self).ok()?;
        tree.pointer(&to_pointer(path)).map(render)
    }

    /// Write one value by dotted path.
    ///
    /// The string is coerced to the JSON type already stored there and the
    /// edited tree must deserialize again, so enum fields reject unknown
    /// variants and nothing changes on error. `rpc.url` is checked as an
    /// endpoint; an empty value or `null` clears it.
    pub fn set(&mut self, path: &str, value: &str) -> Result<(), SettingsError> {
        if path == "rpc.url" {
            return self.set_rpc_url(value);
        }

        let mut tree = self.tree()?;
        let slot = tree
            .pointer_mut(&to_pointer(path))
            .ok_or_else(|| SettingsError::UnknownPath(path.to_string()))?;
        let coerced = coerce(slot, path, value)?;
        *slot = coerced;
        self.replace_with(tree, path)
    }

    /// Put one dotted path back to its default.
    pub fn reset(&mut self, path: &str) -> Result<(), SettingsError> {
        let pointer = to_pointer(path);
        let original = Self::default()
            .tree()?
            .pointer(&pointer)
            .cloned()
            .ok_or_else(|| SettingsError::UnknownPath(path.to_string()))?;

        let mut tree = self.tree()?;
        if let Some(slot) = tree.pointer_mut(&pointer) {
            *slot = original;
        }
        self.replace_with(tree, path)
    }

    /// Every leaf as `(dotted path, value)`, sorted by path.
    pub fn list(&self) -> Vec<(String, String)> {
        let Ok(tree) = serde_json::to_value(self) else {
            return Vec::new();
        };
        let mut entries: Vec<_> = leaves(&tree)
            .into_iter()
            .map(|(pointer, leaf)| (pointer[1..].replace('/', "."), render(leaf)))
            .collect();
        entries.sort();
        entries
    }

    fn set_rpc_url(&mut self, value: &str) -> Result<(), SettingsError> {
        let url = value.trim();
        if url.is_empty() || url.eq_ignore_ascii_case("null") {
            self.rpc.url = None;
            return Ok(());
        }
        crate::rpc::validate_rpc_url(url, "rpc.url").map_err(|e| SettingsError::Rejected {
            path: "rpc.url".to_string(),
            message: e.to_string(),
        })?;
        self.rpc.url = Some(url.to_string());
        Ok(())
    }

    fn tree(&self) -> Result<Value, SettingsError> {
        serde_json::to_value(self).map_err(|e| SettingsError::Encode(e.to_string()))
    }

    fn replace_with(&mut self, tree: Value, path: &str) -> Result<(), SettingsError> {
        *self = serde_json::from_value(tree).map_err(|e| SettingsError::Rejected {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

const TOML_HEADER: &str = "# passkey-confirm configuration file.\n\
                           #\n\
                           # Priority: env var > this file > settings.json > defaults.\n";

fn write_creating_dirs(path: &Path, contents: String) -> Result<(), SettingsError> {
    let io = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(io)?;
    }
    std::fs::write(path, contents).map_err(io)
}

/// `warm_session.max_uses` -> `/warm_session/max_uses`
fn to_pointer(path: &str) -> String {
    format!("/{}", path.replace('.', "/"))
}

fn render(leaf: &Value) -> String {
    match leaf {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Non-object nodes of `root` keyed by JSON pointer.
fn leaves(root: &Value) -> Vec<(String, &Value)> {
    let mut found = Vec::new();
    let mut stack = vec![(String::new(), root)];
    while let Some((pointer, node)) = stack.pop() {
        match node {
            Value::Object(fields) => {
                for (key, child) in fields {
                    stack.push((format!("{pointer}/{key}"), child));
                }
            }
            leaf => found.push((pointer, leaf)),
        }
    }
    found
}

fn coerce(current: &Value, path: &str, raw: &str) -> Result<Value, SettingsError> {
    let mismatch = |expected: &'static str| SettingsError::TypeMismatch {
        path: path.to_string(),
        expected,
        value: raw.to_string(),
    };
    Ok(match current {
        Value::Bool(_) => Value::Bool(raw.parse::<bool>().map_err(|_| mismatch("true or false"))?),
        Value::Number(_) => Value::from(raw.parse::<u64>().map_err(|_| mismatch("an integer"))?),
        Value::String(_) => Value::String(raw.to_string()),
        Value::Null => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        }
        Value::Array(_) | Value::Object(_) => {
            serde_json::from_str(raw).map_err(|_| mismatch("a JSON document"))?
        }
    })
}
