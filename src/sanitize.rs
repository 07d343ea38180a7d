//! Sanitization boundary for values that cross a thread or worker boundary.
//!
//! Internal envelopes may carry live UI handles and callbacks next to plain
//! data. [`sanitize`] reduces a [`Transferable`] to plain JSON, dropping every
//! non-transferable value and every internal field. The result is stable
//! under repeated sanitization.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

/// Keys that only have meaning inside the originating context.
pub const INTERNAL_KEYS: &[&str] = &["_confirmHandle", "confirmHandle", "_uiElement"];

pub type Callback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Reference to a mounted confirmation element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiHandle(pub u64);

/// A value as it exists before crossing a boundary.
#[derive(Clone)]
pub enum Transferable {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Transferable>),
    Object(BTreeMap<String, Transferable>),
    Callback(Callback),
    Handle(UiHandle),
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Handle(h) => f.debug_tuple("Handle").field(h).finish(),
        }
    }
}

impl Transferable {
    /// Insert a field into an object value. No-op for other variants.
    pub fn insert(&mut self, key: impl Into<String>, value: Transferable) {
        if let Self::Object(map) = self {
            map.insert(key.into(), value);
        }
    }

    fn is_transferable(&self) -> bool {
        !matches!(self, Self::Callback(_) | Self::Handle(_))
    }
}

impl From<serde_json::Value> for Transferable {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// Strip callbacks, handles and internal keys, recursively.
pub fn sanitize(value: Transferable) -> serde_json::Value {
    match value {
        Transferable::Null | Transferable::Callback(_) | Transferable::Handle(_) => {
            serde_json::Value::Null
        }
        Transferable::Bool(b) => serde_json::Value::Bool(b),
        Transferable::Number(n) => serde_json::Value::Number(n),
        Transferable::String(s) => serde_json::Value::String(s),
        Transferable::Array(items) => serde_json::Value::Array(
            items
                .into_iter()
                .filter(Transferable::is_transferable)
                .map(sanitize)
                .collect(),
        ),
        Transferable::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(k, v)| v.is_transferable() && !INTERNAL_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k, sanitize(v)))
                .collect(),
        ),
    }
}

/// Mask bearer tokens, key/secret assignments and PRF material in free-form
/// error text before it leaves the process or reaches a log line.
pub fn redact_sensitive_detail(raw: &str) -> String {
    let mut value = raw.to_string();
    let patterns = [
        (r"(?i)\b(bearer)\s+[a-z0-9._\-~+/]+=*", "$1 [REDACTED]"),
        (
            r"(?i)\b(token|api[_\-]?key|secret|password|seed|prf[_\-]?output)\b(\s*[:=]\s*)([^,\s]+)",
            "$1$2[REDACTED]",
        ),
        (r"(?i)\bed25519:[1-9a-hj-np-z]{40,}\b", "ed25519:[REDACTED]"),
    ];

    for (pattern, replacement) in patterns {
        if let Ok(re) = Regex::new(pattern) {
            value = re.replace_all(&value, replacement).to_string();
        }
    }

    value
}
