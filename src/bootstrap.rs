//! Pre-config environment.
//!
//! Vars needed before settings are read (network, RPC endpoint, relying
//! party) may live in `~/.passkey-confirm/.env`, in dotenvy format.

use std::path::{Path, PathBuf};

/// `~/.passkey-confirm`, or `./.passkey-confirm` without a home directory.
pub fn base_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".passkey-confirm")
}

pub fn env_path() -> PathBuf {
    base_dir().join(".env")
}

/// Read `~/.passkey-confirm/.env` into the process environment.
///
/// Runs after `dotenvy::dotenv()`. Neither call overwrites a var that is
/// already set, giving: process env > `./.env` > `~/.passkey-confirm/.env`.
pub fn load_env() {
    load_env_from(&env_path());
}

fn load_env_from(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match dotenvy::from_path(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "loaded bootstrap env");
            true
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "bootstrap env unreadable");
            false
        }
    }
}
