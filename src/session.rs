//! Warm-session signing capabilities.
//!
//! After a WebAuthn-confirmed signing request the host may open a warm
//! session. Later requests in `warmSession` mode skip the authenticator and
//! draw on that session until its use count or expiry runs out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SessionError;
use crate::types::WarmSessionGrant;

/// Limits applied to newly granted sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmSessionPolicy {
    pub max_uses: u32,
    pub ttl: Duration,
}

impl Default for WarmSessionPolicy {
    fn default() -> Self {
        Self {
            max_uses: 3,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    account_id: String,
    remaining_uses: u32,
    expires_at: DateTime<Utc>,
}

/// Use-count and expiry ledger for warm sessions.
pub struct WarmSessionLedger {
    policy: WarmSessionPolicy,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl WarmSessionLedger {
    pub fn new(policy: WarmSessionPolicy) -> Self {
        Self {
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open (or renew) a session for `account_id` with the full policy budget.
    pub fn grant(&self, session_id: &str, account_id: &str) -> WarmSessionGrant {
        let ttl = chrono::Duration::from_std(self.policy.ttl).unwrap_or(chrono::Duration::zero());
        let entry = SessionEntry {
            account_id: account_id.to_string(),
            remaining_uses: self.policy.max_uses,
            expires_at: Utc::now() + ttl,
        };
        let grant = WarmSessionGrant {
            session_id: session_id.to_string(),
            remaining_uses: entry.remaining_uses,
            expires_at: entry.expires_at,
        };
        self.sessions().insert(session_id.to_string(), entry);
        tracing::debug!(session_id, account_id, "warm session granted");
        grant
    }

    /// Consume one use. Expired and exhausted sessions are removed.
    pub fn consume(
        &self,
        session_id: &str,
        account_id: &str,
    ) -> Result<WarmSessionGrant, SessionError> {
        let mut sessions = self.sessions();
        let not_found = || SessionError::NotFound {
            session_id: session_id.to_string(),
        };

        let entry = sessions
            .get_mut(session_id)
            .filter(|e| e.account_id == account_id)
            .ok_or_else(not_found)?;

        if Utc::now() >= entry.expires_at {
            sessions.remove(session_id);
            return Err(SessionError::Expired {
                session_id: session_id.to_string(),
            });
        }
        if entry.remaining_uses == 0 {
            sessions.remove(session_id);
            return Err(SessionError::Exhausted {
                session_id: session_id.to_string(),
            });
        }

        entry.remaining_uses -= 1;
        Ok(WarmSessionGrant {
            session_id: session_id.to_string(),
            remaining_uses: entry.remaining_uses,
            expires_at: entry.expires_at,
        })
    }

    /// Give back a use taken by [`consume`](Self::consume) for a request that
    /// did not complete. No-op once the session is gone or expired.
    pub fn restore(&self, session_id: &str) -> Option<u32> {
        let mut sessions = self.sessions();
        let entry = sessions
            .get_mut(session_id)
            .filter(|e| Utc::now() < e.expires_at)?;
        entry.remaining_uses = entry.remaining_uses.saturating_add(1).min(self.policy.max_uses);
        Some(entry.remaining_uses)
    }

    /// Current state of a session, if it is still usable.
    pub fn status(&self, session_id: &str) -> Option<WarmSessionGrant> {
        let sessions = self.sessions();
        let entry = sessions.get(session_id)?;
        (entry.remaining_uses > 0 && Utc::now() < entry.expires_at).then(|| WarmSessionGrant {
            session_id: session_id.to_string(),
            remaining_uses: entry.remaining_uses,
            expires_at: entry.expires_at,
        })
    }

    pub fn revoke(&self, session_id: &str) -> bool {
        self.sessions().remove(session_id).is_some()
    }

    /// Drop every expired or exhausted session. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, e| e.remaining_uses > 0 && now < e.expires_at);
        before - sessions.len()
    }
}

/// Hands the session-scoped signing key to the signing worker.
#[async_trait]
pub trait SessionKeyDispenser: Send + Sync {
    async fn dispense(&self, grant: &WarmSessionGrant, account_id: &str)
    -> Result<(), SessionError>;

    /// Withdraw a key handed out for a request that was then declined or
    /// cancelled. Must tolerate grants whose dispense never completed.
    async fn reclaim(&self, grant: &WarmSessionGrant, account_id: &str);
}
