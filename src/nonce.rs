//! Access-key nonce sequencing.
//!
//! One [`NonceSequencer`] lives per execution context. It caches the
//! on-chain access-key state for the current turn and hands out
//! reservations for transactions that are still pending, so that concurrent
//! signing requests never pick the same sequence number.
//!
//! ```text
//! base_context() ──► cached? ──yes──► same BaseContext for every caller
//!                      │
//!                      no / force
//!                      │
//!                      ▼
//!            view_access_key + view_block
//!                      │
//!                      ▼
//! reserve(n) ──► scan from next_nonce, skip reserved ──► insert ──► return
//! ```

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::ChainError;
use crate::rpc::ChainRpc;
use crate::types::TransactionContext;

/// Access-key and block state for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseContext {
    pub public_key_string: String,
    pub access_key_nonce: u64,
    pub next_nonce: u64,
    pub block_height: u64,
    pub block_hash: String,
}

impl BaseContext {
    pub fn to_transaction_context(&self, reserved: &[String]) -> TransactionContext {
        TransactionContext {
            near_public_key_str: self.public_key_string.clone(),
            access_key_nonce: self.access_key_nonce.to_string(),
            next_nonce: reserved
                .first()
                .cloned()
                .unwrap_or_else(|| self.next_nonce.to_string()),
            tx_block_height: self.block_height.to_string(),
            tx_block_hash: self.block_hash.clone(),
            reserved_nonces: reserved.to_vec(),
        }
    }
}

/// Options for [`NonceSequencer::base_context`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseContextOptions {
    /// Ignore the cached context and query the chain.
    pub force: bool,
}

#[derive(Debug, Default)]
struct SequencerState {
    account_id: Option<String>,
    public_key: Option<String>,
    reserved: BTreeSet<u64>,
    /// Next nonce derived from the last chain query.
    next_nonce: Option<u64>,
    /// Highest nonce known to be consumed by a broadcast transaction.
    broadcast_floor: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedBase {
    context: BaseContext,
    fetched_at: Instant,
}

/// Nonce sequencer for one account key.
pub struct NonceSequencer {
    state: Mutex<SequencerState>,
    /// Held across the chain query so concurrent callers share one fetch.
    cache: tokio::sync::Mutex<Option<CachedBase>>,
    max_age: Duration,
}

impl NonceSequencer {
    pub fn new(max_age: Duration) -> Self {
        Self {
            state: Mutex::new(SequencerState::default()),
            cache: tokio::sync::Mutex::new(None),
            max_age,
        }
    }

    fn state(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the sequencer to an account key. Switching to a different key
    /// drops all reservations and the cached context.
    pub async fn initialize(&self, account_id: &str, public_key: &str) {
        let changed = {
            let mut state = self.state();
            let same = state.account_id.as_deref() == Some(account_id)
                && state.public_key.as_deref() == Some(public_key);
            if !same {
                *state = SequencerState {
                    account_id: Some(account_id.to_string()),
                    public_key: Some(public_key.to_string()),
                    ..SequencerState::default()
                };
            }
            !same
        };
        if changed {
            *self.cache.lock().await = None;
            tracing::debug!(account_id, "nonce sequencer bound to new access key");
        }
    }

    /// Forget the bound key, the cached context and every reservation.
    pub async fn clear(&self) {
        *self.state() = SequencerState::default();
        *self.cache.lock().await = None;
    }

    pub fn account_id(&self) -> Option<String> {
        self.state().account_id.clone()
    }

    /// Drop the cached context so the next call starts a new turn.
    pub async fn end_turn(&self) {
        *self.cache.lock().await = None;
    }

    /// Query (or reuse) the access-key and block context for this turn.
    ///
    /// Chain failures propagate and leave the reservation set untouched.
    pub async fn base_context(
        &self,
        client: &dyn ChainRpc,
        options: BaseContextOptions,
    ) -> Result<BaseContext, ChainError> {
        let mut cache = self.cache.lock().await;

        if !options.force
            && let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.max_age
        {
            return Ok(cached.context.clone());
        }

        let (account_id, public_key) = {
            let state = self.state();
            match (state.account_id.clone(), state.public_key.clone()) {
                (Some(a), Some(p)) => (a, p),
                _ => return Err(ChainError::NotInitialized),
            }
        };

        let access_key = client.view_access_key(&account_id, &public_key).await?;
        let block = client.view_block().await?;

        let next_nonce = {
            let mut state = self.state();
            let chain_next = access_key.nonce.saturating_add(1);
            let next = match state.broadcast_floor {
                Some(floor) if floor >= chain_next => floor.saturating_add(1),
                _ => chain_next,
            };
            // Reservations the chain has already consumed are stale.
            state.reserved.retain(|n| *n > access_key.nonce);
            state.next_nonce = Some(next);
            next
        };

        let context = BaseContext {
            public_key_string: public_key,
            access_key_nonce: access_key.nonce,
            next_nonce,
            block_height: block.header.height,
            block_hash: block.header.hash,
        };

        tracing::debug!(
            account_id = %account_id,
            access_key_nonce = context.access_key_nonce,
            next_nonce = context.next_nonce,
            block_height = context.block_height,
            "refreshed nonce base context"
        );

        *cache = Some(CachedBase {
            context: context.clone(),
            fetched_at: Instant::now(),
        });
        Ok(context)
    }

    /// Reserve `count` strictly increasing, previously free nonces.
    ///
    /// The scan and the insert happen under one lock, so concurrent callers
    /// can never receive the same nonce.
    pub fn reserve(&self, count: usize) -> Result<Vec<String>, ChainError> {
        let mut state = self.state();
        let start = state.next_nonce.ok_or(ChainError::NotInitialized)?;

        let mut picked = Vec::with_capacity(count);
        let mut candidate = start;
        while picked.len() < count {
            if !state.reserved.contains(&candidate) {
                picked.push(candidate);
            }
            candidate = candidate
                .checked_add(1)
                .ok_or_else(|| ChainError::InvalidNonce("nonce space exhausted".to_string()))?;
        }
        state.reserved.extend(picked.iter().copied());

        tracing::debug!(count, first = ?picked.first(), "reserved nonces");
        Ok(picked.into_iter().map(|n| n.to_string()).collect())
    }

    /// Release one reservation. Releasing an absent nonce is a no-op.
    pub fn release(&self, nonce: &str) {
        match nonce.parse::<u64>() {
            Ok(n) => {
                if self.state().reserved.remove(&n) {
                    tracing::debug!(nonce = n, "released nonce");
                }
            }
            Err(_) => tracing::warn!(nonce, "ignoring release of non-numeric nonce"),
        }
    }

    /// Release every reservation.
    pub fn release_all(&self) {
        self.state().reserved.clear();
    }

    /// Record that `nonce` was consumed by a broadcast transaction. The
    /// reservation is dropped and later reservations start above it without
    /// waiting for a fresh chain query.
    pub fn mark_broadcast(&self, nonce: &str) -> Result<(), ChainError> {
        let n: u64 = nonce
            .parse()
            .map_err(|_| ChainError::InvalidNonce(nonce.to_string()))?;
        let after = n
            .checked_add(1)
            .ok_or_else(|| ChainError::InvalidNonce("nonce space exhausted".to_string()))?;
        let mut state = self.state();
        state.reserved.remove(&n);
        state.broadcast_floor = Some(state.broadcast_floor.map_or(n, |f| f.max(n)));
        if let Some(next) = state.next_nonce
            && next <= n
        {
            state.next_nonce = Some(after);
        }
        Ok(())
    }

    pub fn is_reserved(&self, nonce: &str) -> bool {
        nonce
            .parse::<u64>()
            .map(|n| self.state().reserved.contains(&n))
            .unwrap_or(false)
    }

    /// Snapshot of the reservation set in ascending order.
    pub fn reserved(&self) -> Vec<String> {
        self.state().reserved.iter().map(|n| n.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::rpc::{AccessKeyInfo, BlockHeader, BlockInfo};

    struct StubChain {
        nonce: AtomicU64,
        access_key_calls: AtomicUsize,
        fail: bool,
    }

    impl StubChain {
        fn new(nonce: u64) -> Self {
            Self {
                nonce: AtomicU64::new(nonce),
                access_key_calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ChainRpc for StubChain {
        async fn view_block(&self) -> Result<BlockInfo, ChainError> {
            Ok(BlockInfo {
                header: BlockHeader {
                    height: 500,
                    hash: "blockhash".to_string(),
                },
            })
        }

        async fn view_access_key(
            &self,
            _account_id: &str,
            _public_key: &str,
        ) -> Result<AccessKeyInfo, ChainError> {
            self.access_key_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(ChainError::RequestFailed {
                    method: "query".to_string(),
                    reason: "unavailable".to_string(),
                });
            }
            Ok(AccessKeyInfo {
                nonce: self.nonce.load(Ordering::SeqCst),
                block_height: 500,
                block_hash: "blockhash".to_string(),
            })
        }

        async fn send_transaction(&self, _tx: &str) -> Result<serde_json::Value, ChainError> {
            Ok(serde_json::Value::Null)
        }
    }

    async fn ready_sequencer(chain: &StubChain) -> NonceSequencer {
        let seq = NonceSequencer::new(Duration::from_secs(30));
        seq.initialize("alice.testnet", "ed25519:pk").await;
        seq.base_context(chain, BaseContextOptions::default())
            .await
            .expect("base context");
        seq
    }

    #[tokio::test]
    async fn reserve_returns_distinct_increasing_nonces() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;

        let first = seq.reserve(3).unwrap();
        assert_eq!(first, vec!["101", "102", "103"]);
        let second = seq.reserve(2).unwrap();
        assert_eq!(second, vec!["104", "105"]);
        for n in first.iter().chain(second.iter()) {
            assert!(seq.is_reserved(n));
        }
    }

    #[tokio::test]
    async fn reserve_skips_holes_left_by_release() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;

        seq.reserve(3).unwrap();
        seq.release("102");
        assert_eq!(seq.reserve(2).unwrap(), vec!["102", "104"]);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_release_all_empties() {
        let chain = StubChain::new(7);
        let seq = ready_sequencer(&chain).await;

        let nonces = seq.reserve(2).unwrap();
        seq.release(&nonces[0]);
        seq.release(&nonces[0]);
        assert!(!seq.is_reserved(&nonces[0]));
        assert!(seq.is_reserved(&nonces[1]));

        seq.reserve(4).unwrap();
        seq.release_all();
        assert!(seq.reserved().is_empty());
    }

    #[tokio::test]
    async fn released_batch_does_not_shift_next_reservation() {
        let chain = StubChain::new(41);
        let seq = ready_sequencer(&chain).await;

        let batch = seq.reserve(5).unwrap();
        for n in &batch {
            seq.release(n);
        }
        assert_eq!(seq.reserve(2).unwrap(), vec!["42", "43"]);
    }

    #[tokio::test]
    async fn concurrent_base_context_callers_share_one_fetch() {
        let chain = Arc::new(StubChain::new(10));
        let seq = Arc::new(NonceSequencer::new(Duration::from_secs(30)));
        seq.initialize("alice.testnet", "ed25519:pk").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let chain = Arc::clone(&chain);
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move {
                seq.base_context(chain.as_ref(), BaseContextOptions::default())
                    .await
                    .unwrap()
            }));
        }
        let contexts = futures::future::join_all(handles).await;
        let first = contexts[0].as_ref().unwrap().clone();
        for ctx in contexts {
            assert_eq!(ctx.unwrap(), first);
        }
        assert_eq!(chain.access_key_calls.load(Ordering::SeqCst), 1);

        chain.nonce.store(20, Ordering::SeqCst);
        let forced = seq
            .base_context(chain.as_ref(), BaseContextOptions { force: true })
            .await
            .unwrap();
        assert_eq!(forced.next_nonce, 21);
        assert_eq!(chain.access_key_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn end_turn_forces_a_fresh_query() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;

        seq.base_context(&chain, BaseContextOptions::default())
            .await
            .unwrap();
        assert_eq!(chain.access_key_calls.load(Ordering::SeqCst), 1);

        chain.nonce.store(150, Ordering::SeqCst);
        seq.end_turn().await;
        let next = seq
            .base_context(&chain, BaseContextOptions::default())
            .await
            .unwrap();
        assert_eq!(next.next_nonce, 151);
        assert_eq!(chain.access_key_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overlap() {
        let chain = StubChain::new(0);
        let seq = Arc::new(ready_sequencer(&chain).await);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move { seq.reserve(3).unwrap() }));
        }
        let mut all: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(seq.reserved().len(), 48);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_reservations_untouched() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;
        let reserved = seq.reserve(2).unwrap();

        let failing = StubChain {
            fail: true,
            ..StubChain::new(100)
        };
        let err = seq
            .base_context(&failing, BaseContextOptions { force: true })
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::RequestFailed { .. }));
        assert_eq!(seq.reserved(), reserved);
    }

    #[tokio::test]
    async fn reserve_before_base_context_is_an_error() {
        let seq = NonceSequencer::new(Duration::from_secs(30));
        assert!(matches!(seq.reserve(1), Err(ChainError::NotInitialized)));

        let chain = StubChain::new(1);
        let err = seq
            .base_context(&chain, BaseContextOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NotInitialized));
    }

    #[tokio::test]
    async fn mark_broadcast_advances_past_stale_chain_nonce() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;

        let nonces = seq.reserve(2).unwrap();
        seq.mark_broadcast(&nonces[0]).unwrap();
        seq.mark_broadcast(&nonces[1]).unwrap();
        assert!(seq.reserved().is_empty());

        // Chain has not caught up yet; the floor keeps us ahead of it.
        let ctx = seq
            .base_context(&chain, BaseContextOptions { force: true })
            .await
            .unwrap();
        assert_eq!(ctx.next_nonce, 103);
        assert_eq!(seq.reserve(1).unwrap(), vec!["103"]);
    }

    #[tokio::test]
    async fn mark_broadcast_rejects_the_last_nonce_instead_of_wrapping() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;
        let reserved = seq.reserve(1).unwrap();

        let err = seq.mark_broadcast(&u64::MAX.to_string()).unwrap_err();
        assert!(matches!(err, ChainError::InvalidNonce(_)));
        assert!(matches!(
            seq.mark_broadcast("not-a-number"),
            Err(ChainError::InvalidNonce(_))
        ));
        assert_eq!(seq.reserved(), reserved);
    }

    #[tokio::test]
    async fn switching_keys_resets_state() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;
        seq.reserve(2).unwrap();

        seq.initialize("bob.testnet", "ed25519:other").await;
        assert!(seq.reserved().is_empty());
        assert!(matches!(seq.reserve(1), Err(ChainError::NotInitialized)));
        assert_eq!(seq.account_id().as_deref(), Some("bob.testnet"));
    }

    #[tokio::test]
    async fn transaction_context_uses_first_reserved_nonce() {
        let chain = StubChain::new(100);
        let seq = ready_sequencer(&chain).await;
        let ctx = seq
            .base_context(&chain, BaseContextOptions::default())
            .await
            .unwrap();
        seq.reserve(1).unwrap();
        let reserved = seq.reserve(2).unwrap();
        let tx_ctx = ctx.to_transaction_context(&reserved);
        assert_eq!(tx_ctx.next_nonce, "102");
        assert_eq!(tx_ctx.access_key_nonce, "100");
        assert_eq!(tx_ctx.tx_block_height, "500");
    }
}
