//! Cross-context messaging primitives.
//!
//! - [`await_response`]: wait for the message correlated with one request,
//!   with a timeout and an optional abort signal.
//! - [`WorkerQueue`]: one in-flight round trip per worker.
//! - [`SecureChannelHub`]: session-scoped channel to the signing worker,
//!   used to hand over seed material without it ever entering a response
//!   envelope.
//!
//! ```text
//!  credential side                          signing worker
//!  ───────────────                          ──────────────
//!  attach(session) ──ATTACH + endpoint────►
//!                  ◄──────────ATTACH_OK───
//!  deposit(seed)   ──seed over endpoint───►  endpoint.take()
//!                  ──SEED_READY──────────►
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ChannelError, WaitError};
use crate::types::{ConfirmationResponse, ControlMessage};

/// Messages that carry a correlation id.
pub trait Correlated {
    fn correlation_id(&self) -> &str;
}

impl Correlated for ConfirmationResponse {
    fn correlation_id(&self) -> &str {
        &self.request_id
    }
}

impl Correlated for ControlMessage {
    fn correlation_id(&self) -> &str {
        self.session_id()
    }
}

/// Fires an [`AbortSignal`].
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

/// Observes an [`AbortController`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted. Never resolves if the controller is dropped
    /// without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for the message correlated with `request_id`.
///
/// Uncorrelated messages are dropped and the wait continues. An abort wins
/// over an expired timeout when both are ready.
pub async fn await_response<T: Correlated>(
    rx: &mut mpsc::Receiver<T>,
    request_id: &str,
    timeout: Duration,
    abort: Option<&AbortSignal>,
) -> Result<T, WaitError> {
    let aborted_err = || WaitError::Aborted {
        request_id: request_id.to_string(),
    };
    if abort.is_some_and(AbortSignal::is_aborted) {
        return Err(aborted_err());
    }

    let aborted = async {
        match abort {
            Some(signal) => signal.aborted().await,
            None => std::future::pending().await,
        }
    };
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(aborted);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = &mut aborted => return Err(aborted_err()),
            _ = &mut deadline => {
                return Err(WaitError::TimedOut {
                    request_id: request_id.to_string(),
                    timeout,
                });
            }
            message = rx.recv() => match message {
                Some(message) if message.correlation_id() == request_id => return Ok(message),
                Some(message) => {
                    tracing::debug!(
                        expected = request_id,
                        got = message.correlation_id(),
                        "ignoring uncorrelated message"
                    );
                }
                None => {
                    return Err(WaitError::Closed {
                        request_id: request_id.to_string(),
                    });
                }
            }
        }
    }
}

/// Serializes round trips per worker. The next dispatch to a worker starts
/// only after the previous one has finished.
#[derive(Default)]
pub struct WorkerQueue {
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dispatch<F, T>(&self, worker: &str, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let lane = self
            .lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(worker.to_string())
            .or_default()
            .clone();
        let _turn = lane.lock().await;
        work.await
    }
}

/// Seed material for one session.
#[derive(Debug)]
pub struct SeedMaterial {
    /// PRF first output, used to derive the key-wrapping key.
    pub wrap_key_seed: SecretString,
    pub prf_second: Option<SecretString>,
}

/// Signing-worker end of an attached session channel. Yields its seed once.
#[derive(Debug)]
pub struct SeedEndpoint {
    session_id: String,
    rx: Option<oneshot::Receiver<SeedMaterial>>,
}

impl SeedEndpoint {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn take(&mut self) -> Result<SeedMaterial, ChannelError> {
        let rx = self.rx.take().ok_or_else(|| ChannelError::SeedConsumed {
            session_id: self.session_id.clone(),
        })?;
        rx.await.map_err(|_| ChannelError::NotAttached {
            session_id: self.session_id.clone(),
        })
    }
}

/// Message delivered to the signing worker.
#[derive(Debug)]
pub struct SignerEnvelope {
    pub message: ControlMessage,
    /// Present only on `Attach`.
    pub endpoint: Option<SeedEndpoint>,
}

/// The signing worker's side of the hub.
pub struct SignerPort {
    pub inbox: mpsc::Receiver<SignerEnvelope>,
    pub acks: mpsc::Sender<ControlMessage>,
}

const SIGNER_WORKER: &str = "signer";

/// Credential-side owner of session channels to the signing worker.
pub struct SecureChannelHub {
    to_signer: mpsc::Sender<SignerEnvelope>,
    acks: tokio::sync::Mutex<mpsc::Receiver<ControlMessage>>,
    pending: Mutex<HashMap<String, oneshot::Sender<SeedMaterial>>>,
    queue: WorkerQueue,
    timeout: Duration,
}

impl SecureChannelHub {
    pub fn new(timeout: Duration) -> (Self, SignerPort) {
        let (to_signer, inbox) = mpsc::channel(16);
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let hub = Self {
            to_signer,
            acks: tokio::sync::Mutex::new(ack_rx),
            pending: Mutex::new(HashMap::new()),
            queue: WorkerQueue::new(),
            timeout,
        };
        (
            hub,
            SignerPort {
                inbox,
                acks: ack_tx,
            },
        )
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<SeedMaterial>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.pending().contains_key(session_id)
    }

    async fn send(&self, envelope: SignerEnvelope) -> Result<(), ChannelError> {
        self.to_signer
            .send(envelope)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: SIGNER_WORKER.to_string(),
                reason: e.to_string(),
            })
    }

    /// Send `ATTACH` with a fresh endpoint and wait for `ATTACH_OK`.
    pub async fn attach(&self, session_id: &str) -> Result<(), ChannelError> {
        self.queue
            .dispatch(SIGNER_WORKER, async {
                if self.is_attached(session_id) {
                    return Err(ChannelError::AlreadyAttached {
                        session_id: session_id.to_string(),
                    });
                }

                let (tx, rx) = oneshot::channel();
                self.send(SignerEnvelope {
                    message: ControlMessage::Attach {
                        session_id: session_id.to_string(),
                    },
                    endpoint: Some(SeedEndpoint {
                        session_id: session_id.to_string(),
                        rx: Some(rx),
                    }),
                })
                .await?;

                let mut acks = self.acks.lock().await;
                await_response(&mut *acks, session_id, self.timeout, None).await?;
                self.pending().insert(session_id.to_string(), tx);
                tracing::debug!(session_id, "secure channel attached");
                Ok(())
            })
            .await
    }

    /// Hand the seed to the attached endpoint, then announce `SEED_READY`.
    pub async fn deposit(&self, session_id: &str, seed: SeedMaterial) -> Result<(), ChannelError> {
        let tx = self
            .pending()
            .remove(session_id)
            .ok_or_else(|| ChannelError::NotAttached {
                session_id: session_id.to_string(),
            })?;
        tx.send(seed).map_err(|_| ChannelError::SendFailed {
            name: SIGNER_WORKER.to_string(),
            reason: format!("endpoint for {session_id} dropped"),
        })?;
        self.send(SignerEnvelope {
            message: ControlMessage::SeedReady {
                session_id: session_id.to_string(),
            },
            endpoint: None,
        })
        .await
    }

    /// Drop an attached session without delivering a seed. The endpoint's
    /// `take` then fails.
    pub fn detach(&self, session_id: &str) -> bool {
        self.pending().remove(session_id).is_some()
    }
}
