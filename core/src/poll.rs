/// Long-poll event queue loop and its per-login supervisor
///
/// One `QueueManager` runs per login, on its own task. It registers a queue,
/// polls batches, hands envelopes to the dispatcher in order and persists the
/// watermark of the last envelope the dispatcher accepted. Both the
/// in-flight request and the retry sleep are raced against the cancel signal.
use crate::bridge::{BridgeState, StateEvent, StatusReporter};
use crate::error::Result;
use crate::ids::LoginId;
use crate::zulip::{EventQueueApi, RawEnvelope, RegisterRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const REGISTER_ERROR: &str = "zulip-queue-register-error";
pub const POLL_ERROR: &str = "zulip-event-poll-error";

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side queue handle plus the consumption watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub queue_id: String,
    /// May be -1 right after registration
    pub last_event_id: i64,
}

/// Persists the queue state of one login
pub trait QueueStateStore: Send + Sync {
    fn load(&self) -> Result<Option<QueueState>>;
    fn save(&self, state: &QueueState) -> Result<()>;
}

/// Consumes one envelope; false means "not consumed, try again later"
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &RawEnvelope) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    Cancelled,
    /// Credentials rejected or account gone; needs a new login
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollPhase {
    Unregistered,
    Registering,
    Polling(QueueState),
    Stopped(PollExit),
}

pub struct QueueManager {
    login: LoginId,
    api: Arc<dyn EventQueueApi>,
    handler: Arc<dyn EnvelopeHandler>,
    store: Arc<dyn QueueStateStore>,
    status: Arc<dyn StatusReporter>,
    retry_interval: Duration,
}

impl QueueManager {
    pub fn new(
        login: LoginId,
        api: Arc<dyn EventQueueApi>,
        handler: Arc<dyn EnvelopeHandler>,
        store: Arc<dyn QueueStateStore>,
        status: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            login,
            api,
            handler,
            store,
            status,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn login(&self) -> LoginId {
        self.login
    }

    /// Run until cancelled or a fatal error. `cancel` flips to true (or its
    /// sender is dropped) to stop.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> PollExit {
        self.status.send_state(BridgeState::new(StateEvent::Connecting));
        // After a transient failure, Connected waits for a successful poll
        let mut announced = false;
        let mut connected = false;
        let mut phase = match self.store.load() {
            Ok(Some(state)) if !state.queue_id.is_empty() => {
                info!(
                    "Resuming event queue {} at event {}",
                    state.queue_id, state.last_event_id
                );
                PollPhase::Polling(state)
            }
            Ok(_) => PollPhase::Unregistered,
            Err(e) => {
                error!("Failed to load queue state for login {}: {}", self.login, e);
                PollPhase::Unregistered
            }
        };

        loop {
            if is_cancelled(&cancel) && !matches!(phase, PollPhase::Stopped(_)) {
                phase = PollPhase::Stopped(PollExit::Cancelled);
            }
            if matches!(phase, PollPhase::Polling(_)) && !announced {
                self.status.send_state(BridgeState::new(StateEvent::Connected));
                announced = true;
                connected = true;
            }
            phase = match phase {
                PollPhase::Unregistered => PollPhase::Registering,
                PollPhase::Registering => self.register(&mut cancel, &mut connected).await,
                PollPhase::Polling(state) => {
                    self.poll_once(state, &mut cancel, &mut connected).await
                }
                PollPhase::Stopped(exit) => {
                    info!("Polling stopped for login {} ({:?})", self.login, exit);
                    return exit;
                }
            };
        }
    }

    async fn register(
        &self,
        cancel: &mut watch::Receiver<bool>,
        connected: &mut bool,
    ) -> PollPhase {
        debug!("Registering event queue for login {}", self.login);
        let request = RegisterRequest::standard();
        let Some(result) = cancellable(cancel, self.api.register(&request)).await else {
            return PollPhase::Stopped(PollExit::Cancelled);
        };
        match result {
            Ok(registered) => {
                info!(
                    "Registered event queue {} at event {}",
                    registered.queue_id, registered.last_event_id
                );
                let state = QueueState {
                    queue_id: registered.queue_id,
                    last_event_id: registered.last_event_id,
                };
                self.persist(&state);
                PollPhase::Polling(state)
            }
            Err(e) if e.is_fatal() => {
                error!("Failed to register event queue: {}", e);
                self.report(StateEvent::UnknownError, REGISTER_ERROR, &e.to_string());
                PollPhase::Stopped(PollExit::Fatal)
            }
            Err(e) => {
                error!("Failed to register event queue: {}", e);
                self.report(StateEvent::TransientDisconnect, REGISTER_ERROR, &e.to_string());
                *connected = false;
                if self.backoff(cancel).await {
                    PollPhase::Registering
                } else {
                    PollPhase::Stopped(PollExit::Cancelled)
                }
            }
        }
    }

    async fn poll_once(
        &self,
        mut state: QueueState,
        cancel: &mut watch::Receiver<bool>,
        connected: &mut bool,
    ) -> PollPhase {
        let request = self.api.get_events(&state.queue_id, state.last_event_id);
        let Some(result) = cancellable(cancel, request).await else {
            return PollPhase::Stopped(PollExit::Cancelled);
        };
        match result {
            Ok(batch) => {
                if !*connected {
                    self.status.send_state(BridgeState::new(StateEvent::Connected));
                    *connected = true;
                }
                let start = state.last_event_id;
                let stalled = self.dispatch_batch(batch, &mut state, cancel).await;
                if state.last_event_id != start {
                    self.persist(&state);
                }
                if stalled && !self.backoff(cancel).await {
                    return PollPhase::Stopped(PollExit::Cancelled);
                }
                PollPhase::Polling(state)
            }
            Err(e) if e.is_queue_expired() => {
                info!("Event queue {} expired, registering a new one", state.queue_id);
                PollPhase::Registering
            }
            Err(e) if e.is_fatal() => {
                error!("Failed to poll event queue: {}", e);
                self.report(StateEvent::UnknownError, POLL_ERROR, &e.to_string());
                PollPhase::Stopped(PollExit::Fatal)
            }
            Err(e) => {
                error!("Failed to poll event queue: {}", e);
                self.report(StateEvent::TransientDisconnect, POLL_ERROR, &e.to_string());
                *connected = false;
                if self.backoff(cancel).await {
                    PollPhase::Polling(state)
                } else {
                    PollPhase::Stopped(PollExit::Cancelled)
                }
            }
        }
    }

    /// Returns true if an envelope was rejected and the batch stopped early.
    async fn dispatch_batch(
        &self,
        batch: Vec<Value>,
        state: &mut QueueState,
        cancel: &watch::Receiver<bool>,
    ) -> bool {
        for raw in batch {
            if is_cancelled(cancel) {
                return false;
            }
            let envelope = match RawEnvelope::from_value(raw) {
                Ok(envelope) => envelope,
                Err(reason) => {
                    warn!("Skipping event without an id: {}", reason);
                    continue;
                }
            };
            if !self.handler.handle(&envelope).await {
                warn!("Failed to handle event {}", envelope.id);
                return true;
            }
            state.last_event_id = envelope.id;
        }
        false
    }

    fn persist(&self, state: &QueueState) {
        if let Err(e) = self.store.save(state) {
            error!("Failed to save queue state for login {}: {}", self.login, e);
        }
    }

    fn report(&self, state_event: StateEvent, code: &str, message: &str) {
        self.status
            .send_state(BridgeState::with_error(state_event, code, message));
    }

    /// False if cancelled while waiting
    async fn backoff(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        cancellable(cancel, tokio::time::sleep(self.retry_interval))
            .await
            .is_some()
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Runs `fut` unless cancellation arrives first.
async fn cancellable<F: Future>(cancel: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    if is_cancelled(cancel) {
        return None;
    }
    tokio::select! {
        biased;
        _ = cancel.wait_for(|stop| *stop) => None,
        out = fut => Some(out),
    }
}

/// Owns the poll task of one login
pub struct PollSupervisor {
    login: LoginId,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<Option<PollExit>>,
}

impl PollSupervisor {
    pub fn spawn(manager: QueueManager) -> Self {
        let login = manager.login();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        tokio::spawn(async move {
            let exit = manager.run(cancel_rx).await;
            done_tx.send_replace(Some(exit));
        });
        Self {
            login,
            cancel: cancel_tx,
            done: done_rx,
        }
    }

    pub fn login(&self) -> LoginId {
        self.login
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Exit reason, once the task has finished
    pub fn exit(&self) -> Option<PollExit> {
        *self.done.borrow()
    }

    /// Wait for the task to finish on its own
    pub async fn wait(&self) -> Option<PollExit> {
        let mut done = self.done.clone();
        let exit = match done.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit
    }

    /// Cancel and wait up to `timeout` for the task to finish.
    pub async fn stop(&self, timeout: Duration) -> Option<PollExit> {
        self.cancel();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!("Timed out waiting for poll of login {} to stop", self.login);
                None
            }
        }
    }
}

impl Drop for PollSupervisor {
    fn drop(&mut self) {
        self.cancel();
    }
}
