/// Event queue loop tests
/// Scripted API responses; an exhausted script hangs like an idle long poll

extern crate zulink_core;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use zulink_core::bridge::{BridgeState, StateEvent, StatusReporter};
use zulink_core::ids::LoginId;
use zulink_core::poll::{
    EnvelopeHandler, PollExit, PollSupervisor, QueueManager, QueueState, QueueStateStore,
    POLL_ERROR, REGISTER_ERROR,
};
use zulink_core::zulip::{EventQueueApi, RawEnvelope, RegisterRequest, RegisterResponse};
use zulink_core::{BridgeError, Result};

const ME: LoginId = LoginId(8);

#[derive(Default)]
struct ScriptedApi {
    registers: Mutex<VecDeque<Result<RegisterResponse>>>,
    batches: Mutex<VecDeque<Result<Vec<Value>>>>,
    register_calls: Mutex<usize>,
    polls: Mutex<Vec<(String, i64)>>,
}

impl ScriptedApi {
    fn register_ok(self, queue_id: &str, last_event_id: i64) -> Self {
        self.registers.lock().unwrap().push_back(Ok(RegisterResponse {
            queue_id: queue_id.to_string(),
            last_event_id,
        }));
        self
    }

    fn register_err(self, err: BridgeError) -> Self {
        self.registers.lock().unwrap().push_back(Err(err));
        self
    }

    fn batch(self, events: Vec<Value>) -> Self {
        self.batches.lock().unwrap().push_back(Ok(events));
        self
    }

    fn poll_err(self, err: BridgeError) -> Self {
        self.batches.lock().unwrap().push_back(Err(err));
        self
    }

    fn register_calls(&self) -> usize {
        *self.register_calls.lock().unwrap()
    }

    fn polls(&self) -> Vec<(String, i64)> {
        self.polls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventQueueApi for ScriptedApi {
    async fn register(&self, _request: &RegisterRequest) -> Result<RegisterResponse> {
        *self.register_calls.lock().unwrap() += 1;
        let next = self.registers.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn get_events(&self, queue_id: &str, last_event_id: i64) -> Result<Vec<Value>> {
        self.polls
            .lock()
            .unwrap()
            .push((queue_id.to_string(), last_event_id));
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

/// Accepts everything except ids listed in `reject_once`, which fail one time
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<i64>>,
    reject_once: Mutex<HashSet<i64>>,
}

impl RecordingHandler {
    fn rejecting(ids: &[i64]) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            reject_once: Mutex::new(ids.iter().copied().collect()),
        }
    }

    fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvelopeHandler for RecordingHandler {
    async fn handle(&self, envelope: &RawEnvelope) -> bool {
        self.seen.lock().unwrap().push(envelope.id);
        !self.reject_once.lock().unwrap().remove(&envelope.id)
    }
}

#[derive(Default)]
struct MemoryStore {
    state: Mutex<Option<QueueState>>,
}

impl MemoryStore {
    fn with_state(queue_id: &str, last_event_id: i64) -> Self {
        Self {
            state: Mutex::new(Some(QueueState {
                queue_id: queue_id.to_string(),
                last_event_id,
            })),
        }
    }

    fn current(&self) -> Option<QueueState> {
        self.state.lock().unwrap().clone()
    }
}

impl QueueStateStore for MemoryStore {
    fn load(&self) -> Result<Option<QueueState>> {
        Ok(self.current())
    }

    fn save(&self, state: &QueueState) -> Result<()> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[derive(Default)]
struct StatusLog {
    states: Mutex<Vec<BridgeState>>,
}

impl StatusLog {
    fn events(&self) -> Vec<StateEvent> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.state_event)
            .collect()
    }

    fn errors(&self) -> Vec<(StateEvent, String)> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.error.clone().map(|code| (s.state_event, code)))
            .collect()
    }
}

impl StatusReporter for StatusLog {
    fn send_state(&self, state: BridgeState) {
        self.states.lock().unwrap().push(state);
    }
}

struct Harness {
    api: Arc<ScriptedApi>,
    handler: Arc<RecordingHandler>,
    store: Arc<MemoryStore>,
    status: Arc<StatusLog>,
}

impl Harness {
    fn new(api: ScriptedApi, handler: RecordingHandler, store: MemoryStore) -> Self {
        Self {
            api: Arc::new(api),
            handler: Arc::new(handler),
            store: Arc::new(store),
            status: Arc::new(StatusLog::default()),
        }
    }

    fn manager(&self) -> QueueManager {
        QueueManager::new(
            ME,
            self.api.clone(),
            self.handler.clone(),
            self.store.clone(),
            self.status.clone(),
        )
        .with_retry_interval(Duration::from_millis(10))
    }
}

fn event(id: i64) -> Value {
    json!({ "id": id, "type": "heartbeat" })
}

async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_watermark_is_persisted() {
    let h = Harness::new(
        ScriptedApi::default()
            .register_ok("q1", -1)
            .batch(vec![event(1), event(2)]),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| h.api.polls().len() == 2).await;
    assert_eq!(
        h.api.polls(),
        vec![("q1".to_string(), -1), ("q1".to_string(), 2)]
    );
    assert_eq!(
        h.store.current(),
        Some(QueueState {
            queue_id: "q1".into(),
            last_event_id: 2
        })
    );
    assert_eq!(h.handler.seen(), vec![1, 2]);

    assert_eq!(
        supervisor.stop(Duration::from_secs(1)).await,
        Some(PollExit::Cancelled)
    );
    assert_eq!(
        h.status.events(),
        vec![StateEvent::Connecting, StateEvent::Connected]
    );
}

#[tokio::test]
async fn test_resumes_stored_queue() {
    let h = Harness::new(
        ScriptedApi::default(),
        RecordingHandler::default(),
        MemoryStore::with_state("stored", 7),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| !h.api.polls().is_empty()).await;
    assert_eq!(h.api.polls()[0], ("stored".to_string(), 7));
    assert_eq!(h.api.register_calls(), 0);
    supervisor.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_expired_queue_registers_again_quietly() {
    let h = Harness::new(
        ScriptedApi::default()
            .poll_err(BridgeError::QueueExpired("old".into()))
            .register_ok("new", 10),
        RecordingHandler::default(),
        MemoryStore::with_state("old", 5),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| h.api.polls().len() == 2).await;
    assert_eq!(
        h.api.polls(),
        vec![("old".to_string(), 5), ("new".to_string(), 10)]
    );
    assert_eq!(h.api.register_calls(), 1);
    assert_eq!(h.store.current().unwrap().queue_id, "new");
    supervisor.stop(Duration::from_secs(1)).await;

    assert!(!h.status.events().contains(&StateEvent::TransientDisconnect));
}

#[tokio::test]
async fn test_transient_poll_error_reports_and_retries() {
    let h = Harness::new(
        ScriptedApi::default()
            .register_ok("q1", -1)
            .poll_err(BridgeError::Transport("connection reset".into()))
            .batch(vec![event(1)]),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| h.api.polls().len() == 3).await;
    supervisor.stop(Duration::from_secs(1)).await;

    assert_eq!(
        h.status.events(),
        vec![
            StateEvent::Connecting,
            StateEvent::Connected,
            StateEvent::TransientDisconnect,
            StateEvent::Connected,
        ]
    );
    assert_eq!(
        h.status.errors(),
        vec![(StateEvent::TransientDisconnect, POLL_ERROR.to_string())]
    );
    // The failed poll is retried from the same watermark
    assert_eq!(h.api.polls()[1], ("q1".to_string(), -1));
    assert_eq!(h.api.polls()[2], ("q1".to_string(), 1));
}

#[tokio::test]
async fn test_transient_register_error_retries() {
    let h = Harness::new(
        ScriptedApi::default()
            .register_err(BridgeError::Transport("dns failure".into()))
            .register_ok("q1", 3),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| !h.api.polls().is_empty()).await;
    supervisor.stop(Duration::from_secs(1)).await;

    assert_eq!(h.api.register_calls(), 2);
    assert_eq!(
        h.status.errors(),
        vec![(StateEvent::TransientDisconnect, REGISTER_ERROR.to_string())]
    );
}

#[tokio::test]
async fn test_fatal_register_error_stops() {
    let h = Harness::new(
        ScriptedApi::default().register_err(BridgeError::Unauthorized("bad key".into())),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let (_cancel, rx) = watch::channel(false);

    let exit = tokio::time::timeout(Duration::from_secs(5), h.manager().run(rx))
        .await
        .unwrap();
    assert_eq!(exit, PollExit::Fatal);
    assert_eq!(
        h.status.errors(),
        vec![(StateEvent::UnknownError, REGISTER_ERROR.to_string())]
    );
    assert!(h.api.polls().is_empty());
}

#[tokio::test]
async fn test_fatal_poll_error_stops() {
    let h = Harness::new(
        ScriptedApi::default().poll_err(BridgeError::Api {
            code: "USER_DEACTIVATED".into(),
            msg: "Account is deactivated".into(),
        }),
        RecordingHandler::default(),
        MemoryStore::with_state("q1", 4),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), supervisor.wait())
            .await
            .unwrap(),
        Some(PollExit::Fatal)
    );
    assert_eq!(supervisor.exit(), Some(PollExit::Fatal));
    assert_eq!(
        h.status.errors(),
        vec![(StateEvent::UnknownError, POLL_ERROR.to_string())]
    );
}

#[tokio::test]
async fn test_rejected_event_stalls_watermark() {
    let h = Harness::new(
        ScriptedApi::default()
            .register_ok("q1", -1)
            .batch(vec![event(1), event(2), event(3)])
            .batch(vec![event(2), event(3)]),
        RecordingHandler::rejecting(&[2]),
        MemoryStore::default(),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| h.api.polls().len() == 3).await;
    supervisor.stop(Duration::from_secs(1)).await;

    assert_eq!(h.handler.seen(), vec![1, 2, 2, 3]);
    assert_eq!(
        h.api.polls(),
        vec![
            ("q1".to_string(), -1),
            ("q1".to_string(), 1),
            ("q1".to_string(), 3)
        ]
    );
    assert_eq!(h.store.current().unwrap().last_event_id, 3);
}

#[tokio::test]
async fn test_unreadable_events_are_skipped() {
    let h = Harness::new(
        ScriptedApi::default()
            .register_ok("q1", -1)
            .batch(vec![json!({ "type": "heartbeat" }), event(4)]),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| h.api.polls().len() == 2).await;
    supervisor.stop(Duration::from_secs(1)).await;

    assert_eq!(h.handler.seen(), vec![4]);
    assert_eq!(h.api.polls()[1], ("q1".to_string(), 4));
}

#[tokio::test]
async fn test_untyped_event_still_moves_watermark() {
    let h = Harness::new(
        ScriptedApi::default()
            .register_ok("q1", -1)
            .batch(vec![event(1), json!({ "id": 2 })]),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| h.api.polls().len() == 2).await;
    supervisor.stop(Duration::from_secs(1)).await;

    assert_eq!(h.handler.seen(), vec![1, 2]);
    assert_eq!(
        h.api.polls(),
        vec![("q1".to_string(), -1), ("q1".to_string(), 2)]
    );
    assert_eq!(h.store.current().unwrap().last_event_id, 2);
}

#[tokio::test]
async fn test_cancel_interrupts_hanging_poll() {
    let h = Harness::new(
        ScriptedApi::default().register_ok("q1", -1),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let supervisor = PollSupervisor::spawn(h.manager());

    eventually(|| h.api.polls().len() == 1).await;
    assert_eq!(supervisor.exit(), None);
    assert_eq!(
        supervisor.stop(Duration::from_secs(1)).await,
        Some(PollExit::Cancelled)
    );
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let h = Harness::new(
        ScriptedApi::default()
            .register_ok("q1", -1)
            .poll_err(BridgeError::Transport("timeout".into())),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let manager = h.manager().with_retry_interval(Duration::from_secs(3600));
    let supervisor = PollSupervisor::spawn(manager);

    eventually(|| h.status.events().contains(&StateEvent::TransientDisconnect)).await;
    assert_eq!(
        supervisor.stop(Duration::from_secs(1)).await,
        Some(PollExit::Cancelled)
    );
}

#[tokio::test]
async fn test_dropped_sender_cancels() {
    let h = Harness::new(
        ScriptedApi::default().register_ok("q1", -1),
        RecordingHandler::default(),
        MemoryStore::default(),
    );
    let (cancel, rx) = watch::channel(false);
    let manager = h.manager();
    let task = tokio::spawn(async move { manager.run(rx).await });

    eventually(|| h.api.polls().len() == 1).await;
    drop(cancel);
    let exit = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, PollExit::Cancelled);
}
