#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use mqrelay::relay::{
    Backoff, Broker, BrokerError, BrokerSession, DeliveryPolicy, IngestionClient,
    MessageEnvelope, QueueDeclaration, Relay,
};
use mqrelay::trigger::{ContainerRuntime, LaunchReceipt, TriggerError, TriggerRequest};
use serde_json::{Value, json};
use tokio::sync::Notify;

/// Ordered record of what the broker and the ingestion endpoint observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Broker settled a delivery on dispatch (fire-and-forget).
    AutoAck(u64),
    /// Consumer acknowledged a delivery.
    Ack(u64),
    /// Ingestion endpoint received a `data` field.
    Ingested(String),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<Event> {
    log.lock().unwrap().clone()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// In-memory broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Stored {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    declared: Option<QueueDeclaration>,
    ready: VecDeque<Stored>,
    unacked: BTreeMap<u64, Stored>,
    next_tag: u64,
    generation: u64,
    refuse_connections: bool,
    connects: usize,
    closed_sessions: usize,
    deliveries: Vec<MessageEnvelope>,
}

impl BrokerState {
    /// Return unacknowledged messages to the head of the queue.
    fn requeue_unacked(&mut self) {
        let unacked = std::mem::take(&mut self.unacked);
        for (_, mut stored) in unacked.into_iter().rev() {
            stored.redelivered = true;
            self.ready.push_front(stored);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Single-queue broker with AMQP-like ack, prefetch and redelivery rules.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
    log: EventLog,
}

impl MemoryBroker {
    pub fn new(log: EventLog) -> Self {
        let state = BrokerState { next_tag: 1, ..Default::default() };
        Self { shared: Arc::new(Shared { state: Mutex::new(state), notify: Notify::new() }), log }
    }

    pub fn publish(&self, payload: &str) {
        self.shared
            .state
            .lock()
            .unwrap()
            .ready
            .push_back(Stored { payload: payload.as_bytes().to_vec(), redelivered: false });
        self.shared.notify.notify_waiters();
    }

    /// Pretend the queue already exists with these attributes.
    pub fn predeclare(&self, queue: QueueDeclaration) {
        self.shared.state.lock().unwrap().declared = Some(queue);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().unwrap().refuse_connections = refuse;
    }

    /// Sever every open session, as a network failure would.
    pub fn drop_connections(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.generation += 1;
            state.requeue_unacked();
        }
        self.shared.notify.notify_waiters();
    }

    /// Messages still owned by the broker (ready or awaiting ack).
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.ready.len() + state.unacked.len()
    }

    pub fn connects(&self) -> usize {
        self.shared.state.lock().unwrap().connects
    }

    pub fn closed_sessions(&self) -> usize {
        self.shared.state.lock().unwrap().closed_sessions
    }

    pub fn deliveries(&self) -> Vec<MessageEnvelope> {
        self.shared.state.lock().unwrap().deliveries.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.refuse_connections {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            log: self.log.clone(),
            generation: state.generation,
            consuming: None,
        }))
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    log: EventLog,
    generation: u64,
    consuming: Option<(DeliveryPolicy, Option<u16>)>,
}

impl MemorySession {
    fn check_open(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if state.generation != self.generation {
            return Err(BrokerError::Channel("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare(&mut self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().unwrap();
        self.check_open(&state)?;
        if let Some(existing) = &state.declared {
            if existing.name == queue.name && existing.durable != queue.durable {
                return Err(BrokerError::Declaration {
                    queue: queue.name.clone(),
                    reason: "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
                });
            }
            return Ok(());
        }
        state.declared = Some(queue.clone());
        Ok(())
    }

    async fn start_consuming(
        &mut self,
        queue: &QueueDeclaration,
        policy: DeliveryPolicy,
    ) -> Result<(), BrokerError> {
        self.consuming = Some((policy, queue.prefetch));
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<MessageEnvelope>, BrokerError> {
        let (policy, prefetch) = self
            .consuming
            .ok_or_else(|| BrokerError::Channel("consumer not started".to_string()))?;
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.generation != self.generation {
                    return Ok(None);
                }
                let at_limit = prefetch.is_some_and(|limit| state.unacked.len() >= limit as usize);
                if !at_limit {
                    if let Some(stored) = state.ready.pop_front() {
                        let tag = state.next_tag;
                        state.next_tag += 1;
                        let envelope = MessageEnvelope {
                            payload: stored.payload.clone(),
                            delivery_tag: tag,
                            redelivered: stored.redelivered,
                        };
                        if policy.requires_explicit_ack() {
                            state.unacked.insert(tag, stored);
                        } else {
                            self.log.lock().unwrap().push(Event::AutoAck(tag));
                        }
                        state.deliveries.push(envelope.clone());
                        return Ok(Some(envelope));
                    }
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            self.check_open(&state)?;
            if state.unacked.remove(&delivery_tag).is_none() {
                return Err(BrokerError::Channel(format!("unknown delivery tag {delivery_tag}")));
            }
            self.log.lock().unwrap().push(Event::Ack(delivery_tag));
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.generation == self.generation {
                state.requeue_unacked();
            }
            state.closed_sessions += 1;
        }
        self.consuming = None;
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ingestion endpoint on a loopback socket
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct IngestState {
    log: EventLog,
    script: Arc<Mutex<VecDeque<(StatusCode, Duration)>>>,
}

/// Serves `POST /process_data`, answering from `script` then 200 once it runs out.
pub struct IngestServer {
    pub url: String,
}

impl IngestServer {
    pub async fn start(log: EventLog, script: Vec<(StatusCode, Duration)>) -> Self {
        let state = IngestState { log, script: Arc::new(Mutex::new(script.into())) };
        let app = Router::new().route("/process_data", post(ingest)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { url: format!("http://{addr}/process_data") }
    }
}

async fn ingest(State(state): State<IngestState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let (status, delay) =
        state.script.lock().unwrap().pop_front().unwrap_or((StatusCode::OK, Duration::ZERO));
    tokio::time::sleep(delay).await;
    let data = body.get("data").and_then(Value::as_str).unwrap_or_default().to_string();
    state.log.lock().unwrap().push(Event::Ingested(data));
    (status, Json(json!({ "message": "Data processing initiated" })))
}

pub fn relay_for(broker: &MemoryBroker, url: &str, policy: DeliveryPolicy) -> Relay {
    let ingest = IngestionClient::new(url, "test", Duration::from_secs(5)).unwrap();
    Relay::new(
        Arc::new(broker.clone()),
        ingest,
        QueueDeclaration::for_policy("hello", policy),
        policy,
    )
    .with_backoff(Backoff { initial: Duration::from_millis(10), max: Duration::from_millis(50) })
}

// ---------------------------------------------------------------------------
// Container runtime double
// ---------------------------------------------------------------------------

/// How the recording runtime answers a launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchOutcome {
    #[default]
    Started,
    ImageMissing,
    Unavailable,
    Rejected,
}

/// Records every launch and answers with `outcome`.
#[derive(Clone, Default)]
pub struct RecordingRuntime {
    pub calls: Arc<Mutex<Vec<TriggerRequest>>>,
    pub outcome: LaunchOutcome,
}

impl RecordingRuntime {
    pub fn failing(outcome: LaunchOutcome) -> Self {
        Self { outcome, ..Default::default() }
    }

    pub fn calls(&self) -> Vec<TriggerRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn run(&self, request: &TriggerRequest) -> Result<LaunchReceipt, TriggerError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        match self.outcome {
            LaunchOutcome::Started => Ok(LaunchReceipt {
                image: request.image.clone(),
                container_id: Some(format!("c{count}")),
            }),
            LaunchOutcome::ImageMissing => Err(TriggerError::ImageNotFound(request.image.clone())),
            LaunchOutcome::Unavailable => Err(TriggerError::RuntimeUnavailable(
                "Cannot connect to the Docker daemon".to_string(),
            )),
            LaunchOutcome::Rejected => Err(TriggerError::Rejected {
                code: 125,
                stderr: "invalid reference format".to_string(),
            }),
        }
    }
}
