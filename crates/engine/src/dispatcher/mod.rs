//! Topic-based event dispatch to step sessions.
//!
//! Every emitted [`Event`] is fanned out to the steps subscribed to its
//! topic. Each subscriber owns a FIFO queue drained by a single worker that
//! writes `invoke` requests to the step's RPC session in arrival order; the
//! invocations themselves then run concurrently and settle on their own
//! tasks, so one failing subscriber never affects its siblings or the
//! emitter.
//!
//! Host capabilities (`emit`, `state.*`, `stream.operation`, `log`) are
//! served on every step session. Calls carry the invocation id, which maps
//! back to the invocation's trace, logger and tracer.

mod host;
mod in_flight;
mod subscriptions;

pub use subscriptions::SubscriptionTable;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use polystep_rpc::{DEFAULT_CALL_TIMEOUT, RpcError, RpcSession};
use polystep_types::{Event, RpcMethod, StepConfig, TraceContext, error_object};
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::validate_steps;
use crate::error::DispatchError;
use crate::observability::{LogCollector, LogSender, Logger, LoggerFactory, TraceError, Tracer, TracerFactory};
use crate::protocol::{InvocationArgs, InvocationContext};
use crate::runtime::StepRuntime;
use crate::state::StateAdapter;
use in_flight::InFlight;

/// Host-side view of one running invocation.
#[derive(Clone)]
pub(crate) struct InvocationScope {
    trace: TraceContext,
    step: String,
    logger: Logger,
    tracer: Arc<dyn Tracer>,
}

impl InvocationScope {
    /// Records the outcome on the tracer and, for failures, the trace log.
    fn settle(&self, result: &Result<Value, RpcError>) {
        match result {
            Ok(_) => self.tracer.end(None),
            Err(error) if error.is_timeout() => {
                self.tracer.clear();
                self.logger
                    .error("Step invocation timed out", Some(json!({"error": error_object(error)})));
            }
            Err(error) => {
                self.logger
                    .error("Step invocation failed", Some(json!({"error": error_object(error)})));
                self.tracer.end(Some(TraceError::from_error(error)));
            }
        }
    }
}

/// One step's session, locked while it is being opened.
type SessionSlot = Arc<tokio::sync::Mutex<Option<RpcSession>>>;

pub(crate) struct DispatcherInner {
    steps: IndexMap<String, StepConfig>,
    subscriptions: SubscriptionTable,
    runtime: Arc<dyn StepRuntime>,
    state: Arc<dyn StateAdapter>,
    tracer_factory: Arc<dyn TracerFactory>,
    collector: Arc<LogCollector>,
    loggers: LoggerFactory,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    queues: Mutex<HashMap<String, UnboundedSender<Event>>>,
    invocations: Mutex<HashMap<String, InvocationScope>>,
    in_flight: InFlight,
    call_timeout: Duration,
    shutdown: CancellationToken,
}

/// Routes events to subscribed steps. Cloning shares the dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("steps", &self.inner.steps.keys().collect::<Vec<_>>())
            .field("pending", &self.inner.in_flight.total())
            .finish()
    }
}

impl Dispatcher {
    /// Validates `steps` and builds the subscription table.
    pub fn new(
        steps: Vec<StepConfig>,
        runtime: Arc<dyn StepRuntime>,
        state: Arc<dyn StateAdapter>,
        tracer_factory: Arc<dyn TracerFactory>,
        collector: Arc<LogCollector>,
    ) -> Result<Self, DispatchError> {
        validate_steps(&steps).map_err(|error| DispatchError::InvalidSteps {
            reason: error.to_string(),
        })?;
        let subscriptions = SubscriptionTable::build(&steps);
        let steps = steps.into_iter().map(|step| (step.name.clone(), step)).collect();
        let sender: Arc<dyn LogSender> = collector.clone();

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                steps,
                subscriptions,
                runtime,
                state,
                tracer_factory,
                collector,
                loggers: LoggerFactory::new(sender),
                sessions: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                invocations: Mutex::new(HashMap::new()),
                in_flight: InFlight::new(),
                call_timeout: DEFAULT_CALL_TIMEOUT,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Sets how long an invocation may run before it is abandoned.
    ///
    /// Must be called before the first event is emitted.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.call_timeout = call_timeout;
        } else {
            warn!("Call timeout ignored on a shared dispatcher");
        }
        self
    }

    /// Queues `event` for every subscriber of its topic and returns how many
    /// deliveries were queued. Must run inside a Tokio runtime.
    pub fn emit(&self, event: Event) -> usize {
        self.inner.emit(event).unwrap_or_default()
    }

    /// Starts a new trace with an external event.
    pub fn trigger(&self, topic: impl Into<String>, data: Value, flows: Vec<String>) -> TraceContext {
        let trace = TraceContext::generate(flows);
        let topic = topic.into();
        debug!(topic = %topic, trace_id = %trace.trace_id, "External trigger");
        self.inner.emit(Event::new(topic, data, &trace));
        trace
    }

    /// Resolves once no invocation is queued or running.
    pub async fn wait_idle(&self) {
        self.inner.in_flight.wait_idle().await;
    }

    /// Resolves once nothing is queued or running under `trace_id`.
    pub async fn wait_trace(&self, trace_id: &str) {
        self.inner.in_flight.wait_trace(trace_id).await;
    }

    pub fn pending(&self) -> usize {
        self.inner.in_flight.total()
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepConfig> {
        self.inner.steps.values()
    }

    pub fn step(&self, name: &str) -> Result<&StepConfig, DispatchError> {
        self.inner
            .steps
            .get(name)
            .ok_or_else(|| DispatchError::unknown_step(name))
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.inner.subscriptions
    }

    pub fn state(&self) -> Arc<dyn StateAdapter> {
        Arc::clone(&self.inner.state)
    }

    pub fn collector(&self) -> Arc<LogCollector> {
        Arc::clone(&self.inner.collector)
    }

    pub fn tracer_factory(&self) -> Arc<dyn TracerFactory> {
        Arc::clone(&self.inner.tracer_factory)
    }

    /// Names of steps whose session is currently open.
    pub async fn open_sessions(&self) -> Vec<String> {
        let slots: Vec<(String, SessionSlot)> = lock(&self.inner.sessions)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        let mut names = Vec::new();
        for (name, slot) in slots {
            // A slot that is still opening has no live session yet.
            if let Ok(current) = slot.try_lock()
                && current.as_ref().is_some_and(|session| !session.is_closed())
            {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Invocations queued or running under `trace_id`.
    pub fn pending_for(&self, trace_id: &str) -> usize {
        self.inner.in_flight.pending_for(trace_id)
    }

    /// Stops delivery, closes every step session and releases waiters.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        lock(&self.inner.queues).clear();
        let slots: Vec<(String, SessionSlot)> = lock(&self.inner.sessions).drain().collect();
        for (name, slot) in slots {
            if let Some(session) = slot.lock().await.take() {
                debug!(step = %name, "Closing step session");
                session.shutdown();
            }
        }
        lock(&self.inner.invocations).clear();
        self.inner.in_flight.reset();
    }
}

impl DispatcherInner {
    /// Queues `event` for every subscriber. `None` once shut down.
    fn emit(self: &Arc<Self>, event: Event) -> Option<usize> {
        if self.shutdown.is_cancelled() {
            warn!(topic = %event.topic, "Dropping event emitted after shutdown");
            return None;
        }
        let subscribers = self.subscriptions.subscribers(&event.topic);
        if subscribers.is_empty() {
            debug!(topic = %event.topic, trace_id = %event.trace_id, "No subscribers for topic");
            return Some(0);
        }
        debug!(
            topic = %event.topic,
            trace_id = %event.trace_id,
            subscribers = subscribers.len(),
            "Dispatching event"
        );

        let mut queued = 0;
        for step in subscribers {
            self.in_flight.begin(&event.trace_id);
            if self.enqueue(step, event.clone()) {
                queued += 1;
            } else {
                self.complete(&event.trace_id);
            }
        }
        Some(queued)
    }

    fn enqueue(self: &Arc<Self>, step: &str, event: Event) -> bool {
        let mut queues = lock(&self.queues);
        let queue = queues
            .entry(step.to_string())
            .or_insert_with(|| self.spawn_worker(step.to_string()));
        queue.send(event).is_ok()
    }

    fn spawn_worker(self: &Arc<Self>, step: String) -> UnboundedSender<Event> {
        let (sender, mut receiver) = unbounded_channel::<Event>();
        let dispatcher = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = dispatcher.upgrade() else {
                    break;
                };
                inner.deliver(&step, event).await;
            }
            debug!(step = %step, "Delivery worker stopped");
        });
        sender
    }

    /// Writes one `invoke` request and leaves the response to its own task.
    async fn deliver(self: &Arc<Self>, step_name: &str, event: Event) {
        let trace = event.trace();
        let logger = self.loggers.create(&trace, Some(step_name));
        let Some(step) = self.steps.get(step_name) else {
            logger.error("Event delivered to an unknown step", None);
            self.complete(&trace.trace_id);
            return;
        };

        let session = match self.session_for(step).await {
            Ok(session) => session,
            Err(error) => {
                logger.error("Failed to start step runtime", Some(json!({"error": error_object(&error)})));
                self.complete(&trace.trace_id);
                return;
            }
        };

        let invocation_id = Uuid::new_v4().to_string();
        let tracer = self.tracer_factory.create_tracer(&trace, step, &logger);
        let scope = InvocationScope {
            trace: trace.clone(),
            step: step_name.to_string(),
            logger,
            tracer,
        };
        lock(&self.invocations).insert(invocation_id.clone(), scope.clone());

        let args = InvocationArgs {
            data: event.data,
            context: InvocationContext {
                trace_id: trace.trace_id,
                flows: trace.flows,
                invocation_id: invocation_id.clone(),
                step: step_name.to_string(),
            },
        };
        let pending = serde_json::to_value(&args)
            .map_err(RpcError::from)
            .and_then(|args| session.start_call(RpcMethod::Invoke, args));

        match pending {
            Ok(pending) => {
                let dispatcher = Arc::downgrade(self);
                tokio::spawn(async move {
                    let result = pending.wait().await;
                    match dispatcher.upgrade() {
                        Some(inner) => inner.finish(&invocation_id, &scope, result),
                        None => scope.settle(&result),
                    }
                });
            }
            Err(error) => self.finish(&invocation_id, &scope, Err(error)),
        }
    }

    fn finish(&self, invocation_id: &str, scope: &InvocationScope, result: Result<Value, RpcError>) {
        lock(&self.invocations).remove(invocation_id);
        scope.settle(&result);
        self.complete(&scope.trace.trace_id);
    }

    fn complete(&self, trace_id: &str) {
        self.in_flight
            .complete(trace_id, || self.tracer_factory.finish_trace(trace_id));
    }

    /// Open session for `step`, spawning a fresh runtime when there is none
    /// or the previous one closed.
    async fn session_for(self: &Arc<Self>, step: &StepConfig) -> Result<RpcSession, DispatchError> {
        let slot = Arc::clone(lock(&self.sessions).entry(step.name.clone()).or_default());
        let mut current = slot.lock().await;
        if let Some(session) = current.as_ref()
            && !session.is_closed()
        {
            return Ok(session.clone());
        }
        if let Some(stale) = current.take() {
            debug!(step = %step.name, reason = ?stale.close_reason(), "Replacing closed step session");
            stale.shutdown();
        }

        let transport = self.runtime.open(step).await?;
        let builder = RpcSession::builder(step.name.clone()).call_timeout(self.call_timeout);
        let session = host::with_capabilities(builder, &Arc::downgrade(self)).start(transport);
        if self.shutdown.is_cancelled() {
            session.shutdown();
            return Err(DispatchError::runtime(&step.name, "dispatcher is shut down"));
        }
        debug!(step = %step.name, "Opened step session");
        *current = Some(session.clone());
        Ok(session)
    }

    fn scope(&self, invocation_id: &str) -> Option<InvocationScope> {
        lock(&self.invocations).get(invocation_id).cloned()
    }

    fn trace_state(&self, invocation_id: &str, operation: &str, input: Value) {
        if let Some(scope) = self.scope(invocation_id) {
            scope.tracer.state_operation(operation, input);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests;
