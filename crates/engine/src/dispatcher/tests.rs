use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use polystep_rpc::{RpcError, Transport};
use polystep_types::{LogEntry, LogLevel, StepType};
use serde_json::json;

use crate::observability::{BaseTracerFactory, SpanKind, TraceStatus, TraceStore};
use crate::runtime::{LocalRuntime, ProcessRuntime, RuntimeRegistry};
use crate::sdk::step_handler;
use crate::state::MemoryStateAdapter;

type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

struct Harness {
    dispatcher: Dispatcher,
    store: Arc<TraceStore>,
    collector: Arc<LogCollector>,
}

fn harness(steps: Vec<StepConfig>, runtime: Arc<dyn StepRuntime>) -> Harness {
    let factory = BaseTracerFactory::new(10);
    let store = factory.store().unwrap();
    let collector = Arc::new(LogCollector::new(1000, false));
    let dispatcher = Dispatcher::new(
        steps,
        runtime,
        Arc::new(MemoryStateAdapter::new()),
        Arc::new(factory),
        Arc::clone(&collector),
    )
    .unwrap();
    Harness {
        dispatcher,
        store,
        collector,
    }
}

fn recorder(local: &LocalRuntime, step: &str, recorded: &Recorded) {
    let recorded = Arc::clone(recorded);
    local.register(
        step,
        step_handler(move |data, context| {
            let recorded = Arc::clone(&recorded);
            async move {
                lock(&recorded).push((context.trace_id().to_string(), data));
                Ok(Value::Null)
            }
        }),
    );
}

async fn settle(dispatcher: &Dispatcher) {
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_idle())
        .await
        .expect("dispatcher never went idle");
}

#[tokio::test]
async fn food_order_chain_stays_on_one_trace() {
    let local = LocalRuntime::new();
    let contexts: Recorded = Arc::new(Mutex::new(Vec::new()));
    let notifications: Recorded = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&contexts);
    local.register(
        "ProcessFoodOrder",
        step_handler(move |data, context| {
            let seen = Arc::clone(&seen);
            async move {
                lock(&seen).push((
                    context.step().to_string(),
                    json!({"data": data, "traceId": context.trace_id(), "flows": context.flows()}),
                ));
                context
                    .emit("new-order-notification", json!({"order_id": data["id"]}))
                    .await?;
                Ok(Value::Null)
            }
        }),
    );
    recorder(&local, "NewOrderNotification", &notifications);

    let steps = vec![
        StepConfig::event("ProcessFoodOrder", &["process-food-order"])
            .with_flows(&["basic-tutorial"])
            .with_emits(&["new-order-notification"]),
        StepConfig::event("NewOrderNotification", &["new-order-notification"]).with_flows(&["basic-tutorial"]),
    ];
    let harness = harness(steps, Arc::new(local));

    let trace = TraceContext::new("t1", vec!["basic-tutorial".to_string()]);
    let queued = harness.dispatcher.emit(Event::new(
        "process-food-order",
        json!({"id": "o1", "quantity": 2, "petId": 7}),
        &trace,
    ));
    assert_eq!(queued, 1);
    tokio::time::timeout(Duration::from_secs(5), harness.dispatcher.wait_trace("t1"))
        .await
        .unwrap();

    let contexts = lock(&contexts).clone();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].0, "ProcessFoodOrder");
    assert_eq!(
        contexts[0].1,
        json!({
            "data": {"id": "o1", "quantity": 2, "petId": 7},
            "traceId": "t1",
            "flows": ["basic-tutorial"]
        })
    );
    assert_eq!(
        lock(&notifications).clone(),
        vec![("t1".to_string(), json!({"order_id": "o1"}))]
    );

    let group = harness.store.group("t1").unwrap();
    assert_eq!(group.status, TraceStatus::Completed);
    assert_eq!(group.metadata.total_steps, 2);
    let traces = harness.store.traces("t1").unwrap();
    let producer = traces.iter().find(|trace| trace.name == "ProcessFoodOrder").unwrap();
    assert_eq!(producer.spans[0].kind, SpanKind::Emit);
    assert_eq!(producer.spans[0].name.as_deref(), Some("new-order-notification"));
    assert_eq!(producer.spans[0].operations[0].success, Some(true));
}

#[tokio::test]
async fn failing_subscriber_does_not_affect_siblings() {
    let local = LocalRuntime::new();
    let delivered: Recorded = Arc::new(Mutex::new(Vec::new()));
    local.register(
        "Fails",
        step_handler(|_data, _context| async { Err(RpcError::handler("card declined")) }),
    );
    recorder(&local, "Succeeds", &delivered);

    let steps = vec![
        StepConfig::event("Fails", &["orders"]),
        StepConfig::event("Succeeds", &["orders"]),
    ];
    let harness = harness(steps, Arc::new(local));
    let trace = harness.dispatcher.trigger("orders", json!({"id": 1}), Vec::new());
    assert!(!trace.trace_id.is_empty());
    settle(&harness.dispatcher).await;

    assert_eq!(lock(&delivered).len(), 1);
    let traces = harness.store.traces(&trace.trace_id).unwrap();
    let failed = traces.iter().find(|trace| trace.name == "Fails").unwrap();
    assert_eq!(failed.status, TraceStatus::Failed);
    assert_eq!(failed.error.as_ref().unwrap().message, "card declined");
    let succeeded = traces.iter().find(|trace| trace.name == "Succeeds").unwrap();
    assert_eq!(succeeded.status, TraceStatus::Completed);
    assert_eq!(harness.store.group(&trace.trace_id).unwrap().status, TraceStatus::Failed);

    let errors: Vec<LogEntry> = harness
        .collector
        .for_trace(&trace.trace_id, 100)
        .into_iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .collect();
    assert!(errors.iter().any(|entry| entry.msg == "Step invocation failed"
        && entry.step.as_deref() == Some("Fails")
        && entry.fields["error"]["message"] == "card declined"));
}

#[tokio::test]
async fn state_capabilities_are_traced() {
    let local = LocalRuntime::new();
    local.register(
        "Store",
        step_handler(|data, context| async move {
            context.state_set(context.trace_id(), "order", data.clone()).await?;
            let stored = context.state_get(context.trace_id(), "order").await?;
            context.stream_operation("orders", "update", json!({"id": 1})).await?;
            context.logger().info("Stored order", Some(json!({"order": stored})));
            Ok(Value::Null)
        }),
    );

    let harness = harness(vec![StepConfig::event("Store", &["store"])], Arc::new(local));
    let trace = harness.dispatcher.trigger("store", json!({"id": 1}), Vec::new());
    settle(&harness.dispatcher).await;

    let state = harness.dispatcher.state();
    assert_eq!(state.get(&trace.trace_id, "order").await.unwrap(), Some(json!({"id": 1})));

    let traces = harness.store.traces(&trace.trace_id).unwrap();
    let spans = &traces[0].spans;
    assert_eq!(spans[0].kind, SpanKind::State);
    let operations: Vec<&str> = spans[0].operations.iter().map(|op| op.operation.as_str()).collect();
    assert_eq!(operations, vec!["set", "get"]);
    assert_eq!(spans[1].kind, SpanKind::Stream);
    assert_eq!(spans[1].name.as_deref(), Some("orders"));

    // The log notification may trail the invoke response.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness
            .collector
            .for_trace(&trace.trace_id, 10)
            .iter()
            .any(|entry| entry.msg == "Stored order")
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn timed_out_invocation_is_abandoned() {
    let local = LocalRuntime::new();
    local.register(
        "Stalls",
        step_handler(|_data, _context| async {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }),
    );

    let Harness {
        dispatcher,
        store,
        collector,
    } = harness(vec![StepConfig::event("Stalls", &["stall"])], Arc::new(local));
    let dispatcher = dispatcher.with_call_timeout(Duration::from_millis(50));
    let trace = dispatcher.trigger("stall", Value::Null, Vec::new());
    settle(&dispatcher).await;

    assert!(store.traces(&trace.trace_id).unwrap().is_empty());
    assert!(
        collector
            .for_trace(&trace.trace_id, 10)
            .iter()
            .any(|entry| entry.msg == "Step invocation timed out")
    );
}

#[tokio::test]
async fn unknown_invocation_cannot_emit() {
    let harness = harness(vec![StepConfig::event("A", &["a"])], Arc::new(LocalRuntime::new()));
    let (host_side, step_side) = Transport::pair();
    let _host = host::with_capabilities(RpcSession::builder("A"), &Arc::downgrade(&harness.dispatcher.inner))
        .start(host_side);
    let step = RpcSession::start("A:test", step_side);

    let error = step
        .call(
            RpcMethod::Emit,
            json!({"invocationId": "missing", "topic": "a", "data": {}}),
        )
        .await
        .unwrap_err();
    assert!(error.to_string().contains("Unknown invocation 'missing'"));
    assert_eq!(harness.dispatcher.pending(), 0);

    // State stays reachable for calls without a live scope.
    let stored = step
        .call(
            RpcMethod::StateSet,
            json!({"invocationId": "missing", "groupId": "g", "key": "k", "value": 3}),
        )
        .await
        .unwrap();
    assert_eq!(stored, json!(3));
}

#[tokio::test]
async fn runtime_failures_are_logged_and_released() {
    let runtime = RuntimeRegistry::new(LocalRuntime::new(), ProcessRuntime::new());
    let harness = harness(vec![StepConfig::event("Nowhere", &["go"])], Arc::new(runtime));
    let trace = harness.dispatcher.trigger("go", Value::Null, Vec::new());
    settle(&harness.dispatcher).await;

    let entries = harness.collector.for_trace(&trace.trace_id, 10);
    assert_eq!(entries[0].msg, "Failed to start step runtime");
    assert!(harness.dispatcher.open_sessions().await.is_empty());
}

#[test]
fn invalid_steps_are_rejected() {
    let steps = vec![StepConfig::event("A", &["a"]), StepConfig::event("A", &["b"])];
    let result = Dispatcher::new(
        steps,
        Arc::new(LocalRuntime::new()),
        Arc::new(MemoryStateAdapter::new()),
        Arc::new(BaseTracerFactory::new(1)),
        Arc::new(LogCollector::default()),
    );
    assert!(matches!(result, Err(DispatchError::InvalidSteps { .. })));

    let api_only = vec![StepConfig {
        step_type: StepType::Api,
        ..StepConfig::default()
    }];
    assert!(matches!(
        Dispatcher::new(
            api_only,
            Arc::new(LocalRuntime::new()),
            Arc::new(MemoryStateAdapter::new()),
            Arc::new(BaseTracerFactory::new(1)),
            Arc::new(LogCollector::default()),
        ),
        Err(DispatchError::InvalidSteps { .. })
    ));
}

/// Runtime whose step side records the raw requests it receives.
#[derive(Default)]
struct ObservedRuntime {
    opens: AtomicUsize,
    received: Arc<Mutex<Vec<Value>>>,
    step_sessions: Mutex<Vec<RpcSession>>,
}

#[async_trait::async_trait]
impl StepRuntime for ObservedRuntime {
    async fn open(&self, step: &StepConfig) -> Result<Transport, DispatchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (host_side, step_side) = Transport::pair();
        let session = RpcSession::builder(format!("{}:observed", step.name))
            .handler(
                RpcMethod::Invoke,
                polystep_rpc::raw_handler(|_args| async { Ok(Value::Null) }),
            )
            .start(step_side);
        let received = Arc::clone(&self.received);
        session.on_message(move |message| {
            if message["method"] == "invoke" {
                lock(&received).push(message["args"]["data"].clone());
            }
        });
        lock(&self.step_sessions).push(session);
        Ok(host_side)
    }
}

#[tokio::test]
async fn deliveries_to_one_step_keep_emit_order() {
    let runtime = Arc::new(ObservedRuntime::default());
    let harness = harness(vec![StepConfig::event("Ordered", &["tick"])], runtime.clone());

    let trace = TraceContext::new("t-order", Vec::new());
    for n in 0..20 {
        harness.dispatcher.emit(Event::new("tick", json!(n), &trace));
    }
    settle(&harness.dispatcher).await;

    let received = lock(&runtime.received).clone();
    assert_eq!(received, (0..20).map(|n| json!(n)).collect::<Vec<_>>());
    assert_eq!(runtime.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_session_is_replaced_on_next_delivery() {
    let runtime = Arc::new(ObservedRuntime::default());
    let harness = harness(vec![StepConfig::event("Flaky", &["tick"])], runtime.clone());

    harness.dispatcher.trigger("tick", json!(1), Vec::new());
    settle(&harness.dispatcher).await;
    assert_eq!(harness.dispatcher.open_sessions().await, vec!["Flaky".to_string()]);

    let first = lock(&runtime.step_sessions)[0].clone();
    first.shutdown();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.dispatcher.open_sessions().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    harness.dispatcher.trigger("tick", json!(2), Vec::new());
    settle(&harness.dispatcher).await;
    assert_eq!(runtime.opens.load(Ordering::SeqCst), 2);
    assert_eq!(lock(&runtime.received).clone(), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn shutdown_releases_waiters_and_drops_new_events() {
    let runtime = Arc::new(ObservedRuntime::default());
    let harness = harness(vec![StepConfig::event("Any", &["tick"])], runtime.clone());
    harness.dispatcher.trigger("tick", json!(1), Vec::new());
    settle(&harness.dispatcher).await;

    harness.dispatcher.shutdown().await;
    assert!(harness.dispatcher.open_sessions().await.is_empty());
    let late = Event::new("tick", json!(2), &TraceContext::generate(Vec::new()));
    assert_eq!(harness.dispatcher.emit(late), 0);
    assert_eq!(harness.dispatcher.pending(), 0);
    settle(&harness.dispatcher).await;
}

#[tokio::test]
async fn stored_null_reads_back_as_absent() {
    let local = LocalRuntime::new();
    let reads: Recorded = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&reads);
    local.register(
        "Nulls",
        step_handler(move |_data, context| {
            let seen = Arc::clone(&seen);
            async move {
                context.state_set("g", "k", Value::Null).await?;
                let read = context.state_get("g", "k").await?;
                lock(&seen).push(("get".to_string(), json!(read.is_none())));
                Ok(Value::Null)
            }
        }),
    );

    let harness = harness(vec![StepConfig::event("Nulls", &["go"])], Arc::new(local));
    harness.dispatcher.trigger("go", Value::Null, Vec::new());
    settle(&harness.dispatcher).await;

    assert_eq!(lock(&reads).clone(), vec![("get".to_string(), json!(true))]);
    assert_eq!(harness.dispatcher.state().get("g", "k").await.unwrap(), Some(Value::Null));
}

#[tokio::test]
async fn emit_after_shutdown_is_recorded_as_failed() {
    let local = LocalRuntime::new();
    let harness = harness(
        vec![StepConfig::event("Late", &["go"]).with_emits(&["next"])],
        Arc::new(local.clone()),
    );
    let stop = harness.dispatcher.inner.shutdown.clone();
    local.register(
        "Late",
        step_handler(move |_data, context| {
            let stop = stop.clone();
            async move {
                stop.cancel();
                context.emit("next", json!({"n": 1})).await?;
                Ok(Value::Null)
            }
        }),
    );

    let trace = harness.dispatcher.trigger("go", Value::Null, Vec::new());
    assert_eq!(harness.dispatcher.pending_for(&trace.trace_id), 1);
    tokio::time::timeout(Duration::from_secs(5), harness.dispatcher.wait_trace(&trace.trace_id))
        .await
        .unwrap();
    assert_eq!(harness.dispatcher.pending_for(&trace.trace_id), 0);

    let traces = harness.store.traces(&trace.trace_id).unwrap();
    assert_eq!(traces[0].status, TraceStatus::Failed);
    assert_eq!(traces[0].spans[0].kind, SpanKind::Emit);
    assert_eq!(traces[0].spans[0].operations[0].success, Some(false));
    assert!(
        traces[0]
            .error
            .as_ref()
            .is_some_and(|error| error.message.contains("Dispatcher is shut down"))
    );
}

/// Runtime whose `Slow` step does not start until the gate opens.
#[derive(Default)]
struct GatedRuntime {
    gate: tokio::sync::Notify,
    step_sessions: Mutex<Vec<RpcSession>>,
}

#[async_trait::async_trait]
impl StepRuntime for GatedRuntime {
    async fn open(&self, step: &StepConfig) -> Result<Transport, DispatchError> {
        if step.name == "Slow" {
            self.gate.notified().await;
        }
        let (host_side, step_side) = Transport::pair();
        let session = RpcSession::builder(format!("{}:gated", step.name))
            .handler(
                RpcMethod::Invoke,
                polystep_rpc::raw_handler(|_args| async { Ok(Value::Null) }),
            )
            .start(step_side);
        lock(&self.step_sessions).push(session);
        Ok(host_side)
    }
}

#[tokio::test]
async fn slow_runtime_start_does_not_hold_up_other_steps() {
    let runtime = Arc::new(GatedRuntime::default());
    let harness = harness(
        vec![StepConfig::event("Slow", &["slow"]), StepConfig::event("Fast", &["fast"])],
        runtime.clone(),
    );

    let slow = harness.dispatcher.trigger("slow", Value::Null, Vec::new());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = harness.dispatcher.trigger("fast", Value::Null, Vec::new());
    tokio::time::timeout(Duration::from_secs(5), harness.dispatcher.wait_trace(&fast.trace_id))
        .await
        .expect("fast step waited on the slow runtime");
    assert_eq!(harness.dispatcher.pending_for(&slow.trace_id), 1);
    assert_eq!(harness.dispatcher.open_sessions().await, vec!["Fast".to_string()]);

    runtime.gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), harness.dispatcher.wait_trace(&slow.trace_id))
        .await
        .unwrap();
    assert_eq!(
        harness.dispatcher.open_sessions().await,
        vec!["Fast".to_string(), "Slow".to_string()]
    );
}
