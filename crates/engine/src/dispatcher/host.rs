//! Capabilities the host serves to every step session.

use std::future::Future;
use std::sync::{Arc, Weak};

use polystep_rpc::{RpcError, RpcHandler, RpcSessionBuilder, raw_handler, typed_handler};
use polystep_types::{Event, RpcMethod};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::warn;

use super::DispatcherInner;
use crate::error::DispatchError;
use crate::protocol::{EmitArgs, StateGroupArgs, StateKeyArgs, StreamOperationArgs};

/// Adds the host capability handlers to a step session.
pub(super) fn with_capabilities(builder: RpcSessionBuilder, dispatcher: &Weak<DispatcherInner>) -> RpcSessionBuilder {
    builder
        .handler(RpcMethod::Log, log_handler(dispatcher))
        .handler(RpcMethod::Emit, capability(dispatcher, emit))
        .handler(RpcMethod::StateGet, capability(dispatcher, state_get))
        .handler(RpcMethod::StateSet, capability(dispatcher, state_set))
        .handler(RpcMethod::StateDelete, capability(dispatcher, state_delete))
        .handler(RpcMethod::StateClear, capability(dispatcher, state_clear))
        .handler(RpcMethod::StateGetGroup, capability(dispatcher, state_get_group))
        .handler(RpcMethod::StreamOperation, capability(dispatcher, stream_operation))
}

fn log_handler(dispatcher: &Weak<DispatcherInner>) -> RpcHandler {
    let dispatcher = dispatcher.clone();
    raw_handler(move |args| {
        let inner = dispatcher.upgrade();
        async move {
            let inner = inner.ok_or_else(shut_down)?;
            inner.collector.record_raw(args)?;
            Ok(Value::Null)
        }
    })
}

fn capability<I, O, F, Fut>(dispatcher: &Weak<DispatcherInner>, handler: F) -> RpcHandler
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(Arc<DispatcherInner>, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, DispatchError>> + Send + 'static,
{
    let dispatcher = dispatcher.clone();
    typed_handler(move |input: I| {
        let call = dispatcher.upgrade().map(|inner| handler(inner, input));
        async move {
            match call {
                Some(call) => call.await.map_err(RpcError::from),
                None => Err(shut_down()),
            }
        }
    })
}

fn shut_down() -> RpcError {
    RpcError::handler("Dispatcher is shut down")
}

async fn emit(inner: Arc<DispatcherInner>, args: EmitArgs) -> Result<Value, DispatchError> {
    let scope = inner
        .scope(&args.invocation_id)
        .ok_or_else(|| DispatchError::unknown_invocation(&args.invocation_id))?;
    if let Some(step) = inner.steps.get(&scope.step)
        && !step
            .emits
            .iter()
            .chain(&step.virtual_emits)
            .any(|emit| emit.topic() == args.topic)
    {
        warn!(step = %scope.step, topic = %args.topic, "Step emitted an undeclared topic");
    }

    let queued = inner.emit(Event::new(args.topic.clone(), args.data.clone(), &scope.trace));
    scope.tracer.emit_operation(&args.topic, args.data, queued.is_some());
    match queued {
        Some(_) => Ok(Value::Null),
        None => Err(shut_down().into()),
    }
}

async fn state_get(inner: Arc<DispatcherInner>, args: StateKeyArgs) -> Result<Option<Value>, DispatchError> {
    inner.trace_state(&args.invocation_id, "get", json!({"groupId": args.group_id, "key": args.key}));
    Ok(inner.state.get(&args.group_id, &args.key).await?)
}

async fn state_set(inner: Arc<DispatcherInner>, args: StateKeyArgs) -> Result<Value, DispatchError> {
    let value = args.value.unwrap_or(Value::Null);
    inner.trace_state(
        &args.invocation_id,
        "set",
        json!({"groupId": args.group_id, "key": args.key, "value": value}),
    );
    Ok(inner.state.set(&args.group_id, &args.key, value).await?)
}

async fn state_delete(inner: Arc<DispatcherInner>, args: StateKeyArgs) -> Result<Option<Value>, DispatchError> {
    inner.trace_state(&args.invocation_id, "delete", json!({"groupId": args.group_id, "key": args.key}));
    Ok(inner.state.delete(&args.group_id, &args.key).await?)
}

async fn state_clear(inner: Arc<DispatcherInner>, args: StateGroupArgs) -> Result<Value, DispatchError> {
    inner.trace_state(&args.invocation_id, "clear", json!({"groupId": args.group_id}));
    inner.state.clear(&args.group_id).await?;
    Ok(Value::Null)
}

async fn state_get_group(inner: Arc<DispatcherInner>, args: StateGroupArgs) -> Result<Vec<Value>, DispatchError> {
    inner.trace_state(&args.invocation_id, "getGroup", json!({"groupId": args.group_id}));
    Ok(inner.state.get_group(&args.group_id).await?)
}

async fn stream_operation(inner: Arc<DispatcherInner>, args: StreamOperationArgs) -> Result<Value, DispatchError> {
    let scope = inner
        .scope(&args.invocation_id)
        .ok_or_else(|| DispatchError::unknown_invocation(&args.invocation_id))?;
    scope
        .tracer
        .stream_operation(&args.stream_name, &args.operation, args.input);
    Ok(Value::Null)
}
