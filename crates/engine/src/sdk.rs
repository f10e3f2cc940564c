//! Child-side API for steps written in Rust.
//!
//! A step handler receives the event payload and a [`StepContext`]. The
//! context reaches host capabilities over the step's RPC session; each call
//! carries the invocation id so the host attributes it to the right trace.
//! [`serve_stdio`] runs a handler as a standalone step process.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use polystep_rpc::{RpcError, RpcSession, Transport};
use polystep_types::{RpcMethod, TraceContext};
use serde_json::{Value, json};

use crate::observability::Logger;
use crate::protocol::{
    EmitArgs, InvocationArgs, InvocationContext, StateGroupArgs, StateKeyArgs, StreamOperationArgs,
};

/// Type-erased step handler.
pub type StepHandler = Arc<dyn Fn(Value, StepContext) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Erases a step handler closure.
pub fn step_handler<F, Fut>(handler: F) -> StepHandler
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |data, context| handler(data, context).boxed())
}

/// Capabilities available to one running invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    context: InvocationContext,
    session: RpcSession,
    logger: Logger,
}

impl StepContext {
    pub fn new(context: InvocationContext, session: RpcSession) -> Self {
        let logger = Logger::new(context.trace(), Arc::new(session.clone())).with_step(context.step.clone());
        Self {
            context,
            session,
            logger,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.context.trace_id
    }

    pub fn flows(&self) -> &[String] {
        &self.context.flows
    }

    pub fn trace(&self) -> TraceContext {
        self.context.trace()
    }

    pub fn step(&self) -> &str {
        &self.context.step
    }

    pub fn invocation_id(&self) -> &str {
        &self.context.invocation_id
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Emits an event on the current trace.
    pub async fn emit(&self, topic: impl Into<String>, data: Value) -> Result<(), RpcError> {
        let args = EmitArgs {
            invocation_id: self.context.invocation_id.clone(),
            topic: topic.into(),
            data,
        };
        self.session.call(RpcMethod::Emit, serde_json::to_value(args)?).await?;
        Ok(())
    }

    /// Reads a value. A stored JSON `null` reads back as `None`, the same as
    /// a missing key.
    pub async fn state_get(&self, group_id: &str, key: &str) -> Result<Option<Value>, RpcError> {
        let value = self
            .session
            .call(RpcMethod::StateGet, self.key_args(group_id, key, None)?)
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn state_set(&self, group_id: &str, key: &str, value: Value) -> Result<Value, RpcError> {
        self.session
            .call(RpcMethod::StateSet, self.key_args(group_id, key, Some(value))?)
            .await
    }

    pub async fn state_delete(&self, group_id: &str, key: &str) -> Result<Option<Value>, RpcError> {
        let value = self
            .session
            .call(RpcMethod::StateDelete, self.key_args(group_id, key, None)?)
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn state_get_group(&self, group_id: &str) -> Result<Vec<Value>, RpcError> {
        let value = self
            .session
            .call(RpcMethod::StateGetGroup, self.group_args(group_id)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn state_clear(&self, group_id: &str) -> Result<(), RpcError> {
        self.session.call(RpcMethod::StateClear, self.group_args(group_id)?).await?;
        Ok(())
    }

    /// Reports an operation on a named stream to the host tracer.
    pub async fn stream_operation(&self, stream_name: &str, operation: &str, input: Value) -> Result<Value, RpcError> {
        let args = StreamOperationArgs {
            invocation_id: self.context.invocation_id.clone(),
            stream_name: stream_name.to_string(),
            operation: operation.to_string(),
            input,
        };
        self.session
            .call(RpcMethod::StreamOperation, serde_json::to_value(args)?)
            .await
    }

    fn key_args(&self, group_id: &str, key: &str, value: Option<Value>) -> Result<Value, RpcError> {
        Ok(serde_json::to_value(StateKeyArgs {
            invocation_id: self.context.invocation_id.clone(),
            group_id: group_id.to_string(),
            key: key.to_string(),
            value,
        })?)
    }

    fn group_args(&self, group_id: &str) -> Result<Value, RpcError> {
        Ok(serde_json::to_value(StateGroupArgs {
            invocation_id: self.context.invocation_id.clone(),
            group_id: group_id.to_string(),
        })?)
    }
}

/// Serves `handler` as the `invoke` method of `session`.
pub fn bind_step_handler(session: &RpcSession, handler: StepHandler) {
    let weak = session.downgrade();
    session.register_handler(RpcMethod::Invoke, move |args| {
        let handler = Arc::clone(&handler);
        let weak = weak.clone();
        async move {
            let session = weak
                .upgrade()
                .ok_or_else(|| RpcError::channel_closed("step"))?;
            let InvocationArgs { data, context } = serde_json::from_value(args)?;
            let step_context = StepContext::new(context, session);
            let result = handler(data, step_context.clone()).await;
            if let Err(error) = &result {
                step_context
                    .logger()
                    .error("Step handler failed", Some(json!({"error": {"message": error.to_string()}})));
            }
            result
        }
    });
}

/// Runs `handler` as a step process speaking over stdin/stdout until the
/// host closes the channel.
pub async fn serve_stdio(name: &str, handler: StepHandler) -> Result<(), RpcError> {
    let transport = Transport::spawn(tokio::io::stdin(), tokio::io::stdout());
    let session = RpcSession::builder(name).start_with(transport, |session| bind_step_handler(session, handler));
    session.wait_closed().await;
    Ok(())
}
