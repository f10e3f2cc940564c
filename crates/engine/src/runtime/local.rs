use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use polystep_rpc::{RpcSession, Transport};
use polystep_types::StepConfig;
use tracing::debug;

use super::StepRuntime;
use crate::error::DispatchError;
use crate::sdk::{StepHandler, bind_step_handler};

/// Steps implemented as Rust closures inside the engine process.
///
/// Each open pairs an in-memory transport with a child-side session that
/// serves the registered handler, so local steps speak the same protocol
/// as out-of-process ones.
#[derive(Clone, Default)]
pub struct LocalRuntime {
    handlers: Arc<RwLock<HashMap<String, StepHandler>>>,
}

impl fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime").field("steps", &self.steps()).finish()
    }
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `step`, replacing any earlier one.
    pub fn register(&self, step: impl Into<String>, handler: StepHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(step.into(), handler);
    }

    pub fn contains(&self, step: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.contains_key(step)
    }

    pub fn steps(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut steps: Vec<String> = handlers.keys().cloned().collect();
        steps.sort();
        steps
    }

    fn handler(&self, step: &str) -> Option<StepHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(step).cloned()
    }
}

#[async_trait::async_trait]
impl StepRuntime for LocalRuntime {
    async fn open(&self, step: &StepConfig) -> Result<Transport, DispatchError> {
        let handler = self
            .handler(&step.name)
            .ok_or_else(|| DispatchError::runtime(&step.name, "no local handler registered"))?;
        let (host_side, step_side) = Transport::pair();
        let session = RpcSession::builder(format!("{}:local", step.name))
            .start_with(step_side, |session| bind_step_handler(session, handler));
        // The step side lives until the host side goes away.
        tokio::spawn(async move {
            session.wait_closed().await;
        });
        debug!(step = %step.name, "Opened local step runtime");
        Ok(host_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::step_handler;
    use polystep_types::RpcMethod;
    use serde_json::json;

    #[tokio::test]
    async fn local_steps_answer_invocations() {
        let runtime = LocalRuntime::new();
        runtime.register(
            "double",
            step_handler(|data, _context| async move {
                let value = data["value"].as_i64().unwrap_or_default();
                Ok(json!({"value": value * 2}))
            }),
        );
        assert!(runtime.contains("double"));

        let transport = runtime.open(&StepConfig::event("double", &["numbers"])).await.unwrap();
        let host = RpcSession::start("host", transport);
        let result = host
            .call(
                RpcMethod::Invoke,
                json!({
                    "data": {"value": 21},
                    "context": {"traceId": "t1", "flows": [], "invocationId": "i1", "step": "double"}
                }),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"value": 42}));
    }

    #[tokio::test]
    async fn unknown_local_step_is_a_runtime_error() {
        let runtime = LocalRuntime::new();
        let result = runtime.open(&StepConfig::event("ghost", &["x"])).await;
        assert!(matches!(result, Err(DispatchError::Runtime { .. })));
    }
}
