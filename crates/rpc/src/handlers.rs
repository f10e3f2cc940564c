//! Handler table keyed by the closed method set.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use polystep_types::RpcMethod;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;

/// Type-erased handler: JSON in, JSON out.
pub type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Erases a raw JSON handler.
pub fn raw_handler<F, Fut>(handler: F) -> RpcHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |args| handler(args).boxed())
}

/// Erases a typed handler.
///
/// Arguments that do not decode into `I`, and outputs that do not encode
/// to JSON, fail the call with [`RpcError::Serialization`].
pub fn typed_handler<I, O, F, Fut>(handler: F) -> RpcHandler
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, RpcError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |args| {
        let handler = Arc::clone(&handler);
        async move {
            let input = serde_json::from_value::<I>(args)?;
            let output = handler(input).await?;
            Ok(serde_json::to_value(output)?)
        }
        .boxed()
    })
}

/// Registered handlers; the last registration for a method wins.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<RpcMethod, RpcHandler>>,
}

impl HandlerTable {
    pub(crate) fn insert(&self, method: RpcMethod, handler: RpcHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(method, handler);
    }

    pub(crate) fn get(&self, method: RpcMethod) -> Option<RpcHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(&method).cloned()
    }

    pub(crate) fn methods(&self) -> Vec<RpcMethod> {
        let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut methods: Vec<RpcMethod> = handlers.keys().copied().collect();
        methods.sort();
        methods
    }
}
