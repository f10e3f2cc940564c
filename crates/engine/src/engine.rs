//! Assembles the dispatcher and its collaborators from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use polystep_types::TraceContext;
use serde_json::Value;
use tracing::info;

use crate::config::{EngineConfig, StateBackend};
use crate::dispatcher::Dispatcher;
use crate::observability::{LogCollector, TraceStore, TracerFactory, tracer_factory};
use crate::runtime::{LocalRuntime, ProcessRuntime, RuntimeRegistry};
use crate::sdk::StepHandler;
use crate::state::{FileStateAdapter, MemoryStateAdapter, StateAdapter};

/// A configured engine: state backend, tracer factory, log collector and
/// the dispatcher wired to local and process runtimes.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    local: LocalRuntime,
    dispatcher: Dispatcher,
}

impl Engine {
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let state: Arc<dyn StateAdapter> = match config.state.adapter {
            StateBackend::Memory => Arc::new(MemoryStateAdapter::new()),
            StateBackend::File => {
                let path = config.state.file_path();
                let adapter = FileStateAdapter::open(&path)
                    .await
                    .with_context(|| format!("failed to open state file {}", path.display()))?;
                Arc::new(adapter)
            }
        };
        let tracer_factory = tracer_factory(config.tracing.enabled, config.tracing.max_trace_groups);
        let collector = Arc::new(LogCollector::new(config.logs.max_entries, config.logs.verbose));

        let local = LocalRuntime::new();
        let runtime = RuntimeRegistry::new(local.clone(), ProcessRuntime::from_config(&config));
        let dispatcher = Dispatcher::new(config.steps.clone(), Arc::new(runtime), state, tracer_factory, collector)
            .context("failed to build dispatcher")?
            .with_call_timeout(config.rpc.call_timeout());

        info!(
            steps = config.steps.len(),
            tracing = config.tracing.enabled,
            state = ?config.state.adapter,
            "Engine ready"
        );
        Ok(Self {
            config,
            local,
            dispatcher,
        })
    }

    /// Serves `step` from an in-process handler instead of a child process.
    pub fn register_local_step(&self, step: impl Into<String>, handler: StepHandler) {
        self.local.register(step, handler);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn trigger(&self, topic: impl Into<String>, data: Value, flows: Vec<String>) -> TraceContext {
        self.dispatcher.trigger(topic, data, flows)
    }

    pub fn state(&self) -> Arc<dyn StateAdapter> {
        self.dispatcher.state()
    }

    pub fn collector(&self) -> Arc<LogCollector> {
        self.dispatcher.collector()
    }

    pub fn tracer_factory(&self) -> Arc<dyn TracerFactory> {
        self.dispatcher.tracer_factory()
    }

    /// Recorded traces; `None` when tracing is disabled.
    pub fn trace_store(&self) -> Option<Arc<TraceStore>> {
        self.dispatcher.tracer_factory().store()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.dispatcher.shutdown().await;
    }
}
