//! # Polystep Engine
//!
//! The engine core behind polystep: it routes topic events to steps that run
//! in child processes (or in-process for Rust steps), and serves those steps
//! the capabilities they call back into: scoped state, trace-aware logging,
//! tracing and further emission.
//!
//! ## Usage
//!
//! ```rust
//! use polystep_engine::{Engine, config::EngineConfig, sdk::step_handler};
//! use polystep_types::StepConfig;
//! use serde_json::{Value, json};
//!
//! # tokio::runtime::Runtime::new()?.block_on(async {
//! let config = EngineConfig {
//!     steps: vec![StepConfig::event("Greet", &["greet"])],
//!     ..EngineConfig::default()
//! };
//! let engine = Engine::from_config(config).await?;
//! engine.register_local_step(
//!     "Greet",
//!     step_handler(|data, context| async move {
//!         context.logger().info("Hello", Some(data));
//!         Ok(Value::Null)
//!     }),
//! );
//!
//! let trace = engine.trigger("greet", json!({"name": "polystep"}), Vec::new());
//! engine.dispatcher().wait_trace(&trace.trace_id).await;
//! # engine.shutdown().await;
//! # Ok::<(), anyhow::Error>(())
//! # })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`dispatcher`**: subscription table, per-step FIFO delivery, host capabilities
//! - **`runtime`**: where step code runs (child processes or local closures)
//! - **`state`**: the state adapter contract with memory and file backends
//! - **`observability`**: trace-scoped loggers, the log collector, tracers and the trace store
//! - **`config`**: configuration model, loading and validation
//! - **`sdk`**: the child-side API for steps written in Rust
//! - **`protocol`**: argument shapes of host/step calls

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod runtime;
pub mod sdk;
pub mod state;

// Re-export commonly used types for convenience
pub use config::{ConfigError, EngineConfig, load_config};
pub use dispatcher::{Dispatcher, SubscriptionTable};
pub use engine::Engine;
pub use error::DispatchError;
pub use observability::{LogCollector, Logger, LoggerFactory, NoopTracer, RecordingTracer, TraceStore, Tracer, TracerFactory};
pub use runtime::{LocalRuntime, ProcessRuntime, RuntimeRegistry, StepRuntime};
pub use sdk::{StepContext, StepHandler, serve_stdio, step_handler};
pub use state::{FileStateAdapter, MemoryStateAdapter, StateAdapter, StateError};
