//! Shared type definitions for the polystep workspace.
//!
//! Everything that crosses a crate or process boundary lives here: trace
//! context, events, step declarations, the RPC message union, structured log
//! entries and state entries with their filters.

pub mod log;
pub mod rpc;
pub mod state;
pub mod step;
pub mod trace;

pub use log::{LogEntry, LogLevel, ParseLogLevelError, error_object, normalize_error_field};
pub use rpc::{InboundMessage, RpcMessage, RpcMethod, UnknownMethodError};
pub use state::{FilterOperation, ItemsQuery, StateEntry, StateFilter, value_type_name};
pub use step::{Emit, StepConfig, StepLanguage, StepType, step_id};
pub use trace::{Event, TraceContext, generate_trace_id};
