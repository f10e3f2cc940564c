//! Tracing and logging scoped to a trace.

mod collector;
mod factory;
mod formatter;
mod logger;
mod ring_buffer;
mod trace_store;
mod tracer;

pub use collector::{DEFAULT_MAX_ENTRIES, DEFAULT_MAX_ENTRIES_PER_TRACE, LogCollector};
pub use factory::{BaseTracerFactory, MAX_TRACE_GROUPS_ENV, NoopTracerFactory, TracerFactory, tracer_factory};
pub use formatter::LogFormatter;
pub use logger::{LogSender, Logger, LoggerFactory};
pub use ring_buffer::LogRingBuffer;
pub use trace_store::{
    DEFAULT_MAX_TRACE_GROUPS, EntryPoint, SpanKind, SpanOperation, SpanRecord, Trace, TraceError, TraceGroup,
    TraceGroupMetadata, TraceKey, TraceSpan, TraceStatus, TraceStore,
};
pub use tracer::{NoopTracer, RecordingTracer, Tracer};
