//! Tracer factories, chosen once from configuration.

use std::sync::Arc;

use polystep_types::{StepConfig, TraceContext};
use tracing::warn;

use super::logger::Logger;
use super::trace_store::{DEFAULT_MAX_TRACE_GROUPS, TraceStore};
use super::tracer::{NoopTracer, RecordingTracer, Tracer};

/// Environment override for the number of retained trace groups.
pub const MAX_TRACE_GROUPS_ENV: &str = "POLYSTEP_MAX_TRACE_GROUPS";

pub trait TracerFactory: Send + Sync {
    /// Opens a tracer for one invocation of `step` under `trace`.
    fn create_tracer(&self, trace: &TraceContext, step: &StepConfig, logger: &Logger) -> Arc<dyn Tracer>;

    /// Called once nothing is pending under `trace_id`.
    fn finish_trace(&self, trace_id: &str);

    /// Forgets every recorded trace.
    fn clear(&self);

    /// Backing store, when traces are recorded at all.
    fn store(&self) -> Option<Arc<TraceStore>>;
}

/// Factory for [`RecordingTracer`]s over a bounded [`TraceStore`].
#[derive(Debug, Clone)]
pub struct BaseTracerFactory {
    store: Arc<TraceStore>,
}

impl BaseTracerFactory {
    pub fn new(max_trace_groups: usize) -> Self {
        Self {
            store: Arc::new(TraceStore::new(max_trace_groups)),
        }
    }

    /// Capacity from `POLYSTEP_MAX_TRACE_GROUPS`, then `configured`, then the default.
    pub fn from_env(configured: Option<usize>) -> Self {
        Self::new(max_trace_groups_from_env().or(configured).unwrap_or(DEFAULT_MAX_TRACE_GROUPS))
    }
}

impl TracerFactory for BaseTracerFactory {
    fn create_tracer(&self, trace: &TraceContext, step: &StepConfig, logger: &Logger) -> Arc<dyn Tracer> {
        Arc::new(RecordingTracer::start(
            Arc::clone(&self.store),
            &trace.trace_id,
            &step.name,
            step.step_type,
            logger.clone(),
        ))
    }

    fn finish_trace(&self, trace_id: &str) {
        self.store.complete_group(trace_id);
    }

    fn clear(&self) {
        self.store.clear();
    }

    fn store(&self) -> Option<Arc<TraceStore>> {
        Some(Arc::clone(&self.store))
    }
}

/// Factory used when tracing is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracerFactory;

impl TracerFactory for NoopTracerFactory {
    fn create_tracer(&self, _trace: &TraceContext, _step: &StepConfig, _logger: &Logger) -> Arc<dyn Tracer> {
        NoopTracer::shared()
    }

    fn finish_trace(&self, _trace_id: &str) {}

    fn clear(&self) {}

    fn store(&self) -> Option<Arc<TraceStore>> {
        None
    }
}

/// Builds the factory for the `tracing.enabled` setting.
pub fn tracer_factory(enabled: bool, max_trace_groups: Option<usize>) -> Arc<dyn TracerFactory> {
    if enabled {
        Arc::new(BaseTracerFactory::from_env(max_trace_groups))
    } else {
        Arc::new(NoopTracerFactory)
    }
}

fn max_trace_groups_from_env() -> Option<usize> {
    let raw = std::env::var(MAX_TRACE_GROUPS_ENV).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(value = %raw, "Ignoring invalid {MAX_TRACE_GROUPS_ENV}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::logger::tests::CapturingSender;
    use crate::observability::trace_store::TraceStatus;

    fn logger() -> Logger {
        Logger::new(TraceContext::new("t1", vec![]), Arc::new(CapturingSender::default()))
    }

    #[test]
    fn base_factory_records_and_finishes_groups() {
        let factory = BaseTracerFactory::new(5);
        let trace = TraceContext::new("t1", vec![]);
        let tracer = factory.create_tracer(&trace, &StepConfig::event("a", &["x"]), &logger());
        tracer.state_operation("get", serde_json::json!({}));
        tracer.end(None);
        factory.finish_trace("t1");

        let store = factory.store().unwrap();
        let group = store.group("t1").unwrap();
        assert_eq!(group.status, TraceStatus::Completed);
        assert_eq!(group.name, "a");

        factory.clear();
        assert!(store.groups().is_empty());
    }

    #[test]
    fn disabled_tracing_hands_out_noop_tracers() {
        let factory = tracer_factory(false, Some(10));
        assert!(factory.store().is_none());
        let tracer = factory.create_tracer(&TraceContext::new("t1", vec![]), &StepConfig::event("a", &["x"]), &logger());
        tracer.end(None);
        assert!(!tracer.is_ended());
    }

    #[test]
    fn env_override_takes_precedence() {
        temp_env::with_var(MAX_TRACE_GROUPS_ENV, Some("7"), || {
            assert_eq!(BaseTracerFactory::from_env(Some(3)).store.max_groups(), 7);
        });
        temp_env::with_var(MAX_TRACE_GROUPS_ENV, Some("zero"), || {
            assert_eq!(BaseTracerFactory::from_env(Some(3)).store.max_groups(), 3);
        });
        temp_env::with_var_unset(MAX_TRACE_GROUPS_ENV, || {
            assert_eq!(BaseTracerFactory::from_env(None).store.max_groups(), DEFAULT_MAX_TRACE_GROUPS);
        });
    }
}
