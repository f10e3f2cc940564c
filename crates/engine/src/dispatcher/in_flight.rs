use std::collections::HashMap;

use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
struct Counts {
    total: usize,
    per_trace: HashMap<String, usize>,
}

/// Counts invocations that are queued or running, per trace.
#[derive(Debug)]
pub(crate) struct InFlight {
    counts: watch::Sender<Counts>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        let (counts, _) = watch::channel(Counts::default());
        Self { counts }
    }

    pub(crate) fn begin(&self, trace_id: &str) {
        self.counts.send_modify(|counts| {
            counts.total += 1;
            *counts.per_trace.entry(trace_id.to_string()).or_default() += 1;
        });
    }

    /// Marks one invocation of the trace done. `on_drained` runs when it was
    /// the last one, before any waiter observes the change.
    pub(crate) fn complete(&self, trace_id: &str, on_drained: impl FnOnce()) {
        self.counts.send_modify(|counts| {
            counts.total = counts.total.saturating_sub(1);
            if let Some(pending) = counts.per_trace.get_mut(trace_id) {
                *pending = pending.saturating_sub(1);
                if *pending == 0 {
                    counts.per_trace.remove(trace_id);
                    on_drained();
                }
            }
        });
    }

    pub(crate) fn total(&self) -> usize {
        self.counts.borrow().total
    }

    pub(crate) fn pending_for(&self, trace_id: &str) -> usize {
        self.counts.borrow().per_trace.get(trace_id).copied().unwrap_or_default()
    }

    /// Forgets everything, waking all waiters.
    pub(crate) fn reset(&self) {
        self.counts.send_replace(Counts::default());
    }

    pub(crate) async fn wait_idle(&self) {
        let mut counts = self.counts.subscribe();
        let _ = counts.wait_for(|counts| counts.total == 0).await;
    }

    pub(crate) async fn wait_trace(&self, trace_id: &str) {
        let mut counts = self.counts.subscribe();
        let _ = counts.wait_for(|counts| !counts.per_trace.contains_key(trace_id)).await;
    }
}
