//! Where step code runs.
//!
//! A [`StepRuntime`] opens a fresh transport to a step. The dispatcher
//! layers an RPC session on top and reopens the runtime when the session
//! closes.

mod local;
mod process;

pub use local::LocalRuntime;
pub use process::ProcessRuntime;

use polystep_rpc::Transport;
use polystep_types::StepConfig;

use crate::error::DispatchError;

#[async_trait::async_trait]
pub trait StepRuntime: Send + Sync {
    /// Starts the step's runtime and returns a transport to it.
    async fn open(&self, step: &StepConfig) -> Result<Transport, DispatchError>;
}

/// In-process steps first, child processes for everything else.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    local: LocalRuntime,
    process: ProcessRuntime,
}

impl RuntimeRegistry {
    pub fn new(local: LocalRuntime, process: ProcessRuntime) -> Self {
        Self { local, process }
    }

    pub fn local(&self) -> &LocalRuntime {
        &self.local
    }

    pub fn process(&self) -> &ProcessRuntime {
        &self.process
    }
}

#[async_trait::async_trait]
impl StepRuntime for RuntimeRegistry {
    async fn open(&self, step: &StepConfig) -> Result<Transport, DispatchError> {
        if self.local.contains(&step.name) {
            return self.local.open(step).await;
        }
        self.process.open(step).await
    }
}
