//! Step declarations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::{Uuid, uuid};

/// Namespace for deterministic step ids.
const STEP_NAMESPACE: Uuid = uuid!("7f1c3ff2-9b00-4d0a-bdd7-efb8bca49d4f");

/// How a step is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Runs when a subscribed topic is emitted.
    #[default]
    Event,
    /// Entry point reached through an HTTP route.
    Api,
    /// Entry point reached from a schedule.
    Cron,
    /// Visual-only node; never invoked.
    Noop,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Event => write!(f, "event"),
            StepType::Api => write!(f, "api"),
            StepType::Cron => write!(f, "cron"),
            StepType::Noop => write!(f, "noop"),
        }
    }
}

/// A declared emission, either a bare topic or a labelled one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Emit {
    Topic(String),
    Labelled {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default)]
        conditional: bool,
    },
}

impl Emit {
    pub fn topic(&self) -> &str {
        match self {
            Emit::Topic(topic) => topic,
            Emit::Labelled { topic, .. } => topic,
        }
    }
}

/// Child runtime family a step is executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepLanguage {
    Node,
    Python,
    Ruby,
    /// Executable invoked directly, no interpreter.
    Native,
}

impl StepLanguage {
    /// Derives the runtime family from a handler file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs") => StepLanguage::Node,
            Some("py") => StepLanguage::Python,
            Some("rb") => StepLanguage::Ruby,
            _ => StepLanguage::Native,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepLanguage::Node => "node",
            StepLanguage::Python => "python",
            StepLanguage::Ruby => "ruby",
            StepLanguage::Native => "native",
        }
    }
}

impl fmt::Display for StepLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static declaration of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default)]
    pub subscribes: Vec<String>,
    #[serde(default)]
    pub emits: Vec<Emit>,
    #[serde(default)]
    pub virtual_emits: Vec<Emit>,
    #[serde(default)]
    pub virtual_subscribes: Vec<String>,
    /// Handler file; its extension selects the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    /// Explicit executable, overriding the language runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl StepConfig {
    /// Creates an event step subscribed to `topics`.
    pub fn event(name: impl Into<String>, topics: &[&str]) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::Event,
            subscribes: topics.iter().map(|topic| topic.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_flows(mut self, flows: &[&str]) -> Self {
        self.flows = flows.iter().map(|flow| flow.to_string()).collect();
        self
    }

    pub fn with_emits(mut self, topics: &[&str]) -> Self {
        self.emits = topics.iter().map(|topic| Emit::Topic(topic.to_string())).collect();
        self
    }

    pub fn language(&self) -> StepLanguage {
        self.file_path
            .as_deref()
            .map(StepLanguage::from_path)
            .unwrap_or(StepLanguage::Native)
    }

    pub fn is_subscriber(&self) -> bool {
        self.step_type == StepType::Event && !self.subscribes.is_empty()
    }

    pub fn id(&self) -> String {
        match &self.file_path {
            Some(path) => step_id(&path.to_string_lossy()),
            None => step_id(&self.name),
        }
    }
}

/// Deterministic id for a step source, stable across processes.
pub fn step_id(source: &str) -> String {
    Uuid::new_v5(&STEP_NAMESPACE, source.as_bytes()).to_string()
}
