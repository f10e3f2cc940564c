use indexmap::{IndexMap, IndexSet};
use polystep_types::StepConfig;

/// Topic to subscriber lookup, fixed at startup.
///
/// Subscribers keep declaration order and appear once per topic.
/// `virtualSubscribes` only draw edges in flow diagrams and never receive
/// deliveries.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTable {
    topics: IndexMap<String, IndexSet<String>>,
}

impl SubscriptionTable {
    pub fn build<'a>(steps: impl IntoIterator<Item = &'a StepConfig>) -> Self {
        let mut topics: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for step in steps.into_iter().filter(|step| step.is_subscriber()) {
            for topic in &step.subscribes {
                topics.entry(topic.clone()).or_default().insert(step.name.clone());
            }
        }
        Self { topics }
    }

    pub fn subscribers(&self, topic: &str) -> Vec<&str> {
        self.topics
            .get(topic)
            .map(|steps| steps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystep_types::StepType;

    #[test]
    fn subscribers_keep_declaration_order() {
        let steps = vec![
            StepConfig::event("b", &["orders", "orders"]),
            StepConfig::event("a", &["orders", "audit"]),
            StepConfig {
                virtual_subscribes: vec!["orders".to_string()],
                ..StepConfig::event("c", &["audit"])
            },
            StepConfig {
                step_type: StepType::Api,
                ..StepConfig::event("api", &["orders"])
            },
        ];

        let table = SubscriptionTable::build(&steps);
        assert_eq!(table.subscribers("orders"), vec!["b", "a"]);
        assert_eq!(table.subscribers("audit"), vec!["a", "c"]);
        assert!(table.subscribers("missing").is_empty());
        assert_eq!(table.topics().collect::<Vec<_>>(), vec!["orders", "audit"]);
    }
}
