//! Small synchronous collaborators that don't need a network round trip:
//! node routing and batch id generation.

use mu_cranker::NodeSelector;
use mu_monitor::BatchIdGenerator;

/// Routes every process to the same configured CU node. Real deployments
/// with more than one CU node would consult a scheduler-assignment
/// lookup instead; this crate's scope stops at the single-node case.
pub struct ConfigNodeSelector {
    node_url: String,
}

impl ConfigNodeSelector {
    pub fn new(node_url: impl Into<String>) -> Self {
        ConfigNodeSelector { node_url: node_url.into() }
    }
}

impl NodeSelector for ConfigNodeSelector {
    fn select_node(&self, _process_id: &str) -> String {
        self.node_url.clone()
    }
}

#[derive(Default)]
pub struct UuidBatchIdGenerator;

impl UuidBatchIdGenerator {
    pub fn new() -> Self {
        UuidBatchIdGenerator
    }
}

impl BatchIdGenerator for UuidBatchIdGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
