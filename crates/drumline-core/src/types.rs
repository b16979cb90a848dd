use serde::{Deserialize, Serialize};

/// Addressing context for a query submission — which backend instance the
/// materialized query runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetContext {
    /// Backend instance identifier (path segment of the submit endpoint).
    pub instance_id: String,
    /// Optional marketplace/tenant qualifier forwarded in the submit body.
    #[serde(default)]
    pub marketplace_id: Option<String>,
}

impl TargetContext {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            marketplace_id: None,
        }
    }

    pub fn with_marketplace(mut self, marketplace_id: impl Into<String>) -> Self {
        self.marketplace_id = Some(marketplace_id.into());
        self
    }
}
