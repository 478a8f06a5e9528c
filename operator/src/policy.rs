use crate::bundle::Bundle;
use async_trait::async_trait;
use common::{Result, Values};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Per-kind reconciliation strategy. The default policy accepts everything
/// and defers to the operator-wide requeue interval; embedders register
/// specialized policies for kinds that need gating or extra status.
#[async_trait]
pub trait KindPolicy: Send + Sync {
    /// Precondition gate, checked before install, upgrade and drift repair.
    async fn validate(&self, _instance: &Bundle) -> Result<()> {
        Ok(())
    }

    /// Override the operator-wide re-check interval for this instance.
    fn requeue_after(&self, _instance: &Bundle) -> Option<Duration> {
        None
    }

    /// Extra details to publish under the instance status.
    async fn status_info(&self, _instance: &Bundle) -> Option<Values> {
        None
    }
}

pub struct DefaultPolicy;

#[async_trait]
impl KindPolicy for DefaultPolicy {}

/// Kind to policy mapping with a permissive default.
pub struct PolicySet {
    fallback: Arc<dyn KindPolicy>,
    by_kind: HashMap<String, Arc<dyn KindPolicy>>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self {
            fallback: Arc::new(DefaultPolicy),
            by_kind: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, kind: &str, policy: Arc<dyn KindPolicy>) -> Self {
        self.by_kind.insert(kind.to_string(), policy);
        self
    }

    pub fn for_kind(&self, kind: &str) -> Arc<dyn KindPolicy> {
        self.by_kind.get(kind).cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new()
    }
}
