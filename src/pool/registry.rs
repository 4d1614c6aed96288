//! Capability registry: capability tag -> execution implementation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::pool::handoff::Handoff;
use crate::pool::worker::WorkerContext;

/// Performs the work described by a task and returns a handoff.
/// Implementations report progress through `ctx.progress` and should return
/// promptly once `ctx.stopped()` resolves.
#[async_trait]
pub trait ExecutionCapability: Send + Sync {
    async fn execute(&self, ctx: WorkerContext) -> Result<Handoff>;
}

/// Selects an executor by tag lookup instead of branching on task content.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    by_tag: HashMap<String, Arc<dyn ExecutionCapability>>,
    default: Option<Arc<dyn ExecutionCapability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tag: impl Into<String>, capability: Arc<dyn ExecutionCapability>) -> Self {
        self.by_tag.insert(tag.into(), capability);
        self
    }

    /// Used for tasks without a tag or with an unregistered one.
    pub fn with_default(mut self, capability: Arc<dyn ExecutionCapability>) -> Self {
        self.default = Some(capability);
        self
    }

    pub fn resolve(&self, tag: Option<&str>) -> Option<Arc<dyn ExecutionCapability>> {
        tag.and_then(|t| self.by_tag.get(t))
            .or(self.default.as_ref())
            .cloned()
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.by_tag.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl ExecutionCapability for Named {
        async fn execute(&self, _ctx: WorkerContext) -> Result<Handoff> {
            Ok(Handoff::new().decision(self.0))
        }
    }

    #[test]
    fn test_lookup_and_default() {
        let registry = CapabilityRegistry::new()
            .register("backend", Arc::new(Named("backend")))
            .register("architect", Arc::new(Named("architect")));
        assert!(registry.resolve(Some("backend")).is_some());
        assert!(registry.resolve(Some("frontend")).is_none());
        assert!(registry.resolve(None).is_none());
        assert_eq!(registry.tags(), vec!["architect", "backend"]);

        let registry = registry.with_default(Arc::new(Named("generalist")));
        assert!(registry.resolve(Some("frontend")).is_some());
        assert!(registry.resolve(None).is_some());
    }
}
