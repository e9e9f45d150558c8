//! Tool registry — process-wide catalog of tool factories.
//!
//! The registry never holds bound tool instances. Tools close over a
//! per-run dependency bundle (queries, references, dispatcher), so the
//! registry maps name → `{descriptor, factory}` and [`ToolRegistry::build`]
//! binds fresh instances for each run. Tests construct their own
//! registries; there is no global singleton.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use lum_domain::chat::{ToolDefinition, ToolDescriptor};
use lum_domain::{Error, Result};

use crate::deps::{ToolContext, ToolDeps};
use crate::error::ToolError;

/// A bound tool instance, live for one run.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// Invoke with JSON arguments. See [`crate::error::ToolError`] for
    /// the outcome contract.
    async fn invoke(&self, ctx: &ToolContext, args: Value)
        -> std::result::Result<Value, ToolError>;
}

pub type ToolFactory = Box<dyn Fn(&ToolDeps) -> Arc<dyn Tool> + Send + Sync>;

struct Registration {
    descriptor: ToolDescriptor,
    factory: ToolFactory,
}

/// Thread-safe map from tool name to descriptor + factory. Read-mostly
/// after startup.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<HashMap<String, Registration>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique within a process; registering
    /// the same name twice is an error.
    pub fn register(&self, descriptor: ToolDescriptor, factory: ToolFactory) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.contains_key(&descriptor.name) {
            return Err(Error::InvalidInput(format!(
                "tool '{}' is already registered",
                descriptor.name
            )));
        }
        tracing::debug!(tool = %descriptor.name, "tool registered");
        inner.insert(
            descriptor.name.clone(),
            Registration {
                descriptor,
                factory,
            },
        );
        Ok(())
    }

    /// Bind tool instances for a run. Unknown names are skipped with a
    /// warning — callers decide whether missing tools are an error, which
    /// permits graceful degradation across deployments with different
    /// feature sets.
    pub fn build(&self, names: &[String], deps: &ToolDeps) -> Vec<Arc<dyn Tool>> {
        let inner = self.inner.read();
        let mut bound = Vec::with_capacity(names.len());
        for name in names {
            match inner.get(name) {
                Some(reg) => bound.push((reg.factory)(deps)),
                None => {
                    tracing::warn!(tool = %name, "unknown tool requested, skipping");
                }
            }
        }
        bound
    }

    /// All registered descriptors. No ordering guarantee.
    pub fn describe(&self) -> Vec<ToolDescriptor> {
        self.inner
            .read()
            .values()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    /// All registered names (sorted, for logs and defaults).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Model-facing definitions for a set of bound tools.
    pub fn definitions(tools: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
        tools.iter().map(|t| t.descriptor().definition()).collect()
    }
}
